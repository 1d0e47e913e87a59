//! Invites a remote RTP-MIDI station and plays a scale. Pass the remote
//! IPv4 address as the first argument (defaults to 127.0.0.1).

#[cfg(feature = "demos")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use anyhow::Context;
    use rtpmidi_engine::session::driver::SessionDriver;
    use rtpmidi_engine::session::engine::RtpMidiEngine;
    use rtpmidi_engine::session::state::SessionStatus;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tracing::{Level, event};
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();

    let remote: Ipv4Addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1".to_string())
        .parse()
        .context("remote address must be an IPv4 address")?;

    let mut engine = RtpMidiEngine::new(4096, |bytes: &[u8], _time| {
        event!(Level::INFO, "received {:02X?}", bytes);
    });
    engine.set_session_name("Scale Player");
    engine.initiate_session(remote, 5004, 5005, 5006, 5007, true).context("failed to open sockets")?;

    let mut driver = SessionDriver::spawn(engine);
    event!(Level::INFO, %remote, "inviting");
    driver.wait_for_status(SessionStatus::Opened).await;
    event!(Level::INFO, "session opened, playing a scale");

    let sender = driver.sender();
    for note in [60u8, 62, 64, 65, 67, 69, 71, 72] {
        sender.send_message(&[0x90, note, 0x64]);
        tokio::time::sleep(Duration::from_millis(250)).await;
        sender.send_message(&[0x80, note, 0x00]);
    }
    tokio::time::sleep(Duration::from_millis(250)).await;

    driver.shutdown().await;
    Ok(())
}

#[cfg(not(feature = "demos"))]
fn main() {
    println!("This demo requires the 'demos' feature to be enabled.");
}
