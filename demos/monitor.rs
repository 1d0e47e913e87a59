//! Waits for an invitation on ports 5004/5005 and logs every received MIDI
//! message until interrupted.

#[cfg(feature = "demos")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use anyhow::Context;
    use rtpmidi_engine::session::driver::SessionDriver;
    use rtpmidi_engine::session::engine::RtpMidiEngine;
    use std::net::Ipv4Addr;
    use tracing::{Level, event};
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();

    let mut engine = RtpMidiEngine::new(16 * 1024, |bytes: &[u8], time| {
        event!(Level::INFO, time, "midi {:02X?}", bytes);
    });
    engine.set_session_name("Session Monitor");
    engine
        .initiate_session(Ipv4Addr::UNSPECIFIED, 5004, 5005, 5004, 5005, false)
        .context("failed to open sockets (are ports 5004/5005 free?)")?;

    let mut driver = SessionDriver::spawn(engine);
    event!(Level::INFO, "waiting for an invitation on ports 5004/5005");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(session_event) = driver.next_event() => {
                event!(Level::WARN, ?session_event, "session event");
            }
        }
    }

    driver.shutdown().await;
    Ok(())
}

#[cfg(not(feature = "demos"))]
fn main() {
    println!("This demo requires the 'demos' feature to be enabled.");
}
