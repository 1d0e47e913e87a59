use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event, instrument};

use super::engine::RtpMidiEngine;
use super::fifo::MidiSender;
use super::state::SessionStatus;
use crate::transport::Transport;

const TICK_PERIOD: Duration = Duration::from_millis(1);

/// Connection-health events surfaced to the host, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The keepalive grace for the remote node ran out.
    ConnectionLost,
    /// The peer ended the session with BY.
    PeerClosed,
}

/// Runs an engine on a dedicated tokio task, ticking it every millisecond.
///
/// The driver is the bridge between the synchronous tick core and an async
/// host: it owns the engine, republishes the session status on a watch
/// channel, forwards the edge-triggered flags as [`SessionEvent`]s, and
/// closes the session (sending BY) when shut down.
pub struct SessionDriver {
    sender: MidiSender,
    status: watch::Receiver<SessionStatus>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionDriver {
    /// Takes ownership of an initiated engine and starts ticking it. The
    /// engine's session should already be initiated; an idle engine just
    /// burns ticks until the driver is shut down.
    pub fn spawn<T>(mut engine: RtpMidiEngine<T>) -> SessionDriver
    where
        T: Transport + Send + 'static,
    {
        let sender = engine.sender();
        let (status_tx, status_rx) = watch::channel(engine.session_status());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let cancel_token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_PERIOD);
            // Missed ticks must be made up, the engine clock counts them
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        event!(Level::DEBUG, "session driver: cancellation requested");
                        break;
                    }
                    _ = ticker.tick() => {
                        engine.run_session();
                        if engine.take_connection_lost() {
                            let _ = event_tx.send(SessionEvent::ConnectionLost);
                        }
                        if engine.take_peer_closed() {
                            let _ = event_tx.send(SessionEvent::PeerClosed);
                        }
                        status_tx.send_if_modified(|status| {
                            let current = engine.session_status();
                            if *status != current {
                                *status = current;
                                true
                            } else {
                                false
                            }
                        });
                    }
                }
            }

            engine.close_session();
        });

        SessionDriver {
            sender,
            status: status_rx,
            events: event_rx,
            cancel,
            task,
        }
    }

    /// Producer handle for queuing outbound MIDI.
    pub fn sender(&self) -> MidiSender {
        self.sender.clone()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Resolves once the session reaches `status`.
    pub async fn wait_for_status(&mut self, status: SessionStatus) {
        let _ = self.status.wait_for(|current| *current == status).await;
    }

    /// Next connection-health event. `None` after the driver shut down.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Stops the tick loop and closes the session (sending BY if opened).
    #[instrument(skip_all)]
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            event!(Level::WARN, "session task did not shut down cleanly: {}", e);
        }
    }
}
