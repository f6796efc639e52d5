//! Hardware notification worker.
//!
//! Drains the decision engine's queue on its own thread so LCD/buzzer
//! round-trips never touch pipeline latency. Delivery failures are logged
//! and swallowed; the attendance path never learns about them.

use rollcall_hw::{Notification, NotifierClient};
use tokio::sync::mpsc;

/// Spawn the worker thread. With no client configured the queue is still
/// drained (and feedback silently dropped) so senders never back up.
pub fn spawn_notifier(client: Option<NotifierClient>, mut rx: mpsc::Receiver<Notification>) {
    std::thread::Builder::new()
        .name("rollcall-notify".into())
        .spawn(move || {
            if client.is_none() {
                tracing::info!("no notifier configured, hardware feedback disabled");
            }
            while let Some(notification) = rx.blocking_recv() {
                let Some(client) = client.as_ref() else {
                    continue;
                };
                match client.send(&notification) {
                    Ok(()) => tracing::debug!(
                        line1 = %notification.line1,
                        tone = ?notification.tone,
                        "hardware notified"
                    ),
                    Err(e) => tracing::warn!(error = %e, "hardware notify failed, ignoring"),
                }
            }
            tracing::debug!("notifier thread exiting");
        })
        .expect("failed to spawn notifier thread");
}
