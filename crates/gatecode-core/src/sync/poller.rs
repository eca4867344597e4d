//! Background timers
//!
//! Each poller sleeps for its interval and runs one tick, until the
//! shutdown signal flips or the tick asks to stop.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Spawn a task that runs `tick` every `interval`
///
/// `tick` returns `false` when the engine it serves is gone.
pub(crate) fn spawn_poller<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if !tick().await {
                        break;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("{} poller stopped", name);
    })
}
