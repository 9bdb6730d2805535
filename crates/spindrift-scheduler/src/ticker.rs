//! Interval driver with back-pressure.
//!
//! A naive fixed-rate timer stacks ticks behind a slow handler. This driver
//! runs the handler to completion first and only then arms the next tick, so
//! two handler runs can never overlap. A [`Ticker::wake`] short-circuits the
//! pause, which is how the pool re-enters admission immediately after a task
//! starts or finishes instead of waiting out the interval.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

pub(crate) struct Ticker {
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Ticker {
    /// Run `handler` now and then once per `interval`, measured from handler
    /// completion. `wake` may be shared so other components can trigger an
    /// early re-run.
    pub(crate) fn spawn<H, Fut>(interval: Duration, wake: Arc<Notify>, mut handler: H) -> Self
    where
        H: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let loop_wake = Arc::clone(&wake);
        let task = tokio::spawn(async move {
            loop {
                handler().await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = loop_wake.notified() => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        Self {
            wake,
            shutdown,
            task,
        }
    }

    /// Request an immediate re-run. A wake arriving while the handler is
    /// mid-run is remembered and consumed by the next pause.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
