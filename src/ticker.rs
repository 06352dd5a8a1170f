//! Cancellable fixed-interval task with a single owner.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What a tick callback wants the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFlow {
    Continue,
    Stop,
}

/// Runs a callback on a fixed interval until stopped. The first tick fires immediately.
///
/// Dropping the ticker stops it; there is no way to leak the loop past its owner.
#[derive(Debug)]
pub struct Ticker {
    cancel: CancellationToken,
    nudge: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickFlow> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let nudge = Arc::new(Notify::new());
        let loop_cancel = cancel.clone();
        let loop_nudge = nudge.clone();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = loop_cancel.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = loop_nudge.notified() => interval.reset(),
                }
                let flow = tokio::select! {
                    biased;
                    _ = loop_cancel.cancelled() => break,
                    flow = tick() => flow,
                };
                if flow == TickFlow::Stop {
                    break;
                }
            }
        });

        Self {
            cancel,
            nudge,
            handle: Some(handle),
        }
    }

    /// Run the callback now instead of waiting for the next period.
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop and wait for an in-flight tick to unwind.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticks_immediately_then_on_period() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let ticker = Ticker::spawn(Duration::from_secs(5), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                TickFlow::Continue
            }
        });

        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        ticker.stop();
        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(ticker.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn callback_can_stop_the_loop() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let ticker = Ticker::spawn(Duration::from_secs(1), move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 2 {
                    TickFlow::Stop
                } else {
                    TickFlow::Continue
                }
            }
        });
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(ticker.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn nudge_runs_out_of_cadence() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let ticker = Ticker::spawn(Duration::from_secs(60), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                TickFlow::Continue
            }
        });
        time::sleep(Duration::from_millis(10)).await;
        ticker.nudge();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_stops_the_loop() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let ticker = Ticker::spawn(Duration::from_secs(1), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                TickFlow::Continue
            }
        });
        time::sleep(Duration::from_millis(10)).await;
        drop(ticker);
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
