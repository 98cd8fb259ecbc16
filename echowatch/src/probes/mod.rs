use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use echowatch_common::{Report, SessionCounters};
use log::debug;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

pub mod echo;
pub mod interfaces;

static SHUTDOWN: once_cell::sync::Lazy<ShutdownTrigger> =
    once_cell::sync::Lazy::new(ShutdownTrigger::new);

/// Process-wide shutdown signal observed by every worker.
pub fn shutdown_signal() -> Shutdown {
    SHUTDOWN.subscribe()
}

pub fn request_shutdown() {
    SHUTDOWN.trigger();
}

/// Sending half of a shutdown signal.
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving half of a shutdown signal. Cheap to clone.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested. Never resolves if the
    /// trigger is dropped without firing.
    pub async fn requested(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|requested| *requested).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// Sleeps for `duration` unless shutdown comes first. Returns `false`
    /// when interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.requested() => false,
            _ = time::sleep(duration) => true,
        }
    }
}

/// Receives session counters on the cadence of the owning transport.
pub trait Reporter: Send + Sync {
    fn report(&self, report: Report);
}

impl<F> Reporter for F
where
    F: Fn(Report) + Send + Sync,
{
    fn report(&self, report: Report) {
        self(report)
    }
}

pub type SharedCounters = Arc<Mutex<SessionCounters>>;

pub fn read_counters(counters: &SharedCounters) -> SessionCounters {
    *counters.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn update_counters(counters: &SharedCounters, f: impl FnOnce(&mut SessionCounters)) {
    let mut guard = counters.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard);
}

pub fn now_report(counters: SessionCounters) -> Report {
    Report::new(Utc::now(), counters)
}

/// Repeating report task owned by one echo session.
///
/// Stops on shutdown, and is aborted when dropped so it never outlives the
/// session it reports on.
pub struct ReportTicker {
    handle: JoinHandle<()>,
}

impl ReportTicker {
    /// Calls `tick` every `period`, first call one period from now.
    pub fn spawn<F, Fut>(period: Duration, shutdown: Shutdown, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.requested() => {
                        debug!("report ticker stopping on shutdown");
                        return;
                    }
                    _ = interval.tick() => {}
                }
                tick().await;
            }
        });
        Self { handle }
    }
}

impl Drop for ReportTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let trigger = ShutdownTrigger::new();
        let shutdown = trigger.subscribe();
        assert!(!shutdown.is_requested());

        let waiter = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.requested().await }
        });
        trigger.trigger();

        time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
        assert!(shutdown.is_requested());
        assert!(!shutdown.sleep(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_ticker_stops_when_dropped() {
        let trigger = ShutdownTrigger::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let ticker = ReportTicker::spawn(Duration::from_millis(10), trigger.subscribe(), {
            let ticks = ticks.clone();
            move || {
                let ticks = ticks.clone();
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        time::sleep(Duration::from_millis(55)).await;
        drop(ticker);
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "only {} ticks", seen);

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_closure_is_reporter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let reporter: Arc<dyn Reporter> = {
            let seen = seen.clone();
            Arc::new(move |report: Report| seen.lock().unwrap().push(report.sent))
        };

        reporter.report(now_report(SessionCounters {
            sent: 3,
            ..Default::default()
        }));
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }
}
