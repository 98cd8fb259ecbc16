use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use echowatch_common::{Report, SessionCounters};
use log::warn;

use crate::probes::Reporter;
use crate::telemetry::{CounterHandle, MetricSink, sanitize_metric_name};

/// The four sink counters of one (transport, target) pair, e.g.
/// `tcp_10_0_0_1_sent`. They outlive individual sessions so totals keep
/// growing across reconnects.
pub struct SessionMetrics {
    sink: Arc<dyn MetricSink>,
    sent: CounterHandle,
    received: CounterHandle,
    out_of_order: CounterHandle,
    lost: CounterHandle,
}

impl SessionMetrics {
    pub fn register(sink: Arc<dyn MetricSink>, transport: &str, target: &str) -> Result<Self> {
        let mut created: Vec<CounterHandle> = Vec::with_capacity(4);
        for field in ["sent", "received", "out_of_order", "lost"] {
            let name = sanitize_metric_name(&format!("{}_{}_{}", transport, target, field));
            match sink.create(&name) {
                Ok(handle) => created.push(handle),
                Err(e) => {
                    for handle in created {
                        if let Err(e) = sink.remove(handle) {
                            warn!("{:#}", e);
                        }
                    }
                    return Err(e);
                }
            }
        }

        let [sent, received, out_of_order, lost]: [CounterHandle; 4] = created
            .try_into()
            .map_err(|_| anyhow!("expected four counters for {} {}", transport, target))?;
        Ok(Self {
            sink,
            sent,
            received,
            out_of_order,
            lost,
        })
    }

    pub fn add(&self, delta: SessionCounters) {
        self.sink.increment(&self.sent, delta.sent);
        self.sink.increment(&self.received, delta.received);
        self.sink.increment(&self.out_of_order, delta.out_of_order);
        self.sink.increment(&self.lost, delta.lost);
    }

    /// Removes all four counters. Reporters still holding this set keep
    /// working, their increments are dropped by the sink.
    pub fn unregister(&self) {
        let handles = [&self.sent, &self.received, &self.out_of_order, &self.lost];
        for handle in handles {
            if let Err(e) = self.sink.remove(handle.clone()) {
                warn!("{:#}", e);
            }
        }
    }
}

/// Feeds one session's reports into its [`SessionMetrics`].
///
/// TCP sessions report cumulative counters, so only the growth since the
/// previous report of the same session is added. UDP sessions already report
/// deltas. A new adapter is made for every session.
pub struct SinkReporter {
    metrics: Arc<SessionMetrics>,
    previous: Option<Mutex<SessionCounters>>,
}

impl SinkReporter {
    pub fn cumulative(metrics: Arc<SessionMetrics>) -> Self {
        Self {
            metrics,
            previous: Some(Mutex::new(SessionCounters::default())),
        }
    }

    pub fn delta(metrics: Arc<SessionMetrics>) -> Self {
        Self {
            metrics,
            previous: None,
        }
    }
}

impl Reporter for SinkReporter {
    fn report(&self, report: Report) {
        let counters = report.counters();
        let delta = match &self.previous {
            Some(previous) => {
                let mut previous = previous.lock().unwrap_or_else(|e| e.into_inner());
                let delta = counters.since(&previous);
                *previous = counters;
                delta
            }
            None => counters,
        };
        self.metrics.add(delta);
    }
}
