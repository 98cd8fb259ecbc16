use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use echowatch_common::{CounterField, InterfaceSnapshot};
use log::{debug, info, warn};
use tokio::time::{self, MissedTickBehavior};

use super::{InterfaceSource, SnapshotBuffer};
use crate::probes::Shutdown;
use crate::telemetry::{CounterHandle, MetricSink, sanitize_metric_name};

/// What one poll changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

/// One metric binding per [`CounterField`] of a single interface.
struct InterfaceMetricSet {
    handles: Vec<(CounterField, CounterHandle)>,
}

impl InterfaceMetricSet {
    /// Registers every binding and seeds it with `first`, so the exported
    /// value starts equal to the kernel counter.
    fn create(sink: &dyn MetricSink, first: &InterfaceSnapshot) -> Result<Self> {
        let mut set = Self {
            handles: Vec::with_capacity(CounterField::ALL.len()),
        };

        for field in CounterField::ALL {
            let name = sanitize_metric_name(&format!("{}_{}", first.name, field.suffix()));
            match sink.create(&name) {
                Ok(handle) => set.handles.push((field, handle)),
                Err(e) => {
                    // leave nothing half-registered behind
                    if let Err(undo) = set.destroy(sink) {
                        warn!("Failed to roll back metrics of {}: {:#}", first.name, undo);
                    }
                    return Err(e);
                }
            }
        }

        for (field, handle) in &set.handles {
            sink.increment(handle, field.value(first));
        }
        Ok(set)
    }

    /// Adds the growth since `previous`. A counter that went backwards
    /// (driver reset) adds nothing; `current` becomes the next baseline.
    fn update(&self, sink: &dyn MetricSink, previous: &InterfaceSnapshot, current: &InterfaceSnapshot) {
        for (field, handle) in &self.handles {
            let (before, now) = (field.value(previous), field.value(current));
            if now > before {
                sink.increment(handle, now - before);
            }
        }
    }

    /// Unregisters every binding, even if some of them fail.
    fn destroy(self, sink: &dyn MetricSink) -> Result<()> {
        let mut first_error = None;
        for (_, handle) in self.handles {
            if let Err(e) = sink.remove(handle) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Polls an [`InterfaceSource`] and keeps one [`InterfaceMetricSet`] per
/// live interface, reconciling the tracked set against every new snapshot.
pub struct Collector {
    source: Box<dyn InterfaceSource>,
    sink: Arc<dyn MetricSink>,
    buffer: Arc<SnapshotBuffer>,
    poll_interval: Duration,
    sets: HashMap<String, InterfaceMetricSet>,
    previous: HashMap<String, InterfaceSnapshot>,
    // interfaces whose registration failed, retried quietly every poll
    rejected: HashSet<String>,
}

impl Collector {
    pub fn new(
        source: Box<dyn InterfaceSource>,
        sink: Arc<dyn MetricSink>,
        buffer: Arc<SnapshotBuffer>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            sink,
            buffer,
            poll_interval,
            sets: HashMap::new(),
            previous: HashMap::new(),
            rejected: HashSet::new(),
        }
    }

    /// Names of the interfaces that currently have bindings.
    pub fn tracked(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.sets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// One fetch/publish/reconcile cycle. On error nothing is changed.
    pub fn poll_once(&mut self) -> Result<PollSummary> {
        let snapshots = self
            .source
            .snapshot()
            .with_context(|| format!("Failed to read interfaces from {}", self.source.name()))?;

        let body = serde_json::to_vec(&snapshots).context("Failed to serialize interface snapshot")?;
        self.buffer.publish(Bytes::from(body));

        let current: HashMap<String, InterfaceSnapshot> = snapshots
            .into_iter()
            .map(|snapshot| (snapshot.name.clone(), snapshot))
            .collect();

        let mut summary = PollSummary::default();

        let gone: Vec<String> = self
            .sets
            .keys()
            .filter(|name| !current.contains_key(*name))
            .cloned()
            .collect();
        for name in gone {
            if let Some(set) = self.sets.remove(&name) {
                if let Err(e) = set.destroy(self.sink.as_ref()) {
                    warn!("Failed to unregister metrics of {}: {:#}", name, e);
                }
            }
            self.previous.remove(&name);
            info!("interface {} removed", name);
            summary.removed += 1;
        }

        let mut seen = HashSet::with_capacity(current.len());
        for (name, snapshot) in &current {
            let updated = match (self.sets.get(name), self.previous.get(name)) {
                (Some(set), Some(previous)) => {
                    set.update(self.sink.as_ref(), previous, snapshot);
                    true
                }
                _ => false,
            };

            if updated {
                summary.updated += 1;
            } else {
                match InterfaceMetricSet::create(self.sink.as_ref(), snapshot) {
                    Ok(set) => {
                        info!("interface {} added", name);
                        self.rejected.remove(name);
                        self.sets.insert(name.clone(), set);
                        summary.added += 1;
                    }
                    Err(e) => {
                        if self.rejected.insert(name.clone()) {
                            warn!("Failed to register metrics of {}: {:#}", name, e);
                        } else {
                            debug!("still cannot register metrics of {}: {:#}", name, e);
                        }
                        continue;
                    }
                }
            }
            seen.insert(name.clone());
        }

        self.rejected.retain(|name| current.contains_key(name));
        self.previous = current
            .into_iter()
            .filter(|(name, _)| seen.contains(name))
            .collect();

        Ok(summary)
    }

    /// Polls every interval until shutdown, then unregisters every binding.
    pub async fn run(mut self, shutdown: Shutdown) {
        info!(
            "interface collector started (source: {}, every {:?})",
            self.source.name(),
            self.poll_interval
        );
        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.requested() => break,
                _ = interval.tick() => {}
            }

            match self.poll_once() {
                Ok(summary) => debug!("interface poll: {:?}", summary),
                Err(e) => warn!("Skipping interface poll: {:#}", e),
            }
        }

        self.release_all();
        info!("interface collector stopped");
    }

    fn release_all(&mut self) {
        for (name, set) in self.sets.drain() {
            if let Err(e) = set.destroy(self.sink.as_ref()) {
                warn!("Failed to unregister metrics of {}: {:#}", name, e);
            }
        }
        self.previous.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::ShutdownTrigger;
    use crate::telemetry::MetricRegistry;
    use anyhow::bail;
    use std::sync::Mutex;

    /// Serves a scripted sequence of snapshots; `None` is a read failure.
    /// Once the script runs out the last good snapshot repeats.
    struct ScriptedSource {
        polls: Mutex<Vec<Option<Vec<InterfaceSnapshot>>>>,
        last: Mutex<Vec<InterfaceSnapshot>>,
    }

    impl ScriptedSource {
        fn new(mut polls: Vec<Option<Vec<InterfaceSnapshot>>>) -> Self {
            polls.reverse();
            Self {
                polls: Mutex::new(polls),
                last: Mutex::new(Vec::new()),
            }
        }
    }

    impl InterfaceSource for ScriptedSource {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn snapshot(&self) -> Result<Vec<InterfaceSnapshot>> {
            let mut last = self.last.lock().unwrap();
            match self.polls.lock().unwrap().pop() {
                Some(Some(snapshots)) => {
                    *last = snapshots.clone();
                    Ok(snapshots)
                }
                Some(None) => bail!("read failed"),
                None => Ok(last.clone()),
            }
        }
    }

    fn iface(name: &str, rx_bytes: u64, tx_packets: u64) -> InterfaceSnapshot {
        let mut snapshot = InterfaceSnapshot {
            name: name.to_string(),
            mac: "00:11:22:33:44:55".to_string(),
            if_index: 2,
            mtu: 1500,
            ..Default::default()
        };
        snapshot.counters.rx_bytes = rx_bytes;
        snapshot.counters.tx_packets = tx_packets;
        snapshot
    }

    fn collector(
        polls: Vec<Option<Vec<InterfaceSnapshot>>>,
    ) -> (Collector, Arc<MetricRegistry>, Arc<SnapshotBuffer>) {
        let registry = Arc::new(MetricRegistry::new());
        let buffer = Arc::new(SnapshotBuffer::new());
        let collector = Collector::new(
            Box::new(ScriptedSource::new(polls)),
            registry.clone(),
            buffer.clone(),
            Duration::from_millis(10),
        );
        (collector, registry, buffer)
    }

    #[test]
    fn test_new_interface_is_seeded_with_absolute_values() {
        let (mut collector, registry, _) = collector(vec![Some(vec![iface("eth0", 1000, 5)])]);

        let summary = collector.poll_once().unwrap();
        assert_eq!(summary, PollSummary { added: 1, removed: 0, updated: 0 });
        assert_eq!(registry.len(), CounterField::ALL.len());
        assert_eq!(registry.value("eth0_rx_bytes"), Some(1000));
        assert_eq!(registry.value("eth0_tx_packets"), Some(5));
        assert_eq!(registry.value("eth0_mtu"), Some(1500));
        assert_eq!(registry.value("eth0_if_index"), Some(2));
    }

    #[test]
    fn test_existing_interface_adds_deltas() {
        let (mut collector, registry, _) = collector(vec![
            Some(vec![iface("eth0", 1000, 5)]),
            Some(vec![iface("eth0", 1500, 9)]),
            Some(vec![iface("eth0", 1500, 9)]),
        ]);

        collector.poll_once().unwrap();
        let summary = collector.poll_once().unwrap();
        assert_eq!(summary, PollSummary { added: 0, removed: 0, updated: 1 });
        assert_eq!(registry.value("eth0_rx_bytes"), Some(1500));
        assert_eq!(registry.value("eth0_tx_packets"), Some(9));

        collector.poll_once().unwrap();
        assert_eq!(registry.value("eth0_rx_bytes"), Some(1500));
        // constant gauges are not double counted
        assert_eq!(registry.value("eth0_mtu"), Some(1500));
    }

    #[test]
    fn test_removed_interface_unregisters_every_binding() {
        let (mut collector, registry, _) = collector(vec![
            Some(vec![iface("eth0", 10, 1), iface("wlan0", 20, 2)]),
            Some(vec![iface("eth0", 11, 1)]),
        ]);

        collector.poll_once().unwrap();
        assert_eq!(registry.len(), 2 * CounterField::ALL.len());

        let summary = collector.poll_once().unwrap();
        assert_eq!(summary, PollSummary { added: 0, removed: 1, updated: 1 });
        assert_eq!(registry.len(), CounterField::ALL.len());
        assert!(registry.snapshot().keys().all(|name| name.starts_with("eth0_")));
        assert_eq!(collector.tracked(), vec!["eth0"]);
    }

    #[test]
    fn test_readded_interface_gets_fresh_baseline() {
        let (mut collector, registry, _) = collector(vec![
            Some(vec![iface("eth0", 5000, 50)]),
            Some(vec![]),
            Some(vec![iface("eth0", 100, 1)]),
            Some(vec![iface("eth0", 160, 3)]),
        ]);

        collector.poll_once().unwrap();
        collector.poll_once().unwrap();
        assert!(registry.is_empty());

        let summary = collector.poll_once().unwrap();
        assert_eq!(summary.added, 1);
        assert_eq!(registry.value("eth0_rx_bytes"), Some(100));

        collector.poll_once().unwrap();
        assert_eq!(registry.value("eth0_rx_bytes"), Some(160));
        assert_eq!(registry.value("eth0_tx_packets"), Some(3));
    }

    #[test]
    fn test_counter_reset_does_not_underflow() {
        let (mut collector, registry, _) = collector(vec![
            Some(vec![iface("eth0", 9000, 90)]),
            Some(vec![iface("eth0", 100, 1)]),
            Some(vec![iface("eth0", 250, 4)]),
        ]);

        collector.poll_once().unwrap();
        collector.poll_once().unwrap();
        assert_eq!(registry.value("eth0_rx_bytes"), Some(9000));

        // growth after the reset counts from the new baseline
        collector.poll_once().unwrap();
        assert_eq!(registry.value("eth0_rx_bytes"), Some(9150));
        assert_eq!(registry.value("eth0_tx_packets"), Some(93));
    }

    #[test]
    fn test_source_failure_changes_nothing() {
        let (mut collector, registry, buffer) = collector(vec![
            Some(vec![iface("eth0", 10, 1)]),
            None,
            Some(vec![iface("eth0", 30, 1)]),
        ]);

        collector.poll_once().unwrap();
        let published = buffer.read();

        assert!(collector.poll_once().is_err());
        assert_eq!(buffer.read(), published);
        assert_eq!(registry.value("eth0_rx_bytes"), Some(10));

        collector.poll_once().unwrap();
        assert_eq!(registry.value("eth0_rx_bytes"), Some(30));
    }

    #[test]
    fn test_publishes_snapshot_json() {
        let (mut collector, _, buffer) = collector(vec![Some(vec![iface("lo", 42, 0)])]);
        assert_eq!(&buffer.read()[..], b"[]");

        collector.poll_once().unwrap();
        let published: Vec<InterfaceSnapshot> = serde_json::from_slice(&buffer.read()).unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].name, "lo");
        assert_eq!(published[0].counters.rx_bytes, 42);
    }

    #[test]
    fn test_colliding_names_register_once() {
        // both sanitize to eth_0
        let (mut collector, registry, _) =
            collector(vec![Some(vec![iface("eth-0", 1, 1), iface("eth.0", 2, 2)])]);

        let summary = collector.poll_once().unwrap();
        assert_eq!(summary.added, 1);
        assert_eq!(registry.len(), CounterField::ALL.len());
        assert_eq!(collector.tracked().len(), 1);
    }

    #[test]
    fn test_collision_is_remembered_until_interface_leaves() {
        let (mut collector, registry, _) = collector(vec![
            Some(vec![iface("eth-0", 1, 1), iface("eth.0", 2, 2)]),
            Some(vec![iface("eth-0", 3, 3), iface("eth.0", 4, 4)]),
            Some(vec![iface("eth.0", 5, 5)]),
        ]);

        collector.poll_once().unwrap();
        let kept = collector.tracked()[0].to_string();
        let loser = if kept == "eth-0" { "eth.0" } else { "eth-0" };
        assert!(collector.rejected.contains(loser));

        // the retry fails the same way without growing the registry
        let summary = collector.poll_once().unwrap();
        assert_eq!(summary.added, 0);
        assert_eq!(registry.len(), CounterField::ALL.len());
        assert!(collector.rejected.contains(loser));

        // eth-0 leaves; whichever of the two held the name, eth.0 now owns it
        collector.poll_once().unwrap();
        assert_eq!(collector.tracked(), vec!["eth.0"]);
        assert!(collector.rejected.is_empty());
        assert_eq!(registry.value("eth_0_rx_bytes"), Some(5));
    }

    /// Refuses `*_mtu` names and reports every removal as failed after
    /// performing it.
    struct GrudgingSink {
        inner: MetricRegistry,
    }

    impl MetricSink for GrudgingSink {
        fn create(&self, name: &str) -> Result<CounterHandle> {
            if name.ends_with("_mtu") {
                bail!("no room for {}", name);
            }
            self.inner.create(name)
        }

        fn increment(&self, handle: &CounterHandle, amount: u64) {
            self.inner.increment(handle, amount)
        }

        fn remove(&self, handle: CounterHandle) -> Result<()> {
            self.inner.remove(handle)?;
            bail!("remove acknowledged late")
        }
    }

    #[test]
    fn test_partial_set_is_rolled_back_past_failed_removals() {
        let sink = Arc::new(GrudgingSink {
            inner: MetricRegistry::new(),
        });
        let mut collector = Collector::new(
            Box::new(ScriptedSource::new(vec![Some(vec![iface("eth0", 1, 1)])])),
            sink.clone() as Arc<dyn MetricSink>,
            Arc::new(SnapshotBuffer::new()),
            Duration::from_millis(10),
        );

        let summary = collector.poll_once().unwrap();
        assert_eq!(summary.added, 0);
        assert!(collector.tracked().is_empty());
        assert!(sink.inner.is_empty());
    }

    #[tokio::test]
    async fn test_run_releases_bindings_on_shutdown() {
        let (collector, registry, _) = collector(vec![
            Some(vec![iface("eth0", 1, 1)]),
            Some(vec![iface("eth0", 2, 2)]),
        ]);
        let trigger = ShutdownTrigger::new();
        let task = tokio::spawn(collector.run(trigger.subscribe()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.contains("eth0_rx_bytes"));

        trigger.trigger();
        task.await.unwrap();
        assert!(registry.is_empty());
    }
}
