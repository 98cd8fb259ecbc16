use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use echowatch_common::{InterfaceCounters, InterfaceSnapshot};
use procfs::net::DeviceStatus;

use super::InterfaceSource;

/// Reads `/proc/net/dev`.
///
/// Only the sixteen counters that file carries are filled in; MAC, ifindex
/// and MTU are not available there and stay empty.
pub struct ProcNetDevSource;

impl InterfaceSource for ProcNetDevSource {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn snapshot(&self) -> Result<Vec<InterfaceSnapshot>> {
        let devices = procfs::net::dev_status().context("Failed to read /proc/net/dev")?;
        let timestamp = Utc::now();

        let mut snapshots: Vec<_> = devices
            .values()
            .map(|dev| from_device_status(dev, timestamp))
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }
}

fn from_device_status(dev: &DeviceStatus, timestamp: DateTime<Utc>) -> InterfaceSnapshot {
    InterfaceSnapshot {
        timestamp,
        name: dev.name.clone(),
        counters: InterfaceCounters {
            rx_bytes: dev.recv_bytes,
            rx_packets: dev.recv_packets,
            rx_errors: dev.recv_errs,
            rx_dropped: dev.recv_drop,
            rx_fifo_errors: dev.recv_fifo,
            rx_frame_errors: dev.recv_frame,
            rx_compressed: dev.recv_compressed,
            multicast: dev.recv_multicast,
            tx_bytes: dev.sent_bytes,
            tx_packets: dev.sent_packets,
            tx_errors: dev.sent_errs,
            tx_dropped: dev.sent_drop,
            tx_fifo_errors: dev.sent_fifo,
            collisions: dev.sent_colls,
            tx_carrier_errors: dev.sent_carrier,
            tx_compressed: dev.sent_compressed,
            ..Default::default()
        },
        ..Default::default()
    }
}
