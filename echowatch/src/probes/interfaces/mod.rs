//! Host network-interface counters.
//!
//! A [`InterfaceSource`] produces one [`InterfaceSnapshot`] per interface,
//! the [`Collector`] turns successive snapshots into metric bindings, and the
//! [`SnapshotBuffer`] keeps the latest raw snapshot for HTTP readers.

pub mod collector;
pub mod proc_net_dev;
pub mod sysfs;

pub use collector::{Collector, PollSummary};
pub use proc_net_dev::ProcNetDevSource;
pub use sysfs::SysfsSource;

use std::sync::RwLock;

use anyhow::{Result, bail};
use bytes::Bytes;
use echowatch_common::InterfaceSnapshot;

use crate::settings::InterfaceSettings;

/// Reads the current counters of every interface on the host.
pub trait InterfaceSource: Send {
    fn name(&self) -> &'static str;

    /// Returns snapshots sorted by interface name.
    fn snapshot(&self) -> Result<Vec<InterfaceSnapshot>>;
}

pub fn source_from_settings(settings: &InterfaceSettings) -> Result<Box<dyn InterfaceSource>> {
    match settings.source() {
        "sysfs" => Ok(Box::new(SysfsSource::new(settings.sysfs_root()))),
        "procfs" => Ok(Box::new(ProcNetDevSource)),
        other => bail!("unknown interface source {:?} (expected sysfs or procfs)", other),
    }
}

const EMPTY_SNAPSHOT: &[u8] = b"[]";

/// Most recently published snapshot, serialized as a JSON array.
pub struct SnapshotBuffer {
    body: RwLock<Bytes>,
}

impl Default for SnapshotBuffer {
    fn default() -> Self {
        Self {
            body: RwLock::new(Bytes::from_static(EMPTY_SNAPSHOT)),
        }
    }
}

impl SnapshotBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, body: Bytes) {
        *self.body.write().unwrap_or_else(|e| e.into_inner()) = body;
    }

    /// Cheap clone of the current body; never waits on the collector.
    pub fn read(&self) -> Bytes {
        self.body.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
