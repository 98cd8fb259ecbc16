use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use echowatch_common::{CounterField, InterfaceSnapshot};

use super::InterfaceSource;

/// Reads `/sys/class/net/<iface>/{address,ifindex,mtu,statistics/*}`.
///
/// Entries without a `statistics` directory are not interfaces we can
/// account for and are skipped, as are interfaces that vanish mid-read.
pub struct SysfsSource {
    root: PathBuf,
}

impl SysfsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl InterfaceSource for SysfsSource {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn snapshot(&self) -> Result<Vec<InterfaceSnapshot>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list {}", self.root.display()))?;

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to list {}", self.root.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let timestamp = Utc::now();

            if let Some(snapshot) = read_interface(&self.root.join(&name), name, timestamp)? {
                snapshots.push(snapshot);
            }
        }

        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }
}

fn read_interface(
    dir: &Path,
    name: String,
    timestamp: DateTime<Utc>,
) -> Result<Option<InterfaceSnapshot>> {
    let stats_dir = dir.join("statistics");
    let stats = match fs::read_dir(&stats_dir) {
        Ok(stats) => stats,
        Err(_) => return Ok(None),
    };

    let Some(mac) = read_attr(&dir.join("address"))? else {
        return Ok(None);
    };
    let Some(if_index) = read_number(&dir.join("ifindex"))? else {
        return Ok(None);
    };
    let Some(mtu) = read_number(&dir.join("mtu"))? else {
        return Ok(None);
    };

    let mut snapshot = InterfaceSnapshot {
        timestamp,
        name,
        mac,
        if_index,
        mtu,
        ..Default::default()
    };

    for stat in stats {
        let stat = stat.with_context(|| format!("Failed to list {}", stats_dir.display()))?;
        let file_name = stat.file_name();
        let Some(field) = CounterField::from_stat_name(&file_name.to_string_lossy()) else {
            continue;
        };
        let Some(value) = read_number(&stat.path())? else {
            return Ok(None);
        };
        field.set(&mut snapshot, value);
    }

    Ok(Some(snapshot))
}

/// `None` when the file is gone (interface removed while reading).
fn read_attr(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

fn read_number(path: &Path) -> Result<Option<u64>> {
    let Some(raw) = read_attr(path)? else {
        return Ok(None);
    };
    let value = raw
        .parse()
        .with_context(|| format!("Failed to parse {} value {:?}", path.display(), raw))?;
    Ok(Some(value))
}
