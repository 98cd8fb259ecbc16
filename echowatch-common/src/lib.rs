//! Data model shared between the echo engine, the interface collector and
//! the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One interface's counters at a point in time.
///
/// Created fresh on every poll and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub mac: String,
    pub if_index: u64,
    pub mtu: u64,
    #[serde(flatten)]
    pub counters: InterfaceCounters,
}

/// Kernel traffic/error counters, named after `/sys/class/net/*/statistics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub collisions: u64,
    pub multicast: u64,
    pub rx_bytes: u64,
    pub rx_compressed: u64,
    pub rx_crc_errors: u64,
    pub rx_dropped: u64,
    pub rx_errors: u64,
    pub rx_fifo_errors: u64,
    pub rx_frame_errors: u64,
    pub rx_length_errors: u64,
    pub rx_missed_errors: u64,
    pub rx_nohandler: u64,
    pub rx_over_errors: u64,
    pub rx_packets: u64,
    pub tx_aborted_errors: u64,
    pub tx_bytes: u64,
    pub tx_carrier_errors: u64,
    pub tx_compressed: u64,
    pub tx_dropped: u64,
    pub tx_errors: u64,
    pub tx_fifo_errors: u64,
    pub tx_heartbeat_errors: u64,
    pub tx_packets: u64,
    pub tx_window_errors: u64,
}

/// Every value of an [`InterfaceSnapshot`] that gets its own metric binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterField {
    IfIndex,
    Mtu,
    Collisions,
    Multicast,
    RxBytes,
    RxCompressed,
    RxCrcErrors,
    RxDropped,
    RxErrors,
    RxFifoErrors,
    RxFrameErrors,
    RxLengthErrors,
    RxMissedErrors,
    RxNohandler,
    RxOverErrors,
    RxPackets,
    TxAbortedErrors,
    TxBytes,
    TxCarrierErrors,
    TxCompressed,
    TxDropped,
    TxErrors,
    TxFifoErrors,
    TxHeartbeatErrors,
    TxPackets,
    TxWindowErrors,
}

impl CounterField {
    pub const ALL: [CounterField; 26] = [
        CounterField::IfIndex,
        CounterField::Mtu,
        CounterField::Collisions,
        CounterField::Multicast,
        CounterField::RxBytes,
        CounterField::RxCompressed,
        CounterField::RxCrcErrors,
        CounterField::RxDropped,
        CounterField::RxErrors,
        CounterField::RxFifoErrors,
        CounterField::RxFrameErrors,
        CounterField::RxLengthErrors,
        CounterField::RxMissedErrors,
        CounterField::RxNohandler,
        CounterField::RxOverErrors,
        CounterField::RxPackets,
        CounterField::TxAbortedErrors,
        CounterField::TxBytes,
        CounterField::TxCarrierErrors,
        CounterField::TxCompressed,
        CounterField::TxDropped,
        CounterField::TxErrors,
        CounterField::TxFifoErrors,
        CounterField::TxHeartbeatErrors,
        CounterField::TxPackets,
        CounterField::TxWindowErrors,
    ];

    /// Metric name suffix; for statistics counters this is also the sysfs file name.
    pub fn suffix(self) -> &'static str {
        match self {
            CounterField::IfIndex => "if_index",
            CounterField::Mtu => "mtu",
            CounterField::Collisions => "collisions",
            CounterField::Multicast => "multicast",
            CounterField::RxBytes => "rx_bytes",
            CounterField::RxCompressed => "rx_compressed",
            CounterField::RxCrcErrors => "rx_crc_errors",
            CounterField::RxDropped => "rx_dropped",
            CounterField::RxErrors => "rx_errors",
            CounterField::RxFifoErrors => "rx_fifo_errors",
            CounterField::RxFrameErrors => "rx_frame_errors",
            CounterField::RxLengthErrors => "rx_length_errors",
            CounterField::RxMissedErrors => "rx_missed_errors",
            CounterField::RxNohandler => "rx_nohandler",
            CounterField::RxOverErrors => "rx_over_errors",
            CounterField::RxPackets => "rx_packets",
            CounterField::TxAbortedErrors => "tx_aborted_errors",
            CounterField::TxBytes => "tx_bytes",
            CounterField::TxCarrierErrors => "tx_carrier_errors",
            CounterField::TxCompressed => "tx_compressed",
            CounterField::TxDropped => "tx_dropped",
            CounterField::TxErrors => "tx_errors",
            CounterField::TxFifoErrors => "tx_fifo_errors",
            CounterField::TxHeartbeatErrors => "tx_heartbeat_errors",
            CounterField::TxPackets => "tx_packets",
            CounterField::TxWindowErrors => "tx_window_errors",
        }
    }

    /// Maps a `statistics/<file>` name to its field. `if_index` and `mtu`
    /// live outside that directory and are never matched here.
    pub fn from_stat_name(name: &str) -> Option<CounterField> {
        CounterField::ALL
            .into_iter()
            .filter(|f| !matches!(f, CounterField::IfIndex | CounterField::Mtu))
            .find(|f| f.suffix() == name)
    }

    pub fn value(self, snapshot: &InterfaceSnapshot) -> u64 {
        let c = &snapshot.counters;
        match self {
            CounterField::IfIndex => snapshot.if_index,
            CounterField::Mtu => snapshot.mtu,
            CounterField::Collisions => c.collisions,
            CounterField::Multicast => c.multicast,
            CounterField::RxBytes => c.rx_bytes,
            CounterField::RxCompressed => c.rx_compressed,
            CounterField::RxCrcErrors => c.rx_crc_errors,
            CounterField::RxDropped => c.rx_dropped,
            CounterField::RxErrors => c.rx_errors,
            CounterField::RxFifoErrors => c.rx_fifo_errors,
            CounterField::RxFrameErrors => c.rx_frame_errors,
            CounterField::RxLengthErrors => c.rx_length_errors,
            CounterField::RxMissedErrors => c.rx_missed_errors,
            CounterField::RxNohandler => c.rx_nohandler,
            CounterField::RxOverErrors => c.rx_over_errors,
            CounterField::RxPackets => c.rx_packets,
            CounterField::TxAbortedErrors => c.tx_aborted_errors,
            CounterField::TxBytes => c.tx_bytes,
            CounterField::TxCarrierErrors => c.tx_carrier_errors,
            CounterField::TxCompressed => c.tx_compressed,
            CounterField::TxDropped => c.tx_dropped,
            CounterField::TxErrors => c.tx_errors,
            CounterField::TxFifoErrors => c.tx_fifo_errors,
            CounterField::TxHeartbeatErrors => c.tx_heartbeat_errors,
            CounterField::TxPackets => c.tx_packets,
            CounterField::TxWindowErrors => c.tx_window_errors,
        }
    }

    pub fn set(self, snapshot: &mut InterfaceSnapshot, value: u64) {
        let c = &mut snapshot.counters;
        let slot = match self {
            CounterField::IfIndex => &mut snapshot.if_index,
            CounterField::Mtu => &mut snapshot.mtu,
            CounterField::Collisions => &mut c.collisions,
            CounterField::Multicast => &mut c.multicast,
            CounterField::RxBytes => &mut c.rx_bytes,
            CounterField::RxCompressed => &mut c.rx_compressed,
            CounterField::RxCrcErrors => &mut c.rx_crc_errors,
            CounterField::RxDropped => &mut c.rx_dropped,
            CounterField::RxErrors => &mut c.rx_errors,
            CounterField::RxFifoErrors => &mut c.rx_fifo_errors,
            CounterField::RxFrameErrors => &mut c.rx_frame_errors,
            CounterField::RxLengthErrors => &mut c.rx_length_errors,
            CounterField::RxMissedErrors => &mut c.rx_missed_errors,
            CounterField::RxNohandler => &mut c.rx_nohandler,
            CounterField::RxOverErrors => &mut c.rx_over_errors,
            CounterField::RxPackets => &mut c.rx_packets,
            CounterField::TxAbortedErrors => &mut c.tx_aborted_errors,
            CounterField::TxBytes => &mut c.tx_bytes,
            CounterField::TxCarrierErrors => &mut c.tx_carrier_errors,
            CounterField::TxCompressed => &mut c.tx_compressed,
            CounterField::TxDropped => &mut c.tx_dropped,
            CounterField::TxErrors => &mut c.tx_errors,
            CounterField::TxFifoErrors => &mut c.tx_fifo_errors,
            CounterField::TxHeartbeatErrors => &mut c.tx_heartbeat_errors,
            CounterField::TxPackets => &mut c.tx_packets,
            CounterField::TxWindowErrors => &mut c.tx_window_errors,
        };
        *slot = value;
    }
}

/// Delivery outcomes of one echo session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub sent: u64,
    pub received: u64,
    pub out_of_order: u64,
    pub lost: u64,
}

impl SessionCounters {
    /// Field-wise difference against an earlier reading of the same session.
    pub fn since(&self, earlier: &SessionCounters) -> SessionCounters {
        SessionCounters {
            sent: self.sent.saturating_sub(earlier.sent),
            received: self.received.saturating_sub(earlier.received),
            out_of_order: self.out_of_order.saturating_sub(earlier.out_of_order),
            lost: self.lost.saturating_sub(earlier.lost),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == SessionCounters::default()
    }
}

/// Point-in-time counters handed to a report callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub timestamp: DateTime<Utc>,
    pub sent: u64,
    pub received: u64,
    pub out_of_order: u64,
    pub lost: u64,
}

impl Report {
    pub fn new(timestamp: DateTime<Utc>, counters: SessionCounters) -> Self {
        Self {
            timestamp,
            sent: counters.sent,
            received: counters.received,
            out_of_order: counters.out_of_order,
            lost: counters.lost,
        }
    }

    pub fn counters(&self) -> SessionCounters {
        SessionCounters {
            sent: self.sent,
            received: self.received,
            out_of_order: self.out_of_order,
            lost: self.lost,
        }
    }
}

/// Turns successive cumulative readings into per-interval deltas.
///
/// The first reading only establishes the baseline and yields all zeros.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    last: Option<SessionCounters>,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, current: SessionCounters) -> SessionCounters {
        let delta = match &self.last {
            Some(last) => current.since(last),
            None => SessionCounters::default(),
        };
        self.last = Some(current);
        delta
    }
}
