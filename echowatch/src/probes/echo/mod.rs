//! Round-trip echo probes.
//!
//! ## Roles
//! - **TcpEchoServer / UdpEchoServer**: byte-for-byte reflectors
//! - **TcpEchoClient / UdpEchoClient**: send an increasing decimal sequence
//!   number every send interval and verify the echo
//!
//! Each client exchange ends up in exactly one of `received`, `out_of_order`
//! or `lost` (or closes the session cleanly). TCP reports cumulative counters,
//! UDP reports deltas since the previous report.

pub mod session_metrics;
pub mod tcp_client;
pub mod tcp_server;
pub mod udp_client;
pub mod udp_server;

pub use session_metrics::{SessionMetrics, SinkReporter};
pub use tcp_client::TcpEchoClient;
pub use tcp_server::TcpEchoServer;
pub use udp_client::UdpEchoClient;
pub use udp_server::UdpEchoServer;

use std::{
    io,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use tokio::net::lookup_host;

use crate::settings::EchoSettings;

/// Large enough for any datagram.
pub const READ_BUFFER_SIZE: usize = 65536;

/// Result of one send/verify step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// Echo matched the sequence number just sent.
    Received,
    /// Echo carried some other sequence number.
    OutOfOrder,
    /// The exchange failed but the session can go on.
    Lost,
    /// Peer closed the stream; the session ends without error.
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct EchoConfig {
    pub send_interval: Duration,
    /// Combined write+read budget, measured from send time.
    pub deadline: Duration,
    pub report_interval: Duration,
}

impl EchoConfig {
    pub fn tcp(settings: &EchoSettings) -> Self {
        Self {
            send_interval: settings.send_interval(),
            deadline: settings.tcp_deadline(),
            report_interval: settings.tcp_report_interval(),
        }
    }

    pub fn udp(settings: &EchoSettings) -> Self {
        Self {
            send_interval: settings.send_interval(),
            deadline: settings.udp_deadline(),
            report_interval: settings.udp_report_interval(),
        }
    }
}

pub fn encode_sequence(sequence: u64) -> String {
    sequence.to_string()
}

/// Compares an echoed payload against the most recently sent sequence number.
pub fn classify_echo(payload: &[u8], expected: u64) -> Result<ExchangeOutcome> {
    let text = std::str::from_utf8(payload).context("echo payload is not UTF-8")?;
    let ack: u64 = text
        .trim()
        .parse()
        .with_context(|| format!("echo payload {:?} is not a sequence number", text))?;

    if ack == expected {
        Ok(ExchangeOutcome::Received)
    } else {
        Ok(ExchangeOutcome::OutOfOrder)
    }
}

/// Write errors that mean the peer is gone rather than congested.
pub fn is_write_end_of_stream(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero | io::ErrorKind::BrokenPipe
    )
}

/// Resolves `host`, `host:port`, `ip` or `ip:port`, preferring IPv4.
pub async fn resolve_target(target: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let has_port = target
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());

    let resolved = if has_port {
        lookup_host(target).await.map(|addrs| addrs.collect::<Vec<_>>())
    } else {
        lookup_host((target, default_port))
            .await
            .map(|addrs| addrs.collect::<Vec<_>>())
    };
    let addrs = resolved.with_context(|| format!("Failed to resolve {}", target))?;

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| anyhow!("{} resolved to no addresses", target))
}
