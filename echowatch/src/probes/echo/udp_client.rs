use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use echowatch_common::{DeltaTracker, SessionCounters};
use log::{debug, info};
use tokio::{
    net::UdpSocket,
    time::{self, Instant, MissedTickBehavior},
};

use super::{EchoConfig, ExchangeOutcome, READ_BUFFER_SIZE, classify_echo, encode_sequence};
use crate::probes::{
    ReportTicker, Reporter, SharedCounters, Shutdown, now_report, read_counters, update_counters,
};

/// Client half of a UDP echo session.
///
/// Dropped datagrams are normal here: a read timeout counts as lost and the
/// session carries on. Any other read failure ends the session.
pub struct UdpEchoClient {
    socket: UdpSocket,
    peer: SocketAddr,
    config: EchoConfig,
    counters: SharedCounters,
    sequence: u64,
    buf: Vec<u8>,
}

/// Emits per-interval deltas of one session's counters.
struct DeltaReporter {
    peer: SocketAddr,
    counters: SharedCounters,
    tracker: Mutex<DeltaTracker>,
    reporter: Arc<dyn Reporter>,
}

impl DeltaReporter {
    fn flush(&self) {
        let delta = {
            let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
            tracker.advance(read_counters(&self.counters))
        };
        let report = now_report(delta);
        info!(
            "UDP {} sent: {}, received: {}, outOfOrder: {}, lost: {}",
            self.peer, report.sent, report.received, report.out_of_order, report.lost
        );
        self.reporter.report(report);
    }
}

impl UdpEchoClient {
    pub async fn connect(addr: SocketAddr, config: EchoConfig) -> Result<Self> {
        let local = match addr.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local)
            .await
            .context("Failed to bind UDP client socket")?;
        socket
            .connect(addr)
            .await
            .with_context(|| format!("Failed to connect to UDP {}", addr))?;
        info!("connected to UDP {}", addr);

        Ok(Self {
            socket,
            peer: addr,
            config,
            counters: SharedCounters::default(),
            sequence: 0,
            buf: vec![0u8; READ_BUFFER_SIZE],
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn counters(&self) -> SessionCounters {
        read_counters(&self.counters)
    }

    /// Sends the next sequence number and waits for one datagram back.
    pub async fn exchange(&mut self) -> Result<ExchangeOutcome> {
        let expiry = Instant::now() + self.config.deadline;
        self.sequence += 1;
        let sequence = self.sequence;
        update_counters(&self.counters, |c| c.sent += 1);

        let payload = encode_sequence(sequence);
        match time::timeout_at(expiry, self.socket.send(payload.as_bytes())).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("send {} to UDP {} failed: {}", sequence, self.peer, e);
                update_counters(&self.counters, |c| c.lost += 1);
                return Ok(ExchangeOutcome::Lost);
            }
            Err(_) => {
                debug!("send {} to UDP {} timed out", sequence, self.peer);
                update_counters(&self.counters, |c| c.lost += 1);
                return Ok(ExchangeOutcome::Lost);
            }
        }

        let n = match time::timeout_at(expiry, self.socket.recv(&mut self.buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                update_counters(&self.counters, |c| c.lost += 1);
                return Err(e).with_context(|| format!("Failed read from UDP {}", self.peer));
            }
            Err(_) => {
                debug!("echo of {} from UDP {} timed out", sequence, self.peer);
                update_counters(&self.counters, |c| c.lost += 1);
                return Ok(ExchangeOutcome::Lost);
            }
        };

        let outcome = classify_echo(&self.buf[..n], sequence)?;
        update_counters(&self.counters, |c| match outcome {
            ExchangeOutcome::Received => c.received += 1,
            _ => c.out_of_order += 1,
        });
        Ok(outcome)
    }

    /// Runs the send/verify loop until a read fails or shutdown is requested.
    ///
    /// `reporter` receives deltas: once at start (always zero), every report
    /// interval, and a final flush when the session ends for any reason.
    pub async fn run(mut self, reporter: Arc<dyn Reporter>, shutdown: Shutdown) -> Result<()> {
        let deltas = Arc::new(DeltaReporter {
            peer: self.peer,
            counters: self.counters.clone(),
            tracker: Mutex::new(DeltaTracker::new()),
            reporter,
        });
        // the suppressed first report: zero against a zero baseline, every session
        deltas.flush();

        let ticker = ReportTicker::spawn(self.config.report_interval, shutdown.clone(), {
            let deltas = deltas.clone();
            move || {
                deltas.flush();
                std::future::ready(())
            }
        });

        let result = self.send_loop(&shutdown).await;

        drop(ticker);
        deltas.flush();
        info!("lost connection to UDP {}", self.peer);
        result
    }

    async fn send_loop(&mut self, shutdown: &Shutdown) -> Result<()> {
        let mut send = time::interval(self.config.send_interval);
        send.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.requested() => return Ok(()),
                _ = send.tick() => {}
            }

            let outcome = tokio::select! {
                _ = shutdown.requested() => return Ok(()),
                outcome = self.exchange() => outcome?,
            };

            if outcome == ExchangeOutcome::Closed {
                return Ok(());
            }
        }
    }
}
