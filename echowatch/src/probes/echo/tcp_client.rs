use std::{io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result, anyhow};
use echowatch_common::SessionCounters;
use log::{debug, info};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{self, Instant, MissedTickBehavior},
};

use super::{EchoConfig, ExchangeOutcome, READ_BUFFER_SIZE, classify_echo, encode_sequence};
use crate::probes::{
    ReportTicker, Reporter, SharedCounters, Shutdown, now_report, read_counters, update_counters,
};

/// Client half of a TCP echo session.
///
/// A write failure counts as lost and the session carries on; a read
/// failure counts as lost and ends the session with the error.
pub struct TcpEchoClient {
    stream: TcpStream,
    peer: SocketAddr,
    config: EchoConfig,
    counters: SharedCounters,
    sequence: u64,
    buf: Vec<u8>,
}

impl TcpEchoClient {
    pub async fn connect(addr: SocketAddr, config: EchoConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to TCP {}", addr))?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        info!("connected to TCP {}", peer);

        Ok(Self {
            stream,
            peer,
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

    /// Sends the next sequence number and verifies its echo.
    pub async fn exchange(&mut self) -> Result<ExchangeOutcome> {
        let expiry = Instant::now() + self.config.deadline;
        self.sequence += 1;
        let sequence = self.sequence;
        update_counters(&self.counters, |c| c.sent += 1);

        let payload = encode_sequence(sequence);
        match time::timeout_at(expiry, self.stream.write_all(payload.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if super::is_write_end_of_stream(&e) => {
                return Ok(ExchangeOutcome::Closed);
            }
            Ok(Err(e)) => {
                debug!("write {} to TCP {} failed: {}", sequence, self.peer, e);
                update_counters(&self.counters, |c| c.lost += 1);
                return Ok(ExchangeOutcome::Lost);
            }
            Err(_) => {
                debug!("write {} to TCP {} timed out", sequence, self.peer);
                update_counters(&self.counters, |c| c.lost += 1);
                return Ok(ExchangeOutcome::Lost);
            }
        }

        let n = match time::timeout_at(expiry, self.stream.read(&mut self.buf)).await {
            Ok(Ok(0)) => return Ok(ExchangeOutcome::Closed),
            Ok(Ok(n)) => n,
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(ExchangeOutcome::Closed);
            }
            Ok(Err(e)) => {
                update_counters(&self.counters, |c| c.lost += 1);
                return Err(e).with_context(|| format!("Failed read from TCP {}", self.peer));
            }
            Err(_) => {
                update_counters(&self.counters, |c| c.lost += 1);
                return Err(anyhow!(
                    "read of {} from TCP {} timed out after {:?}",
                    sequence,
                    self.peer,
                    self.config.deadline
                ));
            }
        };

        let outcome = classify_echo(&self.buf[..n], sequence)?;
        update_counters(&self.counters, |c| match outcome {
            ExchangeOutcome::Received => c.received += 1,
            _ => c.out_of_order += 1,
        });
        Ok(outcome)
    }

    /// Runs the send/verify loop until the peer closes, a read fails or
    /// shutdown is requested. Cumulative counters go to `reporter` once per
    /// report interval and once more when the session ends.
    pub async fn run(mut self, reporter: Arc<dyn Reporter>, shutdown: Shutdown) -> Result<()> {
        let ticker = ReportTicker::spawn(self.config.report_interval, shutdown.clone(), {
            let counters = self.counters.clone();
            let peer = self.peer;
            let reporter = reporter.clone();
            move || {
                report_cumulative(peer, &counters, reporter.as_ref());
                std::future::ready(())
            }
        });

        let result = self.send_loop(&shutdown).await;

        drop(ticker);
        report_cumulative(self.peer, &self.counters, reporter.as_ref());
        info!("lost connection to TCP {}", self.peer);
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
                debug!("TCP {} closed the connection", self.peer);
                return Ok(());
            }
        }
    }
}

fn report_cumulative(peer: SocketAddr, counters: &SharedCounters, reporter: &dyn Reporter) {
    let report = now_report(read_counters(counters));
    info!(
        "TCP {} sent: {}, received: {}, outOfOrder: {}, lost: {}",
        peer, report.sent, report.received, report.out_of_order, report.lost
    );
    reporter.report(report);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::ShutdownTrigger;
    use crate::probes::echo::TcpEchoServer;
    use echowatch_common::Report;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn config(deadline: Duration) -> EchoConfig {
        EchoConfig {
            send_interval: Duration::from_millis(10),
            deadline,
            report_interval: Duration::from_millis(50),
        }
    }

    async fn echo_server() -> (SocketAddr, ShutdownTrigger) {
        let server = TcpEchoServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let trigger = ShutdownTrigger::new();
        tokio::spawn(server.run(trigger.subscribe()));
        (addr, trigger)
    }

    #[tokio::test]
    async fn test_clean_exchanges_are_all_received() {
        let (addr, _trigger) = echo_server().await;
        let mut client = TcpEchoClient::connect(addr, config(Duration::from_secs(1)))
            .await
            .unwrap();

        for _ in 0..50 {
            assert_eq!(client.exchange().await.unwrap(), ExchangeOutcome::Received);
        }

        assert_eq!(
            client.counters(),
            SessionCounters {
                sent: 50,
                received: 50,
                out_of_order: 0,
                lost: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_stale_echo_counts_out_of_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let mut last = 0u64;
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                // answer with the previous sequence number
                let seq: u64 = std::str::from_utf8(&buf[..n]).unwrap().parse().unwrap();
                stream.write_all(last.to_string().as_bytes()).await.unwrap();
                last = seq;
            }
        });

        let mut client = TcpEchoClient::connect(addr, config(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(client.exchange().await.unwrap(), ExchangeOutcome::OutOfOrder);
        assert_eq!(client.exchange().await.unwrap(), ExchangeOutcome::OutOfOrder);

        let counters = client.counters();
        assert_eq!(counters.sent, 2);
        assert_eq!(counters.received, 0);
        assert_eq!(counters.out_of_order, 2);
    }

    #[tokio::test]
    async fn test_read_timeout_is_lost_and_ends_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accepts and never answers
        let _silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let mut client = TcpEchoClient::connect(addr, config(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(client.exchange().await.is_err());
        assert_eq!(client.counters().lost, 1);
        assert_eq!(client.counters().sent, 1);
    }

    #[tokio::test]
    async fn test_write_failure_is_lost_then_broken_pipe_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let reset = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // close with RST instead of FIN
            stream.set_linger(Some(Duration::ZERO)).unwrap();
            drop(stream);
        });

        let mut client = TcpEchoClient::connect(addr, config(Duration::from_secs(1)))
            .await
            .unwrap();
        reset.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(client.exchange().await.unwrap(), ExchangeOutcome::Lost);
        assert_eq!(client.counters().lost, 1);
        assert_eq!(client.exchange().await.unwrap(), ExchangeOutcome::Closed);
        assert_eq!(client.counters().lost, 1);
        assert_eq!(client.counters().sent, 2);
    }

    #[tokio::test]
    async fn test_failed_session_reports_its_final_counters() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let client = TcpEchoClient::connect(addr, config(Duration::from_millis(20)))
            .await
            .unwrap();
        let reports = Arc::new(Mutex::new(Vec::<Report>::new()));
        let reporter: Arc<dyn Reporter> = {
            let reports = reports.clone();
            Arc::new(move |r: Report| reports.lock().unwrap().push(r))
        };
        let trigger = ShutdownTrigger::new();

        // the read times out before the first periodic report is due
        assert!(client.run(reporter, trigger.subscribe()).await.is_err());

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].sent, 1);
        assert_eq!(reports[0].lost, 1);
    }

    #[tokio::test]
    async fn test_peer_close_ends_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = TcpEchoClient::connect(addr, config(Duration::from_secs(1)))
            .await
            .unwrap();
        let trigger = ShutdownTrigger::new();
        let reporter: Arc<dyn Reporter> = Arc::new(|_: Report| {});

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            client.run(reporter, trigger.subscribe()),
        )
        .await
        .expect("session did not end");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_pending_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        // a long deadline would keep the read blocked without cancellation
        let client = TcpEchoClient::connect(addr, config(Duration::from_secs(10)))
            .await
            .unwrap();
        let trigger = ShutdownTrigger::new();
        let reporter: Arc<dyn Reporter> = Arc::new(|_: Report| {});
        let session = tokio::spawn(client.run(reporter, trigger.subscribe()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let cancelled_at = Instant::now();
        trigger.trigger();

        let result = tokio::time::timeout(Duration::from_millis(500), session)
            .await
            .expect("session still blocked")
            .unwrap();
        assert!(result.is_ok());
        assert!(cancelled_at.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_reports_are_cumulative() {
        let (addr, _server) = echo_server().await;
        let client = TcpEchoClient::connect(addr, config(Duration::from_secs(1)))
            .await
            .unwrap();

        let reports = Arc::new(Mutex::new(Vec::<Report>::new()));
        let reporter: Arc<dyn Reporter> = {
            let reports = reports.clone();
            Arc::new(move |r: Report| reports.lock().unwrap().push(r))
        };
        let trigger = ShutdownTrigger::new();
        let session = tokio::spawn(client.run(reporter, trigger.subscribe()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.trigger();
        session.await.unwrap().unwrap();

        let reports = reports.lock().unwrap();
        assert!(reports.len() >= 2, "only {} reports", reports.len());
        for pair in reports.windows(2) {
            assert!(pair[1].sent >= pair[0].sent);
            assert!(pair[1].received >= pair[0].received);
        }
        let last = reports.last().unwrap();
        assert!(last.sent > 0);
        assert_eq!(last.lost, 0);
        assert_eq!(last.out_of_order, 0);
    }
}
