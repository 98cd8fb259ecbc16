pub mod http;
pub mod probes;
pub mod settings;
pub mod telemetry;

use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::{signal, task::JoinHandle};

use crate::http::HttpServer;
use crate::probes::{
    Reporter, Shutdown,
    echo::{
        EchoConfig, SessionMetrics, SinkReporter, TcpEchoClient, TcpEchoServer, UdpEchoClient,
        UdpEchoServer, resolve_target,
    },
    interfaces::{Collector, SnapshotBuffer, source_from_settings},
};
use crate::settings::Settings;
use crate::telemetry::{MetricRegistry, MetricSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

/// Sockets bound before any worker starts, so a busy port stops the
/// process instead of a background task.
pub struct Listeners {
    tcp_echo: Option<TcpEchoServer>,
    udp_echo: Option<UdpEchoServer>,
    http: HttpServer,
}

impl Listeners {
    /// Port shared by the TCP and UDP echo servers, if they are enabled.
    pub fn echo_port(&self) -> Option<u16> {
        self.tcp_echo
            .as_ref()
            .and_then(|server| server.local_addr().ok())
            .map(|addr| addr.port())
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        self.http.local_addr()
    }
}

/// Running background tasks.
pub struct Workers {
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Workers {
    fn spawn<F>(&mut self, name: impl Into<String>, worker: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let label = name.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = worker.await {
                error!("{} failed: {:#}", label, e);
            }
        });
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every task to finish.
    pub async fn join(self) {
        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => debug!("{} stopped", name),
                Err(e) => error!("{} panicked: {}", name, e),
            }
        }
    }
}

/// Supervises the echo servers, one TCP and one UDP client per target, the
/// interface collector and the HTTP surface.
pub struct EchoWatchEngine {
    pub settings: Settings,
    targets: Vec<String>,
    registry: Arc<MetricRegistry>,
    snapshots: Arc<SnapshotBuffer>,
}

impl EchoWatchEngine {
    pub fn new(settings: Settings, targets: Vec<String>, registry: Arc<MetricRegistry>) -> Self {
        Self {
            settings,
            targets,
            registry,
            snapshots: Arc::new(SnapshotBuffer::new()),
        }
    }

    pub fn registry(&self) -> Arc<MetricRegistry> {
        self.registry.clone()
    }

    pub async fn run(self) -> Result<()> {
        let listeners = self.bind().await?;
        let workers = self.spawn(listeners, probes::shutdown_signal())?;

        info!("Monitoring active. Press Ctrl-C to exit.");
        signal::ctrl_c().await?;
        info!("Exiting...");

        probes::request_shutdown();
        workers.join().await;
        Ok(())
    }

    /// Binds the echo servers (TCP first, UDP on the same port) and the HTTP
    /// listener.
    pub async fn bind(&self) -> Result<Listeners> {
        self.settings.validate()?;

        let (tcp_echo, udp_echo) = if self.settings.echo.server_enabled() {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.settings.echo.port());
            let tcp = TcpEchoServer::bind(addr).await?;
            let port = tcp.local_addr()?.port();
            let udp = UdpEchoServer::bind(SocketAddr::new(addr.ip(), port)).await?;
            (Some(tcp), Some(udp))
        } else {
            info!("Echo servers disabled");
            (None, None)
        };

        let http = HttpServer::bind(
            self.settings.http.listen(),
            self.snapshots.clone(),
            self.registry.clone(),
        )
        .await?;

        Ok(Listeners {
            tcp_echo,
            udp_echo,
            http,
        })
    }

    /// Starts every worker. Workers stop once `shutdown` fires.
    pub fn spawn(&self, listeners: Listeners, shutdown: Shutdown) -> Result<Workers> {
        let collector = if self.settings.interfaces.enabled() {
            Some(Collector::new(
                source_from_settings(&self.settings.interfaces)?,
                self.registry.clone(),
                self.snapshots.clone(),
                self.settings.interfaces.poll_interval(),
            ))
        } else {
            info!("Interface collection disabled");
            None
        };

        let mut workers = Workers { tasks: Vec::new() };

        if let Some(server) = listeners.tcp_echo {
            workers.spawn("tcp echo server", server.run(shutdown.clone()));
        }
        if let Some(server) = listeners.udp_echo {
            workers.spawn("udp echo server", server.run(shutdown.clone()));
        }
        workers.spawn("http server", listeners.http.run(shutdown.clone()));

        if let Some(collector) = collector {
            let shutdown = shutdown.clone();
            workers.spawn("interface collector", async move {
                collector.run(shutdown).await;
                Ok(())
            });
        }

        for target in &self.targets {
            for transport in [Transport::Tcp, Transport::Udp] {
                let sink: Arc<dyn MetricSink> = self.registry.clone();
                let metrics = match SessionMetrics::register(sink, transport.as_str(), target) {
                    Ok(metrics) => Arc::new(metrics),
                    Err(e) => {
                        warn!("Skipping {} {}: {:#}", transport.as_str(), target, e);
                        continue;
                    }
                };

                let session = SessionLoop {
                    transport,
                    target: target.clone(),
                    default_port: self.settings.echo.port(),
                    config: match transport {
                        Transport::Tcp => EchoConfig::tcp(&self.settings.echo),
                        Transport::Udp => EchoConfig::udp(&self.settings.echo),
                    },
                    restart_delay: self.settings.echo.restart_delay(),
                    metrics,
                };
                workers.spawn(
                    format!("{} client {}", transport.as_str(), target),
                    session.run(shutdown.clone()),
                );
            }
        }

        info!(
            "Started {} workers for {} targets",
            workers.len(),
            self.targets.len()
        );
        Ok(workers)
    }
}

/// Restart loop for one (transport, target) pair.
struct SessionLoop {
    transport: Transport,
    target: String,
    default_port: u16,
    config: EchoConfig,
    restart_delay: std::time::Duration,
    metrics: Arc<SessionMetrics>,
}

impl SessionLoop {
    async fn run(self, shutdown: Shutdown) -> Result<()> {
        let label = self.transport.as_str().to_uppercase();

        while !shutdown.is_requested() {
            match self.session(&shutdown).await {
                Ok(()) => debug!("{} session to {} ended", label, self.target),
                Err(e) => {
                    warn!("{} session to {} failed: {:#}", label, self.target, e);
                    if !shutdown.sleep(self.restart_delay).await {
                        break;
                    }
                }
            }
        }

        self.metrics.unregister();
        Ok(())
    }

    /// One connect/run cycle with a fresh reporter adapter.
    async fn session(&self, shutdown: &Shutdown) -> Result<()> {
        let connect = async {
            let addr = resolve_target(&self.target, self.default_port).await?;
            match self.transport {
                Transport::Tcp => TcpEchoClient::connect(addr, self.config)
                    .await
                    .map(Client::Tcp),
                Transport::Udp => UdpEchoClient::connect(addr, self.config)
                    .await
                    .map(Client::Udp),
            }
        };

        let client = tokio::select! {
            _ = shutdown.requested() => return Ok(()),
            client = connect => client.with_context(|| format!("Failed to start session to {}", self.target))?,
        };

        match client {
            Client::Tcp(client) => {
                let reporter: Arc<dyn Reporter> =
                    Arc::new(SinkReporter::cumulative(self.metrics.clone()));
                client.run(reporter, shutdown.clone()).await
            }
            Client::Udp(client) => {
                let reporter: Arc<dyn Reporter> =
                    Arc::new(SinkReporter::delta(self.metrics.clone()));
                client.run(reporter, shutdown.clone()).await
            }
        }
    }
}

enum Client {
    Tcp(TcpEchoClient),
    Udp(UdpEchoClient),
}
