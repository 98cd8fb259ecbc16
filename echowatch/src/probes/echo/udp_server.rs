use std::net::SocketAddr;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::net::UdpSocket;

use super::READ_BUFFER_SIZE;
use crate::probes::Shutdown;

/// Reflects every datagram back to its source address.
pub struct UdpEchoServer {
    socket: UdpSocket,
}

impl UdpEchoServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind UDP echo server on {}", addr))?;
        info!("UDP echo server listening on {}", socket.local_addr()?);
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// A failed send drops that datagram only; a failed receive ends the server.
    pub async fn run(self, shutdown: Shutdown) -> Result<()> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let (n, peer) = tokio::select! {
                _ = shutdown.requested() => {
                    info!("UDP echo server shutting down");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    received.context("Failed to receive UDP datagram")?
                }
            };

            if let Err(e) = self.socket.send_to(&buf[..n], peer).await {
                warn!("failed echo to UDP {}: {}", peer, e);
            }
        }
    }
}
