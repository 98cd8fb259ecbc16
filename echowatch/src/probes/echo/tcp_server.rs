use std::net::SocketAddr;

use anyhow::{Context, Result};
use bytes::BytesMut;
use log::{debug, info};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use super::READ_BUFFER_SIZE;
use crate::probes::Shutdown;

/// Accepts connections and reflects every byte back to its sender.
///
/// Connections share no state; each one runs on its own task.
pub struct TcpEchoServer {
    listener: TcpListener,
}

impl TcpEchoServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind TCP echo server on {}", addr))?;
        info!("TCP echo server listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, shutdown: Shutdown) -> Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.requested() => {
                    info!("TCP echo server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    accepted.context("Failed to accept TCP connection")?
                }
            };

            tokio::spawn(reflect(stream, peer, shutdown.clone()));
        }
    }
}

async fn reflect(mut stream: TcpStream, peer: SocketAddr, shutdown: Shutdown) {
    info!("connection from TCP {}", peer);
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = shutdown.requested() => break,
            read = stream.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("failed read from TCP {}: {}", peer, e);
                break;
            }
        }

        if let Err(e) = stream.write_all(&buf).await {
            debug!("failed write to TCP {}: {}", peer, e);
            break;
        }
    }

    info!("lost connection from TCP {}", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::ShutdownTrigger;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn start() -> (SocketAddr, ShutdownTrigger, tokio::task::JoinHandle<Result<()>>) {
        let server = TcpEchoServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let trigger = ShutdownTrigger::new();
        let handle = tokio::spawn(server.run(trigger.subscribe()));
        (addr, trigger, handle)
    }

    #[tokio::test]
    async fn test_reflects_bytes() {
        let (addr, trigger, handle) = start().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let payload = b"12345\x00\xffarbitrary bytes";
        client.write_all(payload).await.unwrap();

        let mut echoed = vec![0u8; payload.len()];
        timeout(Duration::from_secs(1), client.read_exact(&mut echoed))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(&echoed, payload);

        trigger.trigger();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connections_are_independent() {
        let (addr, trigger, _handle) = start().await;

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        a.write_all(b"aaa").await.unwrap();
        b.write_all(b"bbbb").await.unwrap();

        let mut from_b = [0u8; 4];
        let mut from_a = [0u8; 3];
        b.read_exact(&mut from_b).await.unwrap();
        a.read_exact(&mut from_a).await.unwrap();
        assert_eq!(&from_a, b"aaa");
        assert_eq!(&from_b, b"bbbb");

        trigger.trigger();
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_connections() {
        let (addr, trigger, _handle) = start().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"1").await.unwrap();
        let mut one = [0u8; 1];
        client.read_exact(&mut one).await.unwrap();

        trigger.trigger();

        let mut rest = Vec::new();
        let read = timeout(Duration::from_secs(1), client.read_to_end(&mut rest))
            .await
            .expect("connection not closed");
        assert!(read.is_err() || rest.is_empty());
    }
}
