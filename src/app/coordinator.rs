use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::link::host::HostId;

/// Synchronizes the start and the end of broadcasting with an external test harness
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Returns when all processes are ready to start broadcasting
    async fn wait_on_barrier(&self) -> anyhow::Result<()>;

    /// Signals that this process has broadcast all its messages
    async fn finished_broadcasting(&self) -> anyhow::Result<()>;
}

/// Passes through immediately, for runs without a harness
pub struct NoCoordinator;

#[async_trait]
impl Coordinator for NoCoordinator {
    async fn wait_on_barrier(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn finished_broadcasting(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Coordinates through TCP connections: the barrier is passed when the barrier server closes the
///  connection, and completion is signalled by sending our id to the signal server.
pub struct TcpCoordinator {
    myself: HostId,
    barrier: Option<SocketAddr>,
    signal: Option<SocketAddr>,
}

impl TcpCoordinator {
    pub fn new(myself: HostId, barrier: Option<SocketAddr>, signal: Option<SocketAddr>) -> TcpCoordinator {
        TcpCoordinator { myself, barrier, signal }
    }
}

#[async_trait]
impl Coordinator for TcpCoordinator {
    async fn wait_on_barrier(&self) -> anyhow::Result<()> {
        let Some(addr) = self.barrier else {
            return Ok(());
        };

        info!("waiting on barrier {:?}", addr);
        let mut stream = TcpStream::connect(addr).await
            .with_context(|| format!("connecting to barrier {:?}", addr))?;

        let mut buf = [0u8; 64];
        loop {
            let n = stream.read(&mut buf).await
                .with_context(|| format!("reading from barrier {:?}", addr))?;
            if n == 0 {
                break;
            }
            debug!("ignoring {} bytes from barrier", n);
        }
        info!("passed barrier");
        Ok(())
    }

    async fn finished_broadcasting(&self) -> anyhow::Result<()> {
        let Some(addr) = self.signal else {
            return Ok(());
        };

        let mut stream = TcpStream::connect(addr).await
            .with_context(|| format!("connecting to signal {:?}", addr))?;
        stream.write_all(&self.myself.as_u32().to_be_bytes()).await?;
        stream.shutdown().await?;
        info!("signalled end of broadcasting to {:?}", addr);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_no_coordinator() {
        NoCoordinator.wait_on_barrier().await.unwrap();
        NoCoordinator.finished_broadcasting().await.unwrap();
    }

    #[tokio::test]
    async fn test_unconfigured_tcp_coordinator_passes() {
        let coordinator = TcpCoordinator::new(HostId::new(1), None, None);
        coordinator.wait_on_barrier().await.unwrap();
        coordinator.finished_broadcasting().await.unwrap();
    }

    #[tokio::test]
    async fn test_barrier_waits_for_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let coordinator = TcpCoordinator::new(HostId::new(1), Some(listener.local_addr().unwrap()), None);

        let waiting = tokio::spawn(async move { coordinator.wait_on_barrier().await });

        let (mut conn, _) = listener.accept().await.unwrap();
        conn.write_all(b"not yet").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(conn);
        tokio::time::timeout(Duration::from_secs(5), waiting).await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_sends_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let coordinator = TcpCoordinator::new(HostId::new(7), None, Some(listener.local_addr().unwrap()));

        let signalling = tokio::spawn(async move { coordinator.finished_broadcasting().await });

        let (mut conn, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        conn.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![0, 0, 0, 7]);
        signalling.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_barrier() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let coordinator = TcpCoordinator::new(HostId::new(1), Some(addr), None);
        assert!(coordinator.wait_on_barrier().await.is_err());
    }
}
