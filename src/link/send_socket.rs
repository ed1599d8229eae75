use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing, and to simulate lossy networks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    /// A failure to send is a transport failure, which is fatal for the link
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);
        self.send_to(buf, to).await
            .with_context(|| format!("error sending UDP datagram to {:?}", to))?;
        Ok(())
    }
}
