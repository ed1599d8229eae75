use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::trace;

use crate::link::datagram::DatagramData;
use crate::link::host::{Host, HostId};
use crate::link::send_socket::SendSocket;

/// Records all datagrams instead of sending them
#[derive(Debug, Default)]
pub struct RecordingSendSocket {
    sent: RwLock<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingSendSocket {
    pub fn new() -> RecordingSendSocket {
        Default::default()
    }

    pub async fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.read().await.clone()
    }

    /// Decoded datagrams in the order they were sent. Panics if a datagram can not be decoded.
    pub async fn sent_data(&self) -> Vec<DatagramData> {
        self.sent.read().await
            .iter()
            .map(|(_, buf)| DatagramData::try_deser(buf).expect("recorded datagram should be well-formed"))
            .collect()
    }
}

#[async_trait]
impl SendSocket for RecordingSendSocket {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.sent.write().await
            .push((to, buf.to_vec()));
        Ok(())
    }
}

/// Drops datagrams at random with a given probability, passing the rest on to a wrapped socket
pub struct LossySendSocket<S: SendSocket> {
    inner: S,
    loss_probability: f64,
}

impl<S: SendSocket> LossySendSocket<S> {
    pub fn new(inner: S, loss_probability: f64) -> LossySendSocket<S> {
        LossySendSocket { inner, loss_probability }
    }
}

#[async_trait]
impl<S: SendSocket> SendSocket for LossySendSocket<S> {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        if rand::random::<f64>() < self.loss_probability {
            trace!("simulating loss of datagram to {:?}", to);
            return Ok(());
        }
        self.inner.send_datagram(to, buf).await
    }
}

/// Passes datagrams on to a fixed set of destinations only, dropping all others. This simulates
///  a process that fails after reaching only some of its peers.
pub struct FilteringSendSocket<S: SendSocket> {
    inner: S,
    reachable: Vec<SocketAddr>,
}

impl<S: SendSocket> FilteringSendSocket<S> {
    pub fn new(inner: S, reachable: Vec<SocketAddr>) -> FilteringSendSocket<S> {
        FilteringSendSocket { inner, reachable }
    }
}

#[async_trait]
impl<S: SendSocket> SendSocket for FilteringSendSocket<S> {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        if !self.reachable.contains(&to) {
            trace!("{:?} is unreachable - dropping datagram", to);
            return Ok(());
        }
        self.inner.send_datagram(to, buf).await
    }
}

/// Binds `n` UDP sockets to ephemeral ports on localhost, returning the corresponding host table
///  with ids `1..=n`
pub async fn bind_local_hosts(n: u32) -> anyhow::Result<(Vec<Host>, Vec<Arc<UdpSocket>>)> {
    let mut hosts = Vec::new();
    let mut sockets = Vec::new();
    for id in 1..=n {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        hosts.push(Host::new(HostId::new(id), socket.local_addr()?));
        sockets.push(Arc::new(socket));
    }
    Ok((hosts, sockets))
}
