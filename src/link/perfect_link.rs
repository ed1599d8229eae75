use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, span, trace, warn, Instrument, Level};

use crate::config::{LinkConfig, MAX_UDP_PAYLOAD};
use crate::link::host::{Host, HostResolver};
use crate::link::message::Message;
use crate::link::receiver::Receiver;
use crate::link::send_socket::SendSocket;
use crate::link::sender::Sender;
use crate::link::store::MessageStore;
use crate::link::throughput_monitor::{SendWindow, ThroughputMonitor};

/// Reliable point-to-point messaging on top of UDP: messages are retransmitted until they are
///  acknowledged, and every received message is delivered exactly once.
///
/// Deliveries are pushed to the channel returned on construction.
pub struct PerfectLink {
    resolver: Arc<HostResolver>,
    sender: Arc<Sender>,
    store: Arc<MessageStore>,
    stopped: AtomicBool,
    receive_tasks: Vec<JoinHandle<()>>,
    send_tasks: Vec<JoinHandle<()>>,
    failure_send: Arc<watch::Sender<Option<String>>>,
    failure: watch::Receiver<Option<String>>,
}

impl PerfectLink {
    pub async fn bind(config: Arc<LinkConfig>, resolver: Arc<HostResolver>) -> anyhow::Result<(PerfectLink, mpsc::UnboundedReceiver<Message>)> {
        let self_addr = resolver.myself().socket_addr;
        let socket = Arc::new(UdpSocket::bind(self_addr).await
            .with_context(|| format!("error binding UDP socket to {:?}", self_addr))?);
        info!("bound UDP socket to {:?}", socket.local_addr()?);

        Self::with_sockets(config, resolver, Arc::new(socket.clone()), socket)
    }

    /// Starts a link on an already bound socket, sending through a separate [SendSocket]
    ///  abstraction.
    pub fn with_sockets(
        config: Arc<LinkConfig>,
        resolver: Arc<HostResolver>,
        send_socket: Arc<dyn SendSocket>,
        receive_socket: Arc<UdpSocket>,
    ) -> anyhow::Result<(PerfectLink, mpsc::UnboundedReceiver<Message>)> {
        config.validate()?;

        let store = Arc::new(MessageStore::new(config.clone()));
        let window = Arc::new(SendWindow::new(config.initial_send_window));
        let throughput_monitor = config.throughput_monitor.clone()
            .map(|c| Arc::new(ThroughputMonitor::new(c)));

        let sender = Arc::new(Sender::new(config.clone(), send_socket, store.clone(), window.clone()));

        let (delivery_send, delivery_recv) = mpsc::unbounded_channel();
        let received_notify = Arc::new(Notify::new());
        let receiver = Arc::new(Receiver::new(resolver.clone(), store.clone(), received_notify, delivery_send, throughput_monitor.clone()));

        let (failure_send, failure_recv) = watch::channel(None);
        let failure_send = Arc::new(failure_send);
        let span = span!(Level::INFO, "link", myself = %resolver.my_id());

        let mut receive_tasks = Vec::new();
        let mut send_tasks = Vec::new();

        receive_tasks.push(spawn_fallible("receive loop", failure_send.clone(), span.clone(),
            recv_loop(receive_socket, receiver.clone())
        ));

        receive_tasks.push(tokio::spawn({
            let receiver = receiver.clone();
            async move {
                receiver.run_triage_loop().await
            }
        }.instrument(span.clone())));

        send_tasks.push(spawn_fallible("sending loop", failure_send.clone(), span.clone(),
            send_loop(sender.clone(), config.send_loop_interval)
        ));

        if let Some(monitor) = throughput_monitor {
            send_tasks.push(tokio::spawn(async move {
                let interval = monitor.config().measurement_interval;
                loop {
                    sleep(interval).await;
                    monitor.end_interval(&window);
                }
            }.instrument(span.clone())));
        }

        info!("perfect link started for {:?}", resolver.myself());

        let link = PerfectLink {
            resolver,
            sender,
            store,
            stopped: AtomicBool::new(false),
            receive_tasks,
            send_tasks,
            failure_send,
            failure: failure_recv,
        };
        Ok((link, delivery_recv))
    }

    pub fn resolver(&self) -> &Arc<HostResolver> {
        &self.resolver
    }

    pub fn myself(&self) -> &Host {
        self.resolver.myself()
    }

    /// Sends a message, waiting while the send window is full. Returns after the message was sent
    ///  or queued, which does not imply it was acknowledged.
    pub async fn send(&self, message: Message) -> anyhow::Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            bail!("link is stopped");
        }
        self.sender.send(message).await
    }

    /// Leaves sending to the sending loop
    pub async fn queue_for_sending(&self, message: Message) {
        if self.stopped.load(Ordering::Acquire) {
            trace!("link is stopped - not queueing {:?}", message.data);
            return;
        }
        self.sender.queue(message).await;
    }

    pub async fn num_unacknowledged(&self) -> usize {
        self.store.num_recent().await + self.store.num_stale().await
    }

    /// Resolves when one of the link's loops terminated with a fatal error
    pub async fn failed(&self) -> String {
        let mut failure = self.failure.clone();
        let result = failure.wait_for(|f| f.is_some()).await
            .map(|f| f.clone());
        match result {
            Ok(Some(msg)) => msg,
            _ => std::future::pending::<String>().await,
        }
    }

    /// Fails the link on behalf of a layer on top of it, e.g. for a payload referencing an unknown
    ///  process. Only the first failure is kept.
    pub fn report_failure(&self, reason: String) {
        error!("fatal error: {}", reason);
        self.failure_send.send_if_modified(|failure| {
            if failure.is_some() {
                return false;
            }
            *failure = Some(reason);
            true
        });
    }

    /// Stops all loops of the link. Acknowledgements that were queued at that point are still
    ///  sent. Calling this repeatedly has no effect.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        for task in &self.receive_tasks {
            task.abort();
        }
        if let Err(e) = self.sender.send_ack_replies().await {
            warn!("error sending remaining acknowledgements: {:#}", e);
        }
        for task in &self.send_tasks {
            task.abort();
        }
        info!("perfect link stopped for {:?}", self.resolver.my_id());
    }
}

impl Drop for PerfectLink {
    fn drop(&mut self) {
        for task in self.receive_tasks.iter().chain(self.send_tasks.iter()) {
            task.abort();
        }
    }
}

fn spawn_fallible<F>(name: &'static str, failure: Arc<watch::Sender<Option<String>>>, span: tracing::Span, f: F) -> JoinHandle<()>
where F: Future<Output = anyhow::Result<()>> + Send + 'static
{
    tokio::spawn(async move {
        if let Err(e) = f.await {
            error!("{} terminated with a fatal error: {:#}", name, e);
            failure.send_replace(Some(format!("{}: {:#}", name, e)));
        }
    }.instrument(span))
}

async fn send_loop(sender: Arc<Sender>, interval: Duration) -> anyhow::Result<()> {
    info!("starting sending loop");

    loop {
        sender.do_send_pass().await?;
        sleep(interval).await;
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, receiver: Arc<Receiver>) -> anyhow::Result<()> {
    info!("starting receive loop");

    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    loop {
        let (num_read, from) = socket.recv_from(&mut buf).await
            .context("error receiving from UDP socket")?;
        trace!("received {} bytes from {:?}", num_read, from);
        receiver.on_datagram(&buf[..num_read]).await?;
    }
}
