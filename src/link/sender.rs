use std::sync::Arc;

use anyhow::bail;
use bytes::BytesMut;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::config::LinkConfig;
use crate::link::message::Message;
use crate::link::send_socket::SendSocket;
use crate::link::store::MessageStore;
use crate::link::throughput_monitor::SendWindow;

pub struct Sender {
    config: Arc<LinkConfig>,
    socket: Arc<dyn SendSocket>,
    store: Arc<MessageStore>,
    window: Arc<SendWindow>,
}

impl Sender {
    pub fn new(config: Arc<LinkConfig>, socket: Arc<dyn SendSocket>, store: Arc<MessageStore>, window: Arc<SendWindow>) -> Sender {
        Sender { config, socket, store, window }
    }

    /// Sends a message right away if the send window has room for it, returning `false` if it
    ///  does not.
    pub async fn try_send(&self, message: &Message) -> anyhow::Result<bool> {
        if !self.store.try_register_send(message, self.window.get(), Instant::now()).await {
            return Ok(false);
        }
        self.transmit(message).await?;
        Ok(true)
    }

    /// Sends a message, waiting for the send window to have room for it. If the window stays
    ///  full, the message is queued for the sending loop.
    pub async fn send(&self, message: Message) -> anyhow::Result<()> {
        for attempt in 0..self.config.send_attempts {
            if self.try_send(&message).await? {
                return Ok(());
            }
            if attempt + 1 < self.config.send_attempts {
                trace!("send window is full - retrying in {:?}", self.config.send_retry_interval);
                sleep(self.config.send_retry_interval).await;
            }
        }

        debug!("send window stayed full - queueing message to {:?}", message.peer().id);
        self.queue(message).await;
        Ok(())
    }

    pub async fn queue(&self, message: Message) {
        self.store.queue(message).await;
    }

    /// One pass of the sending loop
    pub async fn do_send_pass(&self) -> anyhow::Result<()> {
        self.send_pending().await?;
        self.retransmit().await?;
        self.send_ack_replies().await
    }

    pub async fn send_pending(&self) -> anyhow::Result<()> {
        for message in self.store.take_sendable(self.window.get(), Instant::now()).await {
            self.transmit(&message).await?;
        }
        Ok(())
    }

    pub async fn retransmit(&self) -> anyhow::Result<()> {
        for message in self.store.due_retransmissions(Instant::now()).await {
            trace!("retransmitting {:?}", message.data);
            self.transmit(&message).await?;
        }
        Ok(())
    }

    pub async fn send_ack_replies(&self) -> anyhow::Result<()> {
        for ack in self.store.take_ack_replies().await {
            self.transmit(&ack).await?;
        }
        Ok(())
    }

    async fn transmit(&self, message: &Message) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(message.data.encoded_len());
        message.data.ser(&mut buf);
        if buf.len() > self.config.max_datagram_size {
            bail!("datagram to {:?} has a maximum length of {}, was {}", message.peer().id, self.config.max_datagram_size, buf.len());
        }
        self.socket.send_datagram(message.peer().socket_addr, &buf).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use bytes::Bytes;
    use tokio::runtime::Builder;
    use crate::link::datagram::{DatagramData, DatagramKind};
    use crate::link::host::{Host, HostId};
    use crate::link::send_socket::MockSendSocket;
    use crate::test_util::socket::RecordingSendSocket;

    fn host(id: u32) -> Host {
        Host::new(HostId::new(id), SocketAddr::from(([127, 0, 0, 1], 11000 + id as u16)))
    }

    fn msg(to: u32, payload: &'static [u8]) -> Message {
        Message::outgoing(&host(1), host(to), Bytes::from_static(payload))
    }

    fn sender(socket: Arc<dyn SendSocket>, window: usize) -> (Sender, Arc<MessageStore>) {
        let config = Arc::new(LinkConfig {
            initial_send_window: window,
            send_attempts: 3,
            throughput_monitor: None,
            ..Default::default()
        });
        let store = Arc::new(MessageStore::new(config.clone()));
        let sender = Sender::new(config, socket, store.clone(), Arc::new(SendWindow::new(window)));
        (sender, store)
    }

    #[test]
    fn test_send_encodes_datagram() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut socket = MockSendSocket::new();
            socket.expect_send_datagram()
                .once()
                .withf(|to, buf| to == &host(2).socket_addr && buf == [0u8,0,0,1, 0,0,0,2, 0, b'x'].as_slice())
                .returning(|_, _| Ok(()));

            let (sender, store) = sender(Arc::new(socket), 10);
            sender.send(msg(2, b"x")).await.unwrap();
            assert_eq!(store.num_recent().await, 1);
        });
    }

    #[test]
    fn test_oversized_datagram() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let socket = Arc::new(RecordingSendSocket::new());
            let config = Arc::new(LinkConfig {
                max_datagram_size: 12,
                throughput_monitor: None,
                ..Default::default()
            });
            let store = Arc::new(MessageStore::new(config.clone()));
            let sender = Sender::new(config, socket.clone(), store, Arc::new(SendWindow::new(10)));

            sender.send(msg(2, b"abc")).await.unwrap();
            assert!(sender.send(msg(2, b"abcd")).await.is_err());
            assert_eq!(socket.sent_data().await, vec![msg(2, b"abc").data]);
        });
    }

    #[test]
    fn test_send_propagates_socket_error() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut socket = MockSendSocket::new();
            socket.expect_send_datagram()
                .returning(|_, _| Err(anyhow::anyhow!("network is unreachable")));

            let (sender, _) = sender(Arc::new(socket), 10);
            assert!(sender.send(msg(2, b"x")).await.is_err());
        });
    }

    #[test]
    fn test_send_with_full_window_queues() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let socket = Arc::new(RecordingSendSocket::new());
            let (sender, store) = sender(socket.clone(), 1);

            sender.send(msg(2, b"a")).await.unwrap();

            let start = Instant::now();
            sender.send(msg(2, b"b")).await.unwrap();
            // 3 attempts with 2 sleeps in between
            let elapsed = Instant::now() - start;
            assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(210), "{:?}", elapsed);
            assert_eq!(store.num_queued().await, 1);
            assert_eq!(socket.sent_data().await, vec![msg(2, b"a").data]);

            store.acknowledge(&msg(2, b"a").data, Instant::now()).await;
            sender.send_pending().await.unwrap();
            assert_eq!(socket.sent_data().await, vec![msg(2, b"a").data, msg(2, b"b").data]);
        });
    }

    #[test]
    fn test_send_waits_for_window() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let socket = Arc::new(RecordingSendSocket::new());
            let (sender, store) = sender(socket.clone(), 1);
            let sender = Arc::new(sender);

            sender.send(msg(2, b"a")).await.unwrap();

            let store2 = store.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(50)).await;
                store2.acknowledge(&msg(2, b"a").data, Instant::now()).await;
            });

            sender.send(msg(2, b"b")).await.unwrap();
            assert_eq!(store.num_queued().await, 0);
            assert_eq!(socket.sent_data().await, vec![msg(2, b"a").data, msg(2, b"b").data]);
        });
    }

    #[test]
    fn test_send_pass() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let socket = Arc::new(RecordingSendSocket::new());
            let (sender, store) = sender(socket.clone(), 10);

            sender.try_send(&msg(2, b"a")).await.unwrap();
            sender.queue(msg(3, b"b")).await;
            let received = Message::received(DatagramData::new(HostId::new(2), HostId::new(1), DatagramKind::Payload, Bytes::from_static(b"c")), host(2));
            store.queue_ack_reply(received.ack_reply().unwrap()).await;

            sender.do_send_pass().await.unwrap();
            assert_eq!(socket.sent_data().await, vec![msg(2, b"a").data, msg(3, b"b").data, received.data.to_ack()]);

            sleep(Duration::from_millis(101)).await;
            sender.do_send_pass().await.unwrap();
            let sent = socket.sent_data().await;
            assert_eq!(sent.len(), 5);
            assert!(sent[3..].contains(&msg(2, b"a").data));
            assert!(sent[3..].contains(&msg(3, b"b").data));
        });
    }
}
