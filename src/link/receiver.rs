use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::link::datagram::{DatagramData, DatagramKind};
use crate::link::host::HostResolver;
use crate::link::message::Message;
use crate::link::store::MessageStore;
use crate::link::throughput_monitor::ThroughputMonitor;

pub struct Receiver {
    resolver: Arc<HostResolver>,
    store: Arc<MessageStore>,
    received_notify: Arc<Notify>,
    deliveries: mpsc::UnboundedSender<Message>,
    throughput_monitor: Option<Arc<ThroughputMonitor>>,
}

impl Receiver {
    pub fn new(
        resolver: Arc<HostResolver>,
        store: Arc<MessageStore>,
        received_notify: Arc<Notify>,
        deliveries: mpsc::UnboundedSender<Message>,
        throughput_monitor: Option<Arc<ThroughputMonitor>>,
    ) -> Receiver {
        Receiver { resolver, store, received_notify, deliveries, throughput_monitor }
    }

    /// Decodes a raw datagram and puts it into the receive buffer for triage. Malformed datagrams
    ///  are dropped, while a datagram referencing an unknown host is a fatal error.
    pub async fn on_datagram(&self, buf: &[u8]) -> anyhow::Result<()> {
        let data = match DatagramData::try_deser(buf) {
            Ok(data) => data,
            Err(e) => {
                warn!("received malformed datagram of {} bytes - dropping: {}", buf.len(), e);
                return Ok(());
            }
        };

        let sender = self.resolver.get(data.sender)?.clone();
        self.resolver.get(data.receiver)?;
        if data.receiver != self.resolver.my_id() {
            warn!("received datagram addressed to {:?} rather than myself - dropping", data.receiver);
            return Ok(());
        }

        trace!("received {:?} datagram from {:?}", data.kind, data.sender);
        self.store.push_received(Message::received(data, sender), Instant::now()).await;
        self.received_notify.notify_one();
        Ok(())
    }

    /// Processes everything in the receive buffer: payloads are acknowledged and delivered at most
    ///  once, acknowledgements settle the corresponding in-flight message.
    pub async fn process_received(&self) {
        for (message, received_at) in self.store.take_received().await {
            match message.data.kind {
                DatagramKind::Payload => {
                    if let Some(ack) = message.ack_reply() {
                        self.store.queue_ack_reply(ack).await;
                    }
                    if self.store.mark_delivered(&message.data).await {
                        if self.deliveries.send(message).is_err() {
                            debug!("delivery receiver was dropped - discarding delivery");
                        }
                    }
                    else {
                        trace!("duplicate datagram {:?} - not delivering", message.data);
                    }
                }
                DatagramKind::Ack => {
                    if self.store.acknowledge(&message.data.ack_to_original(), received_at).await {
                        if let Some(monitor) = &self.throughput_monitor {
                            monitor.on_ack();
                        }
                    }
                }
            }
        }
    }

    pub async fn run_triage_loop(&self) {
        loop {
            self.received_notify.notified().await;
            self.process_received().await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use bytes::{Bytes, BytesMut};
    use tokio::runtime::Builder;
    use tokio::sync::mpsc::error::TryRecvError;
    use crate::config::LinkConfig;
    use crate::link::host::{Host, HostId};

    fn host(id: u32) -> Host {
        Host::new(HostId::new(id), SocketAddr::from(([127, 0, 0, 1], 11000 + id as u16)))
    }

    fn encoded(data: &DatagramData) -> BytesMut {
        let mut buf = BytesMut::new();
        data.ser(&mut buf);
        buf
    }

    fn receiver() -> (Receiver, Arc<MessageStore>, mpsc::UnboundedReceiver<Message>) {
        let resolver = Arc::new(HostResolver::new(HostId::new(1), vec![host(1), host(2), host(3)]).unwrap());
        let store = Arc::new(MessageStore::new(Arc::new(LinkConfig::default())));
        let (send, recv) = mpsc::unbounded_channel();
        let receiver = Receiver::new(resolver, store.clone(), Arc::new(Notify::new()), send, None);
        (receiver, store, recv)
    }

    fn payload_from(sender: u32, payload: &'static [u8]) -> DatagramData {
        DatagramData::new(HostId::new(sender), HostId::new(1), DatagramKind::Payload, Bytes::from_static(payload))
    }

    #[test]
    fn test_deliver_once_ack_always() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, store, mut deliveries) = receiver();
            let data = payload_from(2, b"a");

            receiver.on_datagram(&encoded(&data)).await.unwrap();
            receiver.on_datagram(&encoded(&data)).await.unwrap();
            receiver.process_received().await;

            assert_eq!(deliveries.try_recv().unwrap(), Message::received(data.clone(), host(2)));
            assert_eq!(deliveries.try_recv(), Err(TryRecvError::Empty));

            let acks = store.take_ack_replies().await;
            assert_eq!(acks.len(), 2);
            for ack in acks {
                assert_eq!(ack.data, data.to_ack());
                assert_eq!(ack.receiver(), Some(&host(2)));
            }

            // retransmission after the ack got lost
            receiver.on_datagram(&encoded(&data)).await.unwrap();
            receiver.process_received().await;
            assert_eq!(deliveries.try_recv(), Err(TryRecvError::Empty));
            assert_eq!(store.take_ack_replies().await.len(), 1);
        });
    }

    #[test]
    fn test_ack_settles_in_flight() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, store, _deliveries) = receiver();
            let sent = Message::outgoing(&host(1), host(3), Bytes::from_static(b"z"));
            store.try_register_send(&sent, 10, Instant::now()).await;

            let ack = sent.data.to_ack();
            receiver.on_datagram(&encoded(&ack)).await.unwrap();
            receiver.process_received().await;
            assert_eq!(store.num_recent().await, 0);

            // duplicate ack is a no-op
            receiver.on_datagram(&encoded(&ack)).await.unwrap();
            receiver.process_received().await;
            assert_eq!(store.num_recent().await, 0);
            assert!(store.take_ack_replies().await.is_empty());
        });
    }

    #[test]
    fn test_malformed_is_dropped() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, store, _deliveries) = receiver();

            receiver.on_datagram(&[0, 0, 0, 2, 0]).await.unwrap();
            receiver.on_datagram(&[0, 0, 0, 2, 0, 0, 0, 1, 9]).await.unwrap();
            assert!(store.take_received().await.is_empty());
        });
    }

    #[test]
    fn test_unknown_host_is_fatal() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, store, _deliveries) = receiver();

            assert!(receiver.on_datagram(&encoded(&payload_from(7, b"a"))).await.is_err());
            assert!(store.take_received().await.is_empty());
        });
    }

    #[test]
    fn test_wrong_receiver_is_dropped() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, store, _deliveries) = receiver();
            let data = DatagramData::new(HostId::new(2), HostId::new(3), DatagramKind::Payload, Bytes::new());

            receiver.on_datagram(&encoded(&data)).await.unwrap();
            assert!(store.take_received().await.is_empty());
        });
    }
}
