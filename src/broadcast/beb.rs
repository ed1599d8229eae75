use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::broadcast::{publish, BroadcastEvent, Broadcaster, Delivery};
use crate::link::host::HostResolver;
use crate::link::message::Message;
use crate::link::perfect_link::PerfectLink;
use crate::payload::{Payload, PayloadFormat};

/// Best-effort broadcast: sends to every other process over the perfect link, and delivers to
///  itself without going through the network.
pub struct BestEffortBroadcast {
    link: Arc<PerfectLink>,
    events: mpsc::UnboundedSender<BroadcastEvent>,
    forward_task: JoinHandle<()>,
}

impl BestEffortBroadcast {
    pub fn new(link: PerfectLink, link_deliveries: mpsc::UnboundedReceiver<Message>, format: PayloadFormat) -> (BestEffortBroadcast, mpsc::UnboundedReceiver<BroadcastEvent>) {
        let (events, events_recv) = mpsc::unbounded_channel();
        let link = Arc::new(link);

        let forward_task = tokio::spawn(Self::forward_deliveries(link.clone(), link_deliveries, format, events.clone()));

        let beb = BestEffortBroadcast {
            link,
            events,
            forward_task,
        };
        (beb, events_recv)
    }

    async fn forward_deliveries(link: Arc<PerfectLink>, mut link_deliveries: mpsc::UnboundedReceiver<Message>, format: PayloadFormat, events: mpsc::UnboundedSender<BroadcastEvent>) {
        while let Some(message) = link_deliveries.recv().await {
            let Some(from) = message.sender().cloned() else {
                warn!("link delivered an outgoing message - ignoring");
                continue;
            };

            match format.try_deser(&mut &message.data.payload[..]) {
                Ok(payload) => {
                    if let Some(origin) = payload.original_sender() {
                        if let Err(e) = link.resolver().get(origin) {
                            link.report_failure(format!("payload from {:?} with invalid origin: {:#}", from.id, e));
                            return;
                        }
                    }
                    trace!("BEB delivering {:?} from {:?}", payload, from.id);
                    publish(&events, BroadcastEvent::Deliver(Delivery { from, payload }));
                }
                Err(e) => warn!("malformed payload from {:?} - dropping: {}", from.id, e),
            }
        }
    }

    /// Re-broadcast on behalf of another process: messages are queued for the link's sending loop,
    ///  and no broadcast event is published.
    pub async fn relay(&self, payload: Payload) {
        let bytes = payload.to_bytes();
        let myself = self.link.myself();
        for host in self.link.resolver().others() {
            self.link.queue_for_sending(Message::outgoing(myself, host.clone(), bytes.clone())).await;
        }
        self.deliver_to_self(payload);
    }

    fn deliver_to_self(&self, payload: Payload) {
        publish(&self.events, BroadcastEvent::Deliver(Delivery {
            from: self.link.myself().clone(),
            payload,
        }));
    }
}

#[async_trait]
impl Broadcaster for BestEffortBroadcast {
    async fn broadcast(&self, payload: Payload) -> anyhow::Result<()> {
        let bytes = payload.to_bytes();
        let myself = self.link.myself();
        for host in self.link.resolver().others() {
            self.link.send(Message::outgoing(myself, host.clone(), bytes.clone())).await?;
        }

        publish(&self.events, BroadcastEvent::Broadcast(payload.clone()));
        self.deliver_to_self(payload);
        Ok(())
    }

    async fn stop(&self) {
        self.forward_task.abort();
        self.link.stop().await;
    }

    async fn failed(&self) -> String {
        self.link.failed().await
    }

    fn resolver(&self) -> &HostResolver {
        self.link.resolver()
    }
}

impl Drop for BestEffortBroadcast {
    fn drop(&mut self) {
        self.forward_task.abort();
    }
}
