use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broadcast::urb::UniformReliableBroadcast;
use crate::broadcast::{publish, BroadcastEvent, Broadcaster, Delivery};
use crate::link::host::{HostId, HostResolver};
use crate::payload::Payload;

/// Reorders deliveries per origin by sequence number
#[derive(Default)]
pub struct FifoQueues {
    next_expected: FxHashMap<HostId, u32>,
    pending: FxHashMap<HostId, BTreeMap<u32, Delivery>>,
}

impl FifoQueues {
    /// Buffers a delivery, returning all deliveries that are in order now
    pub fn on_deliver(&mut self, delivery: Delivery) -> anyhow::Result<Vec<Delivery>> {
        let Some(sequence_number) = delivery.payload.sequence_number() else {
            anyhow::bail!("payload without sequence number from {:?}", delivery.from.id);
        };
        let origin = delivery.from.id;

        let next_expected = self.next_expected.entry(origin).or_insert(1);
        if sequence_number < *next_expected {
            debug!("late duplicate #{} from {:?} - ignoring", sequence_number, origin);
            return Ok(Vec::new());
        }

        let queue = self.pending.entry(origin).or_default();
        queue.insert(sequence_number, delivery);

        let mut result = Vec::new();
        while let Some(entry) = queue.first_entry() {
            if *entry.key() != *next_expected {
                break;
            }
            result.push(entry.remove());
            *next_expected += 1;
        }
        Ok(result)
    }

    pub fn num_pending(&self, origin: HostId) -> usize {
        self.pending.get(&origin)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

/// FIFO broadcast on top of URB: all processes deliver a process' broadcasts in the order they
///  were broadcast.
pub struct FifoBroadcast {
    urb: Arc<UniformReliableBroadcast>,
    /// the last sequence number that was used
    sequence_number: Mutex<u32>,
    forward_task: JoinHandle<()>,
}

impl FifoBroadcast {
    pub fn new(urb: UniformReliableBroadcast, urb_events: mpsc::UnboundedReceiver<BroadcastEvent>) -> (FifoBroadcast, mpsc::UnboundedReceiver<BroadcastEvent>) {
        let (events, events_recv) = mpsc::unbounded_channel();
        let forward_task = tokio::spawn(Self::consume_urb_events(urb_events, events));

        let fifo = FifoBroadcast {
            urb: Arc::new(urb),
            sequence_number: Mutex::new(0),
            forward_task,
        };
        (fifo, events_recv)
    }

    async fn consume_urb_events(mut urb_events: mpsc::UnboundedReceiver<BroadcastEvent>, events: mpsc::UnboundedSender<BroadcastEvent>) {
        let mut queues = FifoQueues::default();

        while let Some(event) = urb_events.recv().await {
            match event {
                BroadcastEvent::Broadcast(payload) => publish(&events, BroadcastEvent::Broadcast(payload)),
                BroadcastEvent::Deliver(delivery) => match queues.on_deliver(delivery) {
                    Ok(in_order) => {
                        for delivery in in_order {
                            publish(&events, BroadcastEvent::Deliver(delivery));
                        }
                    }
                    Err(e) => warn!("{} - dropping", e),
                }
            }
        }
    }
}

#[async_trait]
impl Broadcaster for FifoBroadcast {
    async fn broadcast(&self, payload: Payload) -> anyhow::Result<()> {
        // held across the broadcast so that sequence numbers reach URB in order
        let mut sequence_number = self.sequence_number.lock().await;
        *sequence_number += 1;

        let myself = self.urb.resolver().my_id();
        self.urb.broadcast(Payload::urb(myself, Payload::fifo(*sequence_number, payload))).await
    }

    async fn stop(&self) {
        self.forward_task.abort();
        self.urb.stop().await;
    }

    async fn failed(&self) -> String {
        self.urb.failed().await
    }

    fn resolver(&self) -> &HostResolver {
        self.urb.resolver()
    }
}

impl Drop for FifoBroadcast {
    fn drop(&mut self) {
        self.forward_task.abort();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use rstest::rstest;
    use crate::link::host::Host;

    fn host(id: u32) -> Host {
        Host::new(HostId::new(id), SocketAddr::from(([127, 0, 0, 1], 11000 + id as u16)))
    }

    fn delivery(origin: u32, seq: u32) -> Delivery {
        Delivery {
            from: host(origin),
            payload: Payload::urb(HostId::new(origin), Payload::fifo(seq, Payload::raw())),
        }
    }

    fn seqs(deliveries: Vec<Delivery>) -> Vec<u32> {
        deliveries.into_iter()
            .map(|d| d.payload.sequence_number().unwrap())
            .collect()
    }

    #[rstest]
    #[case::in_order(vec![1, 2, 3], vec![vec![1], vec![2], vec![3]])]
    #[case::reversed(vec![3, 2, 1], vec![vec![], vec![], vec![1, 2, 3]])]
    #[case::gap(vec![2, 4, 1, 3], vec![vec![], vec![], vec![1, 2], vec![3, 4]])]
    #[case::duplicates(vec![1, 1, 3, 3, 2], vec![vec![1], vec![], vec![], vec![], vec![2, 3]])]
    fn test_reordering(#[case] arrivals: Vec<u32>, #[case] expected: Vec<Vec<u32>>) {
        let mut queues = FifoQueues::default();
        let actual = arrivals.into_iter()
            .map(|seq| seqs(queues.on_deliver(delivery(2, seq)).unwrap()))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
        assert_eq!(queues.num_pending(HostId::new(2)), 0);
    }

    #[test]
    fn test_origins_are_independent() {
        let mut queues = FifoQueues::default();

        assert!(queues.on_deliver(delivery(1, 2)).unwrap().is_empty());
        assert_eq!(seqs(queues.on_deliver(delivery(3, 1)).unwrap()), vec![1]);
        assert_eq!(queues.num_pending(HostId::new(1)), 1);
        assert_eq!(seqs(queues.on_deliver(delivery(1, 1)).unwrap()), vec![1, 2]);
    }

    #[test]
    fn test_missing_sequence_number() {
        let mut queues = FifoQueues::default();
        let d = Delivery {
            from: host(1),
            payload: Payload::urb(HostId::new(1), Payload::raw()),
        };
        assert!(queues.on_deliver(d).is_err());
    }
}
