use std::sync::Arc;

use async_trait::async_trait;
use bit_set::BitSet;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::broadcast::beb::BestEffortBroadcast;
use crate::broadcast::{publish, BroadcastEvent, Broadcaster, Delivery};
use crate::link::host::{HostId, HostResolver};
use crate::payload::{Payload, PayloadKind};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PayloadState {
    Pending {
        seen_by: BitSet,
    },
    Delivered,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SeenOutcome {
    /// the payload was delivered before
    Ignored,
    Seen,
    /// the payload was seen for the first time and must be relayed
    Relay,
}

/// Per-payload bookkeeping for uniform reliable broadcast. Payloads that are not in the map are
///  'unseen'.
pub struct UrbRegistry {
    num_processes: usize,
    payloads: FxHashMap<Payload, PayloadState>,
    own_in_flight: FxHashSet<Payload>,
}

impl UrbRegistry {
    pub fn new(num_processes: usize) -> UrbRegistry {
        UrbRegistry {
            num_processes,
            payloads: Default::default(),
            own_in_flight: Default::default(),
        }
    }

    pub fn on_local_broadcast(&mut self, payload: &Payload) {
        self.payloads.entry(payload.clone())
            .or_insert_with(|| PayloadState::Pending { seen_by: BitSet::new() });
        self.own_in_flight.insert(payload.clone());
    }

    pub fn on_beb_deliver(&mut self, payload: &Payload, reporter: HostId) -> SeenOutcome {
        match self.payloads.get_mut(payload) {
            Some(PayloadState::Delivered) => SeenOutcome::Ignored,
            Some(PayloadState::Pending { seen_by }) => {
                seen_by.insert(reporter.as_u32() as usize);
                SeenOutcome::Seen
            }
            None => {
                let mut seen_by = BitSet::new();
                seen_by.insert(reporter.as_u32() as usize);
                self.payloads.insert(payload.clone(), PayloadState::Pending { seen_by });
                SeenOutcome::Relay
            }
        }
    }

    /// Marks all pending payloads that were seen by a strict majority of processes as delivered,
    ///  returning them
    pub fn take_deliverable(&mut self) -> Vec<Payload> {
        let num_processes = self.num_processes;
        let mut result = Vec::new();
        for (payload, state) in self.payloads.iter_mut() {
            if let PayloadState::Pending { seen_by } = state {
                if seen_by.count() * 2 > num_processes {
                    // this drops the seen-by set, bounding memory to undelivered payloads
                    *state = PayloadState::Delivered;
                    result.push(payload.clone());
                }
            }
        }
        for payload in &result {
            self.own_in_flight.remove(payload);
        }
        result
    }

    pub fn state(&self, payload: &Payload) -> Option<&PayloadState> {
        self.payloads.get(payload)
    }

    pub fn num_own_in_flight(&self) -> usize {
        self.own_in_flight.len()
    }
}

/// Uniform reliable broadcast on top of BEB: every process relays a payload the first time it
///  sees it, and delivers it once a majority of all processes was seen relaying it.
pub struct UniformReliableBroadcast {
    beb: Arc<BestEffortBroadcast>,
    registry: Arc<Mutex<UrbRegistry>>,
    tasks: Vec<JoinHandle<()>>,
}

impl UniformReliableBroadcast {
    pub fn new(beb: BestEffortBroadcast, beb_events: mpsc::UnboundedReceiver<BroadcastEvent>) -> (UniformReliableBroadcast, mpsc::UnboundedReceiver<BroadcastEvent>) {
        let (events, events_recv) = mpsc::unbounded_channel();
        let beb = Arc::new(beb);
        let registry = Arc::new(Mutex::new(UrbRegistry::new(beb.resolver().num_hosts())));
        let pending_notify = Arc::new(Notify::new());

        let forward_task = tokio::spawn(Self::consume_beb_events(beb.clone(), registry.clone(), pending_notify.clone(), beb_events, events.clone()));
        let delivery_task = tokio::spawn(Self::delivery_loop(beb.clone(), registry.clone(), pending_notify, events));

        let urb = UniformReliableBroadcast {
            beb,
            registry,
            tasks: vec![forward_task, delivery_task],
        };
        (urb, events_recv)
    }

    async fn consume_beb_events(
        beb: Arc<BestEffortBroadcast>,
        registry: Arc<Mutex<UrbRegistry>>,
        pending_notify: Arc<Notify>,
        mut beb_events: mpsc::UnboundedReceiver<BroadcastEvent>,
        events: mpsc::UnboundedSender<BroadcastEvent>,
    ) {
        let myself = beb.resolver().my_id();

        while let Some(event) = beb_events.recv().await {
            match event {
                BroadcastEvent::Broadcast(payload) => {
                    if payload.original_sender() == Some(myself) {
                        publish(&events, BroadcastEvent::Broadcast(payload));
                    }
                }
                BroadcastEvent::Deliver(delivery) => {
                    if delivery.payload.original_sender().is_none() {
                        warn!("payload without an original sender from {:?} - dropping", delivery.from.id);
                        continue;
                    }

                    let outcome = registry.lock().await
                        .on_beb_deliver(&delivery.payload, delivery.from.id);
                    trace!("{:?} seen by {:?}: {:?}", delivery.payload, delivery.from.id, outcome);

                    match outcome {
                        SeenOutcome::Ignored => {}
                        SeenOutcome::Seen => pending_notify.notify_one(),
                        SeenOutcome::Relay => {
                            beb.relay(delivery.payload).await;
                            pending_notify.notify_one();
                        }
                    }
                }
            }
        }
    }

    async fn delivery_loop(
        beb: Arc<BestEffortBroadcast>,
        registry: Arc<Mutex<UrbRegistry>>,
        pending_notify: Arc<Notify>,
        events: mpsc::UnboundedSender<BroadcastEvent>,
    ) {
        loop {
            pending_notify.notified().await;

            let deliverable = registry.lock().await
                .take_deliverable();
            for payload in deliverable {
                let origin = payload.original_sender()
                    .ok_or_else(|| anyhow::anyhow!("payload without an original sender"))
                    .and_then(|id| beb.resolver().get(id).cloned());
                match origin {
                    Ok(from) => {
                        debug!("URB delivering {:?} from {:?}", payload, from.id);
                        publish(&events, BroadcastEvent::Deliver(Delivery { from, payload }));
                    }
                    Err(e) => error!("cannot deliver {:?}: {}", payload, e),
                }
            }
        }
    }
}

#[async_trait]
impl Broadcaster for UniformReliableBroadcast {
    /// Payloads without a URB layer are wrapped in one with this process as the original sender
    async fn broadcast(&self, payload: Payload) -> anyhow::Result<()> {
        let payload = if payload.has_layer(PayloadKind::Urb) {
            payload
        }
        else {
            Payload::urb(self.beb.resolver().my_id(), payload)
        };

        self.registry.lock().await
            .on_local_broadcast(&payload);
        self.beb.broadcast(payload).await
    }

    async fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.beb.stop().await;
    }

    async fn failed(&self) -> String {
        self.beb.failed().await
    }

    fn resolver(&self) -> &HostResolver {
        self.beb.resolver()
    }
}

impl Drop for UniformReliableBroadcast {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn h(id: u32) -> HostId {
        HostId::new(id)
    }

    fn payload(origin: u32, seq: u32) -> Payload {
        Payload::urb(h(origin), Payload::fifo(seq, Payload::raw()))
    }

    #[rstest]
    #[case::three_of_three(3, 2)]
    #[case::three_of_four(4, 3)]
    #[case::one_of_one(1, 1)]
    #[case::three_of_five(5, 3)]
    fn test_majority(#[case] num_processes: u32, #[case] quorum: u32) {
        let mut registry = UrbRegistry::new(num_processes as usize);

        for reporter in 1..quorum {
            registry.on_beb_deliver(&payload(1, 1), h(reporter));
            assert!(registry.take_deliverable().is_empty());
        }
        registry.on_beb_deliver(&payload(1, 1), h(quorum));
        assert_eq!(registry.take_deliverable(), vec![payload(1, 1)]);
        assert_eq!(registry.state(&payload(1, 1)), Some(&PayloadState::Delivered));
    }

    #[test]
    fn test_relay_only_when_first_seen() {
        let mut registry = UrbRegistry::new(3);

        assert_eq!(registry.on_beb_deliver(&payload(2, 1), h(2)), SeenOutcome::Relay);
        assert_eq!(registry.on_beb_deliver(&payload(2, 1), h(3)), SeenOutcome::Seen);
        // duplicates from the same reporter count only once
        assert_eq!(registry.on_beb_deliver(&payload(2, 1), h(3)), SeenOutcome::Seen);
        assert_eq!(registry.take_deliverable(), vec![payload(2, 1)]);

        assert_eq!(registry.on_beb_deliver(&payload(2, 1), h(1)), SeenOutcome::Ignored);
        assert!(registry.take_deliverable().is_empty());
    }

    #[test]
    fn test_duplicate_reports_do_not_form_a_quorum() {
        let mut registry = UrbRegistry::new(3);
        for _ in 0..5 {
            registry.on_beb_deliver(&payload(2, 1), h(2));
        }
        assert!(registry.take_deliverable().is_empty());
        match registry.state(&payload(2, 1)) {
            Some(PayloadState::Pending { seen_by }) => assert_eq!(seen_by.count(), 1),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_own_broadcast() {
        let mut registry = UrbRegistry::new(3);
        registry.on_local_broadcast(&payload(1, 1));
        assert_eq!(registry.num_own_in_flight(), 1);

        // own broadcasts are pending already, so the self-delivery is not relayed
        assert_eq!(registry.on_beb_deliver(&payload(1, 1), h(1)), SeenOutcome::Seen);
        assert!(registry.take_deliverable().is_empty());

        assert_eq!(registry.on_beb_deliver(&payload(1, 1), h(3)), SeenOutcome::Seen);
        assert_eq!(registry.take_deliverable(), vec![payload(1, 1)]);
        assert_eq!(registry.num_own_in_flight(), 0);
    }

    #[test]
    fn test_payload_identity_includes_origin() {
        let mut registry = UrbRegistry::new(3);
        registry.on_beb_deliver(&payload(1, 1), h(1));
        registry.on_beb_deliver(&payload(2, 1), h(2));
        registry.on_beb_deliver(&payload(2, 1), h(3));

        assert_eq!(registry.take_deliverable(), vec![payload(2, 1)]);
        assert!(matches!(registry.state(&payload(1, 1)), Some(PayloadState::Pending { .. })));
        assert_eq!(registry.state(&payload(3, 1)), None);
    }
}
