use std::sync::Arc;

use async_trait::async_trait;
use bit_set::BitSet;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::broadcast::urb::UniformReliableBroadcast;
use crate::broadcast::{publish, BroadcastEvent, Broadcaster, Delivery};
use crate::link::host::{HostId, HostResolver};
use crate::payload::vector_clock::ProcessVectorClock;
use crate::payload::Payload;

/// The vector clock and everything that must change atomically with it
pub struct CausalState {
    myself: HostId,
    /// processes (by id) whose deliveries this process' broadcasts depend on
    dependencies: BitSet,
    clock: ProcessVectorClock,
    num_broadcasts: u32,
    pending: Vec<Delivery>,
}

impl CausalState {
    pub fn new(myself: HostId, num_processes: usize, dependencies: BitSet) -> CausalState {
        CausalState {
            myself,
            dependencies,
            clock: ProcessVectorClock::new(num_processes),
            num_broadcasts: 0,
            pending: Vec::new(),
        }
    }

    /// Wraps an application payload for broadcasting, stamping it with the localized vector clock
    pub fn stamp(&mut self, payload: Payload) -> Payload {
        let vector_clock = self.clock.localized_snapshot(&self.dependencies, self.myself, self.num_broadcasts);
        self.num_broadcasts += 1;
        Payload::causal(vector_clock, Payload::urb(self.myself, payload))
    }

    pub fn add_pending(&mut self, delivery: Delivery) -> anyhow::Result<()> {
        if delivery.payload.vector_clock().is_none() {
            anyhow::bail!("payload without vector clock from {:?}", delivery.from.id);
        }
        self.pending.push(delivery);
        Ok(())
    }

    /// Removes and returns all pending deliveries whose vector clock is dominated by the local
    ///  clock, advancing the local clock for each of them. Deliveries that become deliverable
    ///  because of an earlier one in the same call are included.
    pub fn take_deliverable(&mut self) -> anyhow::Result<Vec<Delivery>> {
        let mut result = Vec::new();
        loop {
            let clock = &self.clock;
            let deliverable = self.pending.iter()
                .position(|d| d.payload.vector_clock()
                    .map(|vc| vc.is_less_or_equal(clock))
                    .unwrap_or(false)
                );

            let Some(idx) = deliverable else {
                break;
            };
            let delivery = self.pending.remove(idx);
            self.clock.increment(delivery.from.id)?;
            result.push(delivery);
        }
        Ok(result)
    }

    pub fn clock(&self) -> &ProcessVectorClock {
        &self.clock
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }
}

/// Localized causal broadcast on top of URB: a process' broadcast is delivered only after all
///  broadcasts of its dependencies that it had delivered before broadcasting.
pub struct CausalBroadcast {
    urb: Arc<UniformReliableBroadcast>,
    state: Arc<Mutex<CausalState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CausalBroadcast {
    pub fn new(urb: UniformReliableBroadcast, urb_events: mpsc::UnboundedReceiver<BroadcastEvent>, dependencies: BitSet) -> (CausalBroadcast, mpsc::UnboundedReceiver<BroadcastEvent>) {
        let (events, events_recv) = mpsc::unbounded_channel();

        let state = Arc::new(Mutex::new(CausalState::new(urb.resolver().my_id(), urb.resolver().num_hosts(), dependencies)));
        let pending_notify = Arc::new(Notify::new());

        let forward_task = tokio::spawn(Self::consume_urb_events(urb_events, state.clone(), pending_notify.clone(), events.clone()));
        let delivery_task = tokio::spawn(Self::delivery_loop(state.clone(), pending_notify, events));

        let causal = CausalBroadcast {
            urb: Arc::new(urb),
            state,
            tasks: vec![forward_task, delivery_task],
        };
        (causal, events_recv)
    }

    async fn consume_urb_events(
        mut urb_events: mpsc::UnboundedReceiver<BroadcastEvent>,
        state: Arc<Mutex<CausalState>>,
        pending_notify: Arc<Notify>,
        events: mpsc::UnboundedSender<BroadcastEvent>,
    ) {
        while let Some(event) = urb_events.recv().await {
            match event {
                BroadcastEvent::Broadcast(payload) => publish(&events, BroadcastEvent::Broadcast(payload)),
                BroadcastEvent::Deliver(delivery) => {
                    if let Err(e) = state.lock().await.add_pending(delivery) {
                        warn!("{} - dropping", e);
                        continue;
                    }
                    pending_notify.notify_one();
                }
            }
        }
    }

    async fn delivery_loop(state: Arc<Mutex<CausalState>>, pending_notify: Arc<Notify>, events: mpsc::UnboundedSender<BroadcastEvent>) {
        loop {
            pending_notify.notified().await;

            let mut guard = state.lock().await;
            match guard.take_deliverable() {
                Ok(deliverable) => {
                    for delivery in deliverable {
                        debug!("causal delivery of {:?} from {:?}", delivery.payload, delivery.from.id);
                        publish(&events, BroadcastEvent::Deliver(delivery));
                    }
                }
                Err(e) => {
                    error!("causal delivery failed: {:#}", e);
                }
            }
        }
    }

    pub async fn clock(&self) -> ProcessVectorClock {
        self.state.lock().await
            .clock()
            .clone()
    }
}

#[async_trait]
impl Broadcaster for CausalBroadcast {
    async fn broadcast(&self, payload: Payload) -> anyhow::Result<()> {
        let stamped = self.state.lock().await
            .stamp(payload);
        self.urb.broadcast(stamped).await
    }

    async fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.urb.stop().await;
    }

    async fn failed(&self) -> String {
        self.urb.failed().await
    }

    fn resolver(&self) -> &HostResolver {
        self.urb.resolver()
    }
}

impl Drop for CausalBroadcast {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
