//! A stack of broadcast abstractions on top of [crate::link::perfect_link::PerfectLink]. Each
//!  layer consumes the events of the layer below from a channel, and publishes its own events
//!  on a channel for the layer above.

pub mod beb;
pub mod causal;
pub mod fifo;
pub mod urb;


use async_trait::async_trait;
use bit_set::BitSet;
use tokio::sync::mpsc;
use tracing::debug;

use crate::broadcast::beb::BestEffortBroadcast;
use crate::broadcast::causal::CausalBroadcast;
use crate::broadcast::fifo::FifoBroadcast;
use crate::broadcast::urb::UniformReliableBroadcast;
use crate::link::host::{Host, HostResolver};
use crate::link::message::Message;
use crate::link::perfect_link::PerfectLink;
use crate::payload::{Payload, PayloadFormat};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Delivery {
    /// the process the payload is delivered from. Layers on top of URB report the broadcast's
    ///  origin here rather than the relaying process.
    pub from: Host,
    pub payload: Payload,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BroadcastEvent {
    Broadcast(Payload),
    Deliver(Delivery),
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Broadcasts an application payload to all processes, including this one
    async fn broadcast(&self, payload: Payload) -> anyhow::Result<()>;

    /// Stops this layer's tasks and all layers below it
    async fn stop(&self);

    /// Resolves with a description of the failure when the underlying transport failed
    async fn failed(&self) -> String;

    fn resolver(&self) -> &HostResolver;
}

pub(crate) fn publish(events: &mpsc::UnboundedSender<BroadcastEvent>, event: BroadcastEvent) {
    if events.send(event).is_err() {
        debug!("event receiver was dropped - discarding event");
    }
}

/// FIFO broadcast over URB over BEB over the given link
pub fn fifo_stack(link: PerfectLink, link_deliveries: mpsc::UnboundedReceiver<Message>) -> (FifoBroadcast, mpsc::UnboundedReceiver<BroadcastEvent>) {
    let (beb, beb_events) = BestEffortBroadcast::new(link, link_deliveries, PayloadFormat::fifo());
    let (urb, urb_events) = UniformReliableBroadcast::new(beb, beb_events);
    FifoBroadcast::new(urb, urb_events)
}

/// Localized causal broadcast over URB over BEB over the given link
pub fn causal_stack(link: PerfectLink, link_deliveries: mpsc::UnboundedReceiver<Message>, dependencies: BitSet) -> (CausalBroadcast, mpsc::UnboundedReceiver<BroadcastEvent>) {
    let format = PayloadFormat::causal(link.resolver().num_hosts());
    let (beb, beb_events) = BestEffortBroadcast::new(link, link_deliveries, format);
    let (urb, urb_events) = UniformReliableBroadcast::new(beb, beb_events);
    CausalBroadcast::new(urb, urb_events, dependencies)
}
