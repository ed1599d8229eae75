use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::LinkConfig;
use crate::link::datagram::DatagramData;
use crate::link::host::HostId;
use crate::link::message::Message;
use crate::link::transmission::{TransmissionHistory, TransmissionParameters};

struct InFlight {
    message: Message,
    history: TransmissionHistory,
}

#[derive(Default)]
struct StoreInner {
    /// unacknowledged messages that count towards the send window
    recent: FxHashMap<DatagramData, InFlight>,
    /// unacknowledged messages that were retransmitted repeatedly
    stale: FxHashMap<DatagramData, InFlight>,
    to_send: VecDeque<Message>,
    ack_replies: VecDeque<Message>,
    received: VecDeque<(Message, Instant)>,
    delivered: FxHashSet<DatagramData>,
    transmission: FxHashMap<HostId, TransmissionParameters>,
}

/// All state of a link that is shared between the sending, receiving and triage loops.
pub struct MessageStore {
    config: Arc<LinkConfig>,
    inner: Mutex<StoreInner>,
}

impl MessageStore {
    pub fn new(config: Arc<LinkConfig>) -> MessageStore {
        MessageStore {
            config,
            inner: Default::default(),
        }
    }

    /// Registers a message as sent if the send window has room for it. Checking and registering
    ///  is atomic, so concurrent senders can not overshoot the window.
    pub async fn try_register_send(&self, message: &Message, window: usize, now: Instant) -> bool {
        let mut inner = self.inner.lock().await;
        Self::do_try_register(&mut inner, message, window, now)
    }

    fn do_try_register(inner: &mut StoreInner, message: &Message, window: usize, now: Instant) -> bool {
        if inner.recent.contains_key(&message.data) || inner.stale.contains_key(&message.data) {
            trace!("message {:?} is already in flight", message.data);
            return true;
        }
        if inner.recent.len() >= window {
            return false;
        }
        inner.recent.insert(message.data.clone(), InFlight {
            message: message.clone(),
            history: TransmissionHistory::new(now),
        });
        true
    }

    pub async fn queue(&self, message: Message) {
        self.inner.lock().await
            .to_send.push_back(message);
    }

    /// Takes queued messages from the front of the queue for as long as the send window has room,
    ///  registering them as sent.
    pub async fn take_sendable(&self, window: usize, now: Instant) -> Vec<Message> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        let mut result = Vec::new();
        while let Some(message) = inner.to_send.pop_front() {
            if Self::do_try_register(inner, &message, window, now) {
                result.push(message);
            }
            else {
                inner.to_send.push_front(message);
                break;
            }
        }
        result
    }

    /// Collects all messages that are due for retransmission, marking them as resent. The RTO of
    ///  each affected destination is backed off once per call, regardless of how many messages to
    ///  that destination are retransmitted.
    pub async fn due_retransmissions(&self, now: Instant) -> Vec<Message> {
        let rto_config = &self.config.rto;
        let mut inner = self.inner.lock().await;
        let StoreInner { recent, stale, transmission, .. } = &mut *inner;

        let mut result = Vec::new();
        let mut backed_off_hosts = FxHashSet::default();

        for (is_stale, in_flight) in recent.values_mut().map(|f| (false, f))
            .chain(stale.values_mut().map(|f| (true, f)))
        {
            let destination = in_flight.message.data.receiver;
            let timeout = transmission.get(&destination)
                .map(|p| p.retransmission_timeout(is_stale, rto_config))
                .unwrap_or(rto_config.initial_rto);

            if now.saturating_duration_since(in_flight.history.send_time) > timeout {
                in_flight.history.mark_resent(now);
                backed_off_hosts.insert(destination);
                result.push(in_flight.message.clone());
            }
        }

        let demoted = recent.iter()
            .filter(|(_, f)| f.history.retries > self.config.max_retries_before_stale)
            .map(|(data, _)| data.clone())
            .collect::<Vec<_>>();
        for data in demoted {
            if let Some(in_flight) = recent.remove(&data) {
                debug!("demoting message {:?} after {} retries", data, in_flight.history.retries);
                stale.insert(data, in_flight);
            }
        }

        for host in backed_off_hosts {
            transmission.entry(host)
                .or_insert_with(|| TransmissionParameters::new(rto_config))
                .back_off(rto_config);
        }

        result
    }

    /// Removes the acknowledged message from the unacknowledged sets, returning `false` for
    ///  duplicate or late acknowledgements. RTT samples are taken only for messages that were
    ///  never retransmitted.
    pub async fn acknowledge(&self, original: &DatagramData, received_at: Instant) -> bool {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        let in_flight = match inner.recent.remove(original) {
            Some(f) => f,
            None => match inner.stale.remove(original) {
                Some(f) => f,
                None => {
                    trace!("duplicate or late acknowledgement for {:?} - ignoring", original);
                    return false;
                }
            }
        };

        if !in_flight.history.is_retransmitted() {
            let rtt = received_at.saturating_duration_since(in_flight.history.send_time);
            inner.transmission.entry(original.receiver)
                .or_insert_with(|| TransmissionParameters::new(&self.config.rto))
                .on_rtt_sample(rtt, &self.config.rto);
        }
        true
    }

    pub async fn queue_ack_reply(&self, ack: Message) {
        self.inner.lock().await
            .ack_replies.push_back(ack);
    }

    pub async fn take_ack_replies(&self) -> Vec<Message> {
        self.inner.lock().await
            .ack_replies.drain(..)
            .collect()
    }

    pub async fn push_received(&self, message: Message, received_at: Instant) {
        self.inner.lock().await
            .received.push_back((message, received_at));
    }

    pub async fn take_received(&self) -> Vec<(Message, Instant)> {
        self.inner.lock().await
            .received.drain(..)
            .collect()
    }

    /// returns `true` if the datagram was not delivered before
    pub async fn mark_delivered(&self, data: &DatagramData) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.delivered.contains(data) {
            return false;
        }
        inner.delivered.insert(data.clone())
    }

    pub async fn num_recent(&self) -> usize {
        self.inner.lock().await.recent.len()
    }

    pub async fn num_stale(&self) -> usize {
        self.inner.lock().await.stale.len()
    }

    pub async fn num_queued(&self) -> usize {
        self.inner.lock().await.to_send.len()
    }

    pub async fn transmission_parameters(&self, host: HostId) -> TransmissionParameters {
        self.inner.lock().await
            .transmission.get(&host)
            .cloned()
            .unwrap_or_else(|| TransmissionParameters::new(&self.config.rto))
    }
}
