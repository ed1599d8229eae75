use bytes::Bytes;

use crate::link::datagram::{DatagramData, DatagramKind};
use crate::link::host::Host;

/// The resolved peer of a message: the receiver for outgoing messages, the sender for received
///  ones.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Route {
    To(Host),
    From(Host),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub data: DatagramData,
    pub route: Route,
}

impl Message {
    pub fn outgoing(myself: &Host, to: Host, payload: Bytes) -> Message {
        Message {
            data: DatagramData::new(myself.id, to.id, DatagramKind::Payload, payload),
            route: Route::To(to),
        }
    }

    pub fn received(data: DatagramData, from: Host) -> Message {
        Message {
            data,
            route: Route::From(from),
        }
    }

    /// acknowledgement for a received message, routed back to its sender
    pub fn ack_reply(&self) -> Option<Message> {
        match &self.route {
            Route::From(sender) => Some(Message {
                data: self.data.to_ack(),
                route: Route::To(sender.clone()),
            }),
            Route::To(_) => None,
        }
    }

    pub fn peer(&self) -> &Host {
        match &self.route {
            Route::To(h) => h,
            Route::From(h) => h,
        }
    }

    pub fn receiver(&self) -> Option<&Host> {
        match &self.route {
            Route::To(h) => Some(h),
            Route::From(_) => None,
        }
    }

    pub fn sender(&self) -> Option<&Host> {
        match &self.route {
            Route::To(_) => None,
            Route::From(h) => Some(h),
        }
    }
}
