//! Broadcast payloads are stacks of layers, each layer adding its own header in front of the
//!  layer it wraps. A [PayloadFormat] describes the stack a broadcast algorithm puts on the wire.

pub mod vector_clock;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::link::host::HostId;
use crate::payload::vector_clock::MessagePassedVectorClock;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum PayloadKind {
    Raw,
    Urb,
    Fifo,
    Causal,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Payload {
    /// opaque application content
    Raw(Bytes),
    Urb {
        original_sender: HostId,
        inner: Box<Payload>,
    },
    Fifo {
        sequence_number: u32,
        inner: Box<Payload>,
    },
    Causal {
        vector_clock: MessagePassedVectorClock,
        inner: Box<Payload>,
    },
}

impl Payload {
    pub fn raw() -> Payload {
        Payload::Raw(Bytes::new())
    }

    pub fn urb(original_sender: HostId, inner: Payload) -> Payload {
        Payload::Urb { original_sender, inner: Box::new(inner) }
    }

    pub fn fifo(sequence_number: u32, inner: Payload) -> Payload {
        Payload::Fifo { sequence_number, inner: Box::new(inner) }
    }

    pub fn causal(vector_clock: MessagePassedVectorClock, inner: Payload) -> Payload {
        Payload::Causal { vector_clock, inner: Box::new(inner) }
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Raw(_) => PayloadKind::Raw,
            Payload::Urb { .. } => PayloadKind::Urb,
            Payload::Fifo { .. } => PayloadKind::Fifo,
            Payload::Causal { .. } => PayloadKind::Causal,
        }
    }

    pub fn inner(&self) -> Option<&Payload> {
        match self {
            Payload::Raw(_) => None,
            Payload::Urb { inner, .. } => Some(inner),
            Payload::Fifo { inner, .. } => Some(inner),
            Payload::Causal { inner, .. } => Some(inner),
        }
    }

    /// iterates over this payload and all layers it wraps, outermost first
    pub fn layers(&self) -> impl Iterator<Item=&Payload> {
        std::iter::successors(Some(self), |p| p.inner())
    }

    pub fn has_layer(&self, kind: PayloadKind) -> bool {
        self.layers().any(|p| p.kind() == kind)
    }

    /// the process that initiated the broadcast, as recorded by the URB layer
    pub fn original_sender(&self) -> Option<HostId> {
        self.layers()
            .find_map(|p| match p {
                Payload::Urb { original_sender, .. } => Some(*original_sender),
                _ => None,
            })
    }

    pub fn vector_clock(&self) -> Option<&MessagePassedVectorClock> {
        self.layers()
            .find_map(|p| match p {
                Payload::Causal { vector_clock, .. } => Some(vector_clock),
                _ => None,
            })
    }

    /// The 1-based number of this broadcast among its origin's broadcasts: the FIFO sequence
    ///  number, or for causal payloads the origin's stamped vector clock entry plus one.
    pub fn sequence_number(&self) -> Option<u32> {
        self.layers()
            .find_map(|p| match p {
                Payload::Fifo { sequence_number, .. } => Some(*sequence_number),
                Payload::Causal { vector_clock, inner } => inner.original_sender()
                    .map(|origin| vector_clock.entry(origin) + 1),
                _ => None,
            })
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            Payload::Raw(content) => buf.put_slice(content),
            Payload::Urb { original_sender, inner } => {
                original_sender.ser(buf);
                inner.ser(buf);
            }
            Payload::Fifo { sequence_number, inner } => {
                buf.put_u32(*sequence_number);
                inner.ser(buf);
            }
            Payload::Causal { vector_clock, inner } => {
                vector_clock.ser(buf);
                inner.ser(buf);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }
}

/// The layers of a payload stack, outermost first. Deserialization dispatches on each layer's
///  [PayloadKind].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PayloadFormat {
    layers: Vec<PayloadKind>,
    num_processes: usize,
}

impl PayloadFormat {
    pub fn new(layers: Vec<PayloadKind>, num_processes: usize) -> anyhow::Result<PayloadFormat> {
        match layers.split_last() {
            Some((PayloadKind::Raw, outer)) if !outer.contains(&PayloadKind::Raw) => {}
            _ => bail!("payload format must end with a single raw layer: {:?}", layers),
        }
        Ok(PayloadFormat { layers, num_processes })
    }

    pub fn urb() -> PayloadFormat {
        PayloadFormat { layers: vec![PayloadKind::Urb, PayloadKind::Raw], num_processes: 0 }
    }

    pub fn fifo() -> PayloadFormat {
        PayloadFormat { layers: vec![PayloadKind::Urb, PayloadKind::Fifo, PayloadKind::Raw], num_processes: 0 }
    }

    pub fn causal(num_processes: usize) -> PayloadFormat {
        PayloadFormat { layers: vec![PayloadKind::Causal, PayloadKind::Urb, PayloadKind::Raw], num_processes }
    }

    pub fn layers(&self) -> &[PayloadKind] {
        &self.layers
    }

    pub fn try_deser(&self, buf: &mut impl Buf) -> anyhow::Result<Payload> {
        self.try_deser_layers(&self.layers, buf)
    }

    fn try_deser_layers(&self, layers: &[PayloadKind], buf: &mut impl Buf) -> anyhow::Result<Payload> {
        let Some((kind, inner_layers)) = layers.split_first() else {
            bail!("payload format without a raw layer");
        };

        match kind {
            PayloadKind::Raw => Ok(Payload::Raw(buf.copy_to_bytes(buf.remaining()))),
            PayloadKind::Urb => {
                let original_sender = HostId::try_deser(buf)?;
                Ok(Payload::urb(original_sender, self.try_deser_layers(inner_layers, buf)?))
            }
            PayloadKind::Fifo => {
                let sequence_number = buf.try_get_u32()?;
                Ok(Payload::fifo(sequence_number, self.try_deser_layers(inner_layers, buf)?))
            }
            PayloadKind::Causal => {
                let vector_clock = MessagePassedVectorClock::try_deser(buf, self.num_processes)?;
                Ok(Payload::causal(vector_clock, self.try_deser_layers(inner_layers, buf)?))
            }
        }
    }
}
