use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::link::host::HostId;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DatagramKind {
    Payload = 0,
    Ack = 1,
}

/// The unit of transmission on the wire. Identity is by content: it is the key for
///  deduplicating deliveries and for matching acknowledgements.
///
/// The payload is kept in its encoded form, so an acknowledgement can echo it byte by byte.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct DatagramData {
    pub sender: HostId,
    pub receiver: HostId,
    pub kind: DatagramKind,
    pub payload: Bytes,
}

impl DatagramData {
    pub const HEADER_LEN: usize = 4 + 4 + 1;

    pub fn new(sender: HostId, receiver: HostId, kind: DatagramKind, payload: Bytes) -> DatagramData {
        DatagramData { sender, receiver, kind, payload }
    }

    pub fn to_ack(&self) -> DatagramData {
        DatagramData {
            sender: self.receiver,
            receiver: self.sender,
            kind: DatagramKind::Ack,
            payload: self.payload.clone(),
        }
    }

    /// the payload datagram an acknowledgement refers to
    pub fn ack_to_original(&self) -> DatagramData {
        DatagramData {
            sender: self.receiver,
            receiver: self.sender,
            kind: DatagramKind::Payload,
            payload: self.payload.clone(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.payload.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.sender.ser(buf);
        self.receiver.ser(buf);
        buf.put_u8(self.kind.into());
        buf.put_slice(&self.payload);
    }

    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<DatagramData> {
        let sender = HostId::try_deser(&mut buf)?;
        let receiver = HostId::try_deser(&mut buf)?;
        let kind_discriminator = buf.try_get_u8()?;
        let kind = DatagramKind::try_from(kind_discriminator)
            .map_err(|_| anyhow!("invalid datagram kind {}", kind_discriminator))?;
        let payload = Bytes::copy_from_slice(buf);

        Ok(DatagramData { sender, receiver, kind, payload })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::payload(DatagramKind::Payload, b"abc".as_slice(), vec![0,0,0,1, 0,0,0,2, 0, b'a', b'b', b'c'])]
    #[case::ack(DatagramKind::Ack, b"abc".as_slice(), vec![0,0,0,1, 0,0,0,2, 1, b'a', b'b', b'c'])]
    #[case::empty(DatagramKind::Payload, b"".as_slice(), vec![0,0,0,1, 0,0,0,2, 0])]
    fn test_wire_format(#[case] kind: DatagramKind, #[case] payload: &[u8], #[case] expected: Vec<u8>) {
        let data = DatagramData::new(HostId::new(1), HostId::new(2), kind, Bytes::copy_from_slice(payload));

        let mut buf = BytesMut::new();
        data.ser(&mut buf);
        assert_eq!(&buf[..], expected.as_slice());
        assert_eq!(data.encoded_len(), expected.len());

        assert_eq!(DatagramData::try_deser(&buf).unwrap(), data);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated_receiver(vec![0,0,0,1, 0,0])]
    #[case::missing_kind(vec![0,0,0,1, 0,0,0,2])]
    #[case::unknown_kind(vec![0,0,0,1, 0,0,0,2, 7])]
    fn test_malformed(#[case] buf: Vec<u8>) {
        assert!(DatagramData::try_deser(&buf).is_err());
    }

    #[test]
    fn test_ack_identity() {
        let data = DatagramData::new(HostId::new(3), HostId::new(5), DatagramKind::Payload, Bytes::from_static(b"xyz"));
        let ack = data.to_ack();

        assert_eq!(ack.sender, HostId::new(5));
        assert_eq!(ack.receiver, HostId::new(3));
        assert_eq!(ack.kind, DatagramKind::Ack);
        assert_eq!(ack.payload, data.payload);
        assert_ne!(ack, data);
        assert_eq!(ack.ack_to_original(), data);
    }
}
