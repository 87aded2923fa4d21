use std::mem::size_of;
use std::fmt::{Debug, Formatter};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;
use crate::ids::{ConnId, SeqNum};

const CHECKSUM_ALGORITHM: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    Connect = 0,
    Data = 1,
    Ack = 2,
    Cack = 3,
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u32);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x?}", self.0)
    }
}
impl Checksum {
    pub fn new(kind: MessageKind, conn_id: ConnId, seq_num: SeqNum, payload: &[u8]) -> Checksum {
        let mut digest = CHECKSUM_ALGORITHM.digest();

        digest.update(&[kind.into()]);
        digest.update(&conn_id.to_raw().to_be_bytes());
        digest.update(&seq_num.to_raw().to_be_bytes());
        digest.update(&(payload.len() as u32).to_be_bytes());
        digest.update(payload);

        Checksum(digest.finalize())
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("checksum mismatch: expected {expected:?}, was {actual:?}")]
    Corrupted { expected: Checksum, actual: Checksum },
}

/// A single LSP datagram.
///
/// NB: Data messages carry their checksum so that a retransmission is bit-for-bit identical
///      to the original
#[derive(Clone, Eq, PartialEq)]
pub enum Message {
    Connect {
        seq_num: SeqNum,
    },
    Data {
        conn_id: ConnId,
        seq_num: SeqNum,
        payload: Bytes,
        checksum: Checksum,
    },
    /// cumulative: acknowledges all sequence numbers up to and including `seq_num`. An ack
    ///  for `SeqNum::ZERO` acknowledges nothing and doubles as heartbeat.
    Ack {
        conn_id: ConnId,
        seq_num: SeqNum,
    },
    /// selective: acknowledges exactly `seq_num`, which arrived out of order
    Cack {
        conn_id: ConnId,
        seq_num: SeqNum,
    },
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Connect { seq_num } => write!(f, "CONNECT{{{}}}", seq_num),
            Message::Data { conn_id, seq_num, payload, .. } => write!(f, "DATA{{{}:{} [{}]}}", conn_id, seq_num, payload.len()),
            Message::Ack { conn_id, seq_num } => write!(f, "ACK{{{}:{}}}", conn_id, seq_num),
            Message::Cack { conn_id, seq_num } => write!(f, "CACK{{{}:{}}}", conn_id, seq_num),
        }
    }
}

impl Message {
    pub const HEADER_LEN: usize = size_of::<u8>()   // kind
        + size_of::<u32>()                           // conn id
        + size_of::<u32>()                           // seq num
        + size_of::<u32>()                           // payload length
        + size_of::<u32>();                          // checksum

    pub fn connect() -> Message {
        Message::Connect { seq_num: SeqNum::ZERO }
    }

    pub fn data(conn_id: ConnId, seq_num: SeqNum, payload: Bytes) -> Message {
        let checksum = Checksum::new(MessageKind::Data, conn_id, seq_num, &payload);
        Message::Data { conn_id, seq_num, payload, checksum }
    }

    pub fn ack(conn_id: ConnId, seq_num: SeqNum) -> Message {
        Message::Ack { conn_id, seq_num }
    }

    pub fn heartbeat(conn_id: ConnId) -> Message {
        Message::Ack { conn_id, seq_num: SeqNum::ZERO }
    }

    pub fn cack(conn_id: ConnId, seq_num: SeqNum) -> Message {
        Message::Cack { conn_id, seq_num }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Connect { .. } => MessageKind::Connect,
            Message::Data { .. } => MessageKind::Data,
            Message::Ack { .. } => MessageKind::Ack,
            Message::Cack { .. } => MessageKind::Cack,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        match self {
            Message::Connect { .. } => ConnId::NONE,
            Message::Data { conn_id, .. } | Message::Ack { conn_id, .. } | Message::Cack { conn_id, .. } => *conn_id,
        }
    }

    pub fn seq_num(&self) -> SeqNum {
        match self {
            Message::Connect { seq_num } |
            Message::Data { seq_num, .. } |
            Message::Ack { seq_num, .. } |
            Message::Cack { seq_num, .. } => *seq_num,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Message::Data { payload, .. } => payload,
            _ => &[],
        }
    }

    fn checksum(&self) -> Checksum {
        match self {
            Message::Data { checksum, .. } => *checksum,
            _ => Checksum::new(self.kind(), self.conn_id(), self.seq_num(), &[]),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let payload = self.payload();

        buf.put_u8(self.kind().into());
        buf.put_u32(self.conn_id().to_raw());
        buf.put_u32(self.seq_num().to_raw());
        buf.put_u32(payload.len() as u32);
        buf.put_u32(self.checksum().0);
        buf.put_slice(payload);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.payload().len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Parses a complete datagram. The datagram must contain exactly one message and nothing
    ///  else, and its checksum must match.
    pub fn decode(datagram: &[u8]) -> Result<Message, DecodeError> {
        let mut buf = datagram;

        let raw_kind = buf.try_get_u8().map_err(|_| Self::truncated())?;
        let kind = MessageKind::try_from(raw_kind)
            .map_err(|_| DecodeError::Malformed(format!("unknown message kind {}", raw_kind)))?;
        let conn_id = ConnId::from_raw(buf.try_get_u32().map_err(|_| Self::truncated())?);
        let seq_num = SeqNum::from_raw(buf.try_get_u32().map_err(|_| Self::truncated())?);
        let payload_len = buf.try_get_u32().map_err(|_| Self::truncated())? as usize;
        let transmitted = Checksum(buf.try_get_u32().map_err(|_| Self::truncated())?);

        if buf.remaining() != payload_len {
            return Err(DecodeError::Malformed(format!("declared payload length {} but {} bytes remain", payload_len, buf.remaining())));
        }

        let computed = Checksum::new(kind, conn_id, seq_num, buf);
        if computed != transmitted {
            return Err(DecodeError::Corrupted { expected: computed, actual: transmitted });
        }

        if kind != MessageKind::Data && payload_len != 0 {
            return Err(DecodeError::Malformed(format!("{:?} message with payload", kind)));
        }

        Ok(match kind {
            MessageKind::Connect => Message::Connect { seq_num },
            MessageKind::Data => Message::Data {
                conn_id,
                seq_num,
                payload: Bytes::copy_from_slice(buf),
                checksum: transmitted,
            },
            MessageKind::Ack => Message::Ack { conn_id, seq_num },
            MessageKind::Cack => Message::Cack { conn_id, seq_num },
        })
    }

    fn truncated() -> DecodeError {
        DecodeError::Malformed("truncated header".to_string())
    }
}
