use std::fmt::{Debug, Formatter};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;

use crate::error::RemoteError;
use crate::util::buf::{put_string, try_get_string};

const CHECKSUM: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_REDIS);

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl Checksum {
    pub fn new(body: &[u8]) -> Checksum {
        Checksum(CHECKSUM.checksum(body))
    }
}

/// What a producer hands to a consumer: either opaque application data, or the failure that
///  prevented the producer from computing it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Payload {
    Data(Bytes),
    Error(RemoteError),
}

impl Payload {
    const KIND_DATA: u8 = 0;
    const KIND_ERROR: u8 = 1;

    pub fn data(data: impl Into<Bytes>) -> Payload {
        Payload::Data(data.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Payload::Error(_))
    }
}

/// The pair of sequence ids a payload is tagged with. Ids are kept in their string form so that
///  matching does not depend on how the caller typed them.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct StepPair {
    pub upstream_seq_id: String,
    pub downstream_seq_id: String,
}

impl StepPair {
    pub fn new(upstream_seq_id: impl ToString, downstream_seq_id: impl ToString) -> StepPair {
        StepPair {
            upstream_seq_id: upstream_seq_id.to_string(),
            downstream_seq_id: downstream_seq_id.to_string(),
        }
    }
}

/// The unit of data exchanged between parties.
///
/// Wire format, all fixed-width numbers in network byte order:
///
/// ```ascii
///  0: protocol version (u8)
///  1: checksum (u64) - CRC-64 of everything after the checksum
///  9: upstream seq id (varint length + UTF-8)
///  *: downstream seq id (varint length + UTF-8)
///  *: payload kind (u8): 0 = data, 1 = remote error
///  *: data: all remaining bytes
///     remote error: src party (varint length + UTF-8), cause (varint length + UTF-8)
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Envelope {
    pub pair: StepPair,
    pub payload: Payload,
}

impl Envelope {
    pub const PROTOCOL_VERSION_1: u8 = 1;
    const CHECKSUM_OFFSET: usize = 1;
    const BODY_OFFSET: usize = 9;

    pub fn new(pair: StepPair, payload: Payload) -> Envelope {
        Envelope { pair, payload }
    }

    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u64(0); // patched below

        put_string(&mut buf, &self.pair.upstream_seq_id);
        put_string(&mut buf, &self.pair.downstream_seq_id);
        match &self.payload {
            Payload::Data(data) => {
                buf.put_u8(Payload::KIND_DATA);
                buf.put_slice(data);
            }
            Payload::Error(e) => {
                buf.put_u8(Payload::KIND_ERROR);
                put_string(&mut buf, &e.src_party);
                put_string(&mut buf, &e.cause);
            }
        }

        let checksum = Checksum::new(&buf[Self::BODY_OFFSET..]);
        buf[Self::CHECKSUM_OFFSET..Self::BODY_OFFSET].copy_from_slice(&checksum.0.to_be_bytes());
        buf.freeze()
    }

    pub fn try_deser(mut buf: Bytes) -> anyhow::Result<Envelope> {
        if buf.len() < Self::BODY_OFFSET {
            bail!("envelope too short: {} bytes", buf.len());
        }

        let version = buf.get_u8();
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported envelope version {}", version);
        }

        let checksum = Checksum(buf.get_u64());
        let actual_checksum = Checksum::new(&buf);
        if checksum != actual_checksum {
            bail!("envelope checksum mismatch: expected {:?}, was {:?}", checksum, actual_checksum);
        }

        let upstream_seq_id = try_get_string(&mut buf)?;
        let downstream_seq_id = try_get_string(&mut buf)?;

        let payload = match buf.try_get_u8()? {
            Payload::KIND_DATA => Payload::Data(buf),
            Payload::KIND_ERROR => {
                let src_party = try_get_string(&mut buf)?;
                let cause = try_get_string(&mut buf)?;
                if buf.has_remaining() {
                    bail!("{} trailing bytes after remote error payload", buf.remaining());
                }
                Payload::Error(RemoteError { src_party, cause })
            }
            n => return Err(anyhow!("invalid payload kind discriminator: {}", n)),
        };

        Ok(Envelope {
            pair: StepPair { upstream_seq_id, downstream_seq_id },
            payload,
        })
    }
}
