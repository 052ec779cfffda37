use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::ChannelProtocol;

/// Sent by the connecting side as the first frame on a new connection, identifying the sender
///  and the framing it is going to use
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InitMsg {
    pub sender_rank: u32,
    pub world_size: u32,
    pub channel_protocol: ChannelProtocol,
}

impl InitMsg {
    pub const PROTOCOL_VERSION_1: u8 = 1;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u32(self.sender_rank);
        buf.put_u32(self.world_size);
        buf.put_u8(match self.channel_protocol {
            ChannelProtocol::Frame => 0,
            ChannelProtocol::FrameCrc => 1,
        });
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<InitMsg> {
        let version = buf.try_get_u8()?;
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported handshake version {}", version);
        }
        let sender_rank = buf.try_get_u32()?;
        let world_size = buf.try_get_u32()?;
        let channel_protocol = match buf.try_get_u8()? {
            0 => ChannelProtocol::Frame,
            1 => ChannelProtocol::FrameCrc,
            n => bail!("invalid channel protocol discriminator {}", n),
        };
        Ok(InitMsg {
            sender_rank,
            world_size,
            channel_protocol,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    /// checks that the peer's view of the topology matches ours
    pub fn validate(&self, self_rank: usize, world_size: usize, channel_protocol: ChannelProtocol) -> anyhow::Result<usize> {
        let sender_rank = self.sender_rank as usize;
        if self.world_size as usize != world_size {
            bail!("peer has a topology of {} parties, we have {}", self.world_size, world_size);
        }
        if sender_rank >= world_size {
            bail!("peer rank {} is outside the topology", sender_rank);
        }
        if sender_rank == self_rank {
            bail!("peer claims our own rank {}", self_rank);
        }
        if self.channel_protocol != channel_protocol {
            bail!("peer uses channel protocol {:?}, we use {:?}", self.channel_protocol, channel_protocol);
        }
        Ok(sender_rank)
    }
}

/// The accepting side's answer to [InitMsg]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InitResponseMsg {
    pub receiver_rank: u32,
}

impl InitResponseMsg {
    pub const SERIALIZED_LEN: usize = 4;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.receiver_rank);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        let receiver_rank = buf.try_get_u32()?;
        Ok(InitResponseMsg { receiver_rank })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_init_msg_layout() {
        let msg = InitMsg {
            sender_rank: 2,
            world_size: 3,
            channel_protocol: ChannelProtocol::FrameCrc,
        };
        let buf = msg.to_bytes();
        assert_eq!(buf.as_ref(), &[1, 0, 0, 0, 2, 0, 0, 0, 3, 1]);
        assert_eq!(InitMsg::deser(&mut buf.as_ref()).unwrap(), msg);
    }

    #[rstest]
    #[case::truncated(vec![1, 0, 0])]
    #[case::wrong_version(vec![9, 0, 0, 0, 2, 0, 0, 0, 3, 0])]
    #[case::bad_protocol(vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 5])]
    fn test_init_msg_deser_rejects(#[case] raw: Vec<u8>) {
        assert!(InitMsg::deser(&mut raw.as_slice()).is_err());
    }

    #[rstest]
    #[case::ok(1, 3, ChannelProtocol::Frame, Some(1))]
    #[case::wrong_world_size(1, 4, ChannelProtocol::Frame, None)]
    #[case::out_of_range(3, 3, ChannelProtocol::Frame, None)]
    #[case::own_rank(0, 3, ChannelProtocol::Frame, None)]
    #[case::protocol_mismatch(1, 3, ChannelProtocol::FrameCrc, None)]
    fn test_init_msg_validate(#[case] sender_rank: u32, #[case] world_size: u32, #[case] protocol: ChannelProtocol, #[case] expected: Option<usize>) {
        let msg = InitMsg {
            sender_rank,
            world_size,
            channel_protocol: protocol,
        };
        let actual = msg.validate(0, 3, ChannelProtocol::Frame).ok();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_init_response() {
        let mut buf = BytesMut::new();
        InitResponseMsg { receiver_rank: 7 }.ser(&mut buf);
        assert_eq!(buf.len(), InitResponseMsg::SERIALIZED_LEN);
        assert_eq!(InitResponseMsg::deser(&mut buf.as_ref()).unwrap(), InitResponseMsg { receiver_rank: 7 });
    }
}
