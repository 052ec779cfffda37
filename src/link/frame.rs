use std::io::ErrorKind;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use crc::Crc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ChannelProtocol;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

const FRAME_CHECKSUM: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_REDIS);
const CHECKSUM_LEN: usize = size_of::<u64>();

/// Anything a link can exchange frames over: plain TCP, or TLS on either side
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerStream for T {}

/// Writes a single frame:
///
/// ```ascii
/// 0: frame length (u32 BE), starting *after* the length
/// 4: message
/// *: CRC-64 of the message (u64 BE) - only for [ChannelProtocol::FrameCrc]
/// ```
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
    stream: &mut W,
    protocol: ChannelProtocol,
    max_len: usize,
    msg: &[u8],
) -> anyhow::Result<()> {
    if msg.len() > max_len {
        bail!("message of {} bytes exceeds the configured maximum of {} bytes", msg.len(), max_len);
    }

    let mut buf = BytesMut::with_capacity(4 + msg.len() + CHECKSUM_LEN);
    match protocol {
        ChannelProtocol::Frame => {
            let frame_len: u32 = msg.len().prechecked_cast();
            buf.extend_from_slice(&frame_len.to_be_bytes());
            buf.extend_from_slice(msg);
        }
        ChannelProtocol::FrameCrc => {
            let frame_len: u32 = (msg.len() + CHECKSUM_LEN).prechecked_cast();
            buf.extend_from_slice(&frame_len.to_be_bytes());
            buf.extend_from_slice(msg);
            buf.extend_from_slice(&FRAME_CHECKSUM.checksum(msg).to_be_bytes());
        }
    }

    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads a single frame. Returns `None` if the peer closed the stream between frames.
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(
    stream: &mut R,
    protocol: ChannelProtocol,
    max_len: usize,
) -> anyhow::Result<Option<Bytes>> {
    let frame_len: usize = match stream.read_u32().await {
        Ok(len) => len.safe_cast(),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let overhead = match protocol {
        ChannelProtocol::Frame => 0,
        ChannelProtocol::FrameCrc => CHECKSUM_LEN,
    };
    if frame_len < overhead {
        bail!("frame of {} bytes is too short to hold a checksum", frame_len);
    }
    if frame_len - overhead > max_len {
        bail!("received a frame that was longer than the configured maximum ({} > {}) - closing connection because it is apparently compromised", frame_len - overhead, max_len);
    }

    let mut buf = vec![0u8; frame_len];
    stream.read_exact(&mut buf).await?;
    let mut buf = Bytes::from(buf);

    if protocol == ChannelProtocol::FrameCrc {
        let checksum_bytes = buf.split_off(frame_len - CHECKSUM_LEN);
        let mut raw = [0u8; CHECKSUM_LEN];
        raw.copy_from_slice(&checksum_bytes);
        let expected = u64::from_be_bytes(raw);
        let actual = FRAME_CHECKSUM.checksum(&buf);
        if expected != actual {
            bail!("frame checksum mismatch: expected {:016x}, was {:016x}", expected, actual);
        }
    }

    Ok(Some(buf))
}
