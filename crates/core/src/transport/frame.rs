//! Interleaved binary framing (RFC 2326 §10.12).
//!
//! Media multiplexed on the RTSP connection travels in frames:
//!
//! ```text
//! +------+---------+----------------+-----------------+
//! | 0x24 | channel | length (u16 BE)| payload ...     |
//! +------+---------+----------------+-----------------+
//! ```
//!
//! Channels come in pairs per media: even carries RTP, odd carries RTCP.

use std::io::{BufRead, Read};

use crate::error::{RelayError, Result};

/// Leading byte of every interleaved frame (`$`).
pub const MAGIC: u8 = 0x24;

/// Whether `byte` can open an RTSP request line. Method tokens are
/// uppercase ASCII, so a recorder's PAUSE, GET_PARAMETER or TEARDOWN ends the
/// interleaved media stream without closing the connection.
pub fn is_request_lead(byte: u8) -> bool {
    byte.is_ascii_uppercase()
}

/// Largest payload accepted in one frame or datagram.
pub const MAX_PACKET_SIZE: usize = 2048;

pub const HEADER_LEN: usize = 4;

/// Which half of a channel pair a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubChannel {
    Rtp = 0,
    Rtcp = 1,
}

impl SubChannel {
    pub fn from_parity(channel: u8) -> Self {
        if channel % 2 == 0 {
            SubChannel::Rtp
        } else {
            SubChannel::Rtcp
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }
}

/// Interleaved channel → (media ordinal, sub-channel), assuming the
/// conventional `2*ordinal`/`2*ordinal+1` layout.
pub fn split_channel(channel: u8) -> (usize, SubChannel) {
    (usize::from(channel / 2), SubChannel::from_parity(channel))
}

/// Inverse of [`split_channel`]. `None` when the ordinal cannot be encoded
/// in one channel byte.
pub fn join_channel(ordinal: usize, sub: SubChannel) -> Option<u8> {
    u8::try_from(ordinal.checked_mul(2)? + usize::from(sub.index())).ok()
}

/// Header of a frame read by [`read_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub channel: u8,
    pub len: usize,
}

/// Read one interleaved frame into `buf`.
///
/// Returns `Ok(None)` at end of the media stream: either the peer closed the
/// connection on a frame boundary, or the next byte opens a request (see
/// [`is_request_lead`]). In the latter case the byte is left unread so the
/// request can be parsed.
pub fn read_frame<R: BufRead>(reader: &mut R, buf: &mut [u8]) -> Result<Option<FrameHeader>> {
    let lead = match reader.fill_buf()?.first() {
        None => return Ok(None),
        Some(&b) => b,
    };
    if is_request_lead(lead) {
        return Ok(None);
    }
    if lead != MAGIC {
        return Err(RelayError::BadMagic(lead));
    }

    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).map_err(RelayError::from_read)?;

    let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    if len > MAX_PACKET_SIZE || len > buf.len() {
        return Err(RelayError::FrameTooLarge(len));
    }
    reader.read_exact(&mut buf[..len]).map_err(RelayError::from_read)?;

    Ok(Some(FrameHeader {
        channel: header[1],
        len,
    }))
}

/// Encode one frame, header and payload in a single buffer so it can be
/// written with one call.
pub fn encode_frame(channel: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PACKET_SIZE {
        return Err(RelayError::FrameTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(MAGIC);
    out.push(channel);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}
