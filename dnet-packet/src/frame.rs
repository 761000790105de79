//! Ethernet framing for DECnet payloads.
//!
//! A framed packet is destination and source station addresses, the
//! DECnet ethertype, a 16-bit little-endian payload length, and the
//! payload. Short frames are zero-padded on emit; the length field keeps
//! the receiver from reading the pad.

use crate::addr::MacAddr;
use crate::wire::{Reader, Writer};
use crate::Error;

pub const ETHERTYPE_DECNET: u16 = 0x6003;

pub const HEADER_LEN: usize = 16;

/// Minimum transmitted frame length; shorter frames are zero padded.
pub const MIN_FRAME_LEN: usize = 128;

/// Enough for the 1498-byte hello blocksize plus the frame header.
pub const MAX_FRAME_LEN: usize = 1514;

/// A parsed view of a received frame, with the payload trimmed to its
/// stated length.
#[derive(Debug)]
pub struct Frame<'a> {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub payload: &'a [u8],
}

/// The ethertype of a captured frame, if it is long enough to carry one.
pub fn ethertype(raw: &[u8]) -> Option<u16> {
    if raw.len() < 14 {
        None
    } else {
        Some(u16::from_be_bytes([raw[12], raw[13]]))
    }
}

impl<'a> Frame<'a> {
    /// Parses a captured frame. The caller has already checked the
    /// ethertype; this rejects frames whose stated payload length
    /// exceeds what was captured.
    pub fn parse(raw: &'a [u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(raw);

        let dst = reader.arr::<6>()?;
        let src = reader.arr::<6>()?;

        let ethertype = u16::from_be_bytes(reader.arr::<2>()?);
        if ethertype != ETHERTYPE_DECNET {
            return Err(Error::InvalidFormat);
        }

        let len = reader.u16_le()? as usize;
        if len > reader.remaining() {
            return Err(Error::DataUnderflow);
        }

        let payload = &reader.rest()[..len];

        Ok(Self { dst, src, payload })
    }

    /// Emits a frame into `buf`, zero-padding up to the 128-byte minimum,
    /// and returns the number of bytes to put on the wire.
    pub fn emit(
        dst: &MacAddr,
        src: &MacAddr,
        payload: &[u8],
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let mut writer = Writer::new(buf);

        writer.slice(dst)?;
        writer.slice(src)?;
        writer.slice(&ETHERTYPE_DECNET.to_be_bytes())?;

        if payload.len() > u16::MAX as usize {
            return Err(Error::InvalidFormat);
        }

        writer.u16_le(payload.len() as u16)?;
        writer.slice(payload)?;

        let len = writer.len();
        if len < MIN_FRAME_LEN {
            writer.zeroes(MIN_FRAME_LEN - len)?;
        }

        Ok(writer.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addr::{DecnetAddr, NodeAddr};

    #[test]
    fn emit_then_parse() {
        let dst = DecnetAddr::AllRouters.mac();
        let src = NodeAddr::new(1, 100).mac();
        let payload = [0x0B, 1, 2, 3];

        let mut buf = [0; MAX_FRAME_LEN];
        let len = Frame::emit(&dst, &src, &payload, &mut buf).unwrap();
        assert_eq!(len, MIN_FRAME_LEN);

        let frame = Frame::parse(&buf[..len]).unwrap();
        assert_eq!(frame.dst, dst);
        assert_eq!(frame.src, src);
        assert_eq!(frame.payload, &payload);
    }

    #[test]
    fn long_payload_not_padded() {
        let dst = NodeAddr::new(1, 2).mac();
        let src = NodeAddr::new(1, 3).mac();
        let payload = [0xAA; 200];

        let mut buf = [0; MAX_FRAME_LEN];
        let len = Frame::emit(&dst, &src, &payload, &mut buf).unwrap();
        assert_eq!(len, HEADER_LEN + 200);
    }

    #[test]
    fn stated_length_beyond_capture_rejected() {
        let mut buf = [0; MAX_FRAME_LEN];
        let len = Frame::emit(
            &NodeAddr::new(1, 2).mac(),
            &NodeAddr::new(1, 3).mac(),
            &[1, 2, 3],
            &mut buf,
        )
        .unwrap();

        // Claim more payload than the frame carries.
        buf[14] = 0xFF;
        buf[15] = 0x01;
        assert_eq!(Frame::parse(&buf[..len]).err(), Some(Error::DataUnderflow));
    }

    #[test]
    fn wrong_ethertype_rejected() {
        let mut raw = [0u8; 60];
        raw[12] = 0x08;
        raw[13] = 0x00;
        assert_eq!(ethertype(&raw), Some(0x0800));
        assert_eq!(Frame::parse(&raw).err(), Some(Error::InvalidFormat));
    }
}
