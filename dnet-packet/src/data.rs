//! Short- and long-format data packets.
//!
//! Received packets arrive in either format; everything this router
//! forwards leaves in long format with the station-address fields
//! carrying the `AA-00-04-00` prefix.

use crate::addr::{NodeAddr, DECNET_MAC_PREFIX};
use crate::wire::{Reader, Writer};
use crate::Error;
use crate::{FLAGS_LONG_DATA, FLAG_INTRA_ETHERNET, FLAG_RTS, FLAG_RTS_REQUEST};

pub const SHORT_HEADER_LEN: usize = 6;
pub const LONG_HEADER_LEN: usize = 21;

#[derive(Copy, Clone, Debug)]
pub struct DataHeader {
    pub flags: u8,
    pub src: NodeAddr,
    pub dst: NodeAddr,
    pub visits: u8,
}

pub const fn is_return_to_sender(flags: u8) -> bool {
    flags & FLAG_RTS != 0
}

pub const fn is_return_to_sender_request(flags: u8) -> bool {
    flags & FLAG_RTS_REQUEST != 0
}

pub const fn set_intra_ethernet(flags: u8) -> u8 {
    flags | FLAG_INTRA_ETHERNET
}

pub const fn clear_intra_ethernet(flags: u8) -> u8 {
    flags & !FLAG_INTRA_ETHERNET
}

impl DataHeader {
    /// Parses and validates either data format, returning the header and
    /// the transport payload.
    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8]), Error> {
        let flags = *payload.first().ok_or(Error::DataUnderflow)?;

        match flags & 0x07 {
            crate::FLAGS_SHORT_DATA => Self::parse_short(payload),
            crate::FLAGS_LONG_DATA => Self::parse_long(payload),
            _ => Err(Error::InvalidFormat),
        }
    }

    fn parse_short(payload: &[u8]) -> Result<(Self, &[u8]), Error> {
        let mut reader = Reader::new(payload);

        let flags = reader.byte()?;
        if flags & 0x60 != 0 {
            return Err(Error::InvalidFormat);
        }

        let dst = NodeAddr::from_id_bytes(reader.arr::<2>()?);
        let src = NodeAddr::from_id_bytes(reader.arr::<2>()?);

        let forward = reader.byte()?;
        if forward & 0xC0 != 0 {
            return Err(Error::InvalidFormat);
        }

        Ok((
            Self {
                flags,
                src,
                dst,
                visits: forward & 0x3F,
            },
            reader.rest(),
        ))
    }

    fn parse_long(payload: &[u8]) -> Result<(Self, &[u8]), Error> {
        let mut reader = Reader::new(payload);

        let flags = reader.byte()?;
        if flags & 0x40 != 0 {
            return Err(Error::InvalidFormat);
        }

        let d_area = reader.byte()?;
        let d_subarea = reader.byte()?;
        let d_id = reader.arr::<6>()?;
        let s_area = reader.byte()?;
        let s_subarea = reader.byte()?;
        let s_id = reader.arr::<6>()?;
        let nl2 = reader.byte()?;
        let visits = reader.byte()?;
        let s_class = reader.byte()?;
        let pt = reader.byte()?;

        if d_area != 0
            || d_subarea != 0
            || s_area != 0
            || s_subarea != 0
            || nl2 != 0
            || s_class != 0
            || pt != 0
            || d_id[..4] != DECNET_MAC_PREFIX
            || s_id[..4] != DECNET_MAC_PREFIX
        {
            return Err(Error::InvalidFormat);
        }

        Ok((
            Self {
                flags,
                src: NodeAddr::from_id_bytes([s_id[4], s_id[5]]),
                dst: NodeAddr::from_id_bytes([d_id[4], d_id[5]]),
                visits,
            },
            reader.rest(),
        ))
    }

    /// Emits a long-format data packet around `body`.
    pub fn emit_long(
        src: NodeAddr,
        dst: NodeAddr,
        flags: u8,
        visits: u8,
        body: &[u8],
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let mut writer = Writer::new(buf);

        writer.byte(flags & !0x07 | FLAGS_LONG_DATA)?;
        writer.byte(0)?;
        writer.byte(0)?;
        writer.slice(&dst.mac())?;
        writer.byte(0)?;
        writer.byte(0)?;
        writer.slice(&src.mac())?;
        writer.byte(0)?;
        writer.byte(visits)?;
        writer.byte(0)?;
        writer.byte(0)?;
        writer.slice(body)?;

        Ok(writer.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn long_data_round_trip() {
        let body = [1, 2, 3, 4, 5];

        let mut buf = [0; 64];
        let len = DataHeader::emit_long(
            NodeAddr::new(2, 10),
            NodeAddr::new(3, 20),
            0x0E,
            6,
            &body,
            &mut buf,
        )
        .unwrap();
        assert_eq!(len, LONG_HEADER_LEN + body.len());

        let (header, parsed_body) = DataHeader::parse(&buf[..len]).unwrap();
        assert_eq!(header.src, NodeAddr::new(2, 10));
        assert_eq!(header.dst, NodeAddr::new(3, 20));
        assert_eq!(header.visits, 6);
        assert!(is_return_to_sender_request(header.flags));
        assert!(!is_return_to_sender(header.flags));
        assert_eq!(parsed_body, &body);
    }

    #[test]
    fn short_data_parse() {
        let dst = NodeAddr::new(3, 20).id_bytes();
        let src = NodeAddr::new(2, 10).id_bytes();
        let payload = [0x02, dst[0], dst[1], src[0], src[1], 5, 0xDE, 0xAD];

        let (header, body) = DataHeader::parse(&payload).unwrap();
        assert_eq!(header.src, NodeAddr::new(2, 10));
        assert_eq!(header.dst, NodeAddr::new(3, 20));
        assert_eq!(header.visits, 5);
        assert_eq!(body, &[0xDE, 0xAD]);
    }

    #[test]
    fn short_data_reserved_bits_rejected() {
        let payload = [0x22, 0, 0, 0, 0, 0];
        assert_eq!(DataHeader::parse(&payload).err(), Some(Error::InvalidFormat));

        let payload = [0x02, 0, 0, 0, 0, 0x40];
        assert_eq!(DataHeader::parse(&payload).err(), Some(Error::InvalidFormat));
    }

    #[test]
    fn long_data_without_prefix_rejected() {
        let mut buf = [0; 64];
        let len = DataHeader::emit_long(
            NodeAddr::new(2, 10),
            NodeAddr::new(3, 20),
            0x0E,
            1,
            &[],
            &mut buf,
        )
        .unwrap();

        buf[3] = 0xAB;
        assert_eq!(
            DataHeader::parse(&buf[..len]).err(),
            Some(Error::InvalidFormat)
        );
    }

    #[test]
    fn intra_ethernet_flag_helpers() {
        let flags = set_intra_ethernet(0x0E);
        assert_eq!(flags, 0x2E);
        assert_eq!(clear_intra_ethernet(flags), 0x0E);
    }
}
