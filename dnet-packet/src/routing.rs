//! Level 1 and level 2 routing update messages.
//!
//! An update carries one or more segments, each a contiguous run of
//! destinations with packed (hops, cost) entries, and ends with a 16-bit
//! checksum over every segment word. The checksum is a ones-complement
//! sum with end-around carry, seeded with 1.

use crate::addr::NodeAddr;
use crate::wire::{Reader, Writer};
use crate::Error;

pub const LEVEL1_ROUTING_FLAGS: u8 = 0x07;
pub const LEVEL2_ROUTING_FLAGS: u8 = 0x09;

const SEGMENT_OFFSET: usize = 4;

/// Hops and cost packed as `hops << 10 | cost`.
pub const fn pack_entry(hops: u16, cost: u16) -> u16 {
    (hops << 10) | (cost & 0x3FF)
}

pub const fn unpack_entry(packed: u16) -> (u16, u16) {
    (packed >> 10, packed & 0x3FF)
}

/// Ones-complement sum with end-around carry over little-endian 16-bit
/// words, seeded with 1.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = 1u32;

    for word in data.chunks_exact(2) {
        sum += u16::from_le_bytes([word[0], word[1]]) as u32;
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum as u16
}

#[derive(Clone)]
pub struct RoutingMessage<'a> {
    pub level2: bool,
    pub srcnode: NodeAddr,
    segments: &'a [u8],
}

impl<'a> RoutingMessage<'a> {
    /// Parses a routing message, walking the segment chain and checking
    /// the trailing checksum. `max_id` bounds `start + count` (the node
    /// or area number space); a segment past it discards the message.
    pub fn parse(payload: &'a [u8], max_id: u16) -> Result<Self, Error> {
        let mut reader = Reader::new(payload);

        let level2 = match reader.byte()? {
            LEVEL1_ROUTING_FLAGS => false,
            LEVEL2_ROUTING_FLAGS => true,
            _ => return Err(Error::InvalidFormat),
        };

        let srcnode = NodeAddr::from_id_bytes(reader.arr::<2>()?);
        let _res = reader.byte()?;

        // Segments run until exactly the two checksum bytes remain.
        let segments_at = reader.offset();
        while reader.remaining() > 2 {
            let count = reader.u16_le()?;
            let start = reader.u16_le()?;

            if count == 0 || start as u32 + count as u32 > max_id as u32 + 1 {
                return Err(Error::InvalidFormat);
            }

            reader.slice(count as usize * 2)?;
        }

        let segments = &payload[segments_at..reader.offset()];
        let actual = reader.u16_le()?;

        if checksum(segments) != actual {
            return Err(Error::InvalidChecksum);
        }

        Ok(Self {
            level2,
            srcnode,
            segments,
        })
    }

    pub fn segments(&self) -> impl Iterator<Item = Segment<'a>> + '_ {
        SegmentIter {
            reader: Reader::new(self.segments),
        }
    }

    /// Emits a single-segment level 1 update covering `count` packed
    /// entries starting at destination `start`.
    pub fn emit_level1(
        srcnode: NodeAddr,
        start: u16,
        entries: impl ExactSizeIterator<Item = u16>,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        Self::emit(LEVEL1_ROUTING_FLAGS, srcnode, start, entries, buf)
    }

    /// Emits the level 2 update covering areas 1 onward.
    pub fn emit_level2(
        srcnode: NodeAddr,
        entries: impl ExactSizeIterator<Item = u16>,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        Self::emit(LEVEL2_ROUTING_FLAGS, srcnode, 1, entries, buf)
    }

    fn emit(
        flags: u8,
        srcnode: NodeAddr,
        start: u16,
        entries: impl ExactSizeIterator<Item = u16>,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let mut writer = Writer::new(buf);

        writer.byte(flags)?;
        writer.slice(&srcnode.id_bytes())?;
        writer.byte(0)?;

        writer.u16_le(entries.len() as u16)?;
        writer.u16_le(start)?;
        for entry in entries {
            writer.u16_le(entry)?;
        }

        let len = writer.len();
        let sum = checksum(&buf[SEGMENT_OFFSET..len]);

        Writer::new(&mut buf[len..]).u16_le(sum)?;

        Ok(len + 2)
    }
}

pub struct Segment<'a> {
    pub start: u16,
    entries: &'a [u8],
}

impl<'a> Segment<'a> {
    /// Yields `(destination, hops, cost)` for each entry.
    pub fn entries(&self) -> impl Iterator<Item = (u16, u16, u16)> + 'a {
        let start = self.start;

        self.entries
            .chunks_exact(2)
            .enumerate()
            .map(move |(i, word)| {
                let (hops, cost) = unpack_entry(u16::from_le_bytes([word[0], word[1]]));
                (start + i as u16, hops, cost)
            })
    }
}

struct SegmentIter<'a> {
    reader: Reader<'a>,
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.is_empty() {
            return None;
        }

        // Bounds were validated in parse.
        let count = self.reader.u16_le().ok()?;
        let start = self.reader.u16_le().ok()?;
        let entries = self.reader.slice(count as usize * 2).ok()?;

        Some(Segment { start, entries })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn checksum_seed_and_carry() {
        // Sum without carry: 1 + 0x0001 + 0x0002 = 4.
        assert_eq!(checksum(&[1, 0, 2, 0]), 4);

        // 1 + 0xFFFF wraps with end-around carry to 1.
        assert_eq!(checksum(&[0xFF, 0xFF]), 1);
    }

    #[test]
    fn level1_round_trip() {
        let entries = [pack_entry(1, 3), pack_entry(31, 1023), pack_entry(0, 0)];

        let mut buf = [0; 64];
        let len =
            RoutingMessage::emit_level1(NodeAddr::new(1, 100), 64, entries.iter().copied(), &mut buf)
                .unwrap();

        let msg = RoutingMessage::parse(&buf[..len], 1023).unwrap();
        assert!(!msg.level2);
        assert_eq!(msg.srcnode, NodeAddr::new(1, 100));

        let segment = msg.segments().next().unwrap();
        assert_eq!(segment.start, 64);

        let got: heapless::Vec<(u16, u16, u16), 4> = segment.entries().collect();
        assert_eq!(&got[..], &[(64, 1, 3), (65, 31, 1023), (66, 0, 0)]);
    }

    #[test]
    fn level2_round_trip() {
        let entries: heapless::Vec<u16, 63> = (1..=63).map(|_| pack_entry(31, 1023)).collect();

        let mut buf = [0; 256];
        let len =
            RoutingMessage::emit_level2(NodeAddr::new(1, 100), entries.iter().copied(), &mut buf)
                .unwrap();

        let msg = RoutingMessage::parse(&buf[..len], 63).unwrap();
        assert!(msg.level2);

        let segment = msg.segments().next().unwrap();
        assert_eq!(segment.start, 1);
        assert_eq!(segment.entries().count(), 63);
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let entries = [pack_entry(2, 10)];

        let mut buf = [0; 32];
        let len =
            RoutingMessage::emit_level1(NodeAddr::new(1, 50), 0, entries.iter().copied(), &mut buf)
                .unwrap();

        buf[6] ^= 0x01;
        assert_eq!(
            RoutingMessage::parse(&buf[..len], 1023).err(),
            Some(Error::InvalidChecksum)
        );
    }

    #[test]
    fn segment_past_node_space_rejected() {
        let entries = [pack_entry(2, 10)];

        let mut buf = [0; 32];
        let len = RoutingMessage::emit_level1(
            NodeAddr::new(1, 50),
            1023,
            entries.iter().copied(),
            &mut buf,
        )
        .unwrap();

        // start 1023 count 1 is the last valid entry for max_id 1023 but
        // exceeds the area space.
        assert!(RoutingMessage::parse(&buf[..len], 1023).is_ok());
        assert_eq!(
            RoutingMessage::parse(&buf[..len], 63).err(),
            Some(Error::InvalidFormat)
        );
    }

    #[test]
    fn multi_segment_message() {
        // Hand-build two segments then append the checksum.
        let mut buf = [0u8; 64];
        let mut writer = Writer::new(&mut buf);
        writer.byte(LEVEL1_ROUTING_FLAGS).unwrap();
        writer.slice(&NodeAddr::new(1, 7).id_bytes()).unwrap();
        writer.byte(0).unwrap();
        writer.u16_le(1).unwrap();
        writer.u16_le(10).unwrap();
        writer.u16_le(pack_entry(1, 4)).unwrap();
        writer.u16_le(2).unwrap();
        writer.u16_le(20).unwrap();
        writer.u16_le(pack_entry(2, 8)).unwrap();
        writer.u16_le(pack_entry(3, 9)).unwrap();
        let len = writer.len();
        let sum = checksum(&buf[4..len]);
        Writer::new(&mut buf[len..]).u16_le(sum).unwrap();

        let msg = RoutingMessage::parse(&buf[..len + 2], 1023).unwrap();
        let mut segments = msg.segments();

        let first = segments.next().unwrap();
        assert_eq!(first.start, 10);
        assert_eq!(first.entries().count(), 1);

        let second = segments.next().unwrap();
        assert_eq!(second.start, 20);
        assert_eq!(second.entries().count(), 2);

        assert!(segments.next().is_none());
    }
}
