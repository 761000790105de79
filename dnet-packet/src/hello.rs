//! Ethernet hello messages: the periodic router hello with its RS-LIST
//! of heard routers, and the endnode hello this router only receives.

use crate::addr::{MacAddr, NodeAddr};
use crate::wire::{Reader, Writer};
use crate::Error;

pub const ROUTER_HELLO_FLAGS: u8 = 0x0B;
pub const ENDNODE_HELLO_FLAGS: u8 = 0x0D;

/// Blocksize advertised in router hellos.
pub const ETHERNET_BLOCK_SIZE: u16 = 1498;

const RSLIST_ENTRY_LEN: usize = 7;

/// What the TI-info byte of a hello says its sender is.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PeerLevel {
    Level2Router,
    Level1Router,
    Endnode,
}

impl PeerLevel {
    /// Decodes the low two bits of TI-info. The wire values are
    /// swapped relative to the router level: 1 means L2, 2 means L1.
    pub fn from_iinfo(iinfo: u8) -> Option<Self> {
        match iinfo & 0x03 {
            1 => Some(Self::Level2Router),
            2 => Some(Self::Level1Router),
            3 => Some(Self::Endnode),
            _ => None,
        }
    }
}

/// Whether a received initialization requests verification.
pub fn verification_required(iinfo: u8) -> bool {
    iinfo & 0x04 != 0
}

/// One RS-LIST entry: a router the hello's sender currently hears.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RsEntry {
    pub router: NodeAddr,
    pub priority: u8,
    pub up: bool,
}

#[derive(Copy, Clone)]
pub struct RsList<'a>(&'a [u8]);

impl<'a> RsList<'a> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len() / RSLIST_ENTRY_LEN
    }

    pub fn iter(&self) -> impl Iterator<Item = RsEntry> + 'a {
        self.0.chunks_exact(RSLIST_ENTRY_LEN).map(|chunk| {
            let priority_state = chunk[6];

            RsEntry {
                router: NodeAddr::from_id_bytes([chunk[4], chunk[5]]),
                priority: priority_state & 0x7F,
                up: priority_state & 0x80 != 0,
            }
        })
    }

    /// True when `addr` appears in the list; this is how a router learns
    /// its neighbor hears it back.
    pub fn contains(&self, addr: NodeAddr) -> bool {
        self.iter().any(|entry| entry.router == addr)
    }
}

#[derive(Clone)]
pub struct RouterHello<'a> {
    pub tiver: [u8; 3],
    pub id: NodeAddr,
    pub iinfo: u8,
    pub blksize: u16,
    pub priority: u8,
    pub timer: u16,
    pub rslist: RsList<'a>,
}

impl<'a> RouterHello<'a> {
    /// Parses and structurally validates a router hello: the E-LIST must
    /// hold at least its 8 fixed bytes, and the RS-LIST must be a whole
    /// number of 7-byte entries consistent with the E-LIST length.
    pub fn parse(payload: &'a [u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(payload);

        let flags = reader.byte()?;
        if flags != ROUTER_HELLO_FLAGS {
            return Err(Error::InvalidFormat);
        }

        let tiver = reader.arr::<3>()?;
        let id_mac = reader.arr::<6>()?;
        let iinfo = reader.byte()?;
        let blksize = reader.u16_le()?;
        let priority = reader.byte()?;
        let _area = reader.byte()?;
        let timer = reader.u16_le()?;
        let _mpd = reader.byte()?;
        let elist_len = reader.byte()? as usize;

        if elist_len < 8 {
            return Err(Error::InvalidFormat);
        }

        let elist = reader.slice(elist_len)?;
        let rslist_len = elist[7] as usize;

        if rslist_len % RSLIST_ENTRY_LEN != 0 || elist_len != rslist_len + 8 {
            return Err(Error::InvalidFormat);
        }

        Ok(Self {
            tiver,
            id: NodeAddr::from_id_bytes([id_mac[4], id_mac[5]]),
            iinfo,
            blksize,
            priority,
            timer,
            rslist: RsList(&elist[8..]),
        })
    }

    pub fn level(&self) -> Option<PeerLevel> {
        PeerLevel::from_iinfo(self.iinfo)
    }

    /// Emits a router hello. `level2` selects the TI-info router kind;
    /// `rslist` enumerates the broadcast router adjacencies to include.
    pub fn emit(
        id: NodeAddr,
        level2: bool,
        priority: u8,
        timer: u16,
        rslist: impl Iterator<Item = RsEntry>,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let mut writer = Writer::new(buf);

        writer.byte(ROUTER_HELLO_FLAGS)?;
        writer.slice(&[2, 0, 0])?;
        writer.slice(&id.mac())?;
        writer.byte(if level2 { 1 } else { 2 })?;
        writer.u16_le(ETHERNET_BLOCK_SIZE)?;
        writer.byte(priority)?;
        writer.byte(0)?;
        writer.u16_le(timer)?;
        writer.byte(0)?;

        // E-LIST length and RS-LIST length are filled in once the list
        // has been walked.
        let elist_len_at = writer.len();
        writer.byte(0)?;
        writer.zeroes(7)?;
        let rslist_len_at = writer.len();
        writer.byte(0)?;

        let mut count = 0;
        for entry in rslist {
            writer.slice(&entry.router.mac())?;
            writer.byte(entry.priority | if entry.up { 0x80 } else { 0 })?;
            count += 1;
        }

        let rslist_len = count * RSLIST_ENTRY_LEN;
        let len = writer.len();

        buf[elist_len_at] = (rslist_len + 8) as u8;
        buf[rslist_len_at] = rslist_len as u8;

        Ok(len)
    }
}

pub struct EndnodeHello {
    pub tiver: [u8; 3],
    pub id: NodeAddr,
    pub iinfo: u8,
    pub blksize: u16,
    pub timer: u16,
}

impl EndnodeHello {
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(payload);

        let flags = reader.byte()?;
        if flags != ENDNODE_HELLO_FLAGS {
            return Err(Error::InvalidFormat);
        }

        let tiver = reader.arr::<3>()?;
        let id_mac = reader.arr::<6>()?;
        let iinfo = reader.byte()?;
        let blksize = reader.u16_le()?;
        let _area = reader.byte()?;
        let _seed = reader.slice(8)?;
        let _neighbor = reader.arr::<6>()?;
        let timer = reader.u16_le()?;
        let _mpd = reader.byte()?;
        let data_len = reader.byte()? as usize;

        if data_len > reader.remaining() {
            return Err(Error::DataUnderflow);
        }

        Ok(Self {
            tiver,
            id: NodeAddr::from_id_bytes([id_mac[4], id_mac[5]]),
            iinfo,
            blksize,
            timer,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn router_hello_round_trip() {
        let rslist = [
            RsEntry {
                router: NodeAddr::new(1, 200),
                priority: 64,
                up: true,
            },
            RsEntry {
                router: NodeAddr::new(1, 201),
                priority: 32,
                up: false,
            },
        ];

        let mut buf = [0; 256];
        let len = RouterHello::emit(
            NodeAddr::new(1, 100),
            true,
            64,
            15,
            rslist.iter().copied(),
            &mut buf,
        )
        .unwrap();

        let hello = RouterHello::parse(&buf[..len]).unwrap();
        assert_eq!(hello.id, NodeAddr::new(1, 100));
        assert_eq!(hello.level(), Some(PeerLevel::Level2Router));
        assert_eq!(hello.blksize, ETHERNET_BLOCK_SIZE);
        assert_eq!(hello.priority, 64);
        assert_eq!(hello.timer, 15);
        assert_eq!(hello.tiver, [2, 0, 0]);

        let entries: heapless::Vec<RsEntry, 4> = hello.rslist.iter().collect();
        assert_eq!(&entries[..], &rslist[..]);
        assert!(hello.rslist.contains(NodeAddr::new(1, 200)));
        assert!(!hello.rslist.contains(NodeAddr::new(1, 100)));
    }

    #[test]
    fn empty_rslist() {
        let mut buf = [0; 64];
        let len = RouterHello::emit(
            NodeAddr::new(2, 1),
            false,
            0,
            15,
            core::iter::empty(),
            &mut buf,
        )
        .unwrap();
        assert_eq!(len, 27);

        let hello = RouterHello::parse(&buf[..len]).unwrap();
        assert_eq!(hello.level(), Some(PeerLevel::Level1Router));
        assert!(hello.rslist.is_empty());
    }

    #[test]
    fn inconsistent_elist_rejected() {
        let mut buf = [0; 64];
        let len = RouterHello::emit(
            NodeAddr::new(2, 1),
            false,
            0,
            15,
            core::iter::empty(),
            &mut buf,
        )
        .unwrap();

        // RS-LIST length not a multiple of 7.
        buf[26] = 3;
        assert_eq!(
            RouterHello::parse(&buf[..len]).err(),
            Some(Error::InvalidFormat)
        );
    }

    #[test]
    fn endnode_hello_parse() {
        let mut buf = [0u8; 40];
        let mut writer = Writer::new(&mut buf);
        writer.byte(ENDNODE_HELLO_FLAGS).unwrap();
        writer.slice(&[2, 0, 0]).unwrap();
        writer.slice(&NodeAddr::new(1, 42).mac()).unwrap();
        writer.byte(3).unwrap();
        writer.u16_le(1498).unwrap();
        writer.byte(0).unwrap();
        writer.zeroes(8).unwrap();
        writer.slice(&NodeAddr::new(1, 100).mac()).unwrap();
        writer.u16_le(60).unwrap();
        writer.byte(0).unwrap();
        writer.byte(0).unwrap();
        let len = writer.len();

        let hello = EndnodeHello::parse(&buf[..len]).unwrap();
        assert_eq!(hello.id, NodeAddr::new(1, 42));
        assert_eq!(PeerLevel::from_iinfo(hello.iinfo), Some(PeerLevel::Endnode));
        assert_eq!(hello.timer, 60);
    }

    #[test]
    fn truncated_hello_rejected() {
        let buf = [ROUTER_HELLO_FLAGS; 10];
        assert_eq!(RouterHello::parse(&buf).err(), Some(Error::DataUnderflow));
    }
}
