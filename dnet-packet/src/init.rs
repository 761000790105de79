//! Point-to-point initialization traffic: the Phase IV initialization,
//! verification and hello-and-test messages, plus the Phase II node-init
//! answered for backward compatibility.

use heapless::String;

use crate::addr::NodeAddr;
use crate::wire::{Reader, Writer};
use crate::Error;

pub const INIT_FLAGS: u8 = 0x01;
pub const VERIFICATION_FLAGS: u8 = 0x03;
pub const HELLO_AND_TEST_FLAGS: u8 = 0x05;

/// Blocksize advertised in initialization messages.
pub const INIT_BLOCK_SIZE: u16 = 576;

/// Fill value of hello-and-test test data.
const TEST_DATA_FILL: u8 = 0xAA;

const MAX_FCNVAL_LEN: usize = 64;
const MAX_TEST_DATA_LEN: usize = 128;

pub struct Initialization {
    pub srcnode: NodeAddr,
    pub tiinfo: u8,
    pub blksize: u16,
    pub tiver: [u8; 3],
    pub timer: u16,
}

impl Initialization {
    /// Parses an initialization message; the trailing reserved image
    /// field must be empty.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(payload);

        if reader.byte()? != INIT_FLAGS {
            return Err(Error::InvalidFormat);
        }

        let srcnode = NodeAddr::from_id_bytes(reader.arr::<2>()?);
        let tiinfo = reader.byte()?;
        let blksize = reader.u16_le()?;
        let tiver = reader.arr::<3>()?;
        let timer = reader.u16_le()?;

        if reader.byte()? != 0 {
            return Err(Error::InvalidFormat);
        }

        Ok(Self {
            srcnode,
            tiinfo,
            blksize,
            tiver,
            timer,
        })
    }

    /// Emits this node's initialization, always requesting verification.
    pub fn emit(id: NodeAddr, level2: bool, timer: u16, buf: &mut [u8]) -> Result<usize, Error> {
        let mut writer = Writer::new(buf);

        writer.byte(INIT_FLAGS)?;
        writer.slice(&id.id_bytes())?;
        writer.byte(0x04 | if level2 { 1 } else { 2 })?;
        writer.u16_le(INIT_BLOCK_SIZE)?;
        writer.slice(&[2, 0, 0])?;
        writer.u16_le(timer)?;
        writer.byte(0)?;

        Ok(writer.len())
    }
}

pub struct Verification {
    pub srcnode: NodeAddr,
}

impl Verification {
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(payload);

        if reader.byte()? != VERIFICATION_FLAGS {
            return Err(Error::InvalidFormat);
        }

        let srcnode = NodeAddr::from_id_bytes(reader.arr::<2>()?);

        let fcnval_len = reader.byte()? as usize;
        if fcnval_len > MAX_FCNVAL_LEN || fcnval_len > reader.remaining() {
            return Err(Error::InvalidFormat);
        }

        Ok(Self { srcnode })
    }

    /// Emits a verification with an empty function value; there is no
    /// secret to carry.
    pub fn emit(id: NodeAddr, buf: &mut [u8]) -> Result<usize, Error> {
        let mut writer = Writer::new(buf);

        writer.byte(VERIFICATION_FLAGS)?;
        writer.slice(&id.id_bytes())?;
        writer.byte(0)?;

        Ok(writer.len())
    }
}

pub struct HelloAndTest {
    pub srcnode: NodeAddr,
}

impl HelloAndTest {
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(payload);

        if reader.byte()? != HELLO_AND_TEST_FLAGS {
            return Err(Error::InvalidFormat);
        }

        let srcnode = NodeAddr::from_id_bytes(reader.arr::<2>()?);

        let data_len = reader.byte()? as usize;
        if data_len > MAX_TEST_DATA_LEN {
            return Err(Error::InvalidFormat);
        }

        let data = reader.slice(data_len)?;
        if data.iter().any(|&b| b != TEST_DATA_FILL) {
            return Err(Error::InvalidFormat);
        }

        Ok(Self { srcnode })
    }

    pub fn emit(id: NodeAddr, buf: &mut [u8]) -> Result<usize, Error> {
        let mut writer = Writer::new(buf);

        writer.byte(HELLO_AND_TEST_FLAGS)?;
        writer.slice(&id.id_bytes())?;
        writer.byte(0)?;

        Ok(writer.len())
    }
}

/// Phase II node initialization. Recognized and answered so Phase II
/// neighbors see a configured node; Phase II routing itself is not
/// implemented.
pub struct NodeInitPhase2 {
    pub nodeaddr: u8,
    pub nodename: String<6>,
    pub functions: u8,
    pub requests: u8,
    pub blksize: u16,
    pub nspsize: u16,
    pub maxlnks: u16,
    pub routver: [u8; 3],
    pub commver: [u8; 3],
    pub sysver: String<32>,
}

impl NodeInitPhase2 {
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(payload);

        if reader.byte()? != crate::PHASE2_MSGFLG {
            return Err(Error::InvalidFormat);
        }
        if reader.byte()? != 1 {
            return Err(Error::InvalidFormat);
        }

        let nodeaddr = reader.byte()?;

        let nodename_len = reader.byte()? as usize;
        if nodename_len > 6 {
            return Err(Error::InvalidFormat);
        }
        let nodename = str_field::<6>(reader.slice(nodename_len)?)?;

        let functions = reader.byte()?;
        let requests = reader.byte()?;
        let blksize = reader.u16_le()?;
        let nspsize = reader.u16_le()?;
        let maxlnks = reader.u16_le()?;
        let routver = reader.arr::<3>()?;
        let commver = reader.arr::<3>()?;

        let sysver_len = reader.byte()? as usize;
        if sysver_len > 32 {
            return Err(Error::InvalidFormat);
        }
        let sysver = str_field::<32>(reader.slice(sysver_len)?)?;

        if !(3..=240).contains(&nodeaddr)
            || (functions != 0 && functions != 7)
            || requests & 0xF8 != 0
            || nspsize > blksize
            || maxlnks > 4095
        {
            return Err(Error::InvalidFormat);
        }

        Ok(Self {
            nodeaddr,
            nodename,
            functions,
            requests,
            blksize,
            nspsize,
            maxlnks,
            routver,
            commver,
            sysver,
        })
    }

    /// Emits this node's own node-init answer. Fails when the node
    /// number falls outside the Phase II range.
    pub fn emit(id: NodeAddr, name: &str, buf: &mut [u8]) -> Result<usize, Error> {
        if !(2..241).contains(&id.node) {
            return Err(Error::InvalidFormat);
        }

        let sysver = "dnet DECnet router";

        let mut writer = Writer::new(buf);

        writer.byte(crate::PHASE2_MSGFLG)?;
        writer.byte(1)?;
        writer.byte(id.node as u8)?;
        writer.byte(name.len() as u8)?;
        writer.slice(name.as_bytes())?;
        writer.byte(0x07)?;
        writer.byte(0)?;
        writer.u16_le(4096)?;
        writer.u16_le(256)?;
        writer.u16_le(4095)?;
        writer.slice(&[3, 0, 0])?;
        writer.slice(&[3, 0, 0])?;
        writer.byte(sysver.len() as u8)?;
        writer.slice(sysver.as_bytes())?;

        Ok(writer.len())
    }
}

fn str_field<const N: usize>(bytes: &[u8]) -> Result<String<N>, Error> {
    let text = core::str::from_utf8(bytes).map_err(|_| Error::InvalidFormat)?;

    let mut out = String::new();
    out.push_str(text).map_err(|_| Error::InvalidFormat)?;

    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn initialization_round_trip() {
        let mut buf = [0; 32];
        let len = Initialization::emit(NodeAddr::new(1, 100), true, 15, &mut buf).unwrap();
        assert_eq!(len, 12);

        let msg = Initialization::parse(&buf[..len]).unwrap();
        assert_eq!(msg.srcnode, NodeAddr::new(1, 100));
        assert_eq!(msg.blksize, INIT_BLOCK_SIZE);
        assert_eq!(msg.tiver, [2, 0, 0]);
        assert_eq!(msg.timer, 15);
        assert!(crate::hello::verification_required(msg.tiinfo));
        assert_eq!(
            crate::hello::PeerLevel::from_iinfo(msg.tiinfo),
            Some(crate::hello::PeerLevel::Level2Router)
        );
    }

    #[test]
    fn nonzero_reserved_rejected() {
        let mut buf = [0; 32];
        let len = Initialization::emit(NodeAddr::new(1, 100), true, 15, &mut buf).unwrap();
        buf[len - 1] = 1;
        assert_eq!(
            Initialization::parse(&buf[..len]).err(),
            Some(Error::InvalidFormat)
        );
    }

    #[test]
    fn verification_round_trip() {
        let mut buf = [0; 8];
        let len = Verification::emit(NodeAddr::new(2, 5), &mut buf).unwrap();
        let msg = Verification::parse(&buf[..len]).unwrap();
        assert_eq!(msg.srcnode, NodeAddr::new(2, 5));
    }

    #[test]
    fn hello_and_test_round_trip() {
        let mut buf = [0; 8];
        let len = HelloAndTest::emit(NodeAddr::new(1, 100), &mut buf).unwrap();
        let msg = HelloAndTest::parse(&buf[..len]).unwrap();
        assert_eq!(msg.srcnode, NodeAddr::new(1, 100));
    }

    #[test]
    fn hello_and_test_bad_fill_rejected() {
        // data length 2 but one byte is not the 0xAA fill
        let payload = [HELLO_AND_TEST_FLAGS, 0x64, 0x04, 2, 0xAA, 0x55];
        assert_eq!(
            HelloAndTest::parse(&payload).err(),
            Some(Error::InvalidFormat)
        );
    }

    #[test]
    fn phase2_node_init_round_trip() {
        let mut buf = [0; 80];
        let len = NodeInitPhase2::emit(NodeAddr::new(1, 100), "RTR", &mut buf).unwrap();

        let msg = NodeInitPhase2::parse(&buf[..len]).unwrap();
        assert_eq!(msg.nodeaddr, 100);
        assert_eq!(msg.nodename.as_str(), "RTR");
        assert_eq!(msg.functions, 7);
        assert_eq!(msg.blksize, 4096);
        assert_eq!(msg.maxlnks, 4095);
        assert_eq!(msg.routver, [3, 0, 0]);
    }

    #[test]
    fn phase2_out_of_range_node() {
        let mut buf = [0; 80];
        assert!(NodeInitPhase2::emit(NodeAddr::new(1, 1), "RTR", &mut buf).is_err());
        assert!(NodeInitPhase2::emit(NodeAddr::new(1, 300), "RTR", &mut buf).is_err());
    }
}
