#![cfg_attr(not(feature = "std"), no_std)]

use num_enum::TryFromPrimitive;

pub mod addr;
pub mod data;
pub mod frame;
pub mod hello;
pub mod init;
pub mod routing;
pub mod wire;

pub use addr::{DecnetAddr, MacAddr, NodeAddr};

/// Codec errors. `Io` never originates here; the variants describe what a
/// buffer failed to be.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Error {
    DataUnderflow,
    BufferOverflow,
    InvalidFormat,
    InvalidChecksum,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::DataUnderflow => write!(f, "Data underflow"),
            Self::BufferOverflow => write!(f, "Buffer overflow"),
            Self::InvalidFormat => write!(f, "Invalid format"),
            Self::InvalidChecksum => write!(f, "Invalid checksum"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// First byte of every Phase II node-init message.
pub const PHASE2_MSGFLG: u8 = 0x58;

/// Message-flag bits shared by the data-packet formats.
pub const FLAGS_LONG_DATA: u8 = 0x06;
pub const FLAGS_SHORT_DATA: u8 = 0x02;
pub const FLAG_RTS: u8 = 0x10;
pub const FLAG_RTS_REQUEST: u8 = 0x08;
pub const FLAG_INTRA_ETHERNET: u8 = 0x20;

/// Control-message subtype, from bits 1..3 of the message flags.
#[derive(Copy, Clone, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum ControlType {
    Initialization = 0,
    Verification = 1,
    HelloAndTest = 2,
    Level1Routing = 3,
    Level2Routing = 4,
    RouterHello = 5,
    EndnodeHello = 6,
}

/// Category of a DECnet routing-layer payload, decided by its first byte.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MsgKind {
    Control(ControlType),
    ShortData,
    LongData,
    /// Bit 6 set: a data format from a future version. Ignored.
    FutureVersion,
    /// Phase II node-init traffic, recognized for backward compatibility.
    Phase2,
    Unknown,
}

/// Classifies a payload that has already had any padding stripped.
pub fn classify(payload: &[u8]) -> Result<MsgKind, Error> {
    let flags = *payload.first().ok_or(Error::DataUnderflow)?;

    let kind = if flags == PHASE2_MSGFLG {
        MsgKind::Phase2
    } else if flags & 0x01 != 0 {
        match ControlType::try_from((flags & 0x0E) >> 1) {
            Ok(subtype) => MsgKind::Control(subtype),
            Err(_) => MsgKind::Unknown,
        }
    } else if flags & 0x40 != 0 {
        MsgKind::FutureVersion
    } else {
        match flags & 0x07 {
            FLAGS_SHORT_DATA => MsgKind::ShortData,
            FLAGS_LONG_DATA => MsgKind::LongData,
            _ => MsgKind::Unknown,
        }
    };

    Ok(kind)
}

/// Strips the optional padding prefix (bit 7 of the first byte set, low
/// seven bits giving the count of bytes to skip) and returns the real
/// payload.
pub fn strip_padding(payload: &[u8]) -> Result<&[u8], Error> {
    let flags = *payload.first().ok_or(Error::DataUnderflow)?;

    if flags & 0x80 != 0 {
        let padding = (flags & 0x7F) as usize;
        if padding == 0 || padding > payload.len() {
            return Err(Error::InvalidFormat);
        }

        Ok(&payload[padding..])
    } else {
        Ok(payload)
    }
}

/// Routing-specification version acceptance: 2.0.0 and up.
pub fn version_supported(tiver: [u8; 3]) -> bool {
    tiver[0] >= 2
}
