#![cfg_attr(not(feature = "std"), no_std)]

//! DDCMP: reliable, in-order message delivery over a raw byte stream.
//!
//! The whole protocol lives in [`Line`], a sans-I/O engine. The caller
//! feeds it received byte chunks, drains the bytes it wants transmitted,
//! and tells it when its one outstanding deadline has passed; the engine
//! never touches a socket or a clock.

use num_enum::TryFromPrimitive;

pub mod crc;
mod line;

pub use line::{Line, LineState, Notification};

/// Sync byte of a control frame.
pub const ENQ: u8 = 0x05;
/// Sync byte of a numbered data frame.
pub const SOH: u8 = 0x81;
/// Sync byte of a maintenance frame. Unsupported; receiving one halts
/// the line.
pub const DLE: u8 = 0x90;

/// Frame header plus the two CRC fields.
pub const HEADER_LEN: usize = 8;

/// Persistent receive buffer size.
pub const RX_BUFFER_LEN: usize = 8192;

/// Largest payload a data frame may carry and still fit the receive
/// buffer together with its header and CRCs.
pub const MAX_DATA_LEN: usize = RX_BUFFER_LEN - HEADER_LEN - 2;

/// Transmit ring entries are sized for the traffic a router originates
/// (routing updates, hellos, forwarded packets), not the full receive
/// buffer.
pub const MAX_SEND_DATA_LEN: usize = TX_FRAME_LEN - HEADER_LEN - 2;

pub(crate) const TX_FRAME_LEN: usize = 2048;

/// Transmit window: outstanding unacknowledged data frames.
pub const MAX_TRANSMIT_QUEUE_LEN: usize = 5;

/// Every frame this implementation emits carries station address 1.
pub const STATION: u8 = 1;

#[derive(Copy, Clone, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum ControlKind {
    Ack = 1,
    Nak = 2,
    Rep = 3,
    Strt = 6,
    Stack = 7,
}

/// NAK reason codes.
pub const NAK_HEADER_CRC: u8 = 1;
pub const NAK_DATA_CRC: u8 = 2;
pub const NAK_REP_RESPONSE: u8 = 3;
pub const NAK_BUFFER_UNAVAILABLE: u8 = 8;
pub const NAK_MESSAGE_HEADER_FORMAT: u8 = 17;

/// Wrap-aware sequence order: `a < b` iff `b` is within the transmit
/// window ahead of `a`, mod 256.
pub const fn seq_lt(a: u8, b: u8) -> bool {
    let ahead = b.wrapping_sub(a);

    ahead != 0 && ahead as usize <= MAX_TRANSMIT_QUEUE_LEN
}

pub const fn seq_le(a: u8, b: u8) -> bool {
    a == b || seq_lt(a, b)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sequence_order_wraps() {
        assert!(seq_lt(0, 1));
        assert!(seq_lt(0, 5));
        assert!(!seq_lt(0, 6));
        assert!(!seq_lt(0, 0));
        assert!(seq_lt(254, 2));
        assert!(seq_lt(255, 0));
        assert!(!seq_lt(2, 254));

        assert!(seq_le(7, 7));
        assert!(seq_le(7, 8));
        assert!(!seq_le(8, 7));
    }
}
