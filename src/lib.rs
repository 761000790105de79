#![cfg_attr(not(feature = "std"), no_std)]

pub use dnet_ddcmp as ddcmp;
pub use dnet_packet as packet;
pub use dnet_routing as routing;
