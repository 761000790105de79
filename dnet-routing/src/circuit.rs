//! Circuits: a named, costed path out of this node, backed by exactly
//! one line. The line's I/O handle lives with the caller; the circuit
//! keeps the protocol-visible state, counters and the outbound queue the
//! caller drains.

use embassy_time::Instant;

use heapless::{Deque, String, Vec};

use log::{debug, info, warn};

use dnet_packet::{DecnetAddr, NodeAddr};

use crate::{ddcmp_init::DdcmpInitState, LEVEL1_BATCH_SIZE, NN};

/// Largest routing-layer payload a circuit carries (the Ethernet hello
/// blocksize).
pub const MAX_PAYLOAD: usize = 1498;

const OUTBOX_LEN: usize = 16;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CircuitKind {
    Ethernet,
    Ddcmp,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CircuitState {
    Off,
    Up,
}

#[derive(Copy, Clone, Default, Debug)]
pub struct CircuitStats {
    pub valid_raw_packets_received: u64,
    pub decnet_packets_received: u64,
    pub decnet_to_this_node_packets_received: u64,
    pub packets_sent: u64,
    pub loopback_packets_received: u64,
    pub non_decnet_packets_received: u64,
    pub invalid_packets_received: u64,
}

/// A framed packet waiting for the caller to put it on a broadcast
/// line.
pub struct OutPacket {
    pub dst: DecnetAddr,
    pub data: Vec<u8, MAX_PAYLOAD>,
}

/// Per-circuit state of the point-to-point stack: the DDCMP engine and
/// the routing-layer initialization machine above it.
pub struct DdcmpCircuit {
    pub line: dnet_ddcmp::Line,
    pub init_state: DdcmpInitState,
}

impl DdcmpCircuit {
    fn new() -> Self {
        Self {
            line: dnet_ddcmp::Line::new(),
            init_state: DdcmpInitState::Ha,
        }
    }
}

pub struct Circuit {
    pub slot: usize,
    pub name: String<16>,
    pub kind: CircuitKind,
    pub state: CircuitState,
    pub cost: u16,
    /// Peer address; meaningful on non-broadcast circuits only.
    pub adjacent_node: Option<NodeAddr>,
    /// Rolling cursor of the level 1 update batches.
    pub next_level1_node: usize,
    /// Designated-router election result for this broadcast circuit.
    pub designated_router: bool,
    pub stats: CircuitStats,
    pub outbox: Deque<OutPacket, OUTBOX_LEN>,
    pub ddcmp: Option<DdcmpCircuit>,
}

impl Circuit {
    pub fn new(slot: usize, name: &str, kind: CircuitKind, cost: u16, own_node: u16) -> Self {
        let mut circuit_name = String::new();
        for c in name.chars().take(16) {
            let _ = circuit_name.push(c);
        }

        Self {
            slot,
            name: circuit_name,
            kind,
            state: CircuitState::Off,
            cost,
            adjacent_node: None,
            next_level1_node: first_level1_node(own_node),
            designated_router: false,
            stats: CircuitStats::default(),
            outbox: Deque::new(),
            ddcmp: match kind {
                CircuitKind::Ddcmp => Some(DdcmpCircuit::new()),
                CircuitKind::Ethernet => None,
            },
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.kind == CircuitKind::Ethernet
    }

    pub fn is_up(&self) -> bool {
        self.state == CircuitState::Up
    }

    /// Hands a routing-layer payload to this circuit's line: queued for
    /// framing on broadcast circuits, sent through DDCMP otherwise.
    /// Returns false when the line cannot take it right now.
    pub fn write_packet(&mut self, dst: DecnetAddr, payload: &[u8], now: Instant) -> bool {
        let sent = match self.kind {
            CircuitKind::Ethernet => {
                let mut data = Vec::new();

                if data.extend_from_slice(payload).is_err() {
                    warn!("oversize payload dropped on circuit {}", self.name);
                    false
                } else if self.outbox.push_back(OutPacket { dst, data }).is_err() {
                    debug!("outbound queue full on circuit {}", self.name);
                    false
                } else {
                    true
                }
            }
            CircuitKind::Ddcmp => match &mut self.ddcmp {
                Some(ddcmp) => ddcmp.line.send(payload, now),
                None => false,
            },
        };

        if sent {
            self.stats.packets_sent += 1;
        }

        sent
    }

    pub fn log_stats(&self) {
        info!("{}", self.name);
        info!(
            "  DECnet packets received:              {}",
            self.stats.decnet_packets_received
        );
        info!(
            "  DECnet packets to this node received: {}",
            self.stats.decnet_to_this_node_packets_received
        );
        info!(
            "  Invalid packets received:             {}",
            self.stats.invalid_packets_received
        );
        info!(
            "  Loopback packets received:            {}",
            self.stats.loopback_packets_received
        );
        info!(
            "  Valid raw packets received:           {}",
            self.stats.valid_raw_packets_received
        );
        info!(
            "  Packets sent:                         {}",
            self.stats.packets_sent
        );
    }
}

/// First level 1 batch examined after startup: the one holding this
/// node's own number, so neighbors learn of it in the first burst rather
/// than after a full sweep.
fn first_level1_node(own_node: u16) -> usize {
    (own_node as usize / LEVEL1_BATCH_SIZE) * LEVEL1_BATCH_SIZE % (NN + 1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn level1_cursor_starts_at_own_batch() {
        assert_eq!(first_level1_node(100), 64);
        assert_eq!(first_level1_node(63), 0);
        assert_eq!(first_level1_node(64), 64);
        assert_eq!(first_level1_node(1023), 960);
    }

    #[test]
    fn broadcast_write_queues_frame() {
        let mut circuit = Circuit::new(1, "eth0", CircuitKind::Ethernet, 3, 100);

        assert!(circuit.write_packet(
            DecnetAddr::AllRouters,
            &[0x0B, 1, 2],
            Instant::from_secs(0)
        ));
        assert_eq!(circuit.stats.packets_sent, 1);

        let out = circuit.outbox.pop_front().unwrap();
        assert_eq!(out.dst, DecnetAddr::AllRouters);
        assert_eq!(&out.data[..], &[0x0B, 1, 2]);
    }

    #[test]
    fn ddcmp_write_refused_until_running() {
        let mut circuit = Circuit::new(2, "dd0", CircuitKind::Ddcmp, 5, 100);

        assert!(!circuit.write_packet(
            DecnetAddr::Node(NodeAddr::new(1, 200)),
            &[0x05, 0, 0, 0],
            Instant::from_secs(0)
        ));
        assert_eq!(circuit.stats.packets_sent, 0);
    }
}
