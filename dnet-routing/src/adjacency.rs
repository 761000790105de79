//! The adjacency table and its admission, liveness and eviction rules.
//!
//! Slots are stable for an adjacency's lifetime: 1..=NC mirror the
//! circuit slots (one adjacency per non-broadcast circuit), the next
//! NBRA+1 are the broadcast-router region (the extra slot holds a
//! router transiently while the lowest-priority one is chosen for
//! eviction), and the rest are the broadcast-endnode region.

use embassy_time::{Duration, Instant};

use log::{debug, info, trace, warn};

use dnet_packet::NodeAddr;

use crate::circuit::CircuitKind;
use crate::router::Router;
use crate::{decision, eth_init};
use crate::{ADJ_SLOTS, BCT3MULT, NBEA, NBRA, NC, T3MULT};

/// First 0-based index of the broadcast-router region.
const NBRA_BASE: usize = NC;
/// First 0-based index of the broadcast-endnode region; the slot before
/// it is the transient eviction slot.
const NBEA_BASE: usize = NC + NBRA + 1;

/// 1-based slot of the transient eviction slot.
pub const OVERFLOW_SLOT: usize = NC + NBRA + 1;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AdjacencyKind {
    Unused,
    Endnode,
    Level1Router,
    Level2Router,
    Phase3,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AdjacencyState {
    Initialising,
    Up,
}

#[derive(Copy, Clone, Debug)]
pub struct Adjacency {
    pub slot: usize,
    pub kind: AdjacencyKind,
    pub state: AdjacencyState,
    pub id: NodeAddr,
    /// Owning circuit slot.
    pub circuit: usize,
    pub last_heard: Instant,
    /// Hello period the peer advertised, in seconds.
    pub hello_period: u16,
    pub priority: u8,
}

impl Adjacency {
    const fn unused(slot: usize) -> Self {
        Self {
            slot,
            kind: AdjacencyKind::Unused,
            state: AdjacencyState::Initialising,
            id: NodeAddr::new(0, 0),
            circuit: 0,
            last_heard: Instant::from_ticks(0),
            hello_period: 0,
            priority: 0,
        }
    }

    pub fn is_used(&self) -> bool {
        self.kind != AdjacencyKind::Unused
    }

    pub fn is_broadcast_router(&self) -> bool {
        matches!(
            self.kind,
            AdjacencyKind::Level1Router | AdjacencyKind::Level2Router
        )
    }

    pub fn is_broadcast_endnode(&self) -> bool {
        self.kind == AdjacencyKind::Endnode
    }
}

pub struct AdjacencyTable {
    slots: [Adjacency; ADJ_SLOTS],
    pub router_count: usize,
    pub endnode_count: usize,
}

impl Default for AdjacencyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AdjacencyTable {
    pub fn new() -> Self {
        let mut slots = [Adjacency::unused(0); ADJ_SLOTS];
        for (i, adjacency) in slots.iter_mut().enumerate() {
            adjacency.slot = i + 1;
        }

        Self {
            slots,
            router_count: 0,
            endnode_count: 0,
        }
    }

    /// The algorithms index adjacencies by 1-based slot number.
    pub fn get(&self, slot: usize) -> &Adjacency {
        &self.slots[slot - 1]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut Adjacency {
        &mut self.slots[slot - 1]
    }

    pub fn find(&self, id: NodeAddr) -> Option<usize> {
        self.iter_used()
            .find(|adjacency| adjacency.id == id)
            .map(|adjacency| adjacency.slot)
    }

    pub fn iter_used(&self) -> impl Iterator<Item = &Adjacency> {
        self.slots.iter().filter(|adjacency| adjacency.is_used())
    }

    /// The broadcast-router region, eviction slot included.
    pub fn router_adjacencies(&self) -> impl Iterator<Item = &Adjacency> {
        self.slots[NBRA_BASE..NBRA_BASE + NBRA + 1]
            .iter()
            .filter(|adjacency| adjacency.is_used())
    }

    /// The broadcast-endnode region.
    pub fn endnode_adjacencies(&self) -> impl Iterator<Item = &Adjacency> {
        self.slots[NBEA_BASE..NBEA_BASE + NBEA]
            .iter()
            .filter(|adjacency| adjacency.is_used())
    }

    fn free_slot(&self, from: usize, n: usize) -> Option<usize> {
        self.slots[from..from + n]
            .iter()
            .find(|adjacency| !adjacency.is_used())
            .map(|adjacency| adjacency.slot)
    }

    fn delete(&mut self, slot: usize) {
        let adjacency = *self.get(slot);

        if adjacency.is_broadcast_router() {
            self.router_count -= 1;
        } else if adjacency.is_broadcast_endnode() {
            self.endnode_count -= 1;
        }

        *self.get_mut(slot) = Adjacency::unused(slot);
    }
}

/// Handles a router hello: admits or refreshes the adjacency and moves
/// it between Initialising and Up according to whether the peer's
/// RS-LIST names this node.
#[allow(clippy::too_many_arguments)]
pub fn check_router_adjacency(
    router: &mut Router,
    from: NodeAddr,
    circuit: usize,
    kind: AdjacencyKind,
    hello_period: u16,
    priority: u8,
    seen_by_peer: bool,
    now: Instant,
) {
    trace!(
        "checking adjacency for {}, hello={}, priority={}",
        from,
        hello_period,
        priority
    );

    let slot = match router.adjacencies.find(from) {
        Some(slot) => Some(slot),
        None => add_router_adjacency(router, from, circuit, kind, hello_period, priority),
    };

    if let Some(slot) = slot {
        let adjacency = router.adjacencies.get_mut(slot);
        adjacency.last_heard = now;
        adjacency.hello_period = hello_period;
        adjacency.priority = priority;

        let state = adjacency.state;
        let new_state = if seen_by_peer {
            AdjacencyState::Up
        } else {
            AdjacencyState::Initialising
        };

        if state == AdjacencyState::Initialising && new_state == AdjacencyState::Up {
            adjacency_up(router, slot);
        } else if state == AdjacencyState::Up && new_state == AdjacencyState::Initialising {
            adjacency_down(router, slot);
        }
    }

    eth_init::check_designated_router(router, now);
}

/// Handles an endnode hello; any hello from a live endnode promotes it.
pub fn check_endnode_adjacency(
    router: &mut Router,
    from: NodeAddr,
    circuit: usize,
    hello_period: u16,
    now: Instant,
) {
    let slot = match router.adjacencies.find(from) {
        Some(slot) => Some(slot),
        None => add_endnode_adjacency(router, from, circuit, hello_period),
    };

    if let Some(slot) = slot {
        let adjacency = router.adjacencies.get_mut(slot);
        adjacency.last_heard = now;
        adjacency.hello_period = hello_period;

        if adjacency.state == AdjacencyState::Initialising {
            adjacency_up(router, slot);
        }
    }
}

/// Places the peer of a non-broadcast circuit in that circuit's own
/// slot, in Initialising state; the circuit's initialization sublayer
/// drives the hard transition.
pub fn initialise_circuit_adjacency(
    router: &mut Router,
    from: NodeAddr,
    circuit: usize,
    kind: AdjacencyKind,
    hello_period: u16,
    now: Instant,
) {
    debug!("initialising adjacency for {} on circuit {}", from, circuit);

    let slot = circuit;
    let adjacency = router.adjacencies.get_mut(slot);

    adjacency.kind = kind;
    adjacency.id = from;
    adjacency.circuit = circuit;
    adjacency.state = AdjacencyState::Initialising;
    adjacency.hello_period = hello_period;
    adjacency.last_heard = now;
}

/// Refreshes the liveness of a non-broadcast circuit's adjacency and
/// soft-promotes it without a state-change notification.
pub fn check_circuit_adjacency(router: &mut Router, from: NodeAddr, circuit: usize, now: Instant) {
    if router.circuits[circuit - 1].is_broadcast() {
        return;
    }

    match router.adjacencies.find(from) {
        Some(slot) => {
            let adjacency = router.adjacencies.get_mut(slot);
            adjacency.last_heard = now;
            adjacency.state = AdjacencyState::Up;
        }
        None => {
            warn!("could not find adjacency to check for {}", from);
        }
    }
}

/// Drops every adjacency that has not been heard from within its
/// timeout; a dead non-broadcast adjacency also rejects its circuit.
pub fn purge_adjacencies(router: &mut Router, now: Instant) {
    let expired: heapless::Vec<usize, ADJ_SLOTS> = router
        .adjacencies
        .iter_used()
        .filter(|adjacency| {
            let mult = if router.circuits[adjacency.circuit - 1].is_broadcast() {
                BCT3MULT
            } else {
                T3MULT
            };

            now - adjacency.last_heard > Duration::from_secs(mult * adjacency.hello_period as u64)
        })
        .map(|adjacency| adjacency.slot)
        .collect();

    for slot in expired {
        let adjacency = *router.adjacencies.get(slot);
        info!("adjacency timeout {} (Slot {})", adjacency.id, slot);

        if router.circuits[adjacency.circuit - 1].is_broadcast() {
            if adjacency.state == AdjacencyState::Up {
                adjacency_down(router, slot);
            }

            if slot > NC {
                router.adjacencies.delete(slot);
            }
        } else {
            if router.circuits[adjacency.circuit - 1].is_up() {
                router.reject_circuit(adjacency.circuit);
            }

            adjacency_down(router, slot);
            router.adjacencies.delete(slot);
        }
    }

    // Losing a neighbor can change the election.
    eth_init::check_designated_router(router, now);
}

/// Brings down and deletes every adjacency owned by circuits of the
/// given kind.
pub fn stop_all_adjacencies(router: &mut Router, kind: CircuitKind) {
    let slots: heapless::Vec<usize, ADJ_SLOTS> = router
        .adjacencies
        .iter_used()
        .filter(|adjacency| router.circuits[adjacency.circuit - 1].kind == kind)
        .map(|adjacency| adjacency.slot)
        .collect();

    for slot in slots {
        adjacency_down(router, slot);
        router.adjacencies.delete(slot);
    }
}

pub fn adjacency_up(router: &mut Router, slot: usize) {
    let adjacency = router.adjacencies.get_mut(slot);
    adjacency.state = AdjacencyState::Up;

    let (id, circuit) = (adjacency.id, adjacency.circuit);
    info!(
        "adjacency up {} (Slot {}) on {}",
        id,
        slot,
        router.circuits[circuit - 1].name
    );

    decision::process_adjacency_state_change(router, slot);
}

pub fn adjacency_down(router: &mut Router, slot: usize) {
    let adjacency = router.adjacencies.get_mut(slot);
    adjacency.state = AdjacencyState::Initialising;

    let id = adjacency.id;
    info!("adjacency down {} (Slot {})", id, slot);

    decision::process_adjacency_state_change(router, slot);
}

fn add_router_adjacency(
    router: &mut Router,
    id: NodeAddr,
    circuit: usize,
    kind: AdjacencyKind,
    hello_period: u16,
    priority: u8,
) -> Option<usize> {
    debug!("adding adjacency {}, {:?}, priority {}", id, kind, priority);

    let slot = router.adjacencies.free_slot(NBRA_BASE, NBRA + 1)?;
    router.adjacencies.router_count += 1;

    let adjacency = router.adjacencies.get_mut(slot);
    adjacency.kind = kind;
    adjacency.id = id;
    adjacency.circuit = circuit;
    adjacency.state = AdjacencyState::Initialising;
    adjacency.hello_period = hello_period;
    adjacency.priority = priority;

    if router.adjacencies.router_count > NBRA {
        purge_lowest_priority_adjacency(router);
    }

    router.adjacencies.find(id)
}

fn add_endnode_adjacency(
    router: &mut Router,
    id: NodeAddr,
    circuit: usize,
    hello_period: u16,
) -> Option<usize> {
    debug!("adding adjacency {}, endnode", id);

    // A full endnode region silently stops tracking further peers.
    let slot = router.adjacencies.free_slot(NBEA_BASE, NBEA)?;
    router.adjacencies.endnode_count += 1;

    let adjacency = router.adjacencies.get_mut(slot);
    adjacency.kind = AdjacencyKind::Endnode;
    adjacency.id = id;
    adjacency.circuit = circuit;
    adjacency.state = AdjacencyState::Initialising;
    adjacency.hello_period = hello_period;

    Some(slot)
}

/// Evicts the router adjacency with the lowest (priority, id) and
/// compacts the region so live router adjacencies stay within the slots
/// the decision matrices cover.
fn purge_lowest_priority_adjacency(router: &mut Router) {
    let selected = router
        .adjacencies
        .router_adjacencies()
        .min_by_key(|adjacency| (adjacency.priority, adjacency.id.id()))
        .map(|adjacency| adjacency.slot);

    let Some(slot) = selected else {
        return;
    };

    if router.adjacencies.get(slot).state == AdjacencyState::Up {
        adjacency_down(router, slot);
    }

    router.adjacencies.delete(slot);

    // Move the adjacency in the transient slot down into the vacated one
    // so no live router adjacency keeps an out-of-range slot number.
    if slot != OVERFLOW_SLOT {
        let mut moved = *router.adjacencies.get(OVERFLOW_SLOT);

        if moved.is_used() {
            moved.slot = slot;
            router.adjacencies.router_count += 1;
            *router.adjacencies.get_mut(slot) = moved;
            router.adjacencies.delete(OVERFLOW_SLOT);
        }
    }
}
