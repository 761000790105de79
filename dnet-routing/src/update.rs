//! The update process: drains the Send-Routing-Message bits into level 1
//! and level 2 routing messages on every up circuit, pacing the level 1
//! destination space in fixed-size batches.

use embassy_time::Instant;

use log::debug;

use dnet_packet::routing::{pack_entry, RoutingMessage};
use dnet_packet::DecnetAddr;

use crate::circuit::MAX_PAYLOAD;
use crate::router::Router;
use crate::{RouterLevel, LEVEL1_BATCH_SIZE, NA, NN};

/// One update tick: every up circuit gets its level 1 batches and, on a
/// level 2 router, its level 2 message.
pub fn update_tick(router: &mut Router, now: Instant) {
    for slot in 1..=router.circuits.len() {
        if !router.circuits[slot - 1].is_up() {
            continue;
        }

        circuit_level1_update(router, slot, now);

        if router.node.level == RouterLevel::Level2 {
            circuit_level2_update(router, slot, now);
        }
    }
}

/// Walks the whole destination space in batches from the circuit's
/// rolling cursor, emitting only batches with a dirty destination, then
/// advances the cursor one batch so consecutive full bursts start at
/// different points and losses are recoverable.
fn circuit_level1_update(router: &mut Router, slot: usize, now: Instant) {
    let start = router.circuits[slot - 1].next_level1_node;

    loop {
        let from = router.circuits[slot - 1].next_level1_node;

        if level1_update_required(router, slot, from) {
            debug!(
                "sending level 1 routing to {} for node range {}-{}",
                router.circuits[slot - 1].name,
                from,
                from + LEVEL1_BATCH_SIZE - 1
            );

            send_level1_batch(router, slot, from, now);
        }

        let circuit = &mut router.circuits[slot - 1];
        circuit.next_level1_node = (circuit.next_level1_node + LEVEL1_BATCH_SIZE) % (NN + 1);

        if circuit.next_level1_node == start {
            break;
        }
    }

    let circuit = &mut router.circuits[slot - 1];
    circuit.next_level1_node = (circuit.next_level1_node + LEVEL1_BATCH_SIZE) % (NN + 1);
}

fn circuit_level2_update(router: &mut Router, slot: usize, now: Instant) {
    if !level2_update_required(router, slot) {
        return;
    }

    debug!(
        "sending level 2 routing to {}",
        router.circuits[slot - 1].name
    );

    let own = router.node.address;
    let entries: heapless::Vec<u16, NA> = (1..=NA)
        .map(|i| pack_entry(router.area.aminhop[i], router.area.amincost[i]))
        .collect();

    let mut buf = [0u8; MAX_PAYLOAD];
    let Ok(len) = RoutingMessage::emit_level2(own, entries.iter().copied(), &mut buf) else {
        return;
    };

    let dst = update_destination(router, slot);
    router.circuits[slot - 1].write_packet(dst, &buf[..len], now);
}

/// Any dirty bit in the batch selects it for emission, and the bits are
/// consumed in the same pass.
fn level1_update_required(router: &mut Router, slot: usize, from: usize) -> bool {
    let mut required = false;

    for i in from..(from + LEVEL1_BATCH_SIZE).min(NN + 1) {
        if router.db.srm[i][slot] {
            required = true;
            router.db.srm[i][slot] = false;
        }
    }

    required
}

fn level2_update_required(router: &mut Router, slot: usize) -> bool {
    let mut required = false;

    for i in 1..=NA {
        if router.area.asrm[i][slot] {
            required = true;
            router.area.asrm[i][slot] = false;
        }
    }

    required
}

fn send_level1_batch(router: &mut Router, slot: usize, from: usize, now: Instant) {
    let own = router.node.address;
    let count = LEVEL1_BATCH_SIZE.min(NN + 1 - from);

    let entries: heapless::Vec<u16, LEVEL1_BATCH_SIZE> = (from..from + count)
        .map(|i| pack_entry(router.db.minhop[i], router.db.mincost[i]))
        .collect();

    let mut buf = [0u8; MAX_PAYLOAD];
    let Ok(len) = RoutingMessage::emit_level1(own, from as u16, entries.iter().copied(), &mut buf)
    else {
        return;
    };

    let dst = update_destination(router, slot);
    router.circuits[slot - 1].write_packet(dst, &buf[..len], now);
}

/// Broadcast circuits address All Routers; point-to-point circuits
/// address the peer adjacency directly.
fn update_destination(router: &Router, slot: usize) -> DecnetAddr {
    let circuit = &router.circuits[slot - 1];

    if circuit.is_broadcast() {
        DecnetAddr::AllRouters
    } else {
        match circuit.adjacent_node {
            Some(node) => DecnetAddr::Node(node),
            None => DecnetAddr::AllRouters,
        }
    }
}
