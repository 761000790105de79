//! The forwarding engine: a pure reader of the decision process's
//! output vectors that dispatches data packets to an output circuit,
//! enforcing the visit limit and the return-to-sender semantics.

use embassy_time::Instant;

use log::{trace, warn};

use dnet_packet::data::{
    self, is_return_to_sender, is_return_to_sender_request, DataHeader,
};
use dnet_packet::{DecnetAddr, NodeAddr};

use crate::adjacency::AdjacencyKind;
use crate::circuit::MAX_PAYLOAD;
use crate::router::Router;
use crate::{RouterLevel, MAXV};

/// Long-data flags of an ordinarily forwarded packet: return-to-sender
/// may be requested of us.
const FORWARD_FLAGS: u8 = 0x0E;
/// Long-data flags of a packet on its way back to its sender.
const RETURN_FLAGS: u8 = 0x16;

/// Destination reachability, per the level of this router: nodes of the
/// local area consult Reach, other areas AReach (a level 1 router
/// trusts its nearest level 2 router for those).
pub fn is_reachable(router: &Router, address: NodeAddr) -> bool {
    if router.node.address.area != address.area {
        router.node.level == RouterLevel::Level1 || router.area.areach[address.area as usize]
    } else {
        router.db.reach[address.node as usize]
    }
}

/// The adjacency a packet for `node` leaves through: same area via
/// OA, other areas via the nearest attached router (OA[0]) or the area
/// table, with a direct adjacency lookup as the fallback.
fn adjacency_for_node(router: &Router, node: NodeAddr) -> Option<usize> {
    let own = router.node.address;
    let level2 = router.node.level == RouterLevel::Level2;

    let slot = if node.area == own.area {
        router.db.oa[node.node as usize]
    } else if level2 && router.area.attached {
        router.area.aoa[node.area as usize]
    } else {
        router.db.oa[0]
    };

    if slot == 0 {
        router.adjacencies.find(node)
    } else {
        Some(slot)
    }
}

/// Forwards one validated data packet received on `src_circuit`.
pub fn forward_packet(
    router: &mut Router,
    src_circuit: usize,
    header: &DataHeader,
    body: &[u8],
    now: Instant,
) {
    let own = router.node.address;

    let mut src = header.src;
    let mut dst = header.dst;
    let mut flags = FORWARD_FLAGS;
    let visits = header.visits.saturating_add(1);
    let mut forward = true;
    let mut rejecting = false;

    trace!(
        "forward from {} to {}, visits={}, OA(0)={}, attached={}",
        src,
        dst,
        visits,
        router.db.oa[0],
        router.area.attached
    );

    let Some(src_slot) = adjacency_for_node(router, src) else {
        warn!("source adjacency not found");
        return;
    };

    if router.adjacencies.get(src_slot).kind == AdjacencyKind::Phase3 {
        warn!("Phase III data packet forwarding not implemented");
        forward = false;
    }

    if src.area == 0 {
        src.area = own.area;
    }
    if dst.area == 0 {
        dst.area = own.area;
    }

    if is_return_to_sender(header.flags) {
        flags = RETURN_FLAGS;

        if visits > 2 * MAXV {
            warn!("dropping looping return message");
            forward = false;
        }
    }

    if !is_reachable(router, dst) {
        forward = return_to_sender(header.flags, &mut flags, &mut src, &mut dst, "node unreachable");
        rejecting = true;
    } else if visits > MAXV {
        warn!("dropping looping message");
        forward = false;
    }

    if forward
        && !send_long_data(router, Some(src_circuit), src, dst, flags, visits, body, now)
        && !rejecting
        && return_to_sender(
            header.flags,
            &mut flags,
            &mut src,
            &mut dst,
            "congestion on forwarded link",
        )
    {
        send_long_data(router, Some(src_circuit), src, dst, flags, visits, body, now);
    }
}

/// Turns an undeliverable packet around when its sender asked for that,
/// swapping source and destination.
fn return_to_sender(
    request_flags: u8,
    flags: &mut u8,
    src: &mut NodeAddr,
    dst: &mut NodeAddr,
    reason: &str,
) -> bool {
    if is_return_to_sender_request(request_flags) {
        trace!("returning packet to sender: {}", reason);
        core::mem::swap(src, dst);
        *flags = RETURN_FLAGS;

        true
    } else {
        trace!("dropping packet, return not requested: {}", reason);

        false
    }
}

/// Ships a long-format data packet toward `dst`. Exported to higher
/// layers through [`Router::send_data`]; `src_circuit` is `None` for
/// locally originated traffic.
#[allow(clippy::too_many_arguments)]
pub fn send_long_data(
    router: &mut Router,
    src_circuit: Option<usize>,
    src: NodeAddr,
    dst: NodeAddr,
    flags: u8,
    visits: u8,
    body: &[u8],
    now: Instant,
) -> bool {
    let Some(dst_slot) = adjacency_for_node(router, dst) else {
        warn!("destination adjacency not found");
        return false;
    };

    let adjacency = *router.adjacencies.get(dst_slot);

    match adjacency.kind {
        AdjacencyKind::Phase3 => {
            warn!("Phase III data packet forwarding not implemented");
            return false;
        }
        AdjacencyKind::Unused => {
            warn!("trying to forward to an unused adjacency, ignoring forward");
            return false;
        }
        _ => (),
    }

    let out_circuit = adjacency.circuit;

    // A packet leaving a broadcast circuit it arrived on (or originated
    // next to) is flagged intra-Ethernet.
    let flags = if src_circuit.map_or(true, |s| s == out_circuit)
        && router.circuits[out_circuit - 1].is_broadcast()
    {
        data::set_intra_ethernet(flags)
    } else {
        data::clear_intra_ethernet(flags)
    };

    let mut buf = [0u8; MAX_PAYLOAD];
    let Ok(len) = DataHeader::emit_long(src, dst, flags, visits, body, &mut buf) else {
        warn!("data packet too large to forward");
        return false;
    };

    trace!(
        "forwarding to {} via {}",
        dst,
        router.circuits[out_circuit - 1].name
    );

    router.circuits[out_circuit - 1].write_packet(
        DecnetAddr::Node(adjacency.id),
        &buf[..len],
        now,
    )
}
