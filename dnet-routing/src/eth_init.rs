//! The initialization sublayer of broadcast circuits: designated-router
//! election and the periodic hello transmissions.

use embassy_time::{Duration, Instant};

use log::{debug, info};

use dnet_packet::hello::{RouterHello, RsEntry};
use dnet_packet::DecnetAddr;

use crate::adjacency::{self, AdjacencyState};
use crate::circuit::{CircuitKind, MAX_PAYLOAD};
use crate::router::Router;
use crate::timer::TimerKind;
use crate::{RouterLevel, T3};

/// Election rule: this node is designated router on a circuit when its
/// (priority, id) beats every up router adjacency of its own area heard
/// there.
fn could_be_designated_router(router: &Router, slot: usize) -> bool {
    let own = router.node.address;

    router
        .adjacencies
        .router_adjacencies()
        .filter(|adjacency| {
            adjacency.circuit == slot
                && adjacency.id.area == own.area
                && adjacency.state == AdjacencyState::Up
        })
        .all(|adjacency| {
            adjacency.priority < router.node.priority
                || (adjacency.priority == router.node.priority && adjacency.id.id() < own.id())
        })
}

/// Re-evaluates the election on every broadcast circuit. Inside the
/// startup grace window the result is left alone so a rebooting router
/// does not grab the role before hearing its neighbors.
pub fn check_designated_router(router: &mut Router, now: Instant) {
    if !router.dr_delay_expired {
        return;
    }

    for slot in 1..=router.circuits.len() {
        if router.circuits[slot - 1].kind != CircuitKind::Ethernet {
            continue;
        }

        let elected = could_be_designated_router(router, slot);

        if router.circuits[slot - 1].designated_router != elected {
            router.circuits[slot - 1].designated_router = elected;

            if elected {
                info!(
                    "now the designated router on circuit {}",
                    router.circuits[slot - 1].name
                );
                router.timers.create_periodic(
                    TimerKind::EndnodeHello(slot),
                    now,
                    Duration::from_secs(T3),
                );
            } else {
                info!(
                    "no longer the designated router on circuit {}",
                    router.circuits[slot - 1].name
                );
            }
        }
    }
}

/// End of the startup grace window.
pub fn dr_delay_expired(router: &mut Router, now: Instant) {
    router.dr_delay_expired = true;
    check_designated_router(router, now);
}

/// A broadcast circuit that reached Up starts its periodic hellos.
pub fn circuit_up(router: &mut Router, slot: usize, now: Instant) {
    router
        .timers
        .create_periodic(TimerKind::RouterHello(slot), now, Duration::from_secs(T3));

    if router.node.level == RouterLevel::Level2 {
        router
            .timers
            .create_periodic(TimerKind::Level2Hello(slot), now, Duration::from_secs(T3));
    }
}

pub fn circuit_down(router: &mut Router, slot: usize) {
    router.timers.cancel(TimerKind::RouterHello(slot));
    router.timers.cancel(TimerKind::Level2Hello(slot));
    router.timers.cancel(TimerKind::EndnodeHello(slot));
}

/// Sends one router hello on `slot` to the given multicast.
pub fn send_hello(router: &mut Router, slot: usize, dst: DecnetAddr, now: Instant) {
    debug!(
        "sending Ethernet hello to {} on {}",
        dst,
        router.circuits[slot - 1].name
    );

    let own = router.node.address;
    let level2 = router.node.level == RouterLevel::Level2;
    let priority = router.node.priority;

    let rslist: heapless::Vec<RsEntry, { crate::NBRA + 1 }> = router
        .adjacencies
        .router_adjacencies()
        .map(|adjacency| RsEntry {
            router: adjacency.id,
            priority: adjacency.priority,
            up: adjacency.state == AdjacencyState::Up,
        })
        .collect();

    let mut buf = [0u8; MAX_PAYLOAD];
    if let Ok(len) = RouterHello::emit(
        own,
        level2,
        priority,
        T3 as u16,
        rslist.iter().copied(),
        &mut buf,
    ) {
        router.circuits[slot - 1].write_packet(dst, &buf[..len], now);
    }
}

/// The hello-to-endnodes duty of the designated router.
pub fn endnode_hello_timer(router: &mut Router, slot: usize, now: Instant) {
    if router.circuits[slot - 1].designated_router {
        send_hello(router, slot, DecnetAddr::AllEndNodes, now);
    } else {
        router.timers.cancel(TimerKind::EndnodeHello(slot));
    }
}

/// Records the startup grace window and keeps the election off until it
/// passes.
pub fn start(router: &mut Router, now: Instant) {
    router.dr_delay_expired = false;

    let any_broadcast = router
        .circuits
        .iter()
        .any(|circuit| circuit.kind == CircuitKind::Ethernet);

    if any_broadcast {
        router.timers.create_oneshot(
            TimerKind::DrDelay,
            now + Duration::from_secs(crate::DRDELAY),
        );
    }
}

/// Shutdown: every Ethernet adjacency goes down, and a final hello with
/// the now-empty RS-LIST lets peers expire this node quickly.
pub fn stop(router: &mut Router, now: Instant) {
    adjacency::stop_all_adjacencies(router, CircuitKind::Ethernet);

    for slot in 1..=router.circuits.len() {
        if router.circuits[slot - 1].kind != CircuitKind::Ethernet {
            continue;
        }

        debug!(
            "sending Ethernet hello to stop all adjacencies on {}",
            router.circuits[slot - 1].name
        );

        send_hello(router, slot, DecnetAddr::AllRouters, now);

        if router.node.level == RouterLevel::Level2 {
            send_hello(router, slot, DecnetAddr::AllLevel2Routers, now);
        }

        router.circuit_down_now(slot);
    }
}
