//! The initialization sublayer of point-to-point circuits: a per-circuit
//! state machine coordinating DDCMP line readiness with routing-layer
//! initialization and verification.

use embassy_time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use dnet_packet::hello::{verification_required, PeerLevel};
use dnet_packet::init::{HelloAndTest, Initialization, NodeInitPhase2, Verification};
use dnet_packet::{version_supported, DecnetAddr};

use crate::adjacency::{self, AdjacencyKind};
use crate::circuit::MAX_PAYLOAD;
use crate::router::{Deferred, Router};
use crate::timer::TimerKind;
use crate::{RouterLevel, NN, RECALL_TIMER, T3};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DdcmpInitState {
    /// Running: the circuit is in service.
    Ru,
    /// Circuit rejected.
    Cr,
    /// Data link start.
    Ds,
    /// Routing layer initialize.
    Ri,
    /// Routing layer verify.
    Rv,
    /// Routing layer complete.
    Rc,
    /// Off.
    Of,
    /// Halted.
    Ha,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DdcmpInitEvent {
    /// Routing init received, verification requested.
    Nrivr,
    /// Routing init received, no verification requested.
    Nrinv,
    /// Routing verification received.
    Nrv,
    /// Recall timer expired.
    Rt,
    /// Line start complete.
    Sc,
    /// Line start error.
    Ste,
    /// Operator turned the circuit on.
    Opo,
    /// Operator turned the circuit off.
    Opf,
    /// Invalid message received.
    Im,
    /// Circuit reject complete.
    Rc,
    /// Circuit down complete.
    Cdc,
    /// Circuit up complete.
    Cuc,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum InitAction {
    Reinitialize,
    Stop,
    SendInit,
    SendVerify,
}

struct Row {
    event: DdcmpInitEvent,
    state: DdcmpInitState,
    next: DdcmpInitState,
    action: Option<InitAction>,
}

const fn row(
    event: DdcmpInitEvent,
    state: DdcmpInitState,
    next: DdcmpInitState,
    action: Option<InitAction>,
) -> Row {
    Row {
        event,
        state,
        next,
        action,
    }
}

use DdcmpInitEvent as E;
use DdcmpInitState::{Cr, Ds, Ha, Of, Rc, Ri, Ru, Rv};
use InitAction::{Reinitialize, SendInit, SendVerify, Stop};

#[rustfmt::skip]
const STATE_TABLE: &[Row] = &[
    row(E::Nrivr, Ru, Cr, None),
    row(E::Nrivr, Cr, Cr, None),
    row(E::Nrivr, Ds, Ds, None),
    row(E::Nrivr, Ri, Rv, Some(SendVerify)),
    row(E::Nrivr, Rv, Ds, Some(Reinitialize)),
    row(E::Nrivr, Rc, Ds, Some(Reinitialize)),
    row(E::Nrivr, Of, Of, None),
    row(E::Nrivr, Ha, Ha, None),

    row(E::Nrinv, Ru, Cr, None),
    row(E::Nrinv, Cr, Cr, None),
    row(E::Nrinv, Ds, Ds, None),
    row(E::Nrinv, Ri, Rv, None),
    row(E::Nrinv, Rv, Ds, Some(Reinitialize)),
    row(E::Nrinv, Rc, Ds, Some(Reinitialize)),
    row(E::Nrinv, Of, Of, None),
    row(E::Nrinv, Ha, Ha, None),

    row(E::Nrv, Ru, Cr, None),
    row(E::Nrv, Cr, Cr, None),
    row(E::Nrv, Ds, Ds, None),
    row(E::Nrv, Ri, Ds, Some(Reinitialize)),
    row(E::Nrv, Rv, Rc, None),
    row(E::Nrv, Rc, Ds, Some(Reinitialize)),
    row(E::Nrv, Of, Of, None),
    row(E::Nrv, Ha, Ha, None),

    row(E::Rt, Ru, Ru, None),
    row(E::Rt, Cr, Cr, None),
    row(E::Rt, Ds, Ds, Some(Reinitialize)),
    row(E::Rt, Ri, Ds, Some(Reinitialize)),
    row(E::Rt, Rv, Ds, Some(Reinitialize)),
    row(E::Rt, Rc, Rc, None),
    row(E::Rt, Of, Of, None),
    row(E::Rt, Ha, Ha, None),

    row(E::Sc, Ru, Cr, None),
    row(E::Sc, Cr, Cr, None),
    row(E::Sc, Ds, Ri, Some(SendInit)),
    row(E::Sc, Ri, Ds, Some(Reinitialize)),
    row(E::Sc, Rv, Ds, Some(Reinitialize)),
    row(E::Sc, Rc, Ds, Some(Reinitialize)),
    row(E::Sc, Of, Of, None),
    row(E::Sc, Ha, Ha, None),

    row(E::Ste, Ru, Cr, None),
    row(E::Ste, Cr, Cr, None),
    row(E::Ste, Ds, Ds, Some(Reinitialize)),
    row(E::Ste, Ri, Ds, Some(Reinitialize)),
    row(E::Ste, Rv, Ds, Some(Reinitialize)),
    row(E::Ste, Rc, Ds, Some(Reinitialize)),
    row(E::Ste, Of, Of, None),
    row(E::Ste, Ha, Ha, None),

    row(E::Opo, Ru, Ru, None),
    row(E::Opo, Cr, Cr, None),
    row(E::Opo, Ds, Ds, None),
    row(E::Opo, Ri, Ri, None),
    row(E::Opo, Rv, Rv, None),
    row(E::Opo, Rc, Rc, None),
    row(E::Opo, Of, Cr, None),
    row(E::Opo, Ha, Ds, Some(Reinitialize)),

    row(E::Opf, Ru, Of, Some(Stop)),
    row(E::Opf, Cr, Of, None),
    row(E::Opf, Ds, Ha, Some(Stop)),
    row(E::Opf, Ri, Ha, Some(Stop)),
    row(E::Opf, Rv, Ha, Some(Stop)),
    row(E::Opf, Rc, Ha, Some(Stop)),
    row(E::Opf, Of, Of, None),
    row(E::Opf, Ha, Ha, None),

    row(E::Im, Ru, Cr, None),
    row(E::Im, Cr, Cr, None),
    row(E::Im, Ds, Ds, None),
    row(E::Im, Ri, Ds, Some(Reinitialize)),
    row(E::Im, Rv, Ds, Some(Reinitialize)),
    row(E::Im, Rc, Ds, Some(Reinitialize)),
    row(E::Im, Of, Of, None),
    row(E::Im, Ha, Ha, None),

    row(E::Rc, Ru, Cr, None),
    row(E::Rc, Cr, Cr, None),
    row(E::Rc, Ds, Ds, None),
    row(E::Rc, Ri, Ri, None),
    row(E::Rc, Rv, Rv, None),
    row(E::Rc, Rc, Ds, Some(Reinitialize)),
    row(E::Rc, Of, Of, None),
    row(E::Rc, Ha, Ha, None),

    row(E::Cdc, Ru, Ru, None),
    row(E::Cdc, Cr, Ds, Some(Reinitialize)),
    row(E::Cdc, Ds, Ds, None),
    row(E::Cdc, Ri, Ri, None),
    row(E::Cdc, Rv, Rv, None),
    row(E::Cdc, Rc, Rc, None),
    row(E::Cdc, Of, Ha, None),
    row(E::Cdc, Ha, Ha, None),

    row(E::Cuc, Ru, Ru, None),
    row(E::Cuc, Cr, Cr, None),
    row(E::Cuc, Ds, Ds, None),
    row(E::Cuc, Ri, Ri, None),
    row(E::Cuc, Rv, Rv, None),
    row(E::Cuc, Rc, Ru, None),
    row(E::Cuc, Of, Of, None),
    row(E::Cuc, Ha, Ha, None),
];

/// Runs one event through a circuit's initialization machine. Entering
/// RC brings the circuit up; entering CR or OF brings it down.
pub fn process_event(router: &mut Router, slot: usize, event: DdcmpInitEvent, now: Instant) {
    let Some(state) = router.circuits[slot - 1]
        .ddcmp
        .as_ref()
        .map(|ddcmp| ddcmp.init_state)
    else {
        return;
    };

    let Some(entry) = STATE_TABLE
        .iter()
        .find(|row| row.event == event && row.state == state)
    else {
        return;
    };

    let changing = state != entry.next;

    if changing {
        debug!(
            "{:?}: changing DDCMP circuit {} state from {:?} to {:?}",
            event,
            router.circuits[slot - 1].name,
            state,
            entry.next
        );
    }

    if let Some(ddcmp) = router.circuits[slot - 1].ddcmp.as_mut() {
        ddcmp.init_state = entry.next;
    }

    match entry.action {
        Some(InitAction::Reinitialize) => reinitialize(router, slot, now),
        Some(InitAction::Stop) => {
            debug!("stopping DDCMP line {}", router.circuits[slot - 1].name);
            if let Some(ddcmp) = router.circuits[slot - 1].ddcmp.as_mut() {
                ddcmp.line.halt(now);
            }
        }
        Some(InitAction::SendInit) => send_init(router, slot, now),
        Some(InitAction::SendVerify) => send_verify(router, slot, now),
        None => (),
    }

    if changing {
        if entry.next == DdcmpInitState::Rc {
            router.defer(Deferred::CircuitUp(slot));
        } else if entry.next == DdcmpInitState::Cr || entry.next == DdcmpInitState::Of {
            router.defer(Deferred::CircuitDown(slot));
        }
    }
}

/// Issues a data-link restart unless the recall timer is already
/// throttling one.
fn reinitialize(router: &mut Router, slot: usize, now: Instant) {
    if router.timers.is_active(TimerKind::Recall(slot)) {
        trace!(
            "skipping reinitialize for {} because recall timer is active",
            router.circuits[slot - 1].name
        );
        return;
    }

    debug!("starting DDCMP line {}", router.circuits[slot - 1].name);

    if let Some(ddcmp) = router.circuits[slot - 1].ddcmp.as_mut() {
        ddcmp.line.start(now);
    }

    router
        .timers
        .create_oneshot(TimerKind::Recall(slot), now + Duration::from_secs(RECALL_TIMER));
}

fn send_init(router: &mut Router, slot: usize, now: Instant) {
    let own = router.node.address;
    let level2 = router.node.level == RouterLevel::Level2;

    debug!(
        "sending initialization message on {}",
        router.circuits[slot - 1].name
    );

    let mut buf = [0u8; 32];
    if let Ok(len) = Initialization::emit(own, level2, T3 as u16, &mut buf) {
        let dst = peer_address(router, slot);
        router.circuits[slot - 1].write_packet(dst, &buf[..len], now);
    }
}

fn send_verify(router: &mut Router, slot: usize, now: Instant) {
    debug!("sending verification message");

    let mut buf = [0u8; 8];
    if let Ok(len) = Verification::emit(router.node.address, &mut buf) {
        let dst = peer_address(router, slot);
        router.circuits[slot - 1].write_packet(dst, &buf[..len], now);
    }
}

/// Periodic hello-and-test while the circuit is up.
pub fn hello_timer(router: &mut Router, slot: usize, now: Instant) {
    if !router.circuits[slot - 1].is_up() {
        return;
    }

    debug!(
        "sending hello and test on {}",
        router.circuits[slot - 1].name
    );

    let mut buf = [0u8; 8];
    if let Ok(len) = HelloAndTest::emit(router.node.address, &mut buf) {
        let dst = peer_address(router, slot);
        router.circuits[slot - 1].write_packet(dst, &buf[..len], now);
    }
}

/// Recall timer expiry: outside RU this retries the initialization.
pub fn recall_expired(router: &mut Router, slot: usize, now: Instant) {
    let state = router.circuits[slot - 1]
        .ddcmp
        .as_ref()
        .map(|ddcmp| ddcmp.init_state);

    if state.is_some() && state != Some(DdcmpInitState::Ru) {
        trace!(
            "recall timer timed out for {}",
            router.circuits[slot - 1].name
        );
        process_event(router, slot, DdcmpInitEvent::Rt, now);
    }
}

/// Handles a received routing initialization message.
pub fn process_initialization(router: &mut Router, slot: usize, msg: &Initialization, now: Instant) {
    let own = router.node.address;
    let from = msg.srcnode;
    let level = PeerLevel::from_iinfo(msg.tiinfo);

    let mut valid = false;

    if from.node as usize > NN {
        error!("initialization received for node number outside maximum allowed");
    } else if router.node.level == RouterLevel::Level1 && own.area != from.area {
        error!("initialization received from another area when configured as Level 1 router");
    } else if router.node.level == RouterLevel::Level2
        && level == Some(PeerLevel::Level1Router)
        && own.area != from.area
    {
        error!("initialization received from non Level 2 node in another area");
    } else if version_supported(msg.tiver) {
        trace!("initialization received from {}", from);
        valid = true;
    } else {
        warn!(
            "received message for unsupported routing specification version {}.{}.{}",
            msg.tiver[0], msg.tiver[1], msg.tiver[2]
        );
    }

    if !valid {
        process_invalid_message(router, slot, now);
        return;
    }

    router.circuits[slot - 1].adjacent_node = Some(from);

    let kind = match level {
        Some(PeerLevel::Level1Router) => AdjacencyKind::Level1Router,
        Some(PeerLevel::Level2Router) => AdjacencyKind::Level2Router,
        _ => AdjacencyKind::Endnode,
    };

    if verification_required(msg.tiinfo) {
        process_event(router, slot, DdcmpInitEvent::Nrivr, now);
    } else {
        process_event(router, slot, DdcmpInitEvent::Nrinv, now);
    }

    adjacency::initialise_circuit_adjacency(router, from, slot, kind, msg.timer, now);
}

pub fn process_verification(router: &mut Router, slot: usize, msg: &Verification, now: Instant) {
    trace!("verification received from {}", msg.srcnode);
    process_event(router, slot, DdcmpInitEvent::Nrv, now);
}

/// Answers a Phase II node-init so old neighbors see a configured node.
pub fn process_phase2_init(router: &mut Router, slot: usize, msg: &NodeInitPhase2, now: Instant) {
    if router.circuits[slot - 1].is_broadcast() {
        warn!("discarding Phase II node init on a broadcast circuit");
        return;
    }

    info!(
        "Phase II node init from {} {}, funcs=0x{:02X} reqs=0x{:02X}, blksize={} nspsize={}, routver={}.{}.{} commver={}.{}.{} sysver={}",
        msg.nodeaddr,
        msg.nodename,
        msg.functions,
        msg.requests,
        msg.blksize,
        msg.nspsize,
        msg.routver[0],
        msg.routver[1],
        msg.routver[2],
        msg.commver[0],
        msg.commver[1],
        msg.commver[2],
        msg.sysver
    );

    let own = router.node.address;
    let name: heapless::String<6> = router.node.name.clone();

    let mut buf = [0u8; MAX_PAYLOAD];
    match NodeInitPhase2::emit(own, &name, &mut buf) {
        Ok(len) => {
            let dst = peer_address(router, slot);
            router.circuits[slot - 1].write_packet(dst, &buf[..len], now);
        }
        Err(_) => {
            error!("router node address out of range for Phase II messages");
        }
    }
}

pub fn process_invalid_message(router: &mut Router, slot: usize, now: Instant) {
    process_event(router, slot, DdcmpInitEvent::Im, now);
}

fn peer_address(router: &Router, slot: usize) -> DecnetAddr {
    match router.circuits[slot - 1].adjacent_node {
        Some(node) => DecnetAddr::Node(node),
        None => DecnetAddr::Node(router.node.address),
    }
}
