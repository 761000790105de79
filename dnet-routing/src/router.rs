//! The `Router` value: every table the routing layer owns, the event
//! dispatch that connects them, and the deferred-work queue that state
//! machines use to get back out of a callback.

use embassy_time::{Duration, Instant};

use heapless::Deque;

use log::{debug, error, info, trace, warn};

use dnet_packet::data::DataHeader;
use dnet_packet::hello::{EndnodeHello, PeerLevel, RouterHello};
use dnet_packet::init::{HelloAndTest, Initialization, NodeInitPhase2, Verification};
use dnet_packet::routing::RoutingMessage;
use dnet_packet::{classify, frame, strip_padding, version_supported};
use dnet_packet::{ControlType, DecnetAddr, MsgKind, NodeAddr};

use crate::adjacency::{self, AdjacencyKind, AdjacencyTable};
use crate::circuit::{Circuit, CircuitKind, CircuitState, OutPacket, MAX_PAYLOAD};
use crate::decision::{self, AreaRoutingDb, RoutingDb};
use crate::ddcmp_init::{self, DdcmpInitEvent};
use crate::timer::{TimerKind, TimerWheel};
use crate::{eth_init, forwarding, update};
use crate::{FatalError, NodeInfo, RouterLevel, BCT1, NA, NC, NN, T1, T2, T3};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum NodeState {
    Halted,
    Running,
    Stopping,
}

/// Work queued from inside a state-machine callback for execution at
/// the event loop's level.
#[derive(Copy, Clone, Debug)]
pub enum Deferred {
    CircuitUp(usize),
    CircuitDown(usize),
    DdcmpInit(usize, DdcmpInitEvent),
}

/// A data packet addressed to this node, waiting for the higher layer.
pub struct LocalPacket {
    pub src: NodeAddr,
    pub data: heapless::Vec<u8, MAX_PAYLOAD>,
}

pub struct Router {
    pub node: NodeInfo,
    pub circuits: heapless::Vec<Circuit, NC>,
    pub adjacencies: AdjacencyTable,
    pub db: RoutingDb,
    pub area: AreaRoutingDb,
    pub timers: TimerWheel,
    pub dr_delay_expired: bool,
    deferred: Deque<Deferred, 32>,
    local_rx: Deque<LocalPacket, 8>,
    state: NodeState,
}

impl Router {
    pub fn new(node: NodeInfo) -> Self {
        let db = RoutingDb::new(node.address.node);
        let area = AreaRoutingDb::new(node.address.area);

        Self {
            node,
            circuits: heapless::Vec::new(),
            adjacencies: AdjacencyTable::new(),
            db,
            area,
            timers: TimerWheel::new(),
            dr_delay_expired: false,
            deferred: Deque::new(),
            local_rx: Deque::new(),
            state: NodeState::Halted,
        }
    }

    pub fn add_ethernet_circuit(&mut self, name: &str, cost: u16) -> Option<usize> {
        self.add_circuit(name, CircuitKind::Ethernet, cost)
    }

    pub fn add_ddcmp_circuit(&mut self, name: &str, cost: u16) -> Option<usize> {
        self.add_circuit(name, CircuitKind::Ddcmp, cost)
    }

    fn add_circuit(&mut self, name: &str, kind: CircuitKind, cost: u16) -> Option<usize> {
        if self.circuits.is_full() {
            return None;
        }

        let slot = self.circuits.len() + 1;
        let circuit = Circuit::new(slot, name, kind, cost, self.node.address.node);

        self.circuits.push(circuit).ok().map(|_| slot)
    }

    pub fn circuit(&self, slot: usize) -> &Circuit {
        &self.circuits[slot - 1]
    }

    pub fn circuit_mut(&mut self, slot: usize) -> &mut Circuit {
        &mut self.circuits[slot - 1]
    }

    pub fn ddcmp_line_mut(&mut self, slot: usize) -> Option<&mut dnet_ddcmp::Line> {
        self.circuits[slot - 1]
            .ddcmp
            .as_mut()
            .map(|ddcmp| &mut ddcmp.line)
    }

    /// Brings the node into service: initial route computation and the
    /// periodic timers.
    pub fn start(&mut self, now: Instant) {
        decision::initialise(self);

        self.timers.create_periodic(
            TimerKind::T1Tick,
            now + Duration::from_secs(T1),
            Duration::from_secs(T1),
        );
        self.timers.create_periodic(
            TimerKind::BcT1Tick,
            now + Duration::from_secs(BCT1),
            Duration::from_secs(BCT1),
        );
        // The first update burst waits for the Ethernet adjacencies to
        // come up, so neighbors see the adjacency before any routing
        // message.
        self.timers.create_periodic(
            TimerKind::UpdateTick,
            now + Duration::from_secs(T2 + T3 + 5),
            Duration::from_secs(T2),
        );
        self.timers.create_periodic(
            TimerKind::PurgeAdjacencies,
            now + Duration::from_secs(1),
            Duration::from_secs(1),
        );

        eth_init::start(self, now);

        self.state = NodeState::Running;
        info!("node {} running", self.node.address);
    }

    /// Graceful shutdown: final hellos, adjacencies down, circuits off.
    pub fn stop(&mut self, now: Instant) {
        self.state = NodeState::Stopping;

        info!("stopping Ethernet initialization layer");
        eth_init::stop(self, now);

        info!("stopping DDCMP initialization layer");
        adjacency::stop_all_adjacencies(self, CircuitKind::Ddcmp);
        for slot in 1..=self.circuits.len() {
            if self.circuits[slot - 1].kind == CircuitKind::Ddcmp {
                ddcmp_init::process_event(self, slot, DdcmpInitEvent::Opf, now);
            }
        }

        if let Err(err) = self.drain_deferred(now) {
            error!("shutdown: {}", err);
        }

        for circuit in &self.circuits {
            circuit.log_stats();
        }

        info!("shutdown complete");
    }

    /// The next instant at which [`Self::on_tick`] has work, across the
    /// timer wheel and every DDCMP line's protocol deadline.
    pub fn next_due(&self) -> Option<Instant> {
        let ddcmp = self
            .circuits
            .iter()
            .filter_map(|circuit| circuit.ddcmp.as_ref())
            .filter_map(|ddcmp| ddcmp.line.next_timer_due())
            .min();

        match (self.timers.next_due(), ddcmp) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Runs every due timer, then the work they deferred.
    pub fn on_tick(&mut self, now: Instant) -> Result<(), FatalError> {
        for kind in self.timers.take_due(now) {
            self.handle_timer(kind, now)?;
        }

        for slot in 1..=self.circuits.len() {
            if let Some(ddcmp) = self.circuits[slot - 1].ddcmp.as_mut() {
                ddcmp.line.on_timer(now);
            }

            self.process_ddcmp_notifications(slot, now);
        }

        self.drain_deferred(now)
    }

    fn handle_timer(&mut self, kind: TimerKind, now: Instant) -> Result<(), FatalError> {
        trace!("timer {:?} fired", kind);

        match kind {
            TimerKind::T1Tick => decision::t1_tick(self)?,
            TimerKind::BcT1Tick => decision::bct1_tick(self)?,
            TimerKind::UpdateTick => update::update_tick(self, now),
            TimerKind::PurgeAdjacencies => adjacency::purge_adjacencies(self, now),
            TimerKind::DrDelay => eth_init::dr_delay_expired(self, now),
            TimerKind::RouterHello(slot) => {
                eth_init::send_hello(self, slot, DecnetAddr::AllRouters, now)
            }
            TimerKind::Level2Hello(slot) => {
                eth_init::send_hello(self, slot, DecnetAddr::AllLevel2Routers, now)
            }
            TimerKind::EndnodeHello(slot) => eth_init::endnode_hello_timer(self, slot, now),
            TimerKind::DdcmpHello(slot) => ddcmp_init::hello_timer(self, slot, now),
            TimerKind::Recall(slot) => ddcmp_init::recall_expired(self, slot, now),
        }

        Ok(())
    }

    pub(crate) fn defer(&mut self, work: Deferred) {
        if self.deferred.push_back(work).is_err() {
            error!("deferred work queue full, dropping {:?}", work);
        }
    }

    fn drain_deferred(&mut self, now: Instant) -> Result<(), FatalError> {
        while let Some(work) = self.deferred.pop_front() {
            match work {
                Deferred::CircuitUp(slot) => self.circuit_up(slot, now)?,
                Deferred::CircuitDown(slot) => self.circuit_down(slot, now)?,
                Deferred::DdcmpInit(slot, event) => {
                    ddcmp_init::process_event(self, slot, event, now)
                }
            }
        }

        Ok(())
    }

    fn circuit_up(&mut self, slot: usize, now: Instant) -> Result<(), FatalError> {
        info!("circuit {} is coming up", self.circuits[slot - 1].name);
        self.circuits[slot - 1].state = CircuitState::Up;

        decision::process_circuit_state_change(self, slot)?;

        match self.circuits[slot - 1].kind {
            CircuitKind::Ethernet => {
                eth_init::circuit_up(self, slot, now);
                info!("circuit {} up", self.circuits[slot - 1].name);
            }
            CircuitKind::Ddcmp => {
                self.timers.create_periodic(
                    TimerKind::DdcmpHello(slot),
                    now,
                    Duration::from_secs(T3),
                );

                match self.circuits[slot - 1].adjacent_node {
                    Some(node) => info!(
                        "circuit {} up, adjacent node = {}",
                        self.circuits[slot - 1].name,
                        node
                    ),
                    None => info!("circuit {} up", self.circuits[slot - 1].name),
                }

                ddcmp_init::process_event(self, slot, DdcmpInitEvent::Cuc, now);
            }
        }

        Ok(())
    }

    fn circuit_down(&mut self, slot: usize, now: Instant) -> Result<(), FatalError> {
        warn!("circuit {} going down", self.circuits[slot - 1].name);
        self.circuits[slot - 1].state = CircuitState::Off;

        decision::process_circuit_state_change(self, slot)?;

        match self.circuits[slot - 1].kind {
            CircuitKind::Ethernet => eth_init::circuit_down(self, slot),
            CircuitKind::Ddcmp => {
                self.timers.cancel(TimerKind::DdcmpHello(slot));
                ddcmp_init::process_event(self, slot, DdcmpInitEvent::Cdc, now);
            }
        }

        info!("circuit {} down", self.circuits[slot - 1].name);

        Ok(())
    }

    /// Immediate circuit-down during shutdown, where a fatal check only
    /// gets logged.
    pub(crate) fn circuit_down_now(&mut self, slot: usize) {
        self.circuits[slot - 1].state = CircuitState::Off;

        if let Err(err) = decision::process_circuit_state_change(self, slot) {
            error!("shutdown: {}", err);
        }

        eth_init::circuit_down(self, slot);
    }

    /// Rejects a misbehaving circuit: the initialization sublayer takes
    /// it from there.
    pub(crate) fn reject_circuit(&mut self, slot: usize) {
        info!("circuit {} rejected", self.circuits[slot - 1].name);

        match self.circuits[slot - 1].kind {
            CircuitKind::Ddcmp => self.defer(Deferred::DdcmpInit(slot, DdcmpInitEvent::Rc)),
            CircuitKind::Ethernet => self.defer(Deferred::CircuitDown(slot)),
        }
    }

    /// The broadcast line behind `slot` became usable (or stopped being
    /// usable).
    pub fn on_ethernet_line_up(&mut self, slot: usize, now: Instant) -> Result<(), FatalError> {
        self.defer(Deferred::CircuitUp(slot));
        self.drain_deferred(now)
    }

    pub fn on_ethernet_line_down(&mut self, slot: usize, now: Instant) -> Result<(), FatalError> {
        self.defer(Deferred::CircuitDown(slot));
        self.drain_deferred(now)
    }

    /// The transport under a DDCMP circuit connected: the operator-on
    /// event of its initialization machine.
    pub fn on_ddcmp_connected(&mut self, slot: usize, now: Instant) -> Result<(), FatalError> {
        debug!("DDCMP line {} has been opened", self.circuits[slot - 1].name);
        ddcmp_init::process_event(self, slot, DdcmpInitEvent::Opo, now);
        self.drain_deferred(now)
    }

    pub fn on_ddcmp_disconnected(&mut self, slot: usize, now: Instant) -> Result<(), FatalError> {
        debug!("DDCMP line {} has been closed", self.circuits[slot - 1].name);
        ddcmp_init::process_event(self, slot, DdcmpInitEvent::Opf, now);
        self.drain_deferred(now)
    }

    /// Feeds bytes read from a DDCMP circuit's transport through the
    /// link protocol, then every delivered message through the routing
    /// layer.
    pub fn on_ddcmp_data(
        &mut self,
        slot: usize,
        chunk: &[u8],
        now: Instant,
    ) -> Result<(), FatalError> {
        let mut scratch = [0u8; dnet_ddcmp::MAX_DATA_LEN];

        match self.circuits[slot - 1].ddcmp.as_mut() {
            Some(ddcmp) => ddcmp.line.receive(chunk, now),
            None => return Ok(()),
        }

        loop {
            let taken = self.circuits[slot - 1]
                .ddcmp
                .as_mut()
                .and_then(|ddcmp| ddcmp.line.take_received(&mut scratch, now));

            let Some(len) = taken else {
                break;
            };

            self.circuits[slot - 1].stats.valid_raw_packets_received += 1;
            self.process_packet(slot, None, None, &scratch[..len], now)?;
        }

        self.process_ddcmp_notifications(slot, now);
        self.drain_deferred(now)
    }

    fn process_ddcmp_notifications(&mut self, slot: usize, now: Instant) {
        loop {
            let notification = self.circuits[slot - 1]
                .ddcmp
                .as_mut()
                .and_then(|ddcmp| ddcmp.line.take_notification());

            match notification {
                Some(dnet_ddcmp::Notification::Running) => {
                    debug!("DDCMP line {} running", self.circuits[slot - 1].name);
                    ddcmp_init::process_event(self, slot, DdcmpInitEvent::Sc, now);
                }
                Some(dnet_ddcmp::Notification::Halted) => {
                    debug!("DDCMP line {} halted", self.circuits[slot - 1].name);
                    // Restart the circuit.
                    ddcmp_init::process_event(self, slot, DdcmpInitEvent::Opf, now);
                    ddcmp_init::process_event(self, slot, DdcmpInitEvent::Opo, now);
                }
                None => break,
            }
        }
    }

    /// Runs one captured Ethernet frame through classification, the
    /// loopback and addressing filters, and the routing layer.
    pub fn on_ethernet_frame(
        &mut self,
        slot: usize,
        raw: &[u8],
        now: Instant,
    ) -> Result<(), FatalError> {
        match frame::ethertype(raw) {
            Some(frame::ETHERTYPE_DECNET) => (),
            Some(_) => {
                trace!(
                    "discarding non-DECnet packet received on circuit {}",
                    self.circuits[slot - 1].name
                );
                self.circuits[slot - 1].stats.non_decnet_packets_received += 1;
                return Ok(());
            }
            None => {
                self.circuits[slot - 1].stats.invalid_packets_received += 1;
                return Ok(());
            }
        }

        let parsed = match frame::Frame::parse(raw) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.circuits[slot - 1].stats.invalid_packets_received += 1;
                return Ok(());
            }
        };

        self.circuits[slot - 1].stats.valid_raw_packets_received += 1;

        let from = DecnetAddr::from_mac(&parsed.src);
        let to = DecnetAddr::from_mac(&parsed.dst);

        if from == DecnetAddr::Node(self.node.address) {
            trace!(
                "discarding loopback packet on circuit {}",
                self.circuits[slot - 1].name
            );
            self.circuits[slot - 1].stats.loopback_packets_received += 1;
            return Ok(());
        }

        self.circuits[slot - 1].stats.decnet_packets_received += 1;

        if !self.addressed_to_this_node(&to) {
            trace!(
                "discarding packet not addressed to this node received on circuit {}",
                self.circuits[slot - 1].name
            );
            return Ok(());
        }

        self.circuits[slot - 1].stats.decnet_to_this_node_packets_received += 1;

        let result = self.process_packet(slot, Some(from), Some(to), parsed.payload, now);
        self.drain_deferred(now)?;
        result
    }

    fn addressed_to_this_node(&self, to: &DecnetAddr) -> bool {
        match to {
            DecnetAddr::AllRouters => true,
            DecnetAddr::AllLevel2Routers => self.node.level == RouterLevel::Level2,
            DecnetAddr::Node(node) => *node == self.node.address,
            DecnetAddr::AllEndNodes => false,
        }
    }

    fn process_packet(
        &mut self,
        slot: usize,
        from: Option<DecnetAddr>,
        _to: Option<DecnetAddr>,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), FatalError> {
        if self.state != NodeState::Running {
            return Ok(());
        }

        let Ok(payload) = strip_padding(payload) else {
            warn!("invalid message length, padding length error");
            self.circuits[slot - 1].stats.invalid_packets_received += 1;
            return Ok(());
        };

        let Ok(kind) = classify(payload) else {
            warn!("invalid message length, no flags");
            self.circuits[slot - 1].stats.invalid_packets_received += 1;
            return Ok(());
        };

        if let Some(from) = from {
            trace!(
                "process pkt on {} from {}: {:?}",
                self.circuits[slot - 1].name,
                from,
                kind
            );
        }

        match kind {
            MsgKind::Phase2 => match NodeInitPhase2::parse(payload) {
                Ok(msg) => ddcmp_init::process_phase2_init(self, slot, &msg, now),
                Err(_) => {
                    warn!("discarding invalid Phase II packet");
                    self.circuits[slot - 1].stats.invalid_packets_received += 1;
                }
            },
            MsgKind::Control(ControlType::Initialization) => {
                match Initialization::parse(payload) {
                    Ok(msg) => ddcmp_init::process_initialization(self, slot, &msg, now),
                    Err(_) => {
                        self.circuits[slot - 1].stats.invalid_packets_received += 1;
                        ddcmp_init::process_invalid_message(self, slot, now);
                    }
                }
            }
            MsgKind::Control(ControlType::Verification) => match Verification::parse(payload) {
                Ok(msg) => ddcmp_init::process_verification(self, slot, &msg, now),
                Err(_) => {
                    self.circuits[slot - 1].stats.invalid_packets_received += 1;
                    ddcmp_init::process_invalid_message(self, slot, now);
                }
            },
            MsgKind::Control(ControlType::HelloAndTest) => match HelloAndTest::parse(payload) {
                Ok(msg) => adjacency::check_circuit_adjacency(self, msg.srcnode, slot, now),
                Err(_) => {
                    self.circuits[slot - 1].stats.invalid_packets_received += 1;
                    ddcmp_init::process_invalid_message(self, slot, now);
                }
            },
            MsgKind::Control(ControlType::Level1Routing) => {
                match RoutingMessage::parse(payload, NN as u16) {
                    Ok(msg) => {
                        if msg.srcnode == self.node.address {
                            self.count_loopback(slot, "level 1 routing");
                        } else if msg.srcnode.area == self.node.address.area {
                            decision::process_level1_routing(self, &msg)?;
                        }
                    }
                    Err(err) => {
                        warn!("invalid level 1 routing message: {}", err);
                        self.circuits[slot - 1].stats.invalid_packets_received += 1;
                    }
                }
            }
            MsgKind::Control(ControlType::Level2Routing) => {
                if self.node.level == RouterLevel::Level2 {
                    match RoutingMessage::parse(payload, NA as u16) {
                        Ok(msg) => {
                            if msg.srcnode == self.node.address {
                                self.count_loopback(slot, "level 2 routing");
                            } else {
                                decision::process_level2_routing(self, &msg)?;
                            }
                        }
                        Err(err) => {
                            warn!("invalid level 2 routing message: {}", err);
                            self.circuits[slot - 1].stats.invalid_packets_received += 1;
                        }
                    }
                }
            }
            MsgKind::Control(ControlType::RouterHello) => match RouterHello::parse(payload) {
                Ok(hello) => self.process_router_hello(slot, &hello, now),
                Err(err) => {
                    warn!("invalid router hello: {}", err);
                    self.circuits[slot - 1].stats.invalid_packets_received += 1;
                }
            },
            MsgKind::Control(ControlType::EndnodeHello) => match EndnodeHello::parse(payload) {
                Ok(hello) => self.process_endnode_hello(slot, &hello, now),
                Err(err) => {
                    warn!("invalid endnode hello: {}", err);
                    self.circuits[slot - 1].stats.invalid_packets_received += 1;
                }
            },
            MsgKind::ShortData | MsgKind::LongData => {
                self.process_data_packet(slot, payload, now);
            }
            MsgKind::FutureVersion => {
                trace!("ignoring future-version data message");
            }
            MsgKind::Unknown => {
                warn!("discarding unknown packet");
                self.circuits[slot - 1].stats.invalid_packets_received += 1;
            }
        }

        Ok(())
    }

    fn process_router_hello(&mut self, slot: usize, hello: &RouterHello<'_>, now: Instant) {
        if hello.id == self.node.address {
            self.count_loopback(slot, "Ethernet router hello");
            return;
        }

        if !self.router_hello_is_for_this_node(hello) || !version_supported(hello.tiver) {
            return;
        }

        let kind = match hello.level() {
            Some(PeerLevel::Level1Router) => AdjacencyKind::Level1Router,
            Some(PeerLevel::Level2Router) => AdjacencyKind::Level2Router,
            _ => AdjacencyKind::Endnode,
        };

        let seen_by_peer = hello.rslist.contains(self.node.address);

        adjacency::check_router_adjacency(
            self,
            hello.id,
            slot,
            kind,
            hello.timer,
            hello.priority,
            seen_by_peer,
            now,
        );
    }

    fn process_endnode_hello(&mut self, slot: usize, hello: &EndnodeHello, now: Instant) {
        if hello.id == self.node.address {
            self.count_loopback(slot, "Ethernet endnode hello");
            return;
        }

        if !self.endnode_hello_is_for_this_node(hello) || !version_supported(hello.tiver) {
            return;
        }

        adjacency::check_endnode_adjacency(self, hello.id, slot, hello.timer, now);
    }

    /// A level 1 router listens to routers of its own area; a level 2
    /// router additionally to level 2 routers anywhere.
    fn router_hello_is_for_this_node(&self, hello: &RouterHello<'_>) -> bool {
        let same_area = hello.id.area == self.node.address.area;

        match self.node.level {
            RouterLevel::Level1 => same_area,
            RouterLevel::Level2 => hello.level() == Some(PeerLevel::Level2Router) || same_area,
        }
    }

    fn endnode_hello_is_for_this_node(&self, hello: &EndnodeHello) -> bool {
        PeerLevel::from_iinfo(hello.iinfo) == Some(PeerLevel::Endnode)
            && hello.id.area == self.node.address.area
    }

    fn process_data_packet(&mut self, slot: usize, payload: &[u8], now: Instant) {
        if !self.circuits[slot - 1].is_up() {
            trace!("discarding data message as circuit is down");
            return;
        }

        let (header, body) = match DataHeader::parse(payload) {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("message format error, data packet header");
                self.circuits[slot - 1].stats.invalid_packets_received += 1;
                return;
            }
        };

        adjacency::check_circuit_adjacency(self, header.src, slot, now);

        if header.src == self.node.address {
            self.count_loopback(slot, "data message");
        } else if header.dst == self.node.address {
            let mut data = heapless::Vec::new();

            if data.extend_from_slice(body).is_ok() {
                let packet = LocalPacket {
                    src: header.src,
                    data,
                };

                if self.local_rx.push_back(packet).is_err() {
                    warn!("dropping packet for this node, receive queue full");
                }
            }
        } else {
            forwarding::forward_packet(self, slot, &header, body, now);
        }
    }

    fn count_loopback(&mut self, slot: usize, what: &str) {
        trace!(
            "discarding looped-back {} on {}",
            what,
            self.circuits[slot - 1].name
        );
        self.circuits[slot - 1].stats.loopback_packets_received += 1;
    }

    /// Sends higher-layer data toward `dst`, using the same route
    /// selection as the forwarding engine.
    pub fn send_data(&mut self, dst: NodeAddr, body: &[u8], now: Instant) -> bool {
        forwarding::send_long_data(
            self,
            None,
            self.node.address,
            dst,
            0x0E,
            0,
            body,
            now,
        )
    }

    /// Drains the next packet addressed to this node.
    pub fn take_local_packet(&mut self) -> Option<LocalPacket> {
        self.local_rx.pop_front()
    }

    /// Drains the next frame queued on a broadcast circuit.
    pub fn take_outbound(&mut self, slot: usize) -> Option<OutPacket> {
        self.circuits[slot - 1].outbox.pop_front()
    }
}
