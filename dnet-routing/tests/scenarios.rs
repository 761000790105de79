use embassy_time::{Duration, Instant};

use dnet_packet::data::{self, DataHeader};
use dnet_packet::frame::Frame;
use dnet_packet::hello::{RouterHello, RsEntry};
use dnet_packet::routing::{pack_entry, RoutingMessage};
use dnet_packet::{classify, ControlType, DecnetAddr, MsgKind, NodeAddr};

use dnet_routing::adjacency::AdjacencyState;
use dnet_routing::circuit::OutPacket;
use dnet_routing::{
    decision, update, AdjacencyKind, NodeInfo, Router, RouterLevel, INFC, INFH, NBRA, NC, NN,
};

fn t0() -> Instant {
    Instant::from_secs(10_000)
}

fn own() -> NodeAddr {
    NodeAddr::new(1, 100)
}

fn make_router(level: RouterLevel) -> Box<Router> {
    let mut name = heapless::String::new();
    name.push_str("RTR").unwrap();

    let mut router = Box::new(Router::new(NodeInfo {
        address: own(),
        name,
        level,
        priority: 64,
    }));

    router.add_ethernet_circuit("eth0", 3).unwrap();
    router.start(t0());
    router.on_ethernet_line_up(1, t0()).unwrap();

    router
}

fn hello_frame(peer: NodeAddr, level2: bool, priority: u8, rslist: &[RsEntry]) -> Vec<u8> {
    let mut payload = [0u8; 512];
    let plen = RouterHello::emit(peer, level2, priority, 15, rslist.iter().copied(), &mut payload)
        .unwrap();

    let mut raw = [0u8; 1514];
    let len = Frame::emit(
        &DecnetAddr::AllRouters.mac(),
        &peer.mac(),
        &payload[..plen],
        &mut raw,
    )
    .unwrap();

    raw[..len].to_vec()
}

fn level1_frame(peer: NodeAddr, start: u16, entries: &[u16]) -> Vec<u8> {
    let mut payload = [0u8; 512];
    let plen =
        RoutingMessage::emit_level1(peer, start, entries.iter().copied(), &mut payload).unwrap();

    let mut raw = [0u8; 1514];
    let len = Frame::emit(
        &DecnetAddr::AllRouters.mac(),
        &peer.mac(),
        &payload[..plen],
        &mut raw,
    )
    .unwrap();

    raw[..len].to_vec()
}

fn level2_frame(peer: NodeAddr, entries: &[u16]) -> Vec<u8> {
    let mut payload = [0u8; 512];
    let plen = RoutingMessage::emit_level2(peer, entries.iter().copied(), &mut payload).unwrap();

    let mut raw = [0u8; 1514];
    let len = Frame::emit(
        &DecnetAddr::AllRouters.mac(),
        &peer.mac(),
        &payload[..plen],
        &mut raw,
    )
    .unwrap();

    raw[..len].to_vec()
}

fn short_data_frame(link_src: NodeAddr, src: NodeAddr, dst: NodeAddr, visits: u8) -> Vec<u8> {
    short_data_frame_flags(link_src, src, dst, visits, 0x0A)
}

fn short_data_frame_flags(
    link_src: NodeAddr,
    src: NodeAddr,
    dst: NodeAddr,
    visits: u8,
    flags: u8,
) -> Vec<u8> {
    let d = dst.id_bytes();
    let s = src.id_bytes();
    let payload = [flags, d[0], d[1], s[0], s[1], visits, 0xCA, 0xFE];

    let mut raw = [0u8; 1514];
    let len = Frame::emit(&own().mac(), &link_src.mac(), &payload, &mut raw).unwrap();

    raw[..len].to_vec()
}

fn drain_outbox(router: &mut Router, slot: usize) -> Vec<OutPacket> {
    let mut out = Vec::new();
    while let Some(packet) = router.take_outbound(slot) {
        out.push(packet);
    }
    out
}

/// The quantified invariants that must hold after every event.
fn assert_invariants(router: &Router) {
    let own = router.node.address;

    for i in 1..=NN {
        for j in 0..NC + NBRA + 1 {
            let hop = router.db.hop[i][j];
            let cost = router.db.cost[i][j];
            assert!(hop <= 30 || hop == INFH, "Hop[{}][{}] = {}", i, j, hop);
            assert!(cost <= 1022 || cost == INFC, "Cost[{}][{}] = {}", i, j, cost);
        }

        assert_eq!(
            router.db.reach[i],
            router.db.minhop[i] != INFH && router.db.mincost[i] != INFC
        );

        let oa = router.db.oa[i];
        if router.db.reach[i] && oa != 0 {
            assert_ne!(
                router.adjacencies.get(oa).kind,
                AdjacencyKind::Unused,
                "OA[{}] = {} is unused",
                i,
                oa
            );
        }
    }

    assert_eq!(router.db.hop[own.node as usize][0], 0);
    assert_eq!(router.db.cost[own.node as usize][0], 0);

    if router.node.level == RouterLevel::Level2 {
        if router.area.attached {
            assert_eq!(router.db.hop[0][0], 0);
            assert_eq!(router.db.cost[0][0], 0);
        } else {
            assert_eq!(router.db.hop[0][0], INFH);
            assert_eq!(router.db.cost[0][0], INFC);
        }
    }

    assert!(router.adjacencies.router_count <= NBRA);

    for adjacency in router.adjacencies.iter_used() {
        assert_eq!(router.adjacencies.get(adjacency.slot).id, adjacency.id);
    }
}

#[test]
fn hello_without_us_leaves_adjacency_initialising() {
    // S2, first hello: RS-LIST does not name this node yet.
    let peer = NodeAddr::new(1, 200);
    let mut router = make_router(RouterLevel::Level2);

    router
        .on_ethernet_frame(1, &hello_frame(peer, false, 128, &[]), t0())
        .unwrap();

    let slot = router.adjacencies.find(peer).expect("adjacency created");
    assert!(slot > NC, "broadcast router region");
    assert_eq!(
        router.adjacencies.get(slot).state,
        AdjacencyState::Initialising
    );
    assert_eq!(router.adjacencies.get(slot).priority, 128);

    assert!(!router.db.reach[200]);
    assert_invariants(&router);
}

#[test]
fn hello_naming_us_promotes_to_up() {
    // S2, second hello: the peer hears us back.
    let peer = NodeAddr::new(1, 200);
    let mut router = make_router(RouterLevel::Level2);

    router
        .on_ethernet_frame(1, &hello_frame(peer, false, 128, &[]), t0())
        .unwrap();

    let seen = [RsEntry {
        router: own(),
        priority: 64,
        up: true,
    }];
    router
        .on_ethernet_frame(1, &hello_frame(peer, false, 128, &seen), t0())
        .unwrap();

    let slot = router.adjacencies.find(peer).unwrap();
    assert_eq!(router.adjacencies.get(slot).state, AdjacencyState::Up);

    assert_eq!(router.db.minhop[200], 1);
    assert_eq!(router.db.mincost[200], 3);
    assert!(router.db.reach[200]);
    assert_eq!(router.db.oa[200], slot);
    assert_invariants(&router);
}

#[test]
fn silent_peer_is_purged() {
    // S3: 2 * T3 and a bit with no hello.
    let peer = NodeAddr::new(1, 200);
    let mut router = make_router(RouterLevel::Level2);

    let seen = [RsEntry {
        router: own(),
        priority: 64,
        up: true,
    }];
    router
        .on_ethernet_frame(1, &hello_frame(peer, false, 128, &seen), t0())
        .unwrap();
    assert!(router.db.reach[200]);

    router.on_tick(t0() + Duration::from_secs(2 * 15 + 5)).unwrap();

    assert!(router.adjacencies.find(peer).is_none());
    assert!(!router.db.reach[200]);
    assert_eq!(router.db.minhop[200], INFH);
    assert_eq!(router.db.mincost[200], INFC);
    assert!(router.db.srm[200][1], "loss announced on next update");
    assert_invariants(&router);
}

#[test]
fn level1_routing_message_installs_routes() {
    let peer = NodeAddr::new(1, 200);
    let mut router = make_router(RouterLevel::Level2);

    let seen = [RsEntry {
        router: own(),
        priority: 64,
        up: true,
    }];
    router
        .on_ethernet_frame(1, &hello_frame(peer, false, 128, &seen), t0())
        .unwrap();

    // The peer advertises node 300 at 2 hops, cost 7.
    router
        .on_ethernet_frame(
            1,
            &level1_frame(peer, 300, &[pack_entry(2, 7)]),
            t0(),
        )
        .unwrap();

    let slot = router.adjacencies.find(peer).unwrap();
    assert_eq!(router.db.hop[300][slot], 3, "advertised + 1");
    assert_eq!(router.db.cost[300][slot], 10, "advertised + circuit cost");
    assert_eq!(router.db.minhop[300], 3);
    assert_eq!(router.db.mincost[300], 10);
    assert!(router.db.reach[300]);
    assert_invariants(&router);
}

#[test]
fn max_hops_becomes_infinity() {
    let peer = NodeAddr::new(1, 200);
    let mut router = make_router(RouterLevel::Level2);

    let seen = [RsEntry {
        router: own(),
        priority: 64,
        up: true,
    }];
    router
        .on_ethernet_frame(1, &hello_frame(peer, false, 128, &seen), t0())
        .unwrap();

    // 30 advertised hops exceed Maxh after this hop is added.
    router
        .on_ethernet_frame(1, &level1_frame(peer, 300, &[pack_entry(30, 5)]), t0())
        .unwrap();

    assert_eq!(router.db.minhop[300], INFH);
    assert!(!router.db.reach[300]);

    // 29 still fits.
    router
        .on_ethernet_frame(1, &level1_frame(peer, 301, &[pack_entry(29, 5)]), t0())
        .unwrap();
    assert_eq!(router.db.minhop[301], 30);
    assert!(router.db.reach[301]);

    assert_invariants(&router);
}

#[test]
fn routes_recomputation_is_idempotent() {
    let peer = NodeAddr::new(1, 200);
    let mut router = make_router(RouterLevel::Level2);

    let seen = [RsEntry {
        router: own(),
        priority: 64,
        up: true,
    }];
    router
        .on_ethernet_frame(1, &hello_frame(peer, false, 128, &seen), t0())
        .unwrap();
    router
        .on_ethernet_frame(1, &level1_frame(peer, 300, &[pack_entry(2, 7)]), t0())
        .unwrap();

    let minhop = router.db.minhop;
    let mincost = router.db.mincost;
    let oa = router.db.oa;
    let reach = router.db.reach;

    decision::routes(&mut router, 0, NN);

    assert_eq!(router.db.minhop, minhop);
    assert_eq!(router.db.mincost, mincost);
    assert_eq!(router.db.oa, oa);
    assert_eq!(router.db.reach, reach);
}

#[test]
fn level2_routing_message_attaches_node() {
    // S4: area 2 advertised at hops=2, cost=10 over a cost-3 circuit.
    let peer = NodeAddr::new(1, 50);
    let mut router = make_router(RouterLevel::Level2);

    let seen = [RsEntry {
        router: own(),
        priority: 64,
        up: true,
    }];
    router
        .on_ethernet_frame(1, &hello_frame(peer, true, 64, &seen), t0())
        .unwrap();
    assert!(!router.area.attached);

    let entries = [pack_entry(31, 1023), pack_entry(2, 10)];
    router
        .on_ethernet_frame(1, &level2_frame(peer, &entries), t0())
        .unwrap();

    let slot = router.adjacencies.find(peer).unwrap();
    assert_eq!(router.area.ahop[2][slot], 3);
    assert_eq!(router.area.acost[2][slot], 13);
    assert!(router.area.areach[2]);
    assert!(router.area.attached);
    assert_eq!(router.db.hop[0][0], 0);
    assert_eq!(router.db.cost[0][0], 0);
    assert_invariants(&router);
}

/// An attached level 2 router with a route to areas 2 and 3 via 1.50.
fn attached_router() -> (Box<Router>, usize) {
    let peer = NodeAddr::new(1, 50);
    let mut router = make_router(RouterLevel::Level2);

    let seen = [RsEntry {
        router: own(),
        priority: 64,
        up: true,
    }];
    router
        .on_ethernet_frame(1, &hello_frame(peer, true, 64, &seen), t0())
        .unwrap();

    let entries = [pack_entry(31, 1023), pack_entry(2, 10), pack_entry(2, 10)];
    router
        .on_ethernet_frame(1, &level2_frame(peer, &entries), t0())
        .unwrap();

    let slot = router.adjacencies.find(peer).unwrap();
    (router, slot)
}

#[test]
fn forwards_between_areas() {
    // S6: short data from 2.10 to 3.20 leaves as long data via 1.50.
    let (mut router, slot) = attached_router();
    assert_eq!(router.area.aoa[3], slot);

    drain_outbox(&mut router, 1);

    let frame = short_data_frame(NodeAddr::new(1, 50), NodeAddr::new(2, 10), NodeAddr::new(3, 20), 5);
    router.on_ethernet_frame(1, &frame, t0()).unwrap();

    let out = drain_outbox(&mut router, 1);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dst, DecnetAddr::Node(NodeAddr::new(1, 50)));

    let (header, body) = DataHeader::parse(&out[0].data).unwrap();
    assert_eq!(header.src, NodeAddr::new(2, 10));
    assert_eq!(header.dst, NodeAddr::new(3, 20));
    assert_eq!(header.visits, 6);
    assert_eq!(
        header.flags & dnet_packet::FLAG_INTRA_ETHERNET,
        dnet_packet::FLAG_INTRA_ETHERNET,
        "same broadcast circuit in and out"
    );
    assert_eq!(body, &[0xCA, 0xFE]);
}

#[test]
fn visit_limit_drops_looping_packet() {
    let (mut router, _) = attached_router();
    drain_outbox(&mut router, 1);

    // At the ceiling: visits goes to Maxv + 1 on this hop.
    let frame = short_data_frame(NodeAddr::new(1, 50), NodeAddr::new(2, 10), NodeAddr::new(3, 20), 30);
    router.on_ethernet_frame(1, &frame, t0()).unwrap();
    assert!(drain_outbox(&mut router, 1).is_empty());

    // One below still forwards.
    let frame = short_data_frame(NodeAddr::new(1, 50), NodeAddr::new(2, 10), NodeAddr::new(3, 20), 29);
    router.on_ethernet_frame(1, &frame, t0()).unwrap();
    assert_eq!(drain_outbox(&mut router, 1).len(), 1);
}

#[test]
fn unreachable_destination_returns_to_sender() {
    let (mut router, _) = attached_router();
    drain_outbox(&mut router, 1);

    // 1.999 is in our area and unreachable; the sender asked for the
    // packet back.
    let frame = short_data_frame(
        NodeAddr::new(1, 50),
        NodeAddr::new(2, 10),
        NodeAddr::new(1, 999),
        3,
    );
    router.on_ethernet_frame(1, &frame, t0()).unwrap();

    let out = drain_outbox(&mut router, 1);
    assert_eq!(out.len(), 1);

    let (header, _) = DataHeader::parse(&out[0].data).unwrap();
    assert_eq!(header.src, NodeAddr::new(1, 999), "source and destination swapped");
    assert_eq!(header.dst, NodeAddr::new(2, 10));
    assert!(data::is_return_to_sender(header.flags));
    assert!(!data::is_return_to_sender_request(header.flags));
}

#[test]
fn unreachable_destination_without_request_drops() {
    let (mut router, _) = attached_router();
    drain_outbox(&mut router, 1);

    // Flags 0x02: plain short data, no return-to-sender request.
    let frame = short_data_frame_flags(
        NodeAddr::new(1, 50),
        NodeAddr::new(2, 10),
        NodeAddr::new(1, 999),
        3,
        0x02,
    );
    router.on_ethernet_frame(1, &frame, t0()).unwrap();
    assert!(drain_outbox(&mut router, 1).is_empty());
}

#[test]
fn local_packets_are_delivered_up() {
    let (mut router, _) = attached_router();

    let frame = short_data_frame(NodeAddr::new(1, 50), NodeAddr::new(2, 10), own(), 4);
    router.on_ethernet_frame(1, &frame, t0()).unwrap();

    let packet = router.take_local_packet().expect("delivered locally");
    assert_eq!(packet.src, NodeAddr::new(2, 10));
    assert_eq!(&packet.data[..], &[0xCA, 0xFE]);
    assert!(router.take_local_packet().is_none());
}

#[test]
fn update_process_advertises_changes() {
    let peer = NodeAddr::new(1, 200);
    let mut router = make_router(RouterLevel::Level2);

    let seen = [RsEntry {
        router: own(),
        priority: 64,
        up: true,
    }];
    router
        .on_ethernet_frame(1, &hello_frame(peer, false, 128, &seen), t0())
        .unwrap();

    drain_outbox(&mut router, 1);
    update::update_tick(&mut router, t0());

    let out = drain_outbox(&mut router, 1);
    assert!(!out.is_empty());

    let mut advertised_self = false;
    for packet in &out {
        assert_eq!(
            classify(&packet.data).unwrap(),
            MsgKind::Control(ControlType::Level1Routing)
        );
        assert_eq!(packet.dst, DecnetAddr::AllRouters);

        let msg = RoutingMessage::parse(&packet.data, NN as u16).unwrap();
        assert_eq!(msg.srcnode, own());

        for segment in msg.segments() {
            for (dest, hops, cost) in segment.entries() {
                if dest == 100 {
                    assert_eq!((hops, cost), (0, 0), "own entry");
                    advertised_self = true;
                }
            }
        }
    }
    assert!(advertised_self, "own node in the first burst");

    // A second tick with nothing dirty emits nothing.
    update::update_tick(&mut router, t0());
    assert!(drain_outbox(&mut router, 1).is_empty());
}

#[test]
fn eviction_prefers_lowest_priority_then_lowest_id() {
    let mut router = make_router(RouterLevel::Level2);

    for i in 0..NBRA as u16 {
        let peer = NodeAddr::new(1, 300 + i);
        router
            .on_ethernet_frame(1, &hello_frame(peer, false, 60, &[]), t0())
            .unwrap();
    }
    assert_eq!(router.adjacencies.router_count, NBRA);

    // A higher-priority newcomer evicts the lowest id of the equal-60s.
    let newcomer = NodeAddr::new(1, 400);
    router
        .on_ethernet_frame(1, &hello_frame(newcomer, false, 70, &[]), t0())
        .unwrap();

    assert_eq!(router.adjacencies.router_count, NBRA);
    assert!(router.adjacencies.find(newcomer).is_some());
    assert!(router.adjacencies.find(NodeAddr::new(1, 300)).is_none());
    assert!(router.adjacencies.find(NodeAddr::new(1, 301)).is_some());
    assert_invariants(&router);
}

#[test]
fn lower_priority_newcomer_evicts_itself() {
    let mut router = make_router(RouterLevel::Level2);

    for i in 0..NBRA as u16 {
        let peer = NodeAddr::new(1, 300 + i);
        router
            .on_ethernet_frame(1, &hello_frame(peer, false, 60, &[]), t0())
            .unwrap();
    }

    let newcomer = NodeAddr::new(1, 400);
    router
        .on_ethernet_frame(1, &hello_frame(newcomer, false, 50, &[]), t0())
        .unwrap();

    assert_eq!(router.adjacencies.router_count, NBRA);
    assert!(router.adjacencies.find(newcomer).is_none());
    for i in 0..NBRA as u16 {
        assert!(router.adjacencies.find(NodeAddr::new(1, 300 + i)).is_some());
    }
    assert_invariants(&router);
}

#[test]
fn endnode_pool_exhaustion_is_silent() {
    let mut router = make_router(RouterLevel::Level2);

    // Fill the endnode region through the hello path.
    for i in 0..dnet_routing::NBEA as u16 {
        let peer = NodeAddr::new(1, 500 + i);
        dnet_routing::adjacency::check_endnode_adjacency(&mut router, peer, 1, 15, t0());
    }
    assert_eq!(router.adjacencies.endnode_count, dnet_routing::NBEA);

    let extra = NodeAddr::new(1, 700);
    dnet_routing::adjacency::check_endnode_adjacency(&mut router, extra, 1, 15, t0());

    assert!(router.adjacencies.find(extra).is_none());
    assert_eq!(router.adjacencies.endnode_count, dnet_routing::NBEA);
    assert_invariants(&router);
}

#[test]
fn endnode_adjacency_preferred_over_designated_router() {
    let peer = NodeAddr::new(1, 200);
    let mut router = make_router(RouterLevel::Level2);

    let seen = [RsEntry {
        router: own(),
        priority: 64,
        up: true,
    }];
    router
        .on_ethernet_frame(1, &hello_frame(peer, false, 128, &seen), t0())
        .unwrap();

    // The router advertises node 42 one hop away, but 42 is also heard
    // directly on the Ethernet.
    router
        .on_ethernet_frame(1, &level1_frame(peer, 42, &[pack_entry(1, 3)]), t0())
        .unwrap();

    let direct = NodeAddr::new(1, 42);
    dnet_routing::adjacency::check_endnode_adjacency(&mut router, direct, 1, 15, t0());

    let slot = router.adjacencies.find(direct).unwrap();
    assert_eq!(router.db.oa[42], slot, "traffic short-circuits to the endnode");
    assert_invariants(&router);
}

#[test]
fn designated_router_election() {
    let mut router = make_router(RouterLevel::Level2);

    // Nobody else heard: after the grace window this node elects
    // itself.
    router.on_tick(t0() + Duration::from_secs(10)).unwrap();
    assert!(router.circuit(1).designated_router);

    // A higher-priority router appears and takes the role.
    let peer = NodeAddr::new(1, 200);
    let seen = [RsEntry {
        router: own(),
        priority: 64,
        up: true,
    }];
    router
        .on_ethernet_frame(
            1,
            &hello_frame(peer, false, 128, &seen),
            t0() + Duration::from_secs(11),
        )
        .unwrap();
    assert!(!router.circuit(1).designated_router);

    // It goes silent; the role comes back.
    router.on_tick(t0() + Duration::from_secs(60)).unwrap();
    assert!(router.circuit(1).designated_router);
}

#[test]
fn priority_tie_breaks_on_id() {
    let mut router = make_router(RouterLevel::Level2);
    router.on_tick(t0() + Duration::from_secs(10)).unwrap();

    let seen = [RsEntry {
        router: own(),
        priority: 64,
        up: true,
    }];

    // Same priority, lower id than ours: we stay designated router.
    let peer = NodeAddr::new(1, 50);
    router
        .on_ethernet_frame(
            1,
            &hello_frame(peer, false, 64, &seen),
            t0() + Duration::from_secs(11),
        )
        .unwrap();
    assert!(router.circuit(1).designated_router);

    // Same priority, higher id: we lose the election.
    let peer = NodeAddr::new(1, 200);
    router
        .on_ethernet_frame(
            1,
            &hello_frame(peer, false, 64, &seen),
            t0() + Duration::from_secs(12),
        )
        .unwrap();
    assert!(!router.circuit(1).designated_router);
}
