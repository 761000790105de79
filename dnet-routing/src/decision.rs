//! The decision process: Hop/Cost matrices per destination and output
//! adjacency, recomputed on every topology event into the
//! Minhop/Mincost/OA/Reach vectors the forwarding engine reads, with
//! Send-Routing-Message bits raised for the update process.

use log::{error, trace};

use crate::adjacency::{AdjacencyKind, AdjacencyState, AdjacencyTable};
use crate::circuit::CircuitKind;
use crate::router::Router;
use crate::{
    FatalError, RouterLevel, AMAXC, AMAXH, COLS, INFC, INFH, MAXC, MAXH, NA, NBRA, NC, NN,
};

/// Per-node routing database.
pub struct RoutingDb {
    pub hop: [[u16; COLS]; NN + 1],
    pub cost: [[u16; COLS]; NN + 1],
    pub minhop: [u16; NN + 1],
    pub mincost: [u16; NN + 1],
    pub oa: [usize; NN + 1],
    pub reach: [bool; NN + 1],
    pub srm: [[bool; NC + 1]; NN + 1],
}

impl RoutingDb {
    pub fn new(own_node: u16) -> Self {
        let mut db = Self {
            hop: [[INFH; COLS]; NN + 1],
            cost: [[INFC; COLS]; NN + 1],
            minhop: [INFH; NN + 1],
            mincost: [INFC; NN + 1],
            oa: [0; NN + 1],
            reach: [false; NN + 1],
            srm: [[false; NC + 1]; NN + 1],
        };

        // Column 0 of this node's own row is the identity entry.
        db.hop[own_node as usize][0] = 0;
        db.cost[own_node as usize][0] = 0;

        db
    }
}

/// Per-area routing database of a level 2 router.
pub struct AreaRoutingDb {
    pub ahop: [[u16; COLS]; NA + 1],
    pub acost: [[u16; COLS]; NA + 1],
    pub aminhop: [u16; NA + 1],
    pub amincost: [u16; NA + 1],
    pub aoa: [usize; NA + 1],
    pub areach: [bool; NA + 1],
    pub asrm: [[bool; NC + 1]; NA + 1],
    pub attached: bool,
}

impl AreaRoutingDb {
    pub fn new(own_area: u8) -> Self {
        let mut db = Self {
            ahop: [[INFH; COLS]; NA + 1],
            acost: [[INFC; COLS]; NA + 1],
            aminhop: [INFH; NA + 1],
            amincost: [INFC; NA + 1],
            aoa: [0; NA + 1],
            areach: [false; NA + 1],
            asrm: [[false; NC + 1]; NA + 1],
            attached: false,
        };

        db.ahop[own_area as usize][0] = 0;
        db.acost[own_area as usize][0] = 0;

        db
    }
}

/// Runs the initial route computation.
pub fn initialise(router: &mut Router) {
    routes(router, 0, NN);

    if router.node.level == RouterLevel::Level2 {
        aroutes(router, 1, NA);
    }
}

fn adjacency_id(adjacencies: &AdjacencyTable, col: usize) -> u16 {
    if col == 0 {
        0
    } else {
        adjacencies.get(col).id.id()
    }
}

/// Minimum of one matrix row; ties go to the column whose adjacency has
/// the greater DECnet id, which keeps the choice deterministic under
/// symmetric topologies.
fn rowmin(adjacencies: &AdjacencyTable, row: &[u16; COLS]) -> (u16, usize) {
    let mut minimum = u16::MAX;
    let mut col = 0;

    for (j, &value) in row.iter().enumerate() {
        if value < minimum
            || (value == minimum
                && adjacency_id(adjacencies, j) > adjacency_id(adjacencies, col))
        {
            minimum = value;
            col = j;
        }
    }

    (minimum, col)
}

/// Row minimum capped to infinity past the configured maximum.
fn minimize(
    adjacencies: &AdjacencyTable,
    row: &[u16; COLS],
    max: u16,
    inf: u16,
) -> (u16, usize) {
    let (mut minimum, col) = rowmin(adjacencies, row);

    if minimum > max {
        minimum = inf;
    }

    (minimum, col)
}

/// Recomputes reachability and output adjacency for the destinations in
/// `first..=last`; destination 0 is the nearest attached level 2 router.
pub fn routes(router: &mut Router, first: usize, last: usize) {
    for i in first..=last {
        let old_hop = router.db.minhop[i];
        let old_cost = router.db.mincost[i];

        let (mincost, col) = minimize(&router.adjacencies, &router.db.cost[i], MAXC, INFC);

        let mut minhop = router.db.hop[i][col];
        if minhop > MAXH {
            minhop = INFH;
        }

        let mut oa = col;

        // When the best route exits through an Ethernet circuit, a
        // directly heard endnode is reached without the detour through
        // its designated router.
        if (1..=NC).contains(&col)
            && router
                .circuits
                .get(col - 1)
                .is_some_and(|c| c.kind == CircuitKind::Ethernet)
        {
            for adjacency in router.adjacencies.endnode_adjacencies() {
                if adjacency.id.node as usize == i {
                    oa = adjacency.slot;
                }
            }
        }

        let reach = minhop != INFH && mincost != INFC;
        let (minhop, mincost) = if reach {
            (minhop, mincost)
        } else {
            (INFH, INFC)
        };

        router.db.minhop[i] = minhop;
        router.db.mincost[i] = mincost;
        router.db.oa[i] = oa;
        router.db.reach[i] = reach;

        if minhop != old_hop || mincost != old_cost {
            for k in 1..=NC {
                router.db.srm[i][k] = true;
            }
        }
    }
}

/// Recomputes reachability and output adjacency for the areas in
/// `first..=last`, then the attached flag and the destination-0 pseudo
/// entry that hangs off it.
pub fn aroutes(router: &mut Router, first: usize, last: usize) {
    for i in first..=last {
        let old_hop = router.area.aminhop[i];
        let old_cost = router.area.amincost[i];

        let (amincost, col) = minimize(&router.adjacencies, &router.area.acost[i], AMAXC, INFC);

        let mut aminhop = router.area.ahop[i][col];
        if aminhop > AMAXH {
            aminhop = INFH;
        }

        let areach = aminhop != INFH && amincost != INFC;
        let (aminhop, amincost) = if areach {
            (aminhop, amincost)
        } else {
            (INFH, INFC)
        };

        router.area.aminhop[i] = aminhop;
        router.area.amincost[i] = amincost;
        router.area.aoa[i] = col;
        router.area.areach[i] = areach;

        if aminhop != old_hop || amincost != old_cost {
            for j in 1..=NC {
                let level2_adjacent =
                    router.adjacencies.get(j).kind == AdjacencyKind::Level2Router;
                let ethernet = router
                    .circuits
                    .get(j - 1)
                    .is_some_and(|c| c.kind == CircuitKind::Ethernet);

                if level2_adjacent || ethernet {
                    router.area.asrm[i][j] = true;
                }
            }
        }
    }

    router.area.attached = false;
    router.db.hop[0][0] = INFH;
    router.db.cost[0][0] = INFC;

    for i in 1..=NA {
        if router.area.areach[i] && i != router.node.address.area as usize {
            router.db.hop[0][0] = 0;
            router.db.cost[0][0] = 0;
            router.area.attached = true;
        }
    }

    routes(router, 0, 0);
}

/// Adjacency state-change hook from the adjacency manager.
pub fn process_adjacency_state_change(router: &mut Router, slot: usize) {
    if router.adjacencies.get(slot).state == AdjacencyState::Up {
        process_adjacency_up(router, slot);
    } else {
        process_adjacency_down(router, slot);
    }
}

fn process_adjacency_up(router: &mut Router, slot: usize) {
    let adjacency = *router.adjacencies.get(slot);

    if adjacency.is_broadcast_router() {
        let circ = adjacency.circuit;

        for i in 0..=NN {
            router.db.srm[i][circ] = true;
        }

        if router.node.level == RouterLevel::Level2 && adjacency.kind == AdjacencyKind::Level2Router
        {
            for i in 0..=NA {
                router.area.asrm[i][circ] = true;
            }
        }

        // The adjacent router itself is one hop away on its slot; its
        // routing messages then overwrite the column.
        if slot < COLS {
            let node = adjacency.id.node as usize;

            router.db.hop[node][slot] = 1;
            router.db.cost[node][slot] = router.circuits[circ - 1].cost;

            routes(router, node, node);
        }
    } else if adjacency.is_broadcast_endnode() {
        let node = adjacency.id.node as usize;
        let k = adjacency.circuit;

        router.db.hop[node][k] = 1;
        router.db.cost[node][k] = router.circuits[k - 1].cost;

        routes(router, node, node);
    }
}

fn process_adjacency_down(router: &mut Router, slot: usize) {
    let adjacency = *router.adjacencies.get(slot);

    if adjacency.is_broadcast_router() {
        if slot < COLS {
            for i in 1..=NN {
                router.db.hop[i][slot] = INFH;
                router.db.cost[i][slot] = INFC;
            }

            if router.node.level == RouterLevel::Level2 {
                for i in 1..=NA {
                    router.area.ahop[i][slot] = INFH;
                    router.area.acost[i][slot] = INFC;
                }
            }
        }

        if router.node.level == RouterLevel::Level2
            && adjacency.kind == AdjacencyKind::Level2Router
        {
            aroutes(router, 1, NA);
        }

        routes(router, 0, NN);
    } else if adjacency.is_broadcast_endnode() {
        let node = adjacency.id.node as usize;
        let k = adjacency.circuit;

        router.db.hop[node][k] = INFH;
        router.db.cost[node][k] = INFC;

        routes(router, node, node);
    }
}

/// Circuit state-change hook.
pub fn process_circuit_state_change(router: &mut Router, slot: usize) -> Result<(), FatalError> {
    if router.circuits[slot - 1].is_up() {
        process_circuit_up(router, slot)
    } else {
        process_circuit_down(router, slot)
    }
}

fn process_circuit_up(router: &mut Router, slot: usize) -> Result<(), FatalError> {
    check(router)?;

    let j = slot;
    let broadcast = router.circuits[j - 1].is_broadcast();
    let cost = router.circuits[j - 1].cost;

    if cost == 0 {
        error!("circuit cost must be greater than 0 when circuit goes up, terminating");
        return Err(FatalError::ZeroCircuitCost(j));
    }

    if !broadcast {
        let adjacency = *router.adjacencies.get(j);

        if !adjacency.is_used() {
            error!("no adjacency in the slot of circuit {} at circuit up", j);
            return Err(FatalError::MissingCircuitAdjacency(j));
        }

        if adjacency.kind == AdjacencyKind::Endnode {
            let k = adjacency.id.node as usize;

            router.db.hop[k][j] = 1;
            router.db.cost[k][j] = cost;

            routes(router, k, k);
        }

        for i in 0..=NN {
            router.db.srm[i][j] = true;
        }

        if router.node.level == RouterLevel::Level2 && adjacency.kind == AdjacencyKind::Level2Router
        {
            for i in 1..=NA {
                router.area.asrm[i][j] = true;
            }
        }
    } else {
        for i in 0..=NN {
            router.db.srm[i][j] = true;
        }

        if router.node.level == RouterLevel::Level2 {
            for i in 1..=NA {
                router.area.asrm[i][j] = true;
            }
        }
    }

    Ok(())
}

fn process_circuit_down(router: &mut Router, slot: usize) -> Result<(), FatalError> {
    check(router)?;

    let j = slot;

    for i in 0..=NN {
        router.db.hop[i][j] = INFH;
    }

    if router.node.level == RouterLevel::Level2 {
        for i in 1..=NA {
            router.area.ahop[i][j] = INFH;
        }
    }

    // Every router adjacency heard over this circuit dies with it.
    let slots: heapless::Vec<usize, { NBRA + 1 }> = router
        .adjacencies
        .router_adjacencies()
        .filter(|adjacency| adjacency.circuit == j)
        .map(|adjacency| adjacency.slot)
        .collect();

    for adjacency_slot in slots {
        crate::adjacency::adjacency_down(router, adjacency_slot);
    }

    if router.node.level == RouterLevel::Level2 {
        aroutes(router, 1, NA);
    }

    routes(router, 0, NN);

    Ok(())
}

/// Applies one received level 1 routing message.
pub fn process_level1_routing(
    router: &mut Router,
    msg: &dnet_packet::routing::RoutingMessage<'_>,
) -> Result<(), FatalError> {
    let Some(slot) = router.adjacencies.find(msg.srcnode) else {
        return Ok(());
    };

    let circuit = router.adjacencies.get(slot).circuit;
    let circuit_cost = router.circuits[circuit - 1].cost;

    if circuit_cost == 0 {
        error!("circuit cost must be greater than 0, terminating");
        return Err(FatalError::ZeroCircuitCost(circuit));
    }

    check(router)?;

    for segment in msg.segments() {
        for (i, hops, cost) in segment.entries() {
            let i = i as usize;

            trace!(
                "level 1 adjacency slot {}, destination {}, hops={}, cost={}",
                slot,
                i,
                hops,
                cost
            );

            router.db.hop[i][slot] = clamp_hops(hops + 1, MAXH);
            router.db.cost[i][slot] = clamp_cost(cost + circuit_cost, MAXC);

            routes(router, i, i);
        }
    }

    Ok(())
}

/// Applies one received level 2 routing message.
pub fn process_level2_routing(
    router: &mut Router,
    msg: &dnet_packet::routing::RoutingMessage<'_>,
) -> Result<(), FatalError> {
    let Some(slot) = router.adjacencies.find(msg.srcnode) else {
        return Ok(());
    };

    let circuit = router.adjacencies.get(slot).circuit;
    let circuit_cost = router.circuits[circuit - 1].cost;

    if circuit_cost == 0 {
        error!("circuit cost must be greater than 0, terminating");
        return Err(FatalError::ZeroCircuitCost(circuit));
    }

    check(router)?;

    for segment in msg.segments() {
        for (i, hops, cost) in segment.entries() {
            let i = i as usize;

            trace!(
                "level 2 adjacency slot {}, area {}, hops={}, cost={}",
                slot,
                i,
                hops,
                cost
            );

            router.area.ahop[i][slot] = clamp_hops(hops + 1, AMAXH);
            router.area.acost[i][slot] = clamp_cost(cost + circuit_cost, AMAXC);

            aroutes(router, i, i);
        }
    }

    Ok(())
}

/// T1 tick: refresh the full routing state of every non-broadcast
/// circuit.
pub fn t1_tick(router: &mut Router) -> Result<(), FatalError> {
    check(router)?;

    for j in 1..=router.circuits.len() {
        let adjacency = *router.adjacencies.get(j);

        if !router.circuits[j - 1].is_broadcast() && adjacency.kind != AdjacencyKind::Endnode {
            for i in 0..=NN {
                router.db.srm[i][j] = true;
            }
        }

        if router.node.level == RouterLevel::Level2
            && adjacency.kind == AdjacencyKind::Level2Router
            && !router.circuits[j - 1].is_broadcast()
        {
            for i in 0..=NA {
                router.area.asrm[i][j] = true;
            }
        }
    }

    routes(router, 0, NN);

    if router.node.level == RouterLevel::Level2 {
        aroutes(router, 1, NA);
    }

    Ok(())
}

/// BCT1 tick: refresh the full routing state of every broadcast circuit.
pub fn bct1_tick(router: &mut Router) -> Result<(), FatalError> {
    check(router)?;

    for j in 1..=router.circuits.len() {
        if router.circuits[j - 1].is_broadcast() {
            for i in 0..=NN {
                router.db.srm[i][j] = true;
            }

            if router.node.level == RouterLevel::Level2 {
                for i in 0..=NA {
                    router.area.asrm[i][j] = true;
                }
            }
        }
    }

    Ok(())
}

fn clamp_hops(hops: u16, max: u16) -> u16 {
    if hops > max {
        INFH
    } else {
        hops
    }
}

fn clamp_cost(cost: u16, max: u16) -> u16 {
    if cost > max {
        INFC
    } else {
        cost
    }
}

/// Detects corruption of column 0. The identity column is what every
/// other computation is relative to; with it broken the process cannot
/// keep routing.
pub fn check(router: &Router) -> Result<(), FatalError> {
    let mut ok = true;

    let own = router.node.address;

    if router.db.hop[own.node as usize][0] != 0 || router.db.cost[own.node as usize][0] != 0 {
        error!(
            "check 1 failed. Hop is {}, cost is {}",
            router.db.hop[own.node as usize][0],
            router.db.cost[own.node as usize][0]
        );
        ok = false;
    }

    if router.node.level == RouterLevel::Level2 {
        if router.area.attached && (router.db.hop[0][0] != 0 || router.db.cost[0][0] != 0) {
            error!(
                "check 2 failed. Hop[0][0]={} Cost[0][0]={}",
                router.db.hop[0][0], router.db.cost[0][0]
            );
            ok = false;
        }

        if !router.area.attached && (router.db.hop[0][0] != INFH || router.db.cost[0][0] != INFC) {
            error!(
                "check 3 failed. Hop[0][0]={} Cost[0][0]={}",
                router.db.hop[0][0], router.db.cost[0][0]
            );
            ok = false;
        }

        for i in 1..=NA {
            if i == own.area as usize {
                if router.area.ahop[i][0] != 0 || router.area.acost[i][0] != 0 {
                    error!(
                        "check 4 failed. AHop[{}][0]={}, ACost[{}][0]={}",
                        i, router.area.ahop[i][0], i, router.area.acost[i][0]
                    );
                    ok = false;
                }
            } else if router.area.ahop[i][0] != INFH || router.area.acost[i][0] != INFC {
                error!(
                    "check 5 failed. AHop[{}][0]={}, ACost[{}][0]={}",
                    i, router.area.ahop[i][0], i, router.area.acost[i][0]
                );
                ok = false;
            }
        }
    }

    if ok {
        Ok(())
    } else {
        error!("decision database check failed, exiting");
        Err(FatalError::IdentityColumn)
    }
}
