//! Min-cost max-flow placement of item replicas onto members.
//!
//! The placement problem is modeled as a flow network:
//!
//! ```text
//! source -> item -> item/zone -> member -> sink
//! ```
//!
//! - `source -> item` has capacity equal to the item's desired replicas.
//! - `item -> item/zone` carries the replicas an item places within a single zone. Up to its
//!   replicas divided by its eligible zones, rounded up, flow at no cost. A parallel overflow
//!   edge carries the rest at `ZONE_OVERFLOW_COST`, so replicas spread across zones whenever
//!   they can, but skewed zones never leave replicas unplaced.
//! - `item/zone -> member` has capacity 1, so an item never has two replicas on one member.
//!   Its cost is 0 if the member currently holds the item and 1 otherwise.
//! - `member -> sink` has capacity equal to the member's capacity.
//!
//! A minimum cost maximum flow therefore places as many replicas as possible, and among all such
//! placements retains the largest number of current assignments.

use std::collections::VecDeque;

/// The cost of an edge retaining a current assignment.
pub const RETAIN_COST: i64 = 0;
/// The cost of an edge creating a new assignment.
pub const PLACE_COST: i64 = 1;
/// The cost of placing a replica in a zone beyond its even share.
pub const ZONE_OVERFLOW_COST: i64 = PLACE_COST + 1;

const SOURCE: usize = 0;
const SINK: usize = 1;

/// An item to be placed.
#[derive(Clone, Debug, Default)]
pub struct Demand {
    /// The desired number of replicas.
    pub replicas: usize,
    /// Indices of members currently holding this item.
    pub current: Vec<usize>,
    /// Indices of members which may legally hold this item.
    pub eligible: Vec<usize>,
}

/// A member able to hold replicas.
#[derive(Clone, Debug, Default)]
pub struct Supply {
    pub zone: String,
    /// The maximum number of replicas this member may hold.
    pub limit: usize,
}

/// The solved placement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Placement {
    /// For each demand, the sorted indices of members to hold it.
    pub members: Vec<Vec<usize>>,
    /// The number of replicas placed.
    pub placed: usize,
    /// The number of replicas desired.
    pub desired: usize,
}

impl Placement {
    /// The number of desired replicas which could not be placed.
    pub fn unplaced(&self) -> usize {
        self.desired.saturating_sub(self.placed)
    }
}

/// Solve the placement of the given demands onto the given supplies.
///
/// Member capacities are first scaled to each member's fair share of the total demand, which
/// spreads replicas evenly. If that leaves replicas unplaced which raw member limits could
/// place, the unscaled solution is used instead.
pub fn solve(demands: &[Demand], supplies: &[Supply]) -> Placement {
    let desired = demands.iter().map(|demand| demand.replicas).sum();
    let limits: Vec<usize> = supplies.iter().map(|supply| supply.limit).collect();
    let shares = fair_shares(desired, &limits);

    let (members, placed) = solve_with(demands, supplies, &shares);
    if placed < desired && shares != limits {
        let (raw_members, raw_placed) = solve_with(demands, supplies, &limits);
        if raw_placed > placed {
            return Placement {
                members: raw_members,
                placed: raw_placed,
                desired,
            };
        }
    }
    Placement { members, placed, desired }
}

/// Scale each limit to its proportional share of `desired`, rounding up.
fn fair_shares(desired: usize, limits: &[usize]) -> Vec<usize> {
    let total: u128 = limits.iter().map(|limit| *limit as u128).sum();
    if total == 0 {
        return limits.to_vec();
    }
    limits
        .iter()
        .map(|limit| {
            let share = (desired as u128 * *limit as u128 + total - 1) / total;
            (share as usize).min(*limit)
        })
        .collect()
}

fn solve_with(demands: &[Demand], supplies: &[Supply], capacities: &[usize]) -> (Vec<Vec<usize>>, usize) {
    let member_node = |idx: usize| 2 + idx;
    let mut net = Network::new(2 + supplies.len());
    for (idx, capacity) in capacities.iter().enumerate() {
        if *capacity > 0 {
            net.add_edge(member_node(idx), SINK, *capacity, 0);
        }
    }

    // (demand index, member index, edge id) of every candidate placement.
    let mut candidates = vec![];
    for (demand_idx, demand) in demands.iter().enumerate() {
        if demand.replicas == 0 || demand.eligible.is_empty() {
            continue;
        }
        let item_node = net.add_node();
        net.add_edge(SOURCE, item_node, demand.replicas, 0);

        let mut zones: Vec<(&str, Vec<usize>)> = vec![];
        for &member in demand.eligible.iter() {
            let zone = supplies[member].zone.as_str();
            match zones.iter_mut().find(|(name, _)| *name == zone) {
                Some((_, members)) => members.push(member),
                None => zones.push((zone, vec![member])),
            }
        }
        let zone_capacity = (demand.replicas + zones.len() - 1) / zones.len();

        for (_, members) in zones {
            let zone_node = net.add_node();
            net.add_edge(item_node, zone_node, zone_capacity, 0);
            let overflow = demand.replicas.saturating_sub(zone_capacity).min(members.len().saturating_sub(zone_capacity));
            if overflow > 0 {
                net.add_edge(item_node, zone_node, overflow, ZONE_OVERFLOW_COST);
            }
            for member in members {
                let cost = if demand.current.contains(&member) { RETAIN_COST } else { PLACE_COST };
                let edge = net.add_edge(zone_node, member_node(member), 1, cost);
                candidates.push((demand_idx, member, edge));
            }
        }
    }

    let placed = net.min_cost_flow(SOURCE, SINK);
    let mut members = vec![vec![]; demands.len()];
    for (demand_idx, member, edge) in candidates {
        if net.flow(edge) > 0 {
            members[demand_idx].push(member);
        }
    }
    members.iter_mut().for_each(|members| members.sort_unstable());
    (members, placed as usize)
}

#[derive(Debug)]
struct Edge {
    to: usize,
    capacity: i64,
    cost: i64,
}

/// A residual flow network. Edge `e` and `e ^ 1` are always a forward / reverse pair.
#[derive(Debug, Default)]
struct Network {
    edges: Vec<Edge>,
    adjacency: Vec<Vec<usize>>,
}

impl Network {
    fn new(nodes: usize) -> Self {
        Self {
            edges: vec![],
            adjacency: vec![vec![]; nodes],
        }
    }

    fn add_node(&mut self) -> usize {
        self.adjacency.push(vec![]);
        self.adjacency.len() - 1
    }

    fn add_edge(&mut self, from: usize, to: usize, capacity: usize, cost: i64) -> usize {
        let id = self.edges.len();
        self.edges.push(Edge {
            to,
            capacity: capacity as i64,
            cost,
        });
        self.edges.push(Edge {
            to: from,
            capacity: 0,
            cost: -cost,
        });
        self.adjacency[from].push(id);
        self.adjacency[to].push(id + 1);
        id
    }

    /// The flow carried by the given forward edge.
    fn flow(&self, edge: usize) -> i64 {
        self.edges[edge ^ 1].capacity
    }

    /// Push a maximum flow from `source` to `sink` along successive shortest (cheapest) paths,
    /// returning the total flow.
    fn min_cost_flow(&mut self, source: usize, sink: usize) -> i64 {
        let nodes = self.adjacency.len();
        let mut total = 0;
        loop {
            let mut dist = vec![i64::MAX; nodes];
            let mut via = vec![usize::MAX; nodes];
            let mut queued = vec![false; nodes];
            let mut queue = VecDeque::new();
            dist[source] = 0;
            queue.push_back(source);
            queued[source] = true;

            while let Some(node) = queue.pop_front() {
                queued[node] = false;
                for &id in self.adjacency[node].iter() {
                    let edge = &self.edges[id];
                    if edge.capacity > 0 && dist[node] + edge.cost < dist[edge.to] {
                        dist[edge.to] = dist[node] + edge.cost;
                        via[edge.to] = id;
                        if !queued[edge.to] {
                            queued[edge.to] = true;
                            queue.push_back(edge.to);
                        }
                    }
                }
            }
            if dist[sink] == i64::MAX {
                break;
            }

            let mut push = i64::MAX;
            let mut node = sink;
            while node != source {
                let id = via[node];
                push = push.min(self.edges[id].capacity);
                node = self.edges[id ^ 1].to;
            }
            node = sink;
            while node != source {
                let id = via[node];
                self.edges[id].capacity -= push;
                self.edges[id ^ 1].capacity += push;
                node = self.edges[id ^ 1].to;
            }
            total += push;
        }
        total
    }
}
