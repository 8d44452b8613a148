//! Constraint resolution, lane assignment, and the parallel sequencer.
//!
//! The planner turns declared access rights and schedule constraints into
//! dependency-graph edges, applied strongest first so explicit constraints
//! override implicit ones:
//!
//! - weight 5: explicit before / after
//! - weight 4: explicit in-any-order denials
//! - weight 3: before/after readers-of / writers-of
//! - weight 2: in-any-order-with readers/writers denials
//! - weight 1: the implicit writer-to-reader edge per component type
//!
//! For multi-lane worlds it then assigns systems to lanes and derives the
//! excluded pairs that may never overlap in wall-clock time.

use crate::graph::DependencyGraph;
use crate::system::SystemSlot;

/// A schedule constraint with names resolved to ids.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constraint {
    Before(usize),
    After(usize),
    InAnyOrderWith(usize),
    BeforeReadersOf(u16),
    AfterReadersOf(u16),
    BeforeWritersOf(u16),
    AfterWritersOf(u16),
    InAnyOrderWithReadersOf(u16),
    InAnyOrderWithWritersOf(u16),
}

fn readers_of(systems: &[SystemSlot], type_id: u16) -> Vec<usize> {
    systems
        .iter()
        .enumerate()
        .filter(|(_, s)| s.access.read.contains(type_id))
        .map(|(i, _)| i)
        .collect()
}

fn writers_of(systems: &[SystemSlot], type_id: u16) -> Vec<usize> {
    systems
        .iter()
        .enumerate()
        .filter(|(_, s)| s.access.writeish().contains(type_id))
        .map(|(i, _)| i)
        .collect()
}

/// Builds the unsealed dependency graph from constraints and access masks.
pub fn build_graph(
    systems: &[SystemSlot],
    constraints: &[Vec<Constraint>],
    type_count: usize,
) -> DependencyGraph {
    let mut graph = DependencyGraph::new(systems.iter().map(|s| s.name.clone()).collect());

    // Weight 5: explicit ordering.
    for (a, rules) in constraints.iter().enumerate() {
        for rule in rules {
            match *rule {
                Constraint::Before(b) => graph.add_edge(a, b, 5),
                Constraint::After(b) => graph.add_edge(b, a, 5),
                _ => {}
            }
        }
    }
    // Weight 4: explicit denials.
    for (a, rules) in constraints.iter().enumerate() {
        for rule in rules {
            if let Constraint::InAnyOrderWith(b) = *rule {
                graph.deny_edge(a, b, 4);
            }
        }
    }
    // Weight 3: ordering against readers and writers of a type.
    for (a, rules) in constraints.iter().enumerate() {
        for rule in rules {
            match *rule {
                Constraint::BeforeReadersOf(t) => {
                    for b in readers_of(systems, t) {
                        graph.add_edge(a, b, 3);
                    }
                }
                Constraint::AfterReadersOf(t) => {
                    for b in readers_of(systems, t) {
                        graph.add_edge(b, a, 3);
                    }
                }
                Constraint::BeforeWritersOf(t) => {
                    for b in writers_of(systems, t) {
                        graph.add_edge(a, b, 3);
                    }
                }
                Constraint::AfterWritersOf(t) => {
                    for b in writers_of(systems, t) {
                        graph.add_edge(b, a, 3);
                    }
                }
                _ => {}
            }
        }
    }
    // Weight 2: denials against readers and writers of a type.
    for (a, rules) in constraints.iter().enumerate() {
        for rule in rules {
            match *rule {
                Constraint::InAnyOrderWithReadersOf(t) => {
                    for b in readers_of(systems, t) {
                        graph.deny_edge(a, b, 2);
                    }
                }
                Constraint::InAnyOrderWithWritersOf(t) => {
                    for b in writers_of(systems, t) {
                        graph.deny_edge(a, b, 2);
                    }
                }
                _ => {}
            }
        }
    }
    // Weight 1: implicit writer-to-reader edges.
    for type_id in 0..type_count as u16 {
        let writers = writers_of(systems, type_id);
        let readers = readers_of(systems, type_id);
        for &w in &writers {
            for &r in &readers {
                if w != r {
                    graph.add_edge(w, r, 1);
                }
            }
        }
    }
    graph
}

/// A sealed execution plan.
pub enum Plan {
    /// Single lane: a fixed topological order with a flush between systems.
    Simple { order: Vec<usize> },
    Threaded(ThreadedPlan),
}

impl Plan {
    /// The order used for prepare/initialize/finalize passes.
    pub fn init_order(&self) -> &[usize] {
        match self {
            Plan::Simple { order } => order,
            Plan::Threaded(plan) => &plan.order,
        }
    }
}

/// The multi-lane plan: lane assignment, exclusion, and sequencer inputs.
pub struct ThreadedPlan {
    pub lane_count: usize,
    /// Lane per system. Lane 0 is the main thread.
    pub lanes: Vec<usize>,
    /// Topological order, for the initialise/finalise passes.
    pub order: Vec<usize>,
    /// Pairs whose access masks conflict and which no path orders; they
    /// may not run concurrently.
    pub excluded: Vec<Vec<bool>>,
    /// Per system and lane: the weighted systems on that lane unblocked by
    /// this system's completion.
    pub impacts: Vec<Vec<f64>>,
    pub weights: Vec<f64>,
}

/// Assigns systems to at most `threads` lanes.
///
/// Systems touching main-thread-restricted types seed lane 0; everything
/// else starts in its own lane, and lanes merge pairwise by minimum
/// independence (the parallelism lost by serialising them) until the count
/// fits. Lane 0 is merged into only as a last resort.
pub fn assign_lanes(
    systems: &[SystemSlot],
    graph: &DependencyGraph,
    threads: usize,
    restricted: &[bool],
) -> Vec<usize> {
    let mut groups: Vec<Vec<usize>> = vec![Vec::new()];
    for (index, &pinned) in restricted.iter().enumerate() {
        if pinned {
            groups[0].push(index);
        } else {
            groups.push(vec![index]);
        }
    }

    let independence = |a: &[usize], b: &[usize]| -> f64 {
        let mut total = 0.0;
        for &s in a {
            for &t in b {
                if graph.reachable(s, t) || graph.reachable(t, s) {
                    continue;
                }
                if systems[s].stateless || systems[t].stateless {
                    continue;
                }
                total += systems[s].weight.min(systems[t].weight);
            }
        }
        total
    };

    while groups.len() > threads.max(1) {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..groups.len() {
            for j in i + 1..groups.len() {
                let cost = independence(&groups[i], &groups[j]);
                // Lane 0 participates only when nothing else can merge.
                let candidate = (i, j, cost);
                match best {
                    None => best = Some(candidate),
                    Some((bi, _, bc)) => {
                        let better = match (i == 0, bi == 0) {
                            (false, true) => true,
                            (true, false) => false,
                            _ => cost < bc,
                        };
                        if better {
                            best = Some(candidate);
                        }
                    }
                }
            }
        }
        let Some((i, j, _)) = best else { break };
        let merged = groups.remove(j);
        groups[i].extend(merged);
    }

    let mut lanes = vec![0usize; systems.len()];
    for (lane, group) in groups.iter().enumerate() {
        for &system in group {
            lanes[system] = lane;
        }
    }
    lanes
}

/// Pairs of conflicting systems that no path already orders.
pub fn excluded_pairs(systems: &[SystemSlot], graph: &DependencyGraph) -> Vec<Vec<bool>> {
    let n = systems.len();
    let mut excluded = vec![vec![false; n]; n];
    for a in 0..n {
        let wa = systems[a].access.writeish();
        for b in a + 1..n {
            let wb = systems[b].access.writeish();
            let conflict = wa.intersects(&wb)
                || wa.intersects(&systems[b].access.read)
                || wb.intersects(&systems[a].access.read);
            if conflict && !graph.reachable(a, b) && !graph.reachable(b, a) {
                excluded[a][b] = true;
                excluded[b][a] = true;
            }
        }
    }
    excluded
}

/// Per-system, per-lane completion impacts for the sequencer.
pub fn completion_impacts(
    systems: &[SystemSlot],
    graph: &DependencyGraph,
    lanes: &[usize],
    lane_count: usize,
) -> Vec<Vec<f64>> {
    let mut impacts = vec![vec![0.0; lane_count]; systems.len()];
    for s in 0..systems.len() {
        for t in graph.successors(s) {
            impacts[s][lanes[t]] += systems[t].weight;
        }
    }
    impacts
}

/// Picks the next ready system for the threaded plan.
///
/// Among ready systems whose lane is idle and which no running system
/// excludes, the sequencer maximises the sum over lanes of
/// `impacts[lane] / (ready_weight[lane] + running_weight[lane] / 2)`:
/// completing work that unblocks starved lanes first.
pub struct Sequencer<'a> {
    plan: &'a ThreadedPlan,
    ready: Vec<usize>,
    running: Vec<usize>,
    lane_busy: Vec<bool>,
    ready_weight: Vec<f64>,
    running_weight: Vec<f64>,
    completed: usize,
    total: usize,
}

impl<'a> Sequencer<'a> {
    pub fn new(plan: &'a ThreadedPlan, graph: &mut DependencyGraph) -> Self {
        let initial = graph.traverse(None).unwrap_or_default();
        let mut sequencer = Self {
            plan,
            ready: Vec::new(),
            running: Vec::new(),
            lane_busy: vec![false; plan.lane_count],
            ready_weight: vec![0.0; plan.lane_count],
            running_weight: vec![0.0; plan.lane_count],
            completed: 0,
            total: plan.lanes.len(),
        };
        for system in initial {
            sequencer.enqueue(system);
        }
        sequencer
    }

    fn enqueue(&mut self, system: usize) {
        self.ready_weight[self.plan.lanes[system]] += self.plan.weights[system];
        self.ready.push(system);
    }

    fn priority(&self, lane: usize) -> f64 {
        1.0 / (self.ready_weight[lane] + self.running_weight[lane] / 2.0).max(1e-9)
    }

    /// The next system to dispatch, if any lane can take one.
    pub fn next(&mut self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for &system in &self.ready {
            let lane = self.plan.lanes[system];
            if self.lane_busy[lane] {
                continue;
            }
            if self
                .running
                .iter()
                .any(|&other| self.plan.excluded[system][other])
            {
                continue;
            }
            let score: f64 = (0..self.plan.lane_count)
                .map(|l| self.plan.impacts[system][l] * self.priority(l))
                .sum();
            let better = match best {
                None => true,
                Some((current, current_score)) => {
                    score > current_score || (score == current_score && system < current)
                }
            };
            if better {
                best = Some((system, score));
            }
        }
        let (system, _) = best?;
        self.ready.retain(|&s| s != system);
        let lane = self.plan.lanes[system];
        self.lane_busy[lane] = true;
        self.ready_weight[lane] -= self.plan.weights[system];
        self.running_weight[lane] += self.plan.weights[system];
        self.running.push(system);
        Some(system)
    }

    /// Records a completion and enqueues whatever it unblocked.
    pub fn complete(&mut self, graph: &mut DependencyGraph, system: usize) {
        let lane = self.plan.lanes[system];
        self.lane_busy[lane] = false;
        self.running_weight[lane] -= self.plan.weights[system];
        self.running.retain(|&s| s != system);
        self.completed += 1;
        if let Some(unblocked) = graph.traverse(Some(system)) {
            for next in unblocked {
                self.enqueue(next);
            }
        }
    }

    pub fn lane_of(&self, system: usize) -> usize {
        self.plan.lanes[system]
    }

    pub fn is_done(&self) -> bool {
        self.completed == self.total
    }

    /// Whether anything is mid-flight.
    pub fn idle(&self) -> bool {
        self.running.is_empty()
    }
}
