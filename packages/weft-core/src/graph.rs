//! The system dependency graph.
//!
//! A directed graph without self-loops and with at most one edge per vertex
//! pair. Edges carry positive weights (priority of the constraint that
//! created them); a denial edge has negative weight and only serves to
//! suppress weaker edges in either direction; it is not an edge for
//! ordering purposes.
//!
//! Sealing derives all-pairs bottleneck paths, rejects cycles, transitively
//! reduces implied edges, and seeds the frontier traversal used by the
//! execution plans.

use crate::error::{CheckError, Result};

pub struct DependencyGraph {
    n: usize,
    names: Vec<String>,
    weights: Vec<i32>,
    /// Bottleneck width of the strongest path, zero when unreachable.
    reach: Vec<i32>,
    in_degree: Vec<u32>,
    counters: Vec<i64>,
    remaining: usize,
    started: bool,
    sealed: bool,
}

impl DependencyGraph {
    pub fn new(names: Vec<String>) -> Self {
        let n = names.len();
        Self {
            n,
            names,
            weights: vec![0; n * n],
            reach: vec![0; n * n],
            in_degree: vec![0; n],
            counters: vec![0; n],
            remaining: n,
            started: false,
            sealed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    #[inline]
    fn at(&self, a: usize, b: usize) -> usize {
        a * self.n + b
    }

    /// Installs an edge under the stronger-weight-wins rule: the weaker of
    /// the two directions yields, and a weaker request than what is already
    /// present in either direction is ignored.
    pub fn set_edge(&mut self, a: usize, b: usize, weight: i32) {
        debug_assert!(!self.sealed);
        if a == b || weight == 0 {
            return;
        }
        let forward = self.weights[self.at(a, b)];
        let backward = self.weights[self.at(b, a)];
        let strongest = forward.abs().max(backward.abs());
        if weight.abs() < strongest {
            return;
        }
        let idx_ab = self.at(a, b);
        self.weights[idx_ab] = weight;
        if backward.abs() < weight.abs() {
            let idx_ba = self.at(b, a);
            self.weights[idx_ba] = 0;
        }
    }

    /// An ordering edge `a -> b` with positive priority.
    pub fn add_edge(&mut self, a: usize, b: usize, weight: i32) {
        debug_assert!(weight > 0);
        self.set_edge(a, b, weight);
    }

    /// A denial: suppresses weaker ordering edges between `a` and `b`.
    pub fn deny_edge(&mut self, a: usize, b: usize, weight: i32) {
        debug_assert!(weight > 0);
        self.set_edge(a, b, -weight);
    }

    pub fn has_edge(&self, a: usize, b: usize) -> bool {
        self.weights[self.at(a, b)] > 0
    }

    pub fn edge_weight(&self, a: usize, b: usize) -> i32 {
        self.weights[self.at(a, b)]
    }

    /// Whether a directed path `a -> ... -> b` exists in the sealed graph.
    pub fn reachable(&self, a: usize, b: usize) -> bool {
        self.reach[self.at(a, b)] > 0
    }

    pub fn successors(&self, a: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.n).filter(move |&b| self.has_edge(a, b))
    }

    pub fn in_degree(&self, v: usize) -> u32 {
        self.in_degree[v]
    }

    /// Seals the graph: bottleneck all-pairs paths, cycle rejection,
    /// transitive reduction, and in-degree counts.
    pub fn seal(&mut self) -> Result<()> {
        debug_assert!(!self.sealed);
        let n = self.n;

        // Widest-path Floyd-Warshall: a path's width is its minimum edge
        // weight, and the strongest width wins per pair.
        for a in 0..n {
            for b in 0..n {
                let idx_ab = self.at(a, b);
                let w = self.weights[idx_ab];
                self.reach[idx_ab] = w.max(0);
            }
        }
        for k in 0..n {
            for a in 0..n {
                if self.reach[self.at(a, k)] == 0 {
                    continue;
                }
                for b in 0..n {
                    let idx_ab = self.at(a, b);
                    let through = self.reach[self.at(a, k)].min(self.reach[self.at(k, b)]);
                    if through > 0 && through > self.reach[idx_ab] {
                        self.reach[idx_ab] = through;
                    }
                }
            }
        }

        // A vertex that reaches itself sits on a cycle. Vertices on the
        // same cycle reach each other, which groups them into strongly
        // connected components; every elementary cycle lies inside one,
        // so the error must cover them all, disjoint ones included.
        let cyclic: Vec<usize> = (0..n).filter(|&v| self.reach[self.at(v, v)] > 0).collect();
        if !cyclic.is_empty() {
            let mut systems = Vec::new();
            let mut grouped = vec![false; n];
            for &seed in &cyclic {
                if grouped[seed] {
                    continue;
                }
                for &v in &cyclic {
                    if self.reach[self.at(seed, v)] > 0 && self.reach[self.at(v, seed)] > 0 {
                        grouped[v] = true;
                        systems.push(self.names[v].clone());
                    }
                }
            }
            return Err(CheckError::PrecedenceCycle { systems }.into());
        }

        // Transitive reduction: a direct edge implied by an equally strong
        // or stronger two-hop-or-longer path is dropped.
        for a in 0..n {
            for b in 0..n {
                let w = self.weights[self.at(a, b)];
                if w <= 0 {
                    continue;
                }
                let implied = (0..n).any(|k| {
                    k != a
                        && k != b
                        && self.reach[self.at(a, k)] >= w
                        && self.reach[self.at(k, b)] >= w
                });
                if implied {
                    let idx_ab = self.at(a, b);
                    self.weights[idx_ab] = 0;
                }
            }
        }

        self.in_degree = vec![0; n];
        for a in 0..n {
            for b in 0..n {
                if self.weights[self.at(a, b)] > 0 {
                    self.in_degree[b] += 1;
                }
            }
        }
        self.sealed = true;
        tracing::debug!(vertices = n, "dependency graph sealed");
        Ok(())
    }

    /// Frontier traversal. The first call (no completion) initialises the
    /// per-vertex counters from the in-degrees and returns every vertex
    /// with none outstanding; later calls record a completion and return
    /// the vertices it newly unblocked. Returns `None` once every vertex
    /// has completed.
    pub fn traverse(&mut self, completed: Option<usize>) -> Option<Vec<usize>> {
        debug_assert!(self.sealed);
        match completed {
            None => {
                self.started = true;
                self.remaining = self.n;
                for v in 0..self.n {
                    self.counters[v] = self.in_degree[v] as i64;
                }
                Some((0..self.n).filter(|&v| self.counters[v] == 0).collect())
            }
            Some(vertex) => {
                debug_assert!(self.started);
                self.remaining -= 1;
                if self.remaining == 0 {
                    return None;
                }
                let mut unblocked = Vec::new();
                for succ in 0..self.n {
                    if self.weights[self.at(vertex, succ)] > 0 {
                        self.counters[succ] -= 1;
                        if self.counters[succ] == 0 {
                            unblocked.push(succ);
                        }
                    }
                }
                Some(unblocked)
            }
        }
    }

    /// A deterministic topological order (lowest vertex index first among
    /// the ready set), without disturbing traversal state.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut counters: Vec<i64> = self.in_degree.iter().map(|&d| d as i64).collect();
        let mut order = Vec::with_capacity(self.n);
        let mut done = vec![false; self.n];
        while order.len() < self.n {
            let next = (0..self.n)
                .find(|&v| !done[v] && counters[v] == 0)
                .expect("sealed graphs are acyclic");
            done[next] = true;
            order.push(next);
            for succ in 0..self.n {
                if self.weights[self.at(next, succ)] > 0 {
                    counters[succ] -= 1;
                }
            }
        }
        order
    }

    pub fn name(&self, v: usize) -> &str {
        &self.names[v]
    }
}
