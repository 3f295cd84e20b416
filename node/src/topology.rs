//! # Simulated Topologies
//!
//! Edge lists for the shapes the simulator can wire a mesh into. Every
//! topology produced here is connected, so a flood from any node must reach
//! all others.

use std::collections::BTreeSet;

use clap::ValueEnum;
use rand::Rng;
use serde::Serialize;

/// Shape of a simulated mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Each node linked to the next, last back to first.
    Ring,
    /// A chain with no cycles.
    Line,
    /// Every pair linked.
    Full,
    /// A random spanning tree plus a few random chords.
    Random,
}

/// An undirected link as `(initiator, responder)` node indices.
pub type Edge = (usize, usize);

impl Topology {
    /// Edges for `nodes` nodes. `extra` only applies to [`Topology::Random`].
    pub fn edges(self, nodes: usize, extra: usize, rng: &mut impl Rng) -> Vec<Edge> {
        if nodes < 2 {
            return Vec::new();
        }
        match self {
            Topology::Line => (0..nodes - 1).map(|i| (i, i + 1)).collect(),
            Topology::Ring if nodes == 2 => vec![(0, 1)],
            Topology::Ring => (0..nodes).map(|i| (i, (i + 1) % nodes)).collect(),
            Topology::Full => (0..nodes)
                .flat_map(|i| (i + 1..nodes).map(move |j| (i, j)))
                .collect(),
            Topology::Random => random_edges(nodes, extra, rng),
        }
    }
}

fn random_edges(nodes: usize, extra: usize, rng: &mut impl Rng) -> Vec<Edge> {
    let mut seen = BTreeSet::new();
    let mut edges = Vec::new();

    for i in 1..nodes {
        let j = rng.gen_range(0..i);
        seen.insert((j, i));
        edges.push((j, i));
    }

    let max_edges = nodes * (nodes - 1) / 2;
    let wanted = (edges.len() + extra).min(max_edges);
    while edges.len() < wanted {
        let a = rng.gen_range(0..nodes);
        let b = rng.gen_range(0..nodes);
        if a == b {
            continue;
        }
        let key = (a.min(b), a.max(b));
        if seen.insert(key) {
            edges.push((a, b));
        }
    }
    edges
}

/// Number of links each node takes part in.
pub fn degrees(nodes: usize, edges: &[Edge]) -> Vec<usize> {
    let mut degree = vec![0; nodes];
    for &(a, b) in edges {
        degree[a] += 1;
        degree[b] += 1;
    }
    degree
}
