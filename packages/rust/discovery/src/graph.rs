//! Domain dependency graph.
//!
//! An edge `A → B` means A's context references B, so B must finish
//! generation before A starts. Edges keep their insertion sequence so the
//! cycle pass can drop the most recently added edge of each cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use contextsync_shared::DomainId;
use tracing::warn;

/// One dependency edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: DomainId,
    pub to: DomainId,
    /// Insertion sequence, increasing.
    pub seq: u64,
}

/// Directed graph over domains. Acyclic once [`DependencyGraph::break_cycles`] ran.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeSet<DomainId>,
    edges: Vec<Edge>,
    next_seq: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, domain: DomainId) {
        self.nodes.insert(domain);
    }

    /// Add `from → to`. Self-edges and duplicates are ignored; returns whether
    /// the edge was added.
    pub fn add_edge(&mut self, from: DomainId, to: DomainId) -> bool {
        if from == to || self.has_edge(&from, &to) {
            return false;
        }
        self.nodes.insert(from.clone());
        self.nodes.insert(to.clone());
        self.edges.push(Edge {
            from,
            to,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        true
    }

    pub fn has_edge(&self, from: &DomainId, to: &DomainId) -> bool {
        self.edges.iter().any(|e| &e.from == from && &e.to == to)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DomainId> {
        self.nodes.iter()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Domains `domain` depends on, in edge insertion order.
    pub fn dependencies_of(&self, domain: &DomainId) -> Vec<DomainId> {
        self.edges
            .iter()
            .filter(|e| &e.from == domain)
            .map(|e| e.to.clone())
            .collect()
    }

    /// Domains that depend on `domain`.
    pub fn dependents_of(&self, domain: &DomainId) -> Vec<DomainId> {
        self.edges
            .iter()
            .filter(|e| &e.to == domain)
            .map(|e| e.from.clone())
            .collect()
    }

    /// Remove the newest edge of every cycle until the graph is acyclic.
    /// Returns one warning per removed edge.
    pub fn break_cycles(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        while let Some(cycle) = self.find_cycle() {
            let Some(&newest) = cycle.iter().max_by_key(|&&i| self.edges[i].seq) else {
                break;
            };
            let path = cycle_path(&self.edges, &cycle);
            let edge = self.edges.remove(newest);
            let message = format!(
                "dependency cycle {path}: dropped edge {} -> {}",
                edge.from, edge.to
            );
            warn!(from = %edge.from, to = %edge.to, "dropping dependency edge to break cycle");
            warnings.push(message);
        }
        warnings
    }

    pub fn is_acyclic(&self) -> bool {
        self.find_cycle().is_none()
    }

    /// Order in which domains may be generated: dependencies before
    /// dependents, ties broken by domain id.
    pub fn topological_order(&self) -> Vec<DomainId> {
        let mut pending: BTreeMap<&DomainId, usize> = self.nodes.iter().map(|n| (n, 0)).collect();
        for edge in &self.edges {
            *pending.entry(&edge.from).or_default() += 1;
        }

        let mut ready: VecDeque<&DomainId> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = ready.pop_front() {
            order.push(node.clone());
            let mut unblocked = Vec::new();
            for edge in self.edges.iter().filter(|e| &e.to == node) {
                if let Some(count) = pending.get_mut(&edge.from) {
                    *count -= 1;
                    if *count == 0 {
                        unblocked.push(&edge.from);
                    }
                }
            }
            unblocked.sort();
            ready.extend(unblocked);
        }
        order
    }

    /// Edge indices forming one cycle, if any.
    fn find_cycle(&self) -> Option<Vec<usize>> {
        let mut adjacency: BTreeMap<&DomainId, Vec<usize>> = BTreeMap::new();
        for (i, edge) in self.edges.iter().enumerate() {
            adjacency.entry(&edge.from).or_default().push(i);
        }

        let mut marks: HashMap<&DomainId, Mark> = HashMap::new();
        let mut path: Vec<usize> = Vec::new();
        for node in &self.nodes {
            if !marks.contains_key(node) {
                if let Some(cycle) = visit(node, &self.edges, &adjacency, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }
}

fn visit<'a>(
    node: &'a DomainId,
    edges: &'a [Edge],
    adjacency: &BTreeMap<&'a DomainId, Vec<usize>>,
    marks: &mut HashMap<&'a DomainId, Mark>,
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    marks.insert(node, Mark::InProgress);
    for &i in adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]) {
        let next = &edges[i].to;
        match marks.get(next) {
            Some(Mark::InProgress) => {
                let start = path
                    .iter()
                    .position(|&p| &edges[p].from == next)
                    .unwrap_or(path.len());
                let mut cycle = path[start..].to_vec();
                cycle.push(i);
                return Some(cycle);
            }
            Some(Mark::Done) => {}
            None => {
                path.push(i);
                if let Some(cycle) = visit(next, edges, adjacency, marks, path) {
                    return Some(cycle);
                }
                path.pop();
            }
        }
    }
    marks.insert(node, Mark::Done);
    None
}

/// Render a cycle as `A -> B -> C -> A` for warnings.
fn cycle_path(edges: &[Edge], cycle: &[usize]) -> String {
    let mut parts = Vec::with_capacity(cycle.len() + 1);
    if let Some(&first) = cycle.first() {
        parts.push(edges[first].from.to_string());
    }
    parts.extend(cycle.iter().map(|&i| edges[i].to.to_string()));
    parts.join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> DomainId {
        DomainId::new(s).unwrap()
    }

    #[test]
    fn ignores_self_and_duplicate_edges() {
        let mut g = DependencyGraph::new();
        assert!(!g.add_edge(d("A"), d("A")));
        assert!(g.add_edge(d("A"), d("B")));
        assert!(!g.add_edge(d("A"), d("B")));
        assert_eq!(g.edges().len(), 1);
        assert_eq!(g.dependencies_of(&d("A")), vec![d("B")]);
        assert_eq!(g.dependents_of(&d("B")), vec![d("A")]);
    }

    #[test]
    fn three_node_cycle_drops_newest_edge() {
        let mut g = DependencyGraph::new();
        g.add_edge(d("A"), d("B"));
        g.add_edge(d("B"), d("C"));
        g.add_edge(d("C"), d("A"));
        assert!(!g.is_acyclic());

        let warnings = g.break_cycles();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("dropped edge C -> A"), "{}", warnings[0]);
        assert!(g.is_acyclic());
        assert!(g.has_edge(&d("A"), &d("B")));
        assert!(g.has_edge(&d("B"), &d("C")));
        assert!(!g.has_edge(&d("C"), &d("A")));
    }

    #[test]
    fn overlapping_cycles_all_broken() {
        let mut g = DependencyGraph::new();
        g.add_edge(d("A"), d("B"));
        g.add_edge(d("B"), d("A"));
        g.add_edge(d("B"), d("C"));
        g.add_edge(d("C"), d("B"));
        let warnings = g.break_cycles();
        assert_eq!(warnings.len(), 2);
        assert!(g.is_acyclic());
        assert_eq!(g.edges().len(), 2);
    }

    #[test]
    fn topological_order_puts_dependencies_first() {
        let mut g = DependencyGraph::new();
        g.add_node(d("Z"));
        g.add_edge(d("A"), d("B"));
        g.add_edge(d("B"), d("C"));
        g.add_edge(d("A"), d("C"));
        let order = g.topological_order();
        let pos = |x: &str| order.iter().position(|n| n.as_str() == x).unwrap();
        assert_eq!(order.len(), 4);
        assert!(pos("C") < pos("B"));
        assert!(pos("B") < pos("A"));
    }
}
