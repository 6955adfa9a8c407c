use std::collections::{BTreeMap, BTreeSet};

use crate::common::types::TxnId;

/// Wait-for graph over transactions: an edge `a -> b` means `a` is blocked
/// on a lock `b` holds. Ordered containers keep traversal deterministic.
#[derive(Debug, Default)]
pub struct WaitsForGraph {
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

impl WaitsForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, from: TxnId, to: TxnId) {
        self.edges.entry(from).or_default().insert(to);
    }

    pub fn remove_edge(&mut self, from: TxnId, to: TxnId) {
        if let Some(targets) = self.edges.get_mut(&from) {
            targets.remove(&to);
            if targets.is_empty() {
                self.edges.remove(&from);
            }
        }
    }

    /// Drop a transaction and every edge touching it.
    pub fn remove_txn(&mut self, txn_id: TxnId) {
        self.edges.remove(&txn_id);
        for targets in self.edges.values_mut() {
            targets.remove(&txn_id);
        }
        self.edges.retain(|_, targets| !targets.is_empty());
    }

    /// All edges, sorted, for inspection.
    pub fn edges(&self) -> Vec<(TxnId, TxnId)> {
        self.edges
            .iter()
            .flat_map(|(&from, targets)| targets.iter().map(move |&to| (from, to)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Find a cycle by depth-first search starting from the lowest txn id
    /// and exploring neighbors in ascending order. Returns the youngest
    /// (highest-id) transaction in the first cycle found.
    pub fn has_cycle(&self) -> Option<TxnId> {
        let mut finished = BTreeSet::new();
        for &start in self.edges.keys() {
            if finished.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = BTreeSet::new();
            if let Some(victim) = self.dfs(start, &mut finished, &mut path, &mut on_path) {
                return Some(victim);
            }
        }
        None
    }

    fn dfs(
        &self,
        node: TxnId,
        finished: &mut BTreeSet<TxnId>,
        path: &mut Vec<TxnId>,
        on_path: &mut BTreeSet<TxnId>,
    ) -> Option<TxnId> {
        path.push(node);
        on_path.insert(node);

        if let Some(targets) = self.edges.get(&node) {
            for &next in targets {
                if on_path.contains(&next) {
                    // Back edge: the cycle is the path suffix from `next`.
                    let start = path.iter().position(|&p| p == next).unwrap();
                    return path[start..].iter().copied().max();
                }
                if !finished.contains(&next) {
                    if let Some(victim) = self.dfs(next, finished, path, on_path) {
                        return Some(victim);
                    }
                }
            }
        }

        path.pop();
        on_path.remove(&node);
        finished.insert(node);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cycle() {
        let mut graph = WaitsForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);
        graph.add_edge(1, 3);
        assert_eq!(graph.has_cycle(), None);
    }

    #[test]
    fn test_two_txn_cycle_picks_youngest() {
        let mut graph = WaitsForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);
        assert_eq!(graph.has_cycle(), Some(2));
    }

    #[test]
    fn test_longer_cycle() {
        let mut graph = WaitsForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 5);
        graph.add_edge(5, 3);
        graph.add_edge(3, 1);
        assert_eq!(graph.has_cycle(), Some(5));
    }

    #[test]
    fn test_cycle_resolution_by_removal() {
        let mut graph = WaitsForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);
        graph.add_edge(3, 4);
        graph.add_edge(4, 3);

        let first = graph.has_cycle().unwrap();
        assert_eq!(first, 2);
        graph.remove_txn(first);

        let second = graph.has_cycle().unwrap();
        assert_eq!(second, 4);
        graph.remove_txn(second);

        assert_eq!(graph.has_cycle(), None);
    }

    #[test]
    fn test_remove_edge() {
        let mut graph = WaitsForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);
        graph.remove_edge(2, 1);
        assert_eq!(graph.has_cycle(), None);
        assert_eq!(graph.edges(), vec![(1, 2)]);
    }

    #[test]
    fn test_self_loop_not_possible_but_handled() {
        let mut graph = WaitsForGraph::new();
        graph.add_edge(7, 7);
        assert_eq!(graph.has_cycle(), Some(7));
    }
}
