//! Wait-for graph, kept purely as a diagnostic: deadlocks are
//! prevented by a global timeout, not by cycle detection, so this
//! never gates a `ww_dependency` call — it only records who is waiting
//! on whom so a `TIMED_OUT` error can report the blocking chain, and
//! so tests and `ptctl` can dump suspected-stuck transactions.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

/// Tracks "transaction A is waiting on transaction B" edges purely for
/// diagnostics; never consulted to decide whether to block.
#[derive(Default)]
pub struct WaitForGraph {
    graph: Mutex<HashMap<i64, HashSet<i64>>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&self, waiter: i64, owner: i64) {
        self.graph.lock().entry(waiter).or_insert_with(HashSet::new).insert(owner);
    }

    pub fn remove_edge(&self, waiter: i64, owner: i64) {
        if let Some(owners) = self.graph.lock().get_mut(&waiter) {
            owners.remove(&owner);
        }
    }

    pub fn remove_transaction(&self, ts: i64) {
        let mut graph = self.graph.lock();
        graph.remove(&ts);
        for owners in graph.values_mut() {
            owners.remove(&ts);
        }
    }

    /// Returns true if `waiter` is (transitively) blocked behind
    /// itself — informational only; a global wait timeout is what
    /// actually breaks such a cycle.
    pub fn exists_cycle(&self) -> bool {
        let graph = self.graph.lock();
        let mut visited = HashSet::new();
        for &ts in graph.keys() {
            let mut stack = HashSet::new();
            if Self::is_cyclic(&graph, ts, &mut visited, &mut stack) {
                return true;
            }
        }
        false
    }

    fn is_cyclic(
        graph: &HashMap<i64, HashSet<i64>>,
        ts: i64,
        visited: &mut HashSet<i64>,
        stack: &mut HashSet<i64>,
    ) -> bool {
        if !visited.contains(&ts) {
            visited.insert(ts);
            stack.insert(ts);
            if let Some(owners) = graph.get(&ts) {
                for &owner in owners {
                    if (!visited.contains(&owner) && Self::is_cyclic(graph, owner, visited, stack))
                        || stack.contains(&owner)
                    {
                        return true;
                    }
                }
            }
        }
        stack.remove(&ts);
        false
    }

    /// Human-readable blocking chain starting at `waiter`, used to
    /// enrich a `Timeout` error's message.
    pub fn describe_chain(&self, waiter: i64) -> String {
        let graph = self.graph.lock();
        match graph.get(&waiter) {
            Some(owners) if !owners.is_empty() => {
                let mut names: Vec<String> = owners.iter().map(|o| o.to_string()).collect();
                names.sort();
                format!("tx {} waiting on {}", waiter, names.join(", "))
            }
            _ => format!("tx {} waiting on no known owner", waiter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_and_clears_edges() {
        let graph = WaitForGraph::new();
        graph.add_edge(1, 2);
        assert_eq!(graph.describe_chain(1), "tx 1 waiting on 2");
        graph.remove_edge(1, 2);
        assert_eq!(graph.describe_chain(1), "tx 1 waiting on no known owner");
    }

    #[test]
    fn detects_cycle_for_diagnostics_only() {
        let graph = WaitForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);
        assert!(graph.exists_cycle());
    }

    #[test]
    fn remove_transaction_clears_all_references() {
        let graph = WaitForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(3, 2);
        graph.remove_transaction(2);
        assert_eq!(graph.describe_chain(1), "tx 1 waiting on no known owner");
        assert_eq!(graph.describe_chain(3), "tx 3 waiting on no known owner");
    }
}
