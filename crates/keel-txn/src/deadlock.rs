//! Deadlock detection over the wait-for graph.
//!
//! Every transaction about to block records the owners it waits for.
//! Before it blocks, the owner chain is walked: if the chain cycles
//! back to the waiter, the acquisition refuses with a deadlock error
//! naming the transactions involved. The last transaction to close a
//! cycle is always the one still awake, so checking at wait-start
//! catches every cycle.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use keel_common::types::TxnId;

/// The wait-for graph: which owners each blocked transaction waits for.
#[derive(Debug, Default)]
pub struct WaitGraph {
    edges: Mutex<HashMap<TxnId, Vec<TxnId>>>,
}

impl WaitGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically checks for a cycle and, if none exists, records that
    /// `waiter` is blocked on `owners`.
    ///
    /// Returns the cycle (waiter first) if recording would close one.
    pub fn check_and_wait(&self, waiter: TxnId, owners: &[TxnId]) -> Result<(), Vec<TxnId>> {
        let mut edges = self.edges.lock();
        if let Some(mut cycle) = find_cycle(&edges, waiter, owners) {
            cycle.insert(0, waiter);
            debug!(?cycle, "deadlock detected");
            return Err(cycle);
        }
        edges.insert(waiter, owners.to_vec());
        Ok(())
    }

    /// Updates the owners a blocked transaction waits for.
    pub fn update(&self, waiter: TxnId, owners: &[TxnId]) {
        self.edges.lock().insert(waiter, owners.to_vec());
    }

    /// Removes a transaction from the graph once it stops waiting.
    pub fn clear(&self, waiter: TxnId) {
        self.edges.lock().remove(&waiter);
    }
}

/// Walks the owner chain from `owners`, returning the path back to
/// `start` if one exists.
fn find_cycle(
    edges: &HashMap<TxnId, Vec<TxnId>>,
    start: TxnId,
    owners: &[TxnId],
) -> Option<Vec<TxnId>> {
    let mut path = Vec::new();
    let mut visited = std::collections::HashSet::new();
    for &owner in owners {
        if walk(edges, start, owner, &mut path, &mut visited) {
            path.reverse();
            return Some(path);
        }
    }
    None
}

fn walk(
    edges: &HashMap<TxnId, Vec<TxnId>>,
    start: TxnId,
    current: TxnId,
    path: &mut Vec<TxnId>,
    visited: &mut std::collections::HashSet<TxnId>,
) -> bool {
    if current == start {
        return true;
    }
    if !visited.insert(current) {
        return false;
    }
    if let Some(next) = edges.get(&current) {
        for &owner in next {
            if walk(edges, start, owner, path, visited) {
                path.push(current);
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cycle() {
        let graph = WaitGraph::new();
        assert!(graph
            .check_and_wait(TxnId::new(1), &[TxnId::new(2)])
            .is_ok());
        assert!(graph
            .check_and_wait(TxnId::new(2), &[TxnId::new(3)])
            .is_ok());
    }

    #[test]
    fn test_two_party_cycle() {
        let graph = WaitGraph::new();
        graph
            .check_and_wait(TxnId::new(1), &[TxnId::new(2)])
            .unwrap();
        let cycle = graph
            .check_and_wait(TxnId::new(2), &[TxnId::new(1)])
            .unwrap_err();
        assert_eq!(cycle, vec![TxnId::new(2), TxnId::new(1)]);
    }

    #[test]
    fn test_three_party_cycle() {
        let graph = WaitGraph::new();
        graph
            .check_and_wait(TxnId::new(1), &[TxnId::new(2)])
            .unwrap();
        graph
            .check_and_wait(TxnId::new(2), &[TxnId::new(3)])
            .unwrap();
        let cycle = graph
            .check_and_wait(TxnId::new(3), &[TxnId::new(1)])
            .unwrap_err();
        assert_eq!(
            cycle,
            vec![TxnId::new(3), TxnId::new(1), TxnId::new(2)]
        );
    }

    #[test]
    fn test_clear_breaks_cycle() {
        let graph = WaitGraph::new();
        graph
            .check_and_wait(TxnId::new(1), &[TxnId::new(2)])
            .unwrap();
        graph.clear(TxnId::new(1));
        assert!(graph
            .check_and_wait(TxnId::new(2), &[TxnId::new(1)])
            .is_ok());
    }
}
