//! Node capacity registry.
//!
//! When limiters run on several service nodes, a central registry tracks
//! each node's admission capacity and lets a starved node borrow capacity
//! from a peer. This module fixes only the collaborator surface plus an
//! in-memory implementation; a production deployment would back the same
//! trait with a shared store such as redis or etcd.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Capacity record for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Address the node is reachable at; the registry key.
    pub addr: String,
    /// Admission capacity currently assigned to the node.
    pub cap: i64,
    /// Capacity the node has left unassigned.
    pub available: i64,
}

/// Central registry of per-node capacity.
pub trait NodeRegistry: Send + Sync {
    /// Registers a node, replacing any previous record for its address.
    /// Returns whether the registration was accepted.
    fn initial(&self, info: NodeInfo) -> bool;

    /// Returns the records of every registered node.
    fn all_nodes(&self) -> Vec<NodeInfo>;

    /// Moves `cap` capacity from the lender `from` to the node `addr`.
    ///
    /// All-or-nothing: fails without any change unless the lender holds at
    /// least `cap`. The transfer is atomic with respect to both records.
    fn borrow(&self, addr: &str, from: &str, cap: i64) -> bool;

    /// Capacity assigned to `addr`, or `-1` if the node is unknown.
    fn get_cap(&self, addr: &str) -> i64;

    /// Overwrites the capacity of `addr`. Returns `false` if the node is
    /// unknown.
    fn set_cap(&self, addr: &str, cap: i64) -> bool;
}

/// A [`NodeRegistry`] held entirely in process memory.
///
/// One mutex guards the whole table, which is what makes `borrow` atomic
/// across the lender and the borrower.
#[derive(Debug, Default)]
pub struct MemoryNodeRegistry {
    nodes: Mutex<HashMap<String, NodeInfo>>,
}

impl MemoryNodeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeRegistry for MemoryNodeRegistry {
    fn initial(&self, info: NodeInfo) -> bool {
        let mut nodes = self.nodes.lock();
        let _ = nodes.insert(info.addr.clone(), info);
        true
    }

    fn all_nodes(&self) -> Vec<NodeInfo> {
        self.nodes.lock().values().cloned().collect()
    }

    fn borrow(&self, addr: &str, from: &str, cap: i64) -> bool {
        let mut nodes = self.nodes.lock();
        let borrower_cap = match nodes.get(addr) {
            Some(node) => node.cap,
            None => return false,
        };
        let lender_cap = match nodes.get(from) {
            Some(node) => node.cap,
            None => return false,
        };
        if lender_cap < cap {
            return false;
        }
        if let Some(node) = nodes.get_mut(addr) {
            node.cap = borrower_cap + cap;
        }
        if let Some(node) = nodes.get_mut(from) {
            node.cap = lender_cap - cap;
        }
        true
    }

    fn get_cap(&self, addr: &str) -> i64 {
        self.nodes.lock().get(addr).map_or(-1, |node| node.cap)
    }

    fn set_cap(&self, addr: &str, cap: i64) -> bool {
        match self.nodes.lock().get_mut(addr) {
            Some(node) => {
                node.cap = cap;
                true
            }
            None => false,
        }
    }
}
