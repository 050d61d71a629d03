//! The fleet roster: the set of enabled edge nodes.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::domain::node::{NodeRecord, NodeSpec, SharedNode};

/// A lock-free roster of edge nodes.
///
/// Uses `ArcSwap` so a reload publishes the complete replacement list with a
/// single store. Readers load a snapshot without taking a lock and never see
/// a partially built roster.
#[derive(Debug)]
pub struct Roster {
    nodes: ArcSwap<Vec<SharedNode>>,
}

impl Roster {
    /// Create a roster from configuration specs.
    pub fn new(specs: impl IntoIterator<Item = NodeSpec>) -> Self {
        Self {
            nodes: ArcSwap::from_pointee(build_nodes(specs)),
        }
    }

    /// Atomically replace every node. Health state is not carried over.
    ///
    /// Returns the number of nodes in the new roster.
    pub fn reload(&self, specs: impl IntoIterator<Item = NodeSpec>) -> usize {
        let nodes = build_nodes(specs);
        let len = nodes.len();
        self.nodes.store(Arc::new(nodes));
        len
    }

    /// Retrieve a snapshot of all current nodes.
    pub fn snapshot(&self) -> Arc<Vec<SharedNode>> {
        self.nodes.load_full()
    }

    /// The currently healthy nodes, in roster order.
    pub fn healthy(&self) -> Vec<SharedNode> {
        self.nodes
            .load()
            .iter()
            .filter(|n| n.is_healthy())
            .cloned()
            .collect()
    }

    /// Look a node up by name.
    pub fn get(&self, name: &str) -> Option<SharedNode> {
        self.nodes.load().iter().find(|n| n.name() == name).cloned()
    }

    /// The first node whose host matches a request's host header, ignoring ports.
    pub fn find_by_host(&self, request_host: &str) -> Option<SharedNode> {
        self.nodes
            .load()
            .iter()
            .find(|n| n.matches_host(request_host))
            .cloned()
    }

    /// Number of nodes in the roster.
    pub fn len(&self) -> usize {
        self.nodes.load().len()
    }

    /// Whether the roster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build fresh records for the enabled specs. A repeated name keeps its first
/// position and takes the last spec's contents.
fn build_nodes(specs: impl IntoIterator<Item = NodeSpec>) -> Vec<SharedNode> {
    let mut nodes: Vec<SharedNode> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for spec in specs.into_iter().filter(|s| s.enabled) {
        match positions.get(&spec.name) {
            Some(&idx) => {
                warn!(node = %spec.name, "duplicate node name in roster, last entry wins");
                nodes[idx] = Arc::new(NodeRecord::new(spec));
            }
            None => {
                positions.insert(spec.name.clone(), nodes.len());
                nodes.push(Arc::new(NodeRecord::new(spec)));
            }
        }
    }
    nodes
}

/// A shared reference to the lock-free roster.
pub type SharedRoster = Arc<Roster>;
