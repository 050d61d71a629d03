//! Load Balancing Selector logic

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::node::SharedNode;
use crate::domain::roster::SharedRoster;

/// Picks a healthy node for each request.
///
/// Selection is weighted random: every call is an independent draw, so short
/// runs may stray from the weight ratio but large volumes converge on it.
#[derive(Debug)]
pub struct Selector {
    roster: SharedRoster,
    counter: AtomicU64,
}

impl Selector {
    /// Create a selector over the given roster.
    pub fn new(roster: SharedRoster) -> Self {
        Self {
            roster,
            counter: AtomicU64::new(0),
        }
    }

    /// Select a healthy node by weighted random draw.
    ///
    /// Falls back to round robin when every healthy node has weight zero.
    pub fn select_node(&self) -> Option<SharedNode> {
        let nodes = self.roster.healthy();
        if nodes.is_empty() {
            return None;
        }

        let total_weight: u64 = nodes.iter().map(|n| u64::from(n.weight())).sum();
        if total_weight == 0 {
            return self.pick_round_robin(&nodes);
        }

        let mut r = rand::thread_rng().gen_range(0..total_weight) as i64;
        for node in &nodes {
            r -= i64::from(node.weight());
            if r < 0 {
                return Some(node.clone());
            }
        }
        nodes.first().cloned()
    }

    /// Select the next healthy node in rotation.
    pub fn select_node_round_robin(&self) -> Option<SharedNode> {
        let nodes = self.roster.healthy();
        self.pick_round_robin(&nodes)
    }

    fn pick_round_robin(&self, nodes: &[SharedNode]) -> Option<SharedNode> {
        if nodes.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % nodes.len() as u64;
        nodes.get(idx as usize).cloned()
    }
}
