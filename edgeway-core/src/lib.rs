//! Edgeway Core functionality.
//!
//! This crate contains the fleet domain model, health hysteresis policy, node
//! selection and the TTL cache that power the Edgeway steering gateway. It does
//! no network I/O of its own; the engine crate drives it.

pub mod cache;
pub mod domain;
pub mod health;
pub mod load_balancer;
pub mod time;

pub use cache::{SweeperHandle, TtlCache};
pub use domain::node::{
    HealthTransition, NodeHealth, NodeRecord, NodeSpec, NodeStatus, ProbeOutcome, SharedNode,
};
pub use domain::roster::{Roster, SharedRoster};
pub use health::{HealthCheckPolicy, PolicyError};
pub use load_balancer::selector::Selector;
pub use time::{Clock, ManualClock, SystemClock};
