//! Fleet domain models.

pub mod node;
pub mod roster;
