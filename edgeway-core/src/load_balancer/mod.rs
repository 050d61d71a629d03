//! Node selection strategies.

pub mod selector;
