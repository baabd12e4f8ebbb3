//! Accepting connections and keeping count of them.

pub mod listener;
pub mod stats;
