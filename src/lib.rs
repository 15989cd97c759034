//! Bulk-synchronous-parallel, vertex-centric graph computation
//!
//! The engine lives in [`pregel`]; [`algorithms`] holds ready-made
//! computations built on it.

pub mod algorithms;
pub mod pregel;
