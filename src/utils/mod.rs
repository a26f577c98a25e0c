//! # Utility Functions (`utils`)
//!
//! Provides helpers for persisting constructed graphs.

pub mod serialization;

pub use serialization::GraphSnapshot;
