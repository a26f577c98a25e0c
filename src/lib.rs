//! # Graph Optimizer Construction Library
//!
//! This crate builds the training-update part of a dataflow graph. Given parameter
//! blobs and their (dense or sparse) gradients, an optimizer appends the operators that
//! compute a learning rate, maintain per-parameter state and apply the update.
//! It also ships a small reference executor for running the emitted nets on the CPU.

pub mod graph;
pub mod optim;
pub mod runtime;
pub mod utils;
