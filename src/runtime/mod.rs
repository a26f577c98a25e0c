//! # Reference Executor (`runtime`)
//!
//! A small CPU interpreter for the nets the optimizers emit. It runs each operator in
//! order against a [`Workspace`] of named blobs, using straightforward kernels for the
//! optimizer primitives. It exists to check the numeric meaning of a constructed graph,
//! not to be fast.

use crate::graph::NetDef;
use crate::optim::OptimError;
use log::trace;
use ndarray::ArrayD;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

mod kernels;

// --- Error Handling ---
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("Blob '{0}' does not exist in the workspace")]
    MissingBlob(String),
    #[error("Blob '{name}' holds {got}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("Operator '{op}': {detail}")]
    ShapeMismatch { op: String, detail: String },
    #[error("Operator '{op}': index {index} out of range for {rows} rows")]
    IndexOutOfRange { op: String, index: i64, rows: usize },
    #[error("Operator '{op}' is missing input or output slot {slot}")]
    MissingSlot { op: String, slot: usize },
    #[error("Operator '{op}' has a missing or invalid argument '{arg}'")]
    InvalidArgument { op: String, arg: String },
    #[error("No kernel for operator '{0}'")]
    UnsupportedOperator(String),
    #[error(transparent)]
    Policy(#[from] OptimError),
    #[error("ndarray error: {0}")]
    Ndarray(#[from] ndarray::ShapeError),
}

/// A value stored in the workspace.
#[derive(Debug, Clone)]
pub enum Blob {
    Float(ArrayD<f32>),
    Int(ArrayD<i64>),
    Mutex(Arc<Mutex<()>>),
}

impl Blob {
    fn kind(&self) -> &'static str {
        match self {
            Blob::Float(_) => "float tensor",
            Blob::Int(_) => "int tensor",
            Blob::Mutex(_) => "mutex",
        }
    }
}

/// Named blob storage that nets are executed against.
#[derive(Debug, Default)]
pub struct Workspace {
    blobs: HashMap<String, Blob>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_blob(&self, name: &str) -> bool {
        self.blobs.contains_key(name)
    }

    pub fn blob(&self, name: &str) -> Option<&Blob> {
        self.blobs.get(name)
    }

    pub fn feed_float(&mut self, name: &str, value: ArrayD<f32>) {
        self.set(name, Blob::Float(value));
    }

    pub fn feed_int(&mut self, name: &str, value: ArrayD<i64>) {
        self.set(name, Blob::Int(value));
    }

    pub fn fetch_float(&self, name: &str) -> Result<&ArrayD<f32>, RuntimeError> {
        match self.get(name)? {
            Blob::Float(a) => Ok(a),
            other => Err(type_mismatch(name, "float tensor", other)),
        }
    }

    pub fn fetch_int(&self, name: &str) -> Result<&ArrayD<i64>, RuntimeError> {
        match self.get(name)? {
            Blob::Int(a) => Ok(a),
            other => Err(type_mismatch(name, "int tensor", other)),
        }
    }

    /// Runs every operator of `net` in order. Stops at the first failing operator;
    /// blobs written by earlier operators keep their new values.
    pub fn run_net(&mut self, net: &NetDef) -> Result<(), RuntimeError> {
        for op in &net.ops {
            trace!("run {} [{}]", op.op_type, op.inputs.join(", "));
            kernels::run_operator(self, op)?;
        }
        Ok(())
    }

    fn get(&self, name: &str) -> Result<&Blob, RuntimeError> {
        self.blobs
            .get(name)
            .ok_or_else(|| RuntimeError::MissingBlob(name.to_string()))
    }

    fn set(&mut self, name: &str, blob: Blob) {
        self.blobs.insert(name.to_string(), blob);
    }

    fn mutex(&self, name: &str) -> Result<Arc<Mutex<()>>, RuntimeError> {
        match self.get(name)? {
            Blob::Mutex(m) => Ok(Arc::clone(m)),
            other => Err(type_mismatch(name, "mutex", other)),
        }
    }

    fn shape_of(&self, name: &str) -> Result<Vec<usize>, RuntimeError> {
        match self.get(name)? {
            Blob::Float(a) => Ok(a.shape().to_vec()),
            Blob::Int(a) => Ok(a.shape().to_vec()),
            other => Err(type_mismatch(name, "tensor", other)),
        }
    }
}

fn type_mismatch(name: &str, expected: &'static str, got: &Blob) -> RuntimeError {
    RuntimeError::TypeMismatch {
        name: name.to_string(),
        expected,
        got: got.kind(),
    }
}
