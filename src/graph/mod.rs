//! # Operator Graph (`graph`)
//!
//! Append-only description of a computation graph: operator descriptors grouped into an
//! initialization net (run once) and a step net (run every training step), plus the blob
//! table that tracks every named value the graph produces or consumes.

use serde::{Deserialize, Serialize};
use std::fmt;

// --- Submodules ---
pub mod blob;
pub mod builder;
pub mod net;
pub mod registry;

// --- Re-exports ---
pub use blob::{BlobMeta, BlobRef, Gradient, GradientSlice};
pub use builder::GraphBuilder;
pub use net::{Argument, NetDef, OperatorDef};
pub use registry::{Arity, OperatorRegistry, OperatorSchema, OutputInference};

// --- Error Handling ---
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Blob '{name}' already exists as {existing}, cannot redefine it as {requested}")]
    BlobCollision {
        name: String,
        existing: BlobMeta,
        requested: BlobMeta,
    },
    #[error("Unknown blob '{0}'")]
    UnknownBlob(String),
    #[error("Operator '{op}' is not registered for engine '{engine}'")]
    MissingPrimitive { op: String, engine: String },
    #[error("Operator '{op}' expects {expected} {slot}, got {got}")]
    ArityMismatch {
        op: String,
        slot: &'static str,
        expected: Arity,
        got: usize,
    },
    #[error("Operator '{op}' has an invalid argument '{arg}': {reason}")]
    InvalidArgument {
        op: String,
        arg: String,
        reason: String,
    },
}

// --- Element Types ---

/// Element type of a blob.
///
/// `Mutex` blobs hold a mutual-exclusion handle instead of numeric data. `Unknown` is used
/// when an operator's output type cannot be inferred at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Float,
    Int32,
    Int64,
    Mutex,
    Unknown,
}

impl DataType {
    /// Stable integer code, used for the `dtype` argument of fill operators.
    pub fn code(self) -> i64 {
        match self {
            DataType::Float => 1,
            DataType::Int32 => 2,
            DataType::Int64 => 10,
            DataType::Mutex => 100,
            DataType::Unknown => 0,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(DataType::Float),
            2 => Some(DataType::Int32),
            10 => Some(DataType::Int64),
            100 => Some(DataType::Mutex),
            0 => Some(DataType::Unknown),
            _ => None,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DataType::Int32 | DataType::Int64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Float => "float",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Mutex => "mutex",
            DataType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

// --- Device Placement ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceType {
    #[default]
    Cpu,
    Accelerator(u32),
}

/// Placement hint attached to an operator. Operators without one inherit the placement
/// chosen by whoever executes the net.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DeviceOption {
    pub device_type: DeviceType,
}

impl DeviceOption {
    pub fn cpu() -> Self {
        DeviceOption {
            device_type: DeviceType::Cpu,
        }
    }

    pub fn accelerator(id: u32) -> Self {
        DeviceOption {
            device_type: DeviceType::Accelerator(id),
        }
    }
}
