//! # Graph Serialization Utilities
//!
//! Saving and loading a constructed pair of nets (initialization and step).
//! Uses `serde` for serialization and `bincode` as the binary format. Only the graph
//! description is stored, not tensor values.

use crate::graph::{GraphBuilder, NetDef};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

// --- Error Type ---
#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization Error (Bincode): {0}")]
    Bincode(#[from] bincode::Error),
}

/// The two nets a graph builder produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub init_net: NetDef,
    pub net: NetDef,
}

impl GraphSnapshot {
    pub fn from_builder(graph: &GraphBuilder) -> Self {
        GraphSnapshot {
            init_net: graph.init_net().clone(),
            net: graph.net().clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Writes the snapshot to `path`, replacing any existing file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SerializationError> {
        let file = File::create(path.as_ref())?;
        let writer = BufWriter::new(file);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SerializationError> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        Ok(bincode::deserialize_from(reader)?)
    }
}
