//! # Graph Builder
//!
//! Append-only construction of the init and step nets. The builder doubles as the
//! per-graph blob registry: every blob name maps to exactly one [`BlobRef`], which is how
//! graph-wide singletons (the iteration counter, shared constants) are found again.

use super::{BlobMeta, BlobRef, DataType, GraphError, NetDef, OperatorDef, OperatorRegistry};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Init,
    Step,
}

/// # GraphBuilder
///
/// Collects operator descriptors for two streams: the initialization net, run once,
/// and the step net, run every training step.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    init_net: NetDef,
    net: NetDef,
    blobs: HashMap<String, BlobRef>,
    registry: Arc<OperatorRegistry>,
}

impl GraphBuilder {
    /// Creates an empty graph backed by the default operator registry.
    pub fn new(name: &str) -> Self {
        Self::with_registry(name, Arc::new(OperatorRegistry::with_defaults()))
    }

    pub fn with_registry(name: &str, registry: Arc<OperatorRegistry>) -> Self {
        GraphBuilder {
            init_net: NetDef::new(format!("{name}_init")),
            net: NetDef::new(name),
            blobs: HashMap::new(),
            registry,
        }
    }

    pub fn registry(&self) -> &OperatorRegistry {
        &self.registry
    }

    /// Registers a float parameter owned by the surrounding model.
    pub fn declare_parameter(
        &mut self,
        name: &str,
        shape: &[usize],
    ) -> Result<BlobRef, GraphError> {
        self.declare_blob(name, BlobMeta::float(shape))
    }

    /// Registers an externally provided blob (parameter, gradient, input).
    ///
    /// Declaring an existing name again returns the existing handle if the descriptions
    /// are compatible.
    pub fn declare_blob(&mut self, name: &str, meta: BlobMeta) -> Result<BlobRef, GraphError> {
        self.resolve_output(name, meta)
    }

    pub fn blob_exists(&self, name: &str) -> bool {
        self.blobs.contains_key(name)
    }

    pub fn get_blob(&self, name: &str) -> Result<BlobRef, GraphError> {
        self.blobs
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownBlob(name.to_string()))
    }

    /// Appends `op` to the initialization net and returns handles to its outputs.
    pub fn emit_init(&mut self, op: OperatorDef) -> Result<Vec<BlobRef>, GraphError> {
        self.emit(Stream::Init, op)
    }

    /// Appends `op` to the step net and returns handles to its outputs.
    pub fn emit_step(&mut self, op: OperatorDef) -> Result<Vec<BlobRef>, GraphError> {
        self.emit(Stream::Step, op)
    }

    pub fn init_net(&self) -> &NetDef {
        &self.init_net
    }

    pub fn net(&self) -> &NetDef {
        &self.net
    }

    /// Total number of operators emitted into both streams.
    pub fn num_ops(&self) -> usize {
        self.init_net.len() + self.net.len()
    }

    pub fn into_nets(self) -> (NetDef, NetDef) {
        (self.init_net, self.net)
    }

    fn emit(&mut self, stream: Stream, op: OperatorDef) -> Result<Vec<BlobRef>, GraphError> {
        let schema = self.registry.require(&op.op_type, op.engine.as_deref())?;

        let inputs = op
            .inputs
            .iter()
            .map(|name| self.get_blob(name))
            .collect::<Result<Vec<_>, _>>()?;
        let metas = schema.infer_outputs(&op, &inputs)?;

        // Resolve every output before touching the blob table so a failing op leaves
        // the graph unchanged.
        for (name, meta) in op.outputs.iter().zip(&metas) {
            if let Some(existing) = self.blobs.get(name) {
                check_compatible(existing, meta)?;
            }
        }
        let outputs = op
            .outputs
            .iter()
            .zip(metas)
            .map(|(name, meta)| self.resolve_output(name, meta))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "emit {:?} op {} [{}] -> [{}]",
            stream,
            op.op_type,
            op.inputs.join(", "),
            op.outputs.join(", ")
        );
        match stream {
            Stream::Init => self.init_net.ops.push(op),
            Stream::Step => self.net.ops.push(op),
        }
        Ok(outputs)
    }

    fn resolve_output(&mut self, name: &str, meta: BlobMeta) -> Result<BlobRef, GraphError> {
        if let Some(existing) = self.blobs.get(name) {
            check_compatible(existing, &meta)?;
            return Ok(existing.clone());
        }
        let blob = BlobRef::new(name, meta);
        self.blobs.insert(name.to_string(), blob.clone());
        Ok(blob)
    }
}

fn check_compatible(existing: &BlobRef, requested: &BlobMeta) -> Result<(), GraphError> {
    if existing.meta().is_compatible(requested) {
        Ok(())
    } else {
        Err(GraphError::BlobCollision {
            name: existing.name().to_string(),
            existing: existing.meta().clone(),
            requested: requested.clone(),
        })
    }
}

/// Checks that `blob` has exactly the given type and shape.
pub(crate) fn expect_meta(
    blob: &BlobRef,
    dtype: DataType,
    shape: &[usize],
) -> Result<(), GraphError> {
    if blob.dtype() == dtype && blob.shape() == Some(shape) {
        Ok(())
    } else {
        Err(GraphError::BlobCollision {
            name: blob.name().to_string(),
            existing: blob.meta().clone(),
            requested: BlobMeta::new(dtype, Some(shape.to_vec())),
        })
    }
}
