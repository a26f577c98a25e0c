//! # Optimization Algorithms (`optim`)
//!
//! Builds the update subgraph for each trainable parameter: a learning-rate schedule fed
//! by the graph-wide iteration counter, the auxiliary state an algorithm keeps between
//! steps, and the primitive update operator for a dense or sparse gradient.

use crate::graph::{BlobRef, DataType, Gradient, GraphBuilder, GraphError, OperatorDef};

// --- Submodules ---
pub mod adagrad;
pub mod adam;
pub mod aux_params;
pub mod build;
pub mod config;
pub mod dedup;
pub mod ftrl;
pub mod lr;
pub mod sgd;

// Re-export optimizers
pub use adagrad::{AdagradConfig, AdagradOptimizer};
pub use adam::{AdamConfig, AdamOptimizer};
pub use aux_params::{AuxParamRegistry, AuxParams};
pub use build::{
    apply_to_model, build_adagrad, build_adam, build_ftrl, build_optimizer, build_sgd,
    OptimizationModel,
};
pub use config::OptimizerConfig;
pub use dedup::{dedup, DedupAggregator};
pub use ftrl::{FtrlConfig, FtrlOptimizer};
pub use lr::{build_lr, IterationState, LearningRatePolicy};
pub use sgd::{SgdConfig, SgdOptimizer};

// --- Error Handling ---
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum OptimError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("Momentum is not supported for sparse gradients (parameter '{param}')")]
    SparseMomentum { param: String },
    #[error("Deduplication requires a sparse gradient, got dense gradient '{grad}'")]
    DenseDedup { grad: String },
    #[error("Gradient '{grad}' has shape {got:?} but parameter '{param}' has shape {expected:?}")]
    GradientShapeMismatch {
        param: String,
        grad: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Invalid learning rate policy '{policy}': {reason}")]
    InvalidPolicy { policy: String, reason: String },
    #[error("Invalid hyperparameter '{name}': {reason}")]
    InvalidHyperparameter { name: &'static str, reason: String },
}

// --- Optimizer Trait ---

/// Common contract of every update strategy.
///
/// Implementations hold immutable hyperparameters plus the auxiliary-parameter registry
/// they accumulate into, so a single instance can be shared across threads that each
/// drive their own graph.
pub trait Optimizer: Send + Sync {
    /// Emits the update subgraph for `param` into `graph`.
    ///
    /// # Returns
    /// * The auxiliary handles registered by this call. Empty when the optimizer is
    ///   disabled by a non-positive base rate, in which case nothing is emitted.
    fn apply(
        &self,
        graph: &mut GraphBuilder,
        param: &BlobRef,
        grad: &Gradient,
    ) -> Result<AuxParams, OptimError>;

    /// Snapshot of every auxiliary handle registered so far, in registration order.
    fn auxiliary_parameters(&self) -> AuxParams;
}

/// Closed set of update strategies.
#[derive(Debug)]
pub enum OptimizerStrategy {
    Sgd(SgdOptimizer),
    Adagrad(AdagradOptimizer),
    Ftrl(FtrlOptimizer),
    Adam(AdamOptimizer),
}

impl OptimizerStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerStrategy::Sgd(_) => "sgd",
            OptimizerStrategy::Adagrad(_) => "adagrad",
            OptimizerStrategy::Ftrl(_) => "ftrl",
            OptimizerStrategy::Adam(_) => "adam",
        }
    }
}

impl Optimizer for OptimizerStrategy {
    fn apply(
        &self,
        graph: &mut GraphBuilder,
        param: &BlobRef,
        grad: &Gradient,
    ) -> Result<AuxParams, OptimError> {
        match self {
            OptimizerStrategy::Sgd(o) => o.apply(graph, param, grad),
            OptimizerStrategy::Adagrad(o) => o.apply(graph, param, grad),
            OptimizerStrategy::Ftrl(o) => o.apply(graph, param, grad),
            OptimizerStrategy::Adam(o) => o.apply(graph, param, grad),
        }
    }

    fn auxiliary_parameters(&self) -> AuxParams {
        match self {
            OptimizerStrategy::Sgd(o) => o.auxiliary_parameters(),
            OptimizerStrategy::Adagrad(o) => o.auxiliary_parameters(),
            OptimizerStrategy::Ftrl(o) => o.auxiliary_parameters(),
            OptimizerStrategy::Adam(o) => o.auxiliary_parameters(),
        }
    }
}

// --- Shared helpers ---

/// Name of a per-parameter blob, e.g. `w_squared_sum` for `w`.
pub(crate) fn param_blob_name(param: &BlobRef, suffix: &str) -> String {
    format!("{}_{}", param.name(), suffix)
}

/// Emits a zero-initialized blob shaped like `param` (plus `extra_shape`).
pub(crate) fn zeros_like(
    graph: &mut GraphBuilder,
    param: &BlobRef,
    suffix: &str,
    extra_shape: &[i64],
) -> Result<BlobRef, OptimError> {
    let mut op = OperatorDef::new("ConstantFill")
        .inputs([param])
        .outputs([param_blob_name(param, suffix)])
        .arg("value", 0.0f32);
    if !extra_shape.is_empty() {
        op = op.arg("extra_shape", extra_shape.to_vec());
    }
    Ok(graph.emit_init(op)?.remove(0))
}

/// Emits (or finds) a graph-wide scalar float constant.
pub(crate) fn scalar_constant(
    graph: &mut GraphBuilder,
    name: &str,
    value: f32,
) -> Result<BlobRef, OptimError> {
    if graph.blob_exists(name) {
        let blob = graph.get_blob(name)?;
        crate::graph::builder::expect_meta(&blob, DataType::Float, &[1])?;
        return Ok(blob);
    }
    let op = OperatorDef::new("ConstantFill")
        .outputs([name])
        .arg("shape", vec![1i64])
        .arg("value", value);
    Ok(graph.emit_init(op)?.remove(0))
}

/// Rejects dense gradients whose known shape differs from the parameter's.
pub(crate) fn ensure_dense_shape(param: &BlobRef, grad: &BlobRef) -> Result<(), OptimError> {
    match (param.shape(), grad.shape()) {
        (Some(expected), Some(got)) if expected != got => Err(OptimError::GradientShapeMismatch {
            param: param.name().to_string(),
            grad: grad.name().to_string(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }),
        _ => Ok(()),
    }
}

/// Fails fast when `op` has no implementation for `engine`, before anything is emitted.
pub(crate) fn require_primitive(
    graph: &GraphBuilder,
    op: &str,
    engine: Option<&str>,
) -> Result<(), OptimError> {
    graph.registry().require(op, engine)?;
    Ok(())
}
