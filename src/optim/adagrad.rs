//! # Adagrad Optimizer

use super::dedup::{dedup_slice, DedupAggregator};
use super::lr::{build_lr, LearningRatePolicy};
use super::{
    ensure_dense_shape, param_blob_name, require_primitive, zeros_like, AuxParamRegistry,
    AuxParams, OptimError, Optimizer,
};
use crate::graph::{BlobRef, Gradient, GraphBuilder, OperatorDef};
use log::debug;
use serde::{Deserialize, Serialize};

/// Adagrad hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdagradConfig {
    /// Base learning rate. A non-positive value disables the optimizer.
    pub alpha: f32,
    /// Term added to the denominator to improve numerical stability.
    pub epsilon: f32,
    pub policy: LearningRatePolicy,
    pub sparse_dedup_aggregator: Option<DedupAggregator>,
    /// Engine tag for the update primitives; `None` selects the default implementation.
    pub engine: Option<String>,
    pub iter_val: i64,
}

impl Default for AdagradConfig {
    fn default() -> Self {
        AdagradConfig {
            alpha: 0.01,
            epsilon: 1e-4,
            policy: LearningRatePolicy::Fixed,
            sparse_dedup_aggregator: None,
            engine: None,
            iter_val: 0,
        }
    }
}

/// Implements the Adagrad algorithm.
/// Reference: Adaptive Subgradient Methods for Online Learning and Stochastic Optimization -
/// http://jmlr.org/papers/v12/duchi11a.html
///
/// Keeps one local auxiliary blob per parameter, `{param}_squared_sum`, the running sum
/// of squared gradients.
#[derive(Debug)]
pub struct AdagradOptimizer {
    config: AdagradConfig,
    aux: AuxParamRegistry,
}

impl AdagradOptimizer {
    pub fn new(config: AdagradConfig) -> Result<Self, OptimError> {
        config.policy.validate()?;
        if !config.epsilon.is_finite() || config.epsilon < 0.0 {
            return Err(OptimError::InvalidHyperparameter {
                name: "epsilon",
                reason: format!("must be finite and non-negative, got {}", config.epsilon),
            });
        }
        Ok(AdagradOptimizer {
            config,
            aux: AuxParamRegistry::new(),
        })
    }

    pub fn config(&self) -> &AdagradConfig {
        &self.config
    }
}

impl Optimizer for AdagradOptimizer {
    fn apply(
        &self,
        graph: &mut GraphBuilder,
        param: &BlobRef,
        grad: &Gradient,
    ) -> Result<AuxParams, OptimError> {
        let config = &self.config;
        if config.alpha <= 0.0 {
            debug!("adagrad disabled (alpha {}), skipping '{param}'", config.alpha);
            return Ok(AuxParams::default());
        }
        let engine = config.engine.as_deref();
        match grad {
            Gradient::Dense(g) => {
                ensure_dense_shape(param, g)?;
                require_primitive(graph, "Adagrad", engine)?;
            }
            Gradient::Sparse(_) => require_primitive(graph, "SparseAdagrad", engine)?,
        }

        let (lr, _) = build_lr(
            graph,
            config.alpha,
            &param_blob_name(param, "lr"),
            &config.policy,
            config.iter_val,
        )?;
        let squared_sum = zeros_like(graph, param, "squared_sum", &[])?;

        let op = match grad {
            Gradient::Dense(g) => OperatorDef::new("Adagrad").inputs([param, &squared_sum, g, &lr]),
            Gradient::Sparse(slice) => {
                let slice = dedup_slice(graph, config.sparse_dedup_aggregator, slice)?;
                OperatorDef::new("SparseAdagrad").inputs([
                    param,
                    &squared_sum,
                    &slice.indices,
                    &slice.values,
                    &lr,
                ])
            }
        };
        graph.emit_step(
            op.outputs([param, &squared_sum])
                .arg("epsilon", config.epsilon)
                .engine(engine),
        )?;

        Ok(self.aux.register(vec![squared_sum], Vec::new()))
    }

    fn auxiliary_parameters(&self) -> AuxParams {
        self.aux.snapshot()
    }
}
