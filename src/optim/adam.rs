//! # Adam Optimizer

use super::dedup::{dedup_slice, DedupAggregator};
use super::lr::{build_lr, LearningRatePolicy};
use super::{
    ensure_dense_shape, param_blob_name, require_primitive, zeros_like, AuxParamRegistry,
    AuxParams, OptimError, Optimizer,
};
use crate::graph::{BlobRef, Gradient, GraphBuilder, OperatorDef};
use log::debug;
use serde::{Deserialize, Serialize};

/// Adam hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    /// Base learning rate. A non-positive value disables the optimizer.
    pub alpha: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub policy: LearningRatePolicy,
    pub sparse_dedup_aggregator: Option<DedupAggregator>,
    pub engine: Option<String>,
    pub iter_val: i64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig {
            alpha: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            policy: LearningRatePolicy::Fixed,
            sparse_dedup_aggregator: None,
            engine: None,
            iter_val: 0,
        }
    }
}

/// Implements the Adam algorithm.
/// Reference: Adam: A Method for Stochastic Optimization - https://arxiv.org/abs/1412.6980
///
/// Local state per parameter: `{param}_first_moment` and `{param}_second_moment`. The
/// update primitive reads the current iteration for bias correction, so the shared
/// iteration counter is exposed as a shared auxiliary parameter.
#[derive(Debug)]
pub struct AdamOptimizer {
    config: AdamConfig,
    aux: AuxParamRegistry,
}

impl AdamOptimizer {
    pub fn new(config: AdamConfig) -> Result<Self, OptimError> {
        config.policy.validate()?;
        for (name, beta) in [("beta1", config.beta1), ("beta2", config.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(OptimError::InvalidHyperparameter {
                    name,
                    reason: format!("must be in [0, 1), got {beta}"),
                });
            }
        }
        if !config.epsilon.is_finite() || config.epsilon < 0.0 {
            return Err(OptimError::InvalidHyperparameter {
                name: "epsilon",
                reason: format!("must be finite and non-negative, got {}", config.epsilon),
            });
        }
        Ok(AdamOptimizer {
            config,
            aux: AuxParamRegistry::new(),
        })
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }
}

impl Optimizer for AdamOptimizer {
    fn apply(
        &self,
        graph: &mut GraphBuilder,
        param: &BlobRef,
        grad: &Gradient,
    ) -> Result<AuxParams, OptimError> {
        let config = &self.config;
        if config.alpha <= 0.0 {
            debug!("adam disabled (alpha {}), skipping '{param}'", config.alpha);
            return Ok(AuxParams::default());
        }
        let engine = config.engine.as_deref();
        match grad {
            Gradient::Dense(g) => {
                ensure_dense_shape(param, g)?;
                require_primitive(graph, "Adam", engine)?;
            }
            Gradient::Sparse(_) => require_primitive(graph, "SparseAdam", engine)?,
        }

        let (lr, iteration) = build_lr(
            graph,
            config.alpha,
            &param_blob_name(param, "lr"),
            &config.policy,
            config.iter_val,
        )?;
        let m1 = zeros_like(graph, param, "first_moment", &[])?;
        let m2 = zeros_like(graph, param, "second_moment", &[])?;

        let op = match grad {
            Gradient::Dense(g) => {
                OperatorDef::new("Adam").inputs([param, &m1, &m2, g, &lr, &iteration])
            }
            Gradient::Sparse(slice) => {
                let slice = dedup_slice(graph, config.sparse_dedup_aggregator, slice)?;
                OperatorDef::new("SparseAdam").inputs([
                    param,
                    &m1,
                    &m2,
                    &slice.indices,
                    &slice.values,
                    &lr,
                    &iteration,
                ])
            }
        };
        graph.emit_step(
            op.outputs([param, &m1, &m2])
                .engine(engine)
                .arg("beta1", config.beta1)
                .arg("beta2", config.beta2)
                .arg("epsilon", config.epsilon),
        )?;

        Ok(self.aux.register(vec![m1, m2], vec![iteration]))
    }

    fn auxiliary_parameters(&self) -> AuxParams {
        self.aux.snapshot()
    }
}
