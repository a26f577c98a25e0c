//! # Stochastic Gradient Descent (SGD) Optimizer

use super::lr::{build_lr, LearningRatePolicy};
use super::{
    ensure_dense_shape, param_blob_name, scalar_constant, zeros_like, AuxParamRegistry, AuxParams,
    OptimError, Optimizer,
};
use crate::graph::{BlobRef, Gradient, GraphBuilder, OperatorDef};
use log::debug;
use serde::{Deserialize, Serialize};

/// Name of the shared constant-one blob used as a blending coefficient.
pub const ONE_NAME: &str = "ONE";

/// SGD hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    /// Base learning rate. A non-positive value disables the optimizer.
    pub base_learning_rate: f32,
    pub policy: LearningRatePolicy,
    /// Momentum factor; Nesterov momentum is used whenever it is positive.
    pub momentum: f32,
    /// Starting value of the iteration counter, if this optimizer creates it.
    pub iter_val: i64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        SgdConfig {
            base_learning_rate: 0.01,
            policy: LearningRatePolicy::Fixed,
            momentum: 0.0,
            iter_val: 0,
        }
    }
}

/// Plain or Nesterov-momentum SGD.
///
/// Dense update: `param = param + lr * grad` as a `WeightedSum` (lr is negative). With
/// momentum the gradient first goes through `MomentumSGD`, which folds the rate into
/// the buffer, so the final blend uses the constant one instead of lr. Sparse update:
/// `ScatterWeightedSum` over the touched rows, without deduplication.
#[derive(Debug)]
pub struct SgdOptimizer {
    config: SgdConfig,
    aux: AuxParamRegistry,
}

impl SgdOptimizer {
    /// Creates a new SGD optimizer.
    ///
    /// # Arguments
    /// * `config`: Hyperparameters. The policy is validated here; the base rate is not.
    pub fn new(config: SgdConfig) -> Result<Self, OptimError> {
        config.policy.validate()?;
        if !config.momentum.is_finite() || config.momentum < 0.0 {
            return Err(OptimError::InvalidHyperparameter {
                name: "momentum",
                reason: format!("must be finite and non-negative, got {}", config.momentum),
            });
        }
        Ok(SgdOptimizer {
            config,
            aux: AuxParamRegistry::new(),
        })
    }

    /// Simplified constructor with only a base rate.
    pub fn simple(base_learning_rate: f32) -> Result<Self, OptimError> {
        Self::new(SgdConfig {
            base_learning_rate,
            ..SgdConfig::default()
        })
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }
}

impl Optimizer for SgdOptimizer {
    fn apply(
        &self,
        graph: &mut GraphBuilder,
        param: &BlobRef,
        grad: &Gradient,
    ) -> Result<AuxParams, OptimError> {
        let config = &self.config;
        if config.base_learning_rate <= 0.0 {
            debug!("sgd disabled (base rate {}), skipping '{param}'", config.base_learning_rate);
            return Ok(AuxParams::default());
        }
        let use_momentum = config.momentum > 0.0;
        match grad {
            Gradient::Sparse(_) if use_momentum => {
                return Err(OptimError::SparseMomentum {
                    param: param.name().to_string(),
                })
            }
            Gradient::Dense(g) => ensure_dense_shape(param, g)?,
            Gradient::Sparse(_) => {}
        }

        let (lr, _) = build_lr(
            graph,
            config.base_learning_rate,
            &param_blob_name(param, "lr"),
            &config.policy,
            config.iter_val,
        )?;
        let one = scalar_constant(graph, ONE_NAME, 1.0)?;
        let mut local = Vec::new();

        match grad {
            Gradient::Sparse(slice) => {
                graph.emit_step(
                    OperatorDef::new("ScatterWeightedSum")
                        .inputs([param, &one, &slice.indices, &slice.values, &lr])
                        .outputs([param]),
                )?;
            }
            Gradient::Dense(g) => {
                let coeff = if use_momentum {
                    let momentum_data = zeros_like(graph, param, "momentum", &[])?;
                    graph.emit_step(
                        OperatorDef::new("MomentumSGD")
                            .inputs([g, &momentum_data, &lr])
                            .outputs([g, &momentum_data])
                            .arg("momentum", config.momentum)
                            .arg("nesterov", 1i64),
                    )?;
                    local.push(momentum_data);
                    &one
                } else {
                    &lr
                };
                graph.emit_step(
                    OperatorDef::new("WeightedSum")
                        .inputs([param, &one, g, coeff])
                        .outputs([param]),
                )?;
            }
        }

        Ok(self.aux.register(local, vec![one]))
    }

    fn auxiliary_parameters(&self) -> AuxParams {
        self.aux.snapshot()
    }
}
