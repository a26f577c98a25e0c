//! # FTRL-Proximal Optimizer

use super::dedup::{dedup_slice, DedupAggregator};
use super::{
    ensure_dense_shape, require_primitive, zeros_like, AuxParamRegistry, AuxParams, OptimError,
    Optimizer,
};
use crate::graph::{BlobRef, Gradient, GraphBuilder, OperatorDef};
use log::debug;
use serde::{Deserialize, Serialize};

/// FTRL hyperparameters. All four are handed to the update primitive unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FtrlConfig {
    /// Per-coordinate rate scale. A non-positive value disables the optimizer.
    pub alpha: f32,
    pub beta: f32,
    /// L1 regularization strength.
    pub lambda1: f32,
    /// L2 regularization strength.
    pub lambda2: f32,
    pub sparse_dedup_aggregator: Option<DedupAggregator>,
    pub engine: Option<String>,
}

impl Default for FtrlConfig {
    fn default() -> Self {
        FtrlConfig {
            alpha: 0.01,
            beta: 1e-4,
            lambda1: 0.0,
            lambda2: 0.0,
            sparse_dedup_aggregator: None,
            engine: None,
        }
    }
}

/// Follow-the-regularized-leader with per-coordinate rates.
///
/// State is one local blob, `{param}_ftrl_nz`, shaped `[param.., 2]`: the `(n, z)` pair of
/// every coordinate. The accumulated `n` sets the effective rate, so no learning-rate
/// schedule or iteration counter is built.
#[derive(Debug)]
pub struct FtrlOptimizer {
    config: FtrlConfig,
    aux: AuxParamRegistry,
}

impl FtrlOptimizer {
    pub fn new(config: FtrlConfig) -> Result<Self, OptimError> {
        for (name, value) in [
            ("beta", config.beta),
            ("lambda1", config.lambda1),
            ("lambda2", config.lambda2),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(OptimError::InvalidHyperparameter {
                    name,
                    reason: format!("must be finite and non-negative, got {value}"),
                });
            }
        }
        Ok(FtrlOptimizer {
            config,
            aux: AuxParamRegistry::new(),
        })
    }

    pub fn config(&self) -> &FtrlConfig {
        &self.config
    }
}

impl Optimizer for FtrlOptimizer {
    fn apply(
        &self,
        graph: &mut GraphBuilder,
        param: &BlobRef,
        grad: &Gradient,
    ) -> Result<AuxParams, OptimError> {
        let config = &self.config;
        if config.alpha <= 0.0 {
            debug!("ftrl disabled (alpha {}), skipping '{param}'", config.alpha);
            return Ok(AuxParams::default());
        }
        let engine = config.engine.as_deref();
        match grad {
            Gradient::Dense(g) => {
                ensure_dense_shape(param, g)?;
                require_primitive(graph, "Ftrl", engine)?;
            }
            Gradient::Sparse(_) => require_primitive(graph, "SparseFtrl", engine)?,
        }

        let nz = zeros_like(graph, param, "ftrl_nz", &[2])?;

        let op = match grad {
            Gradient::Dense(g) => OperatorDef::new("Ftrl").inputs([param, &nz, g]),
            Gradient::Sparse(slice) => {
                let slice = dedup_slice(graph, config.sparse_dedup_aggregator, slice)?;
                OperatorDef::new("SparseFtrl").inputs([param, &nz, &slice.indices, &slice.values])
            }
        };
        graph.emit_step(
            op.outputs([param, &nz])
                .engine(engine)
                .arg("alpha", config.alpha)
                .arg("beta", config.beta)
                .arg("lambda1", config.lambda1)
                .arg("lambda2", config.lambda2),
        )?;

        Ok(self.aux.register(vec![nz], Vec::new()))
    }

    fn auxiliary_parameters(&self) -> AuxParams {
        self.aux.snapshot()
    }
}
