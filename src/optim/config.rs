//! # Optimizer Configuration
//!
//! Serde-friendly description of which optimizer to build and with what
//! hyperparameters, e.g. from a JSON training config:
//!
//! ```json
//! { "type": "adagrad", "alpha": 0.1, "sparse_dedup_aggregator": "sum" }
//! ```

use super::{
    AdagradConfig, AdagradOptimizer, AdamConfig, AdamOptimizer, FtrlConfig, FtrlOptimizer,
    OptimError, OptimizerStrategy, SgdConfig, SgdOptimizer,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Sgd(SgdConfig),
    Adagrad(AdagradConfig),
    Ftrl(FtrlConfig),
    Adam(AdamConfig),
}

impl OptimizerConfig {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerConfig::Sgd(_) => "sgd",
            OptimizerConfig::Adagrad(_) => "adagrad",
            OptimizerConfig::Ftrl(_) => "ftrl",
            OptimizerConfig::Adam(_) => "adam",
        }
    }

    /// Validates the hyperparameters and constructs the matching strategy.
    pub fn build(&self) -> Result<OptimizerStrategy, OptimError> {
        Ok(match self {
            OptimizerConfig::Sgd(c) => OptimizerStrategy::Sgd(SgdOptimizer::new(c.clone())?),
            OptimizerConfig::Adagrad(c) => {
                OptimizerStrategy::Adagrad(AdagradOptimizer::new(c.clone())?)
            }
            OptimizerConfig::Ftrl(c) => OptimizerStrategy::Ftrl(FtrlOptimizer::new(c.clone())?),
            OptimizerConfig::Adam(c) => OptimizerStrategy::Adam(AdamOptimizer::new(c.clone())?),
        })
    }
}
