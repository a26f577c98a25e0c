//! # Learning-Rate Schedules
//!
//! Every parameter gets its own learning-rate blob, computed each step from one
//! graph-wide iteration counter. The counter and the mutex guarding its increment are
//! created the first time any optimizer asks for a schedule on a graph and found by
//! name afterwards.

use super::OptimError;
use crate::graph::builder::expect_meta;
use crate::graph::{Argument, BlobRef, DataType, DeviceOption, GraphBuilder, OperatorDef};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Blob name of the shared iteration counter.
pub const ITERATION_NAME: &str = "optimizer_iteration";
/// Blob name of the mutex guarding [`ITERATION_NAME`].
pub const ITERATION_MUTEX_NAME: &str = "iteration_mutex";

// --- Policies ---

/// Maps the iteration count to a multiplier of the base learning rate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum LearningRatePolicy {
    /// Constant rate.
    #[default]
    Fixed,
    /// `gamma ^ floor(iter / stepsize)`
    Step { stepsize: i64, gamma: f32 },
    /// `gamma ^ iter`
    Exp { gamma: f32 },
    /// `(1 + gamma * iter) ^ -power`
    Inv { gamma: f32, power: f32 },
    /// `(1 - iter / max_iter) ^ power`, reaching zero at `max_iter`
    Poly { max_iter: i64, power: f32 },
    /// Ramps linearly from `start_multiplier` to 1 over the first `num_iter` iterations.
    #[serde(rename = "linearWarmup")]
    LinearWarmup { start_multiplier: f32, num_iter: i64 },
    /// `multiplier` for the first `num_iter` iterations, 1 afterwards.
    #[serde(rename = "constantWarmup")]
    ConstantWarmup { multiplier: f32, num_iter: i64 },
}

impl LearningRatePolicy {
    pub fn step(stepsize: i64, gamma: f32) -> Result<Self, OptimError> {
        Self::checked(LearningRatePolicy::Step { stepsize, gamma })
    }

    pub fn exp(gamma: f32) -> Result<Self, OptimError> {
        Self::checked(LearningRatePolicy::Exp { gamma })
    }

    pub fn inv(gamma: f32, power: f32) -> Result<Self, OptimError> {
        Self::checked(LearningRatePolicy::Inv { gamma, power })
    }

    pub fn poly(max_iter: i64, power: f32) -> Result<Self, OptimError> {
        Self::checked(LearningRatePolicy::Poly { max_iter, power })
    }

    pub fn linear_warmup(start_multiplier: f32, num_iter: i64) -> Result<Self, OptimError> {
        Self::checked(LearningRatePolicy::LinearWarmup {
            start_multiplier,
            num_iter,
        })
    }

    pub fn constant_warmup(multiplier: f32, num_iter: i64) -> Result<Self, OptimError> {
        Self::checked(LearningRatePolicy::ConstantWarmup {
            multiplier,
            num_iter,
        })
    }

    fn checked(policy: Self) -> Result<Self, OptimError> {
        policy.validate()?;
        Ok(policy)
    }

    /// Name carried by the `policy` argument of the LearningRate operator.
    pub fn name(&self) -> &'static str {
        match self {
            LearningRatePolicy::Fixed => "fixed",
            LearningRatePolicy::Step { .. } => "step",
            LearningRatePolicy::Exp { .. } => "exp",
            LearningRatePolicy::Inv { .. } => "inv",
            LearningRatePolicy::Poly { .. } => "poly",
            LearningRatePolicy::LinearWarmup { .. } => "linearWarmup",
            LearningRatePolicy::ConstantWarmup { .. } => "constantWarmup",
        }
    }

    pub fn validate(&self) -> Result<(), OptimError> {
        let invalid = |reason: &str| {
            Err(OptimError::InvalidPolicy {
                policy: self.name().to_string(),
                reason: reason.to_string(),
            })
        };
        match *self {
            LearningRatePolicy::Fixed => Ok(()),
            LearningRatePolicy::Step { stepsize, gamma } => {
                if stepsize <= 0 {
                    invalid("stepsize must be positive")
                } else if !(gamma.is_finite() && gamma > 0.0) {
                    invalid("gamma must be positive")
                } else {
                    Ok(())
                }
            }
            LearningRatePolicy::Exp { gamma } => {
                if !(gamma.is_finite() && gamma > 0.0) {
                    invalid("gamma must be positive")
                } else {
                    Ok(())
                }
            }
            LearningRatePolicy::Inv { gamma, power } => {
                if !(gamma.is_finite() && gamma > 0.0) {
                    invalid("gamma must be positive")
                } else if !(power.is_finite() && power > 0.0) {
                    invalid("power must be positive")
                } else {
                    Ok(())
                }
            }
            LearningRatePolicy::Poly { max_iter, power } => {
                if max_iter <= 0 {
                    invalid("max_iter must be positive")
                } else if !(power.is_finite() && power >= 0.0) {
                    invalid("power must be non-negative")
                } else {
                    Ok(())
                }
            }
            LearningRatePolicy::LinearWarmup {
                start_multiplier,
                num_iter,
            } => {
                if num_iter <= 0 {
                    invalid("num_iter must be positive")
                } else if !(0.0..=1.0).contains(&start_multiplier) {
                    invalid("start_multiplier must be in [0, 1]")
                } else {
                    Ok(())
                }
            }
            LearningRatePolicy::ConstantWarmup {
                multiplier,
                num_iter,
            } => {
                if num_iter <= 0 {
                    invalid("num_iter must be positive")
                } else if !(multiplier.is_finite() && multiplier >= 0.0) {
                    invalid("multiplier must be non-negative")
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Rate multiplier at iteration `iter`.
    pub fn multiplier(&self, iter: i64) -> f32 {
        let iter = iter.max(0);
        match *self {
            LearningRatePolicy::Fixed => 1.0,
            LearningRatePolicy::Step { stepsize, gamma } => {
                gamma.powf((iter / stepsize) as f32)
            }
            LearningRatePolicy::Exp { gamma } => gamma.powf(iter as f32),
            LearningRatePolicy::Inv { gamma, power } => (1.0 + gamma * iter as f32).powf(-power),
            LearningRatePolicy::Poly { max_iter, power } => {
                let progress = iter.min(max_iter) as f32 / max_iter as f32;
                (1.0 - progress).powf(power)
            }
            LearningRatePolicy::LinearWarmup {
                start_multiplier,
                num_iter,
            } => {
                if iter >= num_iter {
                    1.0
                } else {
                    start_multiplier + (1.0 - start_multiplier) * iter as f32 / num_iter as f32
                }
            }
            LearningRatePolicy::ConstantWarmup {
                multiplier,
                num_iter,
            } => {
                if iter >= num_iter {
                    1.0
                } else {
                    multiplier
                }
            }
        }
    }

    /// Operator attributes describing this policy.
    pub fn to_args(&self) -> Vec<(String, Argument)> {
        let mut args = vec![("policy".to_string(), Argument::from(self.name()))];
        let mut push = |name: &str, value: Argument| args.push((name.to_string(), value));
        match *self {
            LearningRatePolicy::Fixed => {}
            LearningRatePolicy::Step { stepsize, gamma } => {
                push("stepsize", Argument::Int(stepsize));
                push("gamma", Argument::Float(gamma));
            }
            LearningRatePolicy::Exp { gamma } => push("gamma", Argument::Float(gamma)),
            LearningRatePolicy::Inv { gamma, power } => {
                push("gamma", Argument::Float(gamma));
                push("power", Argument::Float(power));
            }
            LearningRatePolicy::Poly { max_iter, power } => {
                push("max_iter", Argument::Int(max_iter));
                push("power", Argument::Float(power));
            }
            LearningRatePolicy::LinearWarmup {
                start_multiplier,
                num_iter,
            } => {
                push("start_multiplier", Argument::Float(start_multiplier));
                push("num_iter", Argument::Int(num_iter));
            }
            LearningRatePolicy::ConstantWarmup {
                multiplier,
                num_iter,
            } => {
                push("multiplier", Argument::Float(multiplier));
                push("num_iter", Argument::Int(num_iter));
            }
        }
        args
    }

    /// Decodes a policy from LearningRate operator attributes.
    pub fn from_args(args: &BTreeMap<String, Argument>) -> Result<Self, OptimError> {
        let name = args
            .get("policy")
            .and_then(Argument::as_str)
            .unwrap_or("fixed");
        let missing = |arg: &str| OptimError::InvalidPolicy {
            policy: name.to_string(),
            reason: format!("missing or mistyped argument '{arg}'"),
        };
        let float = |arg: &str| {
            args.get(arg)
                .and_then(Argument::as_float)
                .ok_or_else(|| missing(arg))
        };
        let int = |arg: &str| {
            args.get(arg)
                .and_then(Argument::as_int)
                .ok_or_else(|| missing(arg))
        };

        let policy = match name {
            "fixed" => LearningRatePolicy::Fixed,
            "step" => LearningRatePolicy::Step {
                stepsize: int("stepsize")?,
                gamma: float("gamma")?,
            },
            "exp" => LearningRatePolicy::Exp {
                gamma: float("gamma")?,
            },
            "inv" => LearningRatePolicy::Inv {
                gamma: float("gamma")?,
                power: float("power")?,
            },
            "poly" => LearningRatePolicy::Poly {
                max_iter: int("max_iter")?,
                power: float("power")?,
            },
            "linearWarmup" => LearningRatePolicy::LinearWarmup {
                start_multiplier: float("start_multiplier")?,
                num_iter: int("num_iter")?,
            },
            "constantWarmup" => LearningRatePolicy::ConstantWarmup {
                multiplier: float("multiplier")?,
                num_iter: int("num_iter")?,
            },
            other => {
                return Err(OptimError::InvalidPolicy {
                    policy: other.to_string(),
                    reason: "unknown policy".to_string(),
                })
            }
        };
        policy.validate()?;
        Ok(policy)
    }
}

// --- Iteration State ---

/// Handles to the graph-wide step counter and the mutex its increment runs under.
#[derive(Debug, Clone)]
pub struct IterationState {
    pub counter: BlobRef,
    pub mutex: BlobRef,
}

impl IterationState {
    /// Returns the graph's iteration state, creating it on first use.
    ///
    /// Creation emits into the init net a CPU-pinned int64 counter of shape `[1]` filled
    /// with `iter_val` and a mutex, and into the step net one `AtomicIter` that bumps the
    /// counter under that mutex. Later calls only look the blobs up; `iter_val` is
    /// ignored then.
    pub fn get_or_create(graph: &mut GraphBuilder, iter_val: i64) -> Result<Self, OptimError> {
        if graph.blob_exists(ITERATION_NAME) {
            let counter = graph.get_blob(ITERATION_NAME)?;
            expect_meta(&counter, DataType::Int64, &[1])?;
            let mutex = graph.get_blob(ITERATION_MUTEX_NAME)?;
            expect_meta(&mutex, DataType::Mutex, &[])?;
            return Ok(IterationState { counter, mutex });
        }

        // Validate the mutex name up front so a collision leaves no half-built state.
        if graph.blob_exists(ITERATION_MUTEX_NAME) {
            let existing = graph.get_blob(ITERATION_MUTEX_NAME)?;
            expect_meta(&existing, DataType::Mutex, &[])?;
        }

        let counter = graph
            .emit_init(
                OperatorDef::new("ConstantFill")
                    .outputs([ITERATION_NAME])
                    .arg("shape", vec![1i64])
                    .arg("value", Argument::Int(iter_val))
                    .arg("dtype", DataType::Int64.code())
                    .device(DeviceOption::cpu()),
            )?
            .remove(0);
        let mutex = graph
            .emit_init(OperatorDef::new("CreateMutex").outputs([ITERATION_MUTEX_NAME]))?
            .remove(0);
        graph.emit_step(
            OperatorDef::new("AtomicIter")
                .inputs([&mutex, &counter])
                .outputs([ITERATION_NAME]),
        )?;
        debug!("created iteration counter '{ITERATION_NAME}' starting at {iter_val}");

        Ok(IterationState { counter, mutex })
    }
}

/// Builds the learning-rate blob `lr_blob` for one parameter.
///
/// The emitted rate is `policy(iter) * -base_rate`: updates are written as additions,
/// so descent needs a negative rate. No sign check happens here; callers decide what a
/// non-positive base rate means.
///
/// # Returns
/// * `(lr, iteration)` handles.
pub fn build_lr(
    graph: &mut GraphBuilder,
    base_rate: f32,
    lr_blob: &str,
    policy: &LearningRatePolicy,
    iter_val: i64,
) -> Result<(BlobRef, BlobRef), OptimError> {
    policy.validate()?;
    let iteration = IterationState::get_or_create(graph, iter_val)?.counter;

    let lr = graph
        .emit_step(
            OperatorDef::new("LearningRate")
                .inputs([&iteration])
                .outputs([lr_blob])
                .arg("base_lr", -base_rate)
                .args(policy.to_args()),
        )?
        .remove(0);
    Ok((lr, iteration))
}
