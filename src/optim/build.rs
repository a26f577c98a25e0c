//! # Driver Entry Points
//!
//! Convenience functions that construct an optimizer and apply it to every
//! (parameter, gradient) pair a model exposes.

use super::{
    AdagradConfig, AdagradOptimizer, AdamConfig, AdamOptimizer, FtrlConfig, FtrlOptimizer,
    OptimError, Optimizer, OptimizerConfig, OptimizerStrategy, SgdConfig, SgdOptimizer,
};
use crate::graph::registry::SIMD_ENGINE;
use crate::graph::{BlobRef, Gradient, GraphBuilder};
use log::info;

/// What the build functions need from a model: its graph and its trainable pairs.
pub trait OptimizationModel {
    fn graph(&self) -> &GraphBuilder;

    fn graph_mut(&mut self) -> &mut GraphBuilder;

    /// (parameter, gradient) pairs in a stable order. With `parameters` set, only those
    /// parameters are returned.
    fn optimization_pairs(&self, parameters: Option<&[BlobRef]>) -> Vec<(BlobRef, Gradient)>;
}

/// Applies `optimizer` to the selected pairs of `model`, in order.
pub fn apply_to_model<M, O>(
    model: &mut M,
    optimizer: &O,
    parameters: Option<&[BlobRef]>,
) -> Result<(), OptimError>
where
    M: OptimizationModel + ?Sized,
    O: Optimizer + ?Sized,
{
    let pairs = model.optimization_pairs(parameters);
    let graph = model.graph_mut();
    for (param, grad) in &pairs {
        optimizer.apply(graph, param, grad)?;
    }
    let aux = optimizer.auxiliary_parameters();
    info!(
        "optimizer applied to {} parameters ({} local, {} shared auxiliary blobs)",
        pairs.len(),
        aux.local.len(),
        aux.shared.len()
    );
    Ok(())
}

pub fn build_sgd<M: OptimizationModel + ?Sized>(
    model: &mut M,
    base_learning_rate: f32,
    config: SgdConfig,
) -> Result<SgdOptimizer, OptimError> {
    let optimizer = SgdOptimizer::new(SgdConfig {
        base_learning_rate,
        ..config
    })?;
    apply_to_model(model, &optimizer, None)?;
    Ok(optimizer)
}

/// Builds FTRL on `engine`. For the `SIMD` engine both the dense and sparse primitives
/// must be available before anything is emitted.
pub fn build_ftrl<M: OptimizationModel + ?Sized>(
    model: &mut M,
    engine: &str,
    config: FtrlConfig,
) -> Result<FtrlOptimizer, OptimError> {
    if engine == SIMD_ENGINE {
        let registry = model.graph().registry();
        for op in ["Ftrl", "SparseFtrl"] {
            registry.require(op, Some(engine))?;
        }
    }
    let optimizer = FtrlOptimizer::new(FtrlConfig {
        engine: Some(engine.to_string()).filter(|e| !e.is_empty()),
        ..config
    })?;
    apply_to_model(model, &optimizer, None)?;
    Ok(optimizer)
}

/// Builds Adagrad, optionally for a subset of the model's parameters.
pub fn build_adagrad<M: OptimizationModel + ?Sized>(
    model: &mut M,
    base_learning_rate: f32,
    parameters: Option<&[BlobRef]>,
    config: AdagradConfig,
) -> Result<AdagradOptimizer, OptimError> {
    let optimizer = AdagradOptimizer::new(AdagradConfig {
        alpha: base_learning_rate,
        ..config
    })?;
    apply_to_model(model, &optimizer, parameters)?;
    Ok(optimizer)
}

pub fn build_adam<M: OptimizationModel + ?Sized>(
    model: &mut M,
    base_learning_rate: f32,
    config: AdamConfig,
) -> Result<AdamOptimizer, OptimError> {
    let optimizer = AdamOptimizer::new(AdamConfig {
        alpha: base_learning_rate,
        ..config
    })?;
    apply_to_model(model, &optimizer, None)?;
    Ok(optimizer)
}

/// Builds whichever optimizer `config` describes and applies it to every pair.
pub fn build_optimizer<M: OptimizationModel + ?Sized>(
    model: &mut M,
    config: &OptimizerConfig,
) -> Result<OptimizerStrategy, OptimError> {
    let optimizer = config.build()?;
    info!("building {} optimizer", optimizer.name());
    apply_to_model(model, &optimizer, None)?;
    Ok(optimizer)
}
