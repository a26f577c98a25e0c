mod common;

use common::TestModel;
use graph_optim::graph::registry::SIMD_ENGINE;
use graph_optim::graph::{Argument, BlobMeta, BlobRef, GraphBuilder, GraphError, OperatorRegistry};
use graph_optim::optim::lr::{ITERATION_MUTEX_NAME, ITERATION_NAME};
use graph_optim::optim::{
    build_adagrad, build_adam, build_ftrl, build_optimizer, build_sgd, AdagradConfig,
    AdagradOptimizer, AdamConfig, AdamOptimizer, DedupAggregator, FtrlConfig, FtrlOptimizer,
    OptimError, Optimizer, OptimizerConfig, OptimizerStrategy, SgdConfig, SgdOptimizer,
};
use std::sync::Arc;

fn adagrad(alpha: f32) -> AdagradOptimizer {
    AdagradOptimizer::new(AdagradConfig {
        alpha,
        ..AdagradConfig::default()
    })
    .unwrap()
}

fn all_strategies(rate: f32) -> Vec<OptimizerStrategy> {
    vec![
        OptimizerStrategy::Sgd(SgdOptimizer::simple(rate).unwrap()),
        OptimizerStrategy::Adagrad(adagrad(rate)),
        OptimizerStrategy::Ftrl(
            FtrlOptimizer::new(FtrlConfig {
                alpha: rate,
                ..FtrlConfig::default()
            })
            .unwrap(),
        ),
        OptimizerStrategy::Adam(
            AdamOptimizer::new(AdamConfig {
                alpha: rate,
                ..AdamConfig::default()
            })
            .unwrap(),
        ),
    ]
}

#[test]
fn adagrad_dense_parameter_end_to_end() {
    let mut model = TestModel::new();
    let p = model.dense("p", &[4]);
    let grad = model.gradient(&p);
    let optimizer = adagrad(0.1);

    let added = optimizer.apply(&mut model.graph, &p, &grad).unwrap();
    assert_eq!(added.local_names(), vec!["p_squared_sum"]);
    assert!(added.shared.is_empty());

    let squared_sum = &added.local[0];
    assert_eq!(squared_sum.shape(), Some(&[4usize][..]));
    let fill = model
        .graph
        .init_net()
        .ops
        .iter()
        .find(|op| op.outputs == ["p_squared_sum"])
        .unwrap();
    assert_eq!(fill.op_type, "ConstantFill");
    assert_eq!(fill.get_arg("value").and_then(Argument::as_float), Some(0.0));

    assert!(model.graph.blob_exists("p_lr"));
    assert_eq!(model.graph.init_net().ops_of_type("CreateMutex").count(), 1);
    let counters: Vec<_> = model
        .graph
        .init_net()
        .ops
        .iter()
        .filter(|op| op.outputs == [ITERATION_NAME])
        .collect();
    assert_eq!(counters.len(), 1);

    let updates: Vec<_> = model.graph.net().ops_of_type("Adagrad").collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].inputs, ["p", "p_squared_sum", "p_grad", "p_lr"]);
    assert_eq!(updates[0].outputs, ["p", "p_squared_sum"]);
    assert_eq!(updates[0].get_arg("epsilon").and_then(Argument::as_float), Some(1e-4));

    let lr_op = model.graph.net().ops_of_type("LearningRate").next().unwrap();
    assert_eq!(lr_op.get_arg("base_lr").and_then(Argument::as_float), Some(-0.1));
    assert_eq!(lr_op.inputs, [ITERATION_NAME]);
}

#[test]
fn adam_parameters_share_one_counter() {
    let mut model = TestModel::new();
    let a = model.dense("a", &[2, 3]);
    let b = model.dense("b", &[5]);
    let optimizer = AdamOptimizer::new(AdamConfig::default()).unwrap();

    let first = model.apply(&optimizer, &a).unwrap();
    let second = model.apply(&optimizer, &b).unwrap();
    assert_eq!(first.shared_names(), vec![ITERATION_NAME]);
    assert_eq!(second.shared_names(), vec![ITERATION_NAME]);
    assert!(BlobRef::same_handle(&first.shared[0], &second.shared[0]));

    let aux = optimizer.auxiliary_parameters();
    assert_eq!(aux.shared.len(), 1);
    let counter = model.graph.get_blob(ITERATION_NAME).unwrap();
    assert!(BlobRef::same_handle(&aux.shared[0], &counter));
    assert_eq!(
        aux.local_names(),
        vec!["a_first_moment", "a_second_moment", "b_first_moment", "b_second_moment"]
    );

    let updates: Vec<_> = model.graph.net().ops_of_type("Adam").collect();
    assert_eq!(updates.len(), 2);
    for update in updates {
        assert_eq!(update.inputs[5], ITERATION_NAME);
    }
}

#[test]
fn non_positive_rate_emits_nothing() {
    for rate in [0.0, -0.5] {
        for optimizer in all_strategies(rate) {
            let mut model = TestModel::new();
            let dense = model.dense("w", &[3]);
            let sparse = model.sparse("emb", &[10, 4], 2);
            for param in [&dense, &sparse] {
                let added = model.apply(&optimizer, param).unwrap();
                assert!(added.is_empty(), "{} returned aux state", optimizer.name());
            }
            assert_eq!(model.graph.num_ops(), 0, "{} emitted operators", optimizer.name());
            assert!(optimizer.auxiliary_parameters().is_empty());
        }
    }
}

#[test]
fn sgd_momentum_rejects_sparse_gradient() {
    let mut model = TestModel::new();
    let emb = model.sparse("emb", &[10, 4], 3);
    let optimizer = SgdOptimizer::new(SgdConfig {
        momentum: 0.9,
        ..SgdConfig::default()
    })
    .unwrap();

    let err = model.apply(&optimizer, &emb).unwrap_err();
    assert_eq!(err, OptimError::SparseMomentum { param: "emb".to_string() });
    assert_eq!(model.graph.num_ops(), 0);
    assert!(optimizer.auxiliary_parameters().is_empty());
}

#[test]
fn sgd_dense_and_sparse_paths() {
    let mut model = TestModel::new();
    let w = model.dense("w", &[3]);
    let emb = model.sparse("emb", &[10, 4], 2);
    let optimizer = SgdOptimizer::simple(0.5).unwrap();

    let dense = model.apply(&optimizer, &w).unwrap();
    let sparse = model.apply(&optimizer, &emb).unwrap();
    assert_eq!(sparse.shared_names(), vec!["ONE"]);
    assert!(BlobRef::same_handle(&dense.shared[0], &sparse.shared[0]));

    let blend = model.graph.net().ops_of_type("WeightedSum").next().unwrap();
    assert_eq!(blend.inputs, ["w", "ONE", "w_grad", "w_lr"]);
    let scatter = model.graph.net().ops_of_type("ScatterWeightedSum").next().unwrap();
    assert_eq!(
        scatter.inputs,
        ["emb", "ONE", "emb_grad_indices", "emb_grad_values", "emb_lr"]
    );
    assert_eq!(model.graph.net().ops_of_type("DeduplicateGradientSlices").count(), 0);

    let aux = optimizer.auxiliary_parameters();
    assert!(aux.local.is_empty());
    assert_eq!(aux.shared_names(), vec!["ONE"]);
}

#[test]
fn sgd_momentum_uses_nesterov_and_constant_one() {
    let mut model = TestModel::new();
    let w = model.dense("w", &[3]);
    let optimizer = SgdOptimizer::new(SgdConfig {
        momentum: 0.9,
        ..SgdConfig::default()
    })
    .unwrap();
    let added = model.apply(&optimizer, &w).unwrap();
    assert_eq!(added.local_names(), vec!["w_momentum"]);

    let momentum = model.graph.net().ops_of_type("MomentumSGD").next().unwrap();
    assert_eq!(momentum.inputs, ["w_grad", "w_momentum", "w_lr"]);
    assert_eq!(momentum.get_arg("nesterov").and_then(Argument::as_int), Some(1));
    let blend = model.graph.net().ops_of_type("WeightedSum").next().unwrap();
    assert_eq!(blend.inputs, ["w", "ONE", "w_grad", "ONE"]);
}

#[test]
fn aux_params_follow_registration_order() {
    let mut model = TestModel::new();
    let first = model.dense("first", &[2]);
    let second = model.sparse("second", &[6, 2], 3);
    let third = model.dense("third", &[1]);
    let optimizer = FtrlOptimizer::new(FtrlConfig::default()).unwrap();

    let mut seen = 0;
    for param in [&first, &second, &third] {
        model.apply(&optimizer, param).unwrap();
        let aux = optimizer.auxiliary_parameters();
        assert!(aux.local.len() > seen);
        seen = aux.local.len();
    }
    let aux = optimizer.auxiliary_parameters();
    assert_eq!(
        aux.local_names(),
        vec!["first_ftrl_nz", "second_ftrl_nz", "third_ftrl_nz"]
    );
    assert_eq!(aux.local[1].shape(), Some(&[6usize, 2, 2][..]));
    assert!(aux.shared.is_empty());
    assert!(!model.graph.blob_exists(ITERATION_NAME));
}

#[test]
fn only_adam_shares_the_iteration_counter() {
    for optimizer in all_strategies(0.01) {
        let mut model = TestModel::new();
        let w = model.dense("w", &[4]);
        model.apply(&optimizer, &w).unwrap();
        let shares_counter = optimizer
            .auxiliary_parameters()
            .shared
            .iter()
            .any(|b| b.name() == ITERATION_NAME);
        assert_eq!(shares_counter, optimizer.name() == "adam", "{}", optimizer.name());
    }
}

#[test]
fn one_counter_across_optimizer_instances() {
    let mut model = TestModel::new();
    let params: Vec<_> = (0..4).map(|i| model.dense(&format!("w{i}"), &[2])).collect();
    let sgd = SgdOptimizer::simple(0.1).unwrap();
    let adam = AdamOptimizer::new(AdamConfig::default()).unwrap();
    let adagrad = adagrad(0.1);

    for (i, param) in params.iter().enumerate() {
        let grad = model.gradient(param);
        let optimizer: &dyn Optimizer = match i % 3 {
            0 => &sgd,
            1 => &adam,
            _ => &adagrad,
        };
        optimizer.apply(&mut model.graph, param, &grad).unwrap();
    }

    let init = model.graph.init_net();
    assert_eq!(init.ops_of_type("CreateMutex").count(), 1);
    assert_eq!(init.ops.iter().filter(|op| op.outputs == [ITERATION_NAME]).count(), 1);
    assert_eq!(model.graph.net().ops_of_type("AtomicIter").count(), 1);
    assert_eq!(model.graph.net().ops_of_type("LearningRate").count(), 4);
    assert_eq!(init.ops.iter().filter(|op| op.outputs == ["ONE"]).count(), 1);
}

#[test]
fn counter_pinned_to_cpu_with_start_value() {
    let mut model = TestModel::new();
    let w = model.dense("w", &[2]);
    let optimizer = AdamOptimizer::new(AdamConfig {
        iter_val: 7,
        ..AdamConfig::default()
    })
    .unwrap();
    model.apply(&optimizer, &w).unwrap();

    let fill = model
        .graph
        .init_net()
        .ops
        .iter()
        .find(|op| op.outputs == [ITERATION_NAME])
        .unwrap();
    assert!(fill.device.is_some());
    assert_eq!(fill.get_arg("value"), Some(&Argument::Int(7)));
    let atomic = model.graph.net().ops_of_type("AtomicIter").next().unwrap();
    assert_eq!(atomic.inputs, [ITERATION_MUTEX_NAME, ITERATION_NAME]);
}

#[test]
fn counter_name_collision_is_fatal() {
    let mut model = TestModel::new();
    model
        .graph
        .declare_blob(ITERATION_NAME, BlobMeta::float(&[3]))
        .unwrap();
    let w = model.dense("w", &[2]);

    let err = model.apply(&adagrad(0.1), &w).unwrap_err();
    assert!(matches!(
        err,
        OptimError::Graph(GraphError::BlobCollision { ref name, .. }) if name == ITERATION_NAME
    ));
}

#[test]
fn dense_gradient_shape_mismatch() {
    let mut graph = GraphBuilder::new("train");
    let w = graph.declare_parameter("w", &[4]).unwrap();
    let g = graph.declare_parameter("g", &[5]).unwrap();
    let err = adagrad(0.1)
        .apply(&mut graph, &w, &graph_optim::graph::Gradient::dense(g))
        .unwrap_err();
    assert!(matches!(err, OptimError::GradientShapeMismatch { .. }));
    assert_eq!(graph.num_ops(), 0);
}

#[test]
fn missing_engine_fails_before_emitting() {
    let mut model = TestModel::new();
    let w = model.dense("w", &[2]);
    let optimizer = AdamOptimizer::new(AdamConfig {
        engine: Some(SIMD_ENGINE.to_string()),
        ..AdamConfig::default()
    })
    .unwrap();

    let err = model.apply(&optimizer, &w).unwrap_err();
    assert_eq!(
        err,
        OptimError::Graph(GraphError::MissingPrimitive {
            op: "Adam".to_string(),
            engine: SIMD_ENGINE.to_string(),
        })
    );
    assert_eq!(model.graph.num_ops(), 0);
}

#[test]
fn sparse_adagrad_with_dedup_and_engine() {
    let mut model = TestModel::new();
    let emb = model.sparse("emb", &[8, 2], 3);
    let optimizer = AdagradOptimizer::new(AdagradConfig {
        sparse_dedup_aggregator: Some(DedupAggregator::Sum),
        engine: Some(SIMD_ENGINE.to_string()),
        ..AdagradConfig::default()
    })
    .unwrap();
    model.apply(&optimizer, &emb).unwrap();

    let dedup = model
        .graph
        .net()
        .ops_of_type("DeduplicateGradientSlices")
        .next()
        .unwrap();
    assert_eq!(dedup.get_arg("aggregator").and_then(Argument::as_str), Some("sum"));
    let update = model.graph.net().ops_of_type("SparseAdagrad").next().unwrap();
    assert_eq!(update.engine_name(), SIMD_ENGINE);
    assert_eq!(update.inputs[2..4], ["emb_grad_indices_dedup", "emb_grad_values_dedup"]);
}

#[test]
fn sparse_ftrl_reads_deduplicated_slices() {
    let mut model = TestModel::new();
    let emb = model.sparse("emb", &[8, 2], 4);
    let optimizer = FtrlOptimizer::new(FtrlConfig {
        sparse_dedup_aggregator: Some(DedupAggregator::Mean),
        ..FtrlConfig::default()
    })
    .unwrap();
    model.apply(&optimizer, &emb).unwrap();

    let dedup = model
        .graph
        .net()
        .ops_of_type("DeduplicateGradientSlices")
        .next()
        .unwrap();
    assert_eq!(dedup.get_arg("aggregator").and_then(Argument::as_str), Some("mean"));
    let update = model.graph.net().ops_of_type("SparseFtrl").next().unwrap();
    assert_eq!(update.inputs[2..4], ["emb_grad_indices_dedup", "emb_grad_values_dedup"]);
    assert_eq!(update.outputs, ["emb", "emb_ftrl_nz"]);
}

#[test]
fn sparse_adam_reads_deduplicated_slices() {
    let mut model = TestModel::new();
    let emb = model.sparse("emb", &[8, 2], 4);
    let optimizer = AdamOptimizer::new(AdamConfig {
        sparse_dedup_aggregator: Some(DedupAggregator::Sum),
        ..AdamConfig::default()
    })
    .unwrap();
    model.apply(&optimizer, &emb).unwrap();

    assert_eq!(model.graph.net().ops_of_type("DeduplicateGradientSlices").count(), 1);
    let update = model.graph.net().ops_of_type("SparseAdam").next().unwrap();
    assert_eq!(update.inputs[3..5], ["emb_grad_indices_dedup", "emb_grad_values_dedup"]);
    assert_eq!(update.inputs[5..], ["emb_lr", ITERATION_NAME]);
}

#[test]
fn build_functions_cover_every_pair() {
    let mut model = TestModel::new();
    model.dense("w", &[3]);
    model.sparse("emb", &[10, 4], 2);
    let sgd = build_sgd(&mut model, 0.1, SgdConfig::default()).unwrap();
    assert_eq!(sgd.config().base_learning_rate, 0.1);
    assert_eq!(model.graph.net().ops_of_type("WeightedSum").count(), 1);
    assert_eq!(model.graph.net().ops_of_type("ScatterWeightedSum").count(), 1);

    let mut model = TestModel::new();
    model.dense("w", &[3]);
    model.sparse("emb", &[10, 4], 2);
    let adam = build_adam(&mut model, 0.002, AdamConfig::default()).unwrap();
    assert_eq!(adam.auxiliary_parameters().local.len(), 4);
    assert_eq!(model.graph.net().ops_of_type("SparseAdam").count(), 1);
}

#[test]
fn build_adagrad_honours_parameter_filter() {
    let mut model = TestModel::new();
    let keep = model.dense("keep", &[3]);
    model.dense("skip", &[3]);
    let optimizer =
        build_adagrad(&mut model, 0.05, Some(&[keep][..]), AdagradConfig::default()).unwrap();
    assert_eq!(optimizer.auxiliary_parameters().local_names(), vec!["keep_squared_sum"]);
    assert!(!model.graph.blob_exists("skip_squared_sum"));
}

#[test]
fn build_ftrl_checks_simd_primitives_up_front() {
    let mut registry = OperatorRegistry::with_defaults();
    registry.unregister_engine("SparseFtrl", SIMD_ENGINE);
    let mut model = TestModel::new();
    model.graph = GraphBuilder::with_registry("train", Arc::new(registry));
    model.dense("w", &[3]);

    let err = build_ftrl(&mut model, SIMD_ENGINE, FtrlConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        OptimError::Graph(GraphError::MissingPrimitive { ref op, .. }) if op == "SparseFtrl"
    ));
    assert_eq!(model.graph.num_ops(), 0);

    let mut model = TestModel::new();
    model.dense("w", &[3]);
    build_ftrl(&mut model, SIMD_ENGINE, FtrlConfig::default()).unwrap();
    let update = model.graph.net().ops_of_type("Ftrl").next().unwrap();
    assert_eq!(update.engine_name(), SIMD_ENGINE);
}

#[test]
fn build_optimizer_from_config() {
    let mut model = TestModel::new();
    model.dense("w", &[3]);
    let config = OptimizerConfig::Adam(AdamConfig::default());
    let optimizer = build_optimizer(&mut model, &config).unwrap();
    assert_eq!(optimizer.name(), "adam");
    assert_eq!(model.graph.net().ops_of_type("Adam").count(), 1);
}
