#![allow(dead_code)]

use graph_optim::graph::{BlobMeta, BlobRef, DataType, Gradient, GraphBuilder};
use graph_optim::optim::{AuxParams, OptimError, OptimizationModel, Optimizer};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A model with hand-declared parameters and gradients.
pub struct TestModel {
    pub graph: GraphBuilder,
    pairs: Vec<(BlobRef, Gradient)>,
}

impl TestModel {
    pub fn new() -> Self {
        init_logging();
        TestModel {
            graph: GraphBuilder::new("train"),
            pairs: Vec::new(),
        }
    }

    /// Declares `name` with a dense gradient `{name}_grad` of the same shape.
    pub fn dense(&mut self, name: &str, shape: &[usize]) -> BlobRef {
        let param = self.graph.declare_parameter(name, shape).unwrap();
        let grad = self
            .graph
            .declare_parameter(&format!("{name}_grad"), shape)
            .unwrap();
        self.pairs.push((param.clone(), Gradient::dense(grad)));
        param
    }

    /// Declares `name` with a sparse gradient over `rows` rows of `shape`.
    pub fn sparse(&mut self, name: &str, shape: &[usize], rows: usize) -> BlobRef {
        let param = self.graph.declare_parameter(name, shape).unwrap();
        let indices = self
            .graph
            .declare_blob(
                &format!("{name}_grad_indices"),
                BlobMeta::new(DataType::Int64, Some(vec![rows])),
            )
            .unwrap();
        let mut value_shape = vec![rows];
        value_shape.extend_from_slice(&shape[1..]);
        let values = self
            .graph
            .declare_parameter(&format!("{name}_grad_values"), &value_shape)
            .unwrap();
        self.pairs
            .push((param.clone(), Gradient::sparse(indices, values)));
        param
    }

    /// Applies `optimizer` to `param` and its declared gradient.
    pub fn apply<O: Optimizer + ?Sized>(
        &mut self,
        optimizer: &O,
        param: &BlobRef,
    ) -> Result<AuxParams, OptimError> {
        let grad = self.gradient(param);
        optimizer.apply(&mut self.graph, param, &grad)
    }

    pub fn gradient(&self, param: &BlobRef) -> Gradient {
        self.pairs
            .iter()
            .find(|(p, _)| BlobRef::same_handle(p, param))
            .map(|(_, g)| g.clone())
            .unwrap()
    }
}

impl OptimizationModel for TestModel {
    fn graph(&self) -> &GraphBuilder {
        &self.graph
    }

    fn graph_mut(&mut self) -> &mut GraphBuilder {
        &mut self.graph
    }

    fn optimization_pairs(&self, parameters: Option<&[BlobRef]>) -> Vec<(BlobRef, Gradient)> {
        self.pairs
            .iter()
            .filter(|(p, _)| match parameters {
                Some(selected) => selected.iter().any(|s| BlobRef::same_handle(s, p)),
                None => true,
            })
            .cloned()
            .collect()
    }
}
