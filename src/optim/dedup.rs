//! # Sparse Gradient Deduplication

use super::OptimError;
use crate::graph::{Gradient, GradientSlice, GraphBuilder, OperatorDef};
use serde::{Deserialize, Serialize};

/// How rows sharing an index are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupAggregator {
    Sum,
    Mean,
}

impl DedupAggregator {
    pub fn name(self) -> &'static str {
        match self {
            DedupAggregator::Sum => "sum",
            DedupAggregator::Mean => "mean",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sum" => Some(DedupAggregator::Sum),
            "mean" => Some(DedupAggregator::Mean),
            _ => None,
        }
    }
}

/// Collapses duplicate indices of a sparse gradient into one row each.
///
/// With no aggregator the gradient is returned as is and nothing is emitted. Otherwise a
/// `DeduplicateGradientSlices` op is added to the step net and the returned gradient
/// refers to its outputs, `{indices}_dedup` and `{values}_dedup`.
///
/// # Errors
/// * [`OptimError::DenseDedup`] if `grad` is dense, whether or not an aggregator is set.
pub fn dedup(
    graph: &mut GraphBuilder,
    aggregator: Option<DedupAggregator>,
    grad: &Gradient,
) -> Result<Gradient, OptimError> {
    let slice = match grad {
        Gradient::Sparse(slice) => slice,
        Gradient::Dense(dense) => {
            return Err(OptimError::DenseDedup {
                grad: dense.name().to_string(),
            })
        }
    };
    Ok(Gradient::Sparse(dedup_slice(graph, aggregator, slice)?))
}

/// [`dedup`] for a gradient already known to be sparse.
pub(crate) fn dedup_slice(
    graph: &mut GraphBuilder,
    aggregator: Option<DedupAggregator>,
    slice: &GradientSlice,
) -> Result<GradientSlice, OptimError> {
    let Some(aggregator) = aggregator else {
        return Ok(slice.clone());
    };

    let mut outputs = graph.emit_step(
        OperatorDef::new("DeduplicateGradientSlices")
            .inputs([&slice.indices, &slice.values])
            .outputs([
                format!("{}_dedup", slice.indices.name()),
                format!("{}_dedup", slice.values.name()),
            ])
            .arg("aggregator", aggregator.name()),
    )?;
    let values = outputs.remove(1);
    let indices = outputs.remove(0);
    Ok(GradientSlice { indices, values })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BlobMeta, BlobRef, DataType};

    fn sparse_grad(graph: &mut GraphBuilder) -> Gradient {
        let indices = graph
            .declare_blob("g_indices", BlobMeta::new(DataType::Int64, Some(vec![3])))
            .unwrap();
        let values = graph.declare_blob("g_values", BlobMeta::float(&[3])).unwrap();
        Gradient::sparse(indices, values)
    }

    #[test]
    fn test_no_aggregator_is_identity() {
        let mut graph = GraphBuilder::new("dedup");
        let grad = sparse_grad(&mut graph);
        let out = dedup(&mut graph, None, &grad).unwrap();

        let (Gradient::Sparse(a), Gradient::Sparse(b)) = (&grad, &out) else {
            panic!("expected sparse gradients");
        };
        assert!(BlobRef::same_handle(&a.indices, &b.indices));
        assert!(BlobRef::same_handle(&a.values, &b.values));
        assert_eq!(graph.num_ops(), 0);
    }

    #[test]
    fn test_aggregator_emits_dedup_op() {
        let mut graph = GraphBuilder::new("dedup");
        let grad = sparse_grad(&mut graph);
        let out = dedup(&mut graph, Some(DedupAggregator::Sum), &grad).unwrap();

        let Gradient::Sparse(slice) = out else {
            panic!("expected sparse gradient");
        };
        assert_eq!(slice.indices.name(), "g_indices_dedup");
        assert_eq!(slice.indices.dtype(), DataType::Int64);
        assert_eq!(slice.values.shape(), None);
        let op = &graph.net().ops[0];
        assert_eq!(op.op_type, "DeduplicateGradientSlices");
        assert_eq!(op.get_arg("aggregator").and_then(|a| a.as_str()), Some("sum"));
    }

    #[test]
    fn test_dense_gradient_rejected() {
        let mut graph = GraphBuilder::new("dedup");
        let g = graph.declare_parameter("g", &[4]).unwrap();
        for aggregator in [None, Some(DedupAggregator::Mean)] {
            let err = dedup(&mut graph, aggregator, &Gradient::dense(g.clone())).unwrap_err();
            assert_eq!(err, OptimError::DenseDedup { grad: "g".into() });
        }
    }
}
