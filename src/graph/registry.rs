//! # Operator Registry
//!
//! Schemas for the primitive operators the optimizers emit. The registry is what lets
//! graph construction fail fast when a primitive (or an engine-specific implementation
//! of one) is not available, instead of failing later at execution time.

use super::{BlobMeta, BlobRef, DataType, GraphError, OperatorDef};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Accepted number of inputs or outputs of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: Option<usize>,
}

impl Arity {
    pub const fn exact(n: usize) -> Self {
        Arity { min: n, max: Some(n) }
    }

    pub const fn range(min: usize, max: usize) -> Self {
        Arity { min, max: Some(max) }
    }

    pub const fn at_least(min: usize) -> Self {
        Arity { min, max: None }
    }

    pub fn accepts(&self, n: usize) -> bool {
        n >= self.min && self.max.map_or(true, |max| n <= max)
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) if max == self.min => write!(f, "exactly {}", self.min),
            Some(max) => write!(f, "{} to {}", self.min, max),
            None => write!(f, "at least {}", self.min),
        }
    }
}

/// How the type and shape of an operator's outputs are derived from its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputInference {
    /// `dtype` argument (default float); shape from the `shape` argument, or from the
    /// first input's shape followed by `extra_shape` when an input is given.
    ConstantFill,
    /// Every output has this fixed type and shape.
    Fixed(DataType, &'static [usize]),
    /// Output `i` is the same blob description as input `map[i]` (in-place updates).
    SameAs(&'static [usize]),
    /// Output `i` keeps the dtype of input `map[i]` but its shape is data dependent.
    DtypeOf(&'static [usize]),
}

impl OutputInference {
    fn infer(&self, op: &OperatorDef, inputs: &[BlobRef]) -> Result<Vec<BlobMeta>, GraphError> {
        let metas = match *self {
            OutputInference::ConstantFill => vec![constant_fill_meta(op, inputs)?],
            OutputInference::Fixed(dtype, shape) => op
                .outputs
                .iter()
                .map(|_| BlobMeta::new(dtype, Some(shape.to_vec())))
                .collect(),
            OutputInference::SameAs(map) => map.iter().map(|&i| inputs[i].meta().clone()).collect(),
            OutputInference::DtypeOf(map) => map
                .iter()
                .map(|&i| BlobMeta::new(inputs[i].dtype(), None))
                .collect(),
        };
        Ok(metas)
    }
}

fn constant_fill_meta(op: &OperatorDef, inputs: &[BlobRef]) -> Result<BlobMeta, GraphError> {
    let invalid = |arg: &str, reason: &str| GraphError::InvalidArgument {
        op: op.op_type.clone(),
        arg: arg.to_string(),
        reason: reason.to_string(),
    };

    let dtype = match op.get_arg("dtype") {
        Some(arg) => {
            let code = arg.as_int().ok_or_else(|| invalid("dtype", "expected an integer code"))?;
            DataType::from_code(code).ok_or_else(|| invalid("dtype", "unknown type code"))?
        }
        None => DataType::Float,
    };

    let dims = |arg: &str| -> Result<Vec<usize>, GraphError> {
        match op.get_arg(arg) {
            Some(a) => a
                .as_ints()
                .ok_or_else(|| invalid(arg, "expected a list of integers"))?
                .iter()
                .map(|&d| usize::try_from(d).map_err(|_| invalid(arg, "negative dimension")))
                .collect(),
            None => Ok(Vec::new()),
        }
    };

    let shape = match inputs.first() {
        Some(input) => {
            let extra = dims("extra_shape")?;
            input.shape().map(|s| s.iter().copied().chain(extra).collect())
        }
        None => Some(dims("shape")?),
    };
    Ok(BlobMeta::new(dtype, shape))
}

/// Static description of one primitive operator.
#[derive(Debug, Clone)]
pub struct OperatorSchema {
    pub name: &'static str,
    pub inputs: Arity,
    pub outputs: Arity,
    pub inference: OutputInference,
}

impl OperatorSchema {
    /// Checks arity and derives the descriptions of `op`'s outputs.
    pub fn infer_outputs(
        &self,
        op: &OperatorDef,
        inputs: &[BlobRef],
    ) -> Result<Vec<BlobMeta>, GraphError> {
        if !self.inputs.accepts(op.inputs.len()) {
            return Err(GraphError::ArityMismatch {
                op: op.op_type.clone(),
                slot: "inputs",
                expected: self.inputs,
                got: op.inputs.len(),
            });
        }
        if !self.outputs.accepts(op.outputs.len()) {
            return Err(GraphError::ArityMismatch {
                op: op.op_type.clone(),
                slot: "outputs",
                expected: self.outputs,
                got: op.outputs.len(),
            });
        }
        self.inference.infer(op, inputs)
    }
}

const fn schema(
    name: &'static str,
    inputs: Arity,
    outputs: Arity,
    inference: OutputInference,
) -> OperatorSchema {
    OperatorSchema {
        name,
        inputs,
        outputs,
        inference,
    }
}

const DEFAULT_SCHEMAS: [OperatorSchema; 14] = [
    schema("ConstantFill", Arity::range(0, 1), Arity::exact(1), OutputInference::ConstantFill),
    schema(
        "CreateMutex",
        Arity::exact(0),
        Arity::exact(1),
        OutputInference::Fixed(DataType::Mutex, &[]),
    ),
    // [mutex, counter] -> [counter]
    schema("AtomicIter", Arity::exact(2), Arity::exact(1), OutputInference::SameAs(&[1])),
    schema(
        "LearningRate",
        Arity::exact(1),
        Arity::exact(1),
        OutputInference::Fixed(DataType::Float, &[1]),
    ),
    // [X0, w0, X1, w1, ...] -> [X0]
    schema("WeightedSum", Arity::at_least(2), Arity::exact(1), OutputInference::SameAs(&[0])),
    // [X0, w0, indices, X1, w1, ...] -> [X0]
    schema(
        "ScatterWeightedSum",
        Arity::at_least(5),
        Arity::exact(1),
        OutputInference::SameAs(&[0]),
    ),
    // [grad, moment, lr] -> [grad, moment]
    schema("MomentumSGD", Arity::exact(3), Arity::exact(2), OutputInference::SameAs(&[0, 1])),
    schema("Adagrad", Arity::exact(4), Arity::exact(2), OutputInference::SameAs(&[0, 1])),
    schema("SparseAdagrad", Arity::exact(5), Arity::exact(2), OutputInference::SameAs(&[0, 1])),
    schema("Ftrl", Arity::exact(3), Arity::exact(2), OutputInference::SameAs(&[0, 1])),
    schema("SparseFtrl", Arity::exact(4), Arity::exact(2), OutputInference::SameAs(&[0, 1])),
    schema("Adam", Arity::exact(6), Arity::exact(3), OutputInference::SameAs(&[0, 1, 2])),
    schema("SparseAdam", Arity::exact(7), Arity::exact(3), OutputInference::SameAs(&[0, 1, 2])),
    schema(
        "DeduplicateGradientSlices",
        Arity::exact(2),
        Arity::exact(2),
        OutputInference::DtypeOf(&[0, 1]),
    ),
];

/// Engine tag for the vectorized implementations shipped with the default registry.
pub const SIMD_ENGINE: &str = "SIMD";

/// # OperatorRegistry
///
/// Known operator schemas, plus which non-default engines each operator is implemented
/// for. The default engine (empty tag) is available for every registered operator.
#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    schemas: HashMap<String, OperatorSchema>,
    engines: HashSet<(String, String)>,
}

impl OperatorRegistry {
    /// A registry with no operators at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The optimizer primitives, with `SIMD` implementations of Adagrad and Ftrl.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for schema in DEFAULT_SCHEMAS {
            registry.register(schema);
        }
        for op in ["Adagrad", "SparseAdagrad", "Ftrl", "SparseFtrl"] {
            registry.register_engine(op, SIMD_ENGINE);
        }
        registry
    }

    pub fn register(&mut self, schema: OperatorSchema) {
        self.schemas.insert(schema.name.to_string(), schema);
    }

    /// Marks `op` as implemented for `engine`. Has no effect on unregistered operators'
    /// availability until their schema is registered too.
    pub fn register_engine(&mut self, op: &str, engine: &str) {
        self.engines.insert((op.to_string(), engine.to_string()));
    }

    pub fn unregister_engine(&mut self, op: &str, engine: &str) {
        self.engines.remove(&(op.to_string(), engine.to_string()));
    }

    pub fn schema(&self, op: &str) -> Option<&OperatorSchema> {
        self.schemas.get(op)
    }

    pub fn is_operator(&self, op: &str, engine: Option<&str>) -> bool {
        if !self.schemas.contains_key(op) {
            return false;
        }
        match engine {
            None | Some("") => true,
            Some(engine) => self.engines.contains(&(op.to_string(), engine.to_string())),
        }
    }

    /// Looks up the schema for `op` on `engine`, failing if either is unavailable.
    pub fn require(&self, op: &str, engine: Option<&str>) -> Result<&OperatorSchema, GraphError> {
        match self.schemas.get(op) {
            Some(schema) if self.is_operator(op, engine) => Ok(schema),
            _ => Err(GraphError::MissingPrimitive {
                op: op.to_string(),
                engine: engine.unwrap_or("").to_string(),
            }),
        }
    }
}
