//! # Operator and Net Descriptors

use super::{BlobRef, DeviceOption};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value of a named operator attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Argument {
    Float(f32),
    Int(i64),
    Ints(Vec<i64>),
    Str(String),
}

impl Argument {
    pub fn as_float(&self) -> Option<f32> {
        match self {
            Argument::Float(v) => Some(*v),
            Argument::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Argument::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Argument::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Argument::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f32> for Argument {
    fn from(v: f32) -> Self {
        Argument::Float(v)
    }
}

impl From<i64> for Argument {
    fn from(v: i64) -> Self {
        Argument::Int(v)
    }
}

impl From<Vec<i64>> for Argument {
    fn from(v: Vec<i64>) -> Self {
        Argument::Ints(v)
    }
}

impl From<&str> for Argument {
    fn from(v: &str) -> Self {
        Argument::Str(v.to_string())
    }
}

impl From<String> for Argument {
    fn from(v: String) -> Self {
        Argument::Str(v)
    }
}

/// # OperatorDef
///
/// One primitive invocation: operator type, input and output blob names, attributes,
/// and optional engine tag and device placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorDef {
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub args: BTreeMap<String, Argument>,
    pub engine: Option<String>,
    pub device: Option<DeviceOption>,
}

impl OperatorDef {
    pub fn new(op_type: impl Into<String>) -> Self {
        OperatorDef {
            op_type: op_type.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            args: BTreeMap::new(),
            engine: None,
            device: None,
        }
    }

    #[must_use]
    pub fn inputs<'a, I>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = &'a BlobRef>,
    {
        self.inputs = inputs.into_iter().map(|b| b.name().to_string()).collect();
        self
    }

    #[must_use]
    pub fn outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.outputs = outputs.into_iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    #[must_use]
    pub fn arg(mut self, name: &str, value: impl Into<Argument>) -> Self {
        self.args.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = (String, Argument)>,
    {
        self.args.extend(args);
        self
    }

    /// Sets the engine tag. An empty tag means the default implementation.
    #[must_use]
    pub fn engine(mut self, engine: Option<&str>) -> Self {
        self.engine = engine.filter(|e| !e.is_empty()).map(str::to_string);
        self
    }

    #[must_use]
    pub fn device(mut self, device: DeviceOption) -> Self {
        self.device = Some(device);
        self
    }

    pub fn get_arg(&self, name: &str) -> Option<&Argument> {
        self.args.get(name)
    }

    pub fn engine_name(&self) -> &str {
        self.engine.as_deref().unwrap_or("")
    }
}

/// Ordered list of operators. Execution runs them front to back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetDef {
    pub name: String,
    pub ops: Vec<OperatorDef>,
}

impl NetDef {
    pub fn new(name: impl Into<String>) -> Self {
        NetDef {
            name: name.into(),
            ops: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operators of the given type, in emission order.
    pub fn ops_of_type<'a>(&'a self, op_type: &'a str) -> impl Iterator<Item = &'a OperatorDef> {
        self.ops.iter().filter(move |op| op.op_type == op_type)
    }
}
