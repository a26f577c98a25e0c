//! # Blob Handles
//!
//! Named references to values living in the graph, and the dense/sparse gradient
//! representation optimizers consume.

use super::DataType;
use std::fmt;
use std::sync::Arc;

/// Static description of a blob: element type and, when known, its shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobMeta {
    pub dtype: DataType,
    pub shape: Option<Vec<usize>>,
}

impl BlobMeta {
    pub fn new(dtype: DataType, shape: Option<Vec<usize>>) -> Self {
        BlobMeta { dtype, shape }
    }

    pub fn float(shape: &[usize]) -> Self {
        BlobMeta::new(DataType::Float, Some(shape.to_vec()))
    }

    /// Whether a blob described by `self` may be reused where `other` was requested.
    /// Unknown dtypes and unknown shapes are compatible with anything.
    pub fn is_compatible(&self, other: &BlobMeta) -> bool {
        let dtype_ok = self.dtype == other.dtype
            || self.dtype == DataType::Unknown
            || other.dtype == DataType::Unknown;
        let shape_ok = match (&self.shape, &other.shape) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        dtype_ok && shape_ok
    }
}

impl fmt::Display for BlobMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shape {
            Some(shape) => write!(f, "{}{:?}", self.dtype, shape),
            None => write!(f, "{}[?]", self.dtype),
        }
    }
}

#[derive(Debug)]
struct BlobInner {
    name: String,
    meta: BlobMeta,
}

/// # BlobRef
///
/// Cheap-to-clone handle to a named blob. Handles are created by the [`GraphBuilder`]
/// only, so two handles with the same name inside one graph are always the same handle.
///
/// [`GraphBuilder`]: super::GraphBuilder
#[derive(Debug, Clone)]
pub struct BlobRef {
    inner: Arc<BlobInner>,
}

impl BlobRef {
    pub(crate) fn new(name: impl Into<String>, meta: BlobMeta) -> Self {
        BlobRef {
            inner: Arc::new(BlobInner {
                name: name.into(),
                meta,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn meta(&self) -> &BlobMeta {
        &self.inner.meta
    }

    pub fn dtype(&self) -> DataType {
        self.inner.meta.dtype
    }

    pub fn shape(&self) -> Option<&[usize]> {
        self.inner.meta.shape.as_deref()
    }

    /// Identity comparison: true only if both refer to the same allocated handle.
    pub fn same_handle(a: &BlobRef, b: &BlobRef) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl PartialEq for BlobRef {
    fn eq(&self, other: &Self) -> bool {
        BlobRef::same_handle(self, other)
            || (self.inner.name == other.inner.name && self.inner.meta == other.inner.meta)
    }
}

impl Eq for BlobRef {}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl AsRef<str> for BlobRef {
    fn as_ref(&self) -> &str {
        self.name()
    }
}

// --- Gradients ---

/// Row-level sparse gradient. `indices` may repeat and need not be sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradientSlice {
    pub indices: BlobRef,
    pub values: BlobRef,
}

/// Gradient of one parameter. The variant is supplied by the caller; nothing here
/// inspects blob contents to decide it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gradient {
    Dense(BlobRef),
    Sparse(GradientSlice),
}

impl Gradient {
    pub fn dense(grad: BlobRef) -> Self {
        Gradient::Dense(grad)
    }

    pub fn sparse(indices: BlobRef, values: BlobRef) -> Self {
        Gradient::Sparse(GradientSlice { indices, values })
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Gradient::Sparse(_))
    }
}
