//! CPU kernels for the optimizer primitives.
//!
//! Dense updates run element-wise in parallel through `ndarray::Zip`. Sparse updates
//! walk their indices in order, since an index may appear more than once.

use super::{Blob, RuntimeError, Workspace};
use crate::graph::{Argument, DataType, OperatorDef};
use crate::optim::lr::LearningRatePolicy;
use ndarray::{ArrayD, IxDyn, Zip};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

pub(super) fn run_operator(ws: &mut Workspace, op: &OperatorDef) -> Result<(), RuntimeError> {
    match op.op_type.as_str() {
        "ConstantFill" => constant_fill(ws, op),
        "CreateMutex" => {
            ws.set(output(op, 0)?, Blob::Mutex(Arc::new(Mutex::new(()))));
            Ok(())
        }
        "AtomicIter" => atomic_iter(ws, op),
        "LearningRate" => learning_rate(ws, op),
        "WeightedSum" => weighted_sum(ws, op),
        "ScatterWeightedSum" => scatter_weighted_sum(ws, op),
        "MomentumSGD" => momentum_sgd(ws, op),
        "Adagrad" => adagrad(ws, op),
        "SparseAdagrad" => sparse_adagrad(ws, op),
        "Ftrl" => ftrl(ws, op),
        "SparseFtrl" => sparse_ftrl(ws, op),
        "Adam" => adam(ws, op),
        "SparseAdam" => sparse_adam(ws, op),
        "DeduplicateGradientSlices" => deduplicate(ws, op),
        other => Err(RuntimeError::UnsupportedOperator(other.to_string())),
    }
}

// --- Slot and argument helpers ---

fn input(op: &OperatorDef, slot: usize) -> Result<&str, RuntimeError> {
    op.inputs.get(slot).map(String::as_str).ok_or_else(|| RuntimeError::MissingSlot {
        op: op.op_type.clone(),
        slot,
    })
}

fn output(op: &OperatorDef, slot: usize) -> Result<&str, RuntimeError> {
    op.outputs.get(slot).map(String::as_str).ok_or_else(|| RuntimeError::MissingSlot {
        op: op.op_type.clone(),
        slot,
    })
}

fn float_arg(op: &OperatorDef, name: &str) -> Result<f32, RuntimeError> {
    op.get_arg(name)
        .and_then(Argument::as_float)
        .ok_or_else(|| invalid_arg(op, name))
}

fn invalid_arg(op: &OperatorDef, name: &str) -> RuntimeError {
    RuntimeError::InvalidArgument {
        op: op.op_type.clone(),
        arg: name.to_string(),
    }
}

fn shape_mismatch(op: &OperatorDef, detail: String) -> RuntimeError {
    RuntimeError::ShapeMismatch {
        op: op.op_type.clone(),
        detail,
    }
}

/// First element of a float blob, used for rates and weights.
fn scalar(ws: &Workspace, op: &OperatorDef, name: &str) -> Result<f32, RuntimeError> {
    ws.fetch_float(name)?
        .iter()
        .next()
        .copied()
        .ok_or_else(|| shape_mismatch(op, format!("'{name}' is empty, expected a scalar")))
}

fn same_shape(
    op: &OperatorDef,
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    what: &str,
) -> Result<(), RuntimeError> {
    if a.shape() != b.shape() {
        return Err(shape_mismatch(
            op,
            format!("{what} has shape {:?}, expected {:?}", b.shape(), a.shape()),
        ));
    }
    Ok(())
}

fn dims(op: &OperatorDef, name: &str) -> Result<Vec<usize>, RuntimeError> {
    match op.get_arg(name) {
        Some(arg) => arg
            .as_ints()
            .ok_or_else(|| invalid_arg(op, name))?
            .iter()
            .map(|&d| usize::try_from(d).map_err(|_| invalid_arg(op, name)))
            .collect(),
        None => Ok(Vec::new()),
    }
}

// --- Sparse row addressing ---

/// Row view of a parameter: the number of rows and the elements per row.
fn rows_and_block(shape: &[usize]) -> (usize, usize) {
    match shape.split_first() {
        Some((&rows, rest)) => (rows, rest.iter().product()),
        None => (1, 1),
    }
}

/// Validates `indices` against `rows` and that `values` holds one block per index.
fn sparse_rows(
    op: &OperatorDef,
    indices: &ArrayD<i64>,
    values_len: usize,
    rows: usize,
    block: usize,
) -> Result<Vec<usize>, RuntimeError> {
    if values_len != indices.len() * block {
        return Err(shape_mismatch(
            op,
            format!(
                "{} values for {} indices of {} elements each",
                values_len,
                indices.len(),
                block
            ),
        ));
    }
    indices
        .iter()
        .map(|&index| match usize::try_from(index) {
            Ok(row) if row < rows => Ok(row),
            _ => Err(RuntimeError::IndexOutOfRange {
                op: op.op_type.clone(),
                index,
                rows,
            }),
        })
        .collect()
}

fn flat(a: &ArrayD<f32>) -> Vec<f32> {
    a.iter().copied().collect()
}

fn reshape(shape: &[usize], data: Vec<f32>) -> Result<ArrayD<f32>, RuntimeError> {
    Ok(ArrayD::from_shape_vec(IxDyn(shape), data)?)
}

// --- Initialization and iteration ---

fn constant_fill(ws: &mut Workspace, op: &OperatorDef) -> Result<(), RuntimeError> {
    let shape = match op.inputs.first() {
        Some(name) => {
            let mut shape = ws.shape_of(name)?;
            shape.extend(dims(op, "extra_shape")?);
            shape
        }
        None => dims(op, "shape")?,
    };
    let dtype = match op.get_arg("dtype") {
        Some(arg) => arg
            .as_int()
            .and_then(DataType::from_code)
            .ok_or_else(|| invalid_arg(op, "dtype"))?,
        None => DataType::Float,
    };
    let value = op.get_arg("value");
    let blob = match dtype {
        DataType::Float => {
            let v = value.and_then(Argument::as_float).unwrap_or(0.0);
            Blob::Float(ArrayD::from_elem(IxDyn(&shape), v))
        }
        DataType::Int32 | DataType::Int64 => {
            let v = value
                .and_then(|a| a.as_int().or_else(|| a.as_float().map(|f| f as i64)))
                .unwrap_or(0);
            Blob::Int(ArrayD::from_elem(IxDyn(&shape), v))
        }
        _ => return Err(invalid_arg(op, "dtype")),
    };
    ws.set(output(op, 0)?, blob);
    Ok(())
}

fn atomic_iter(ws: &mut Workspace, op: &OperatorDef) -> Result<(), RuntimeError> {
    let mutex = ws.mutex(input(op, 0)?)?;
    let _guard = mutex.lock();
    let mut counter = ws.fetch_int(input(op, 1)?)?.clone();
    counter.mapv_inplace(|c| c + 1);
    ws.set(output(op, 0)?, Blob::Int(counter));
    Ok(())
}

fn learning_rate(ws: &mut Workspace, op: &OperatorDef) -> Result<(), RuntimeError> {
    let counter = input(op, 0)?;
    let iter = ws
        .fetch_int(counter)?
        .iter()
        .next()
        .copied()
        .ok_or_else(|| shape_mismatch(op, format!("'{counter}' is empty")))?;
    let policy = LearningRatePolicy::from_args(&op.args)?;
    let base_lr = float_arg(op, "base_lr")?;
    let rate = ArrayD::from_elem(IxDyn(&[1]), base_lr * policy.multiplier(iter));
    ws.set(output(op, 0)?, Blob::Float(rate));
    Ok(())
}

// --- SGD family ---

fn weighted_sum(ws: &mut Workspace, op: &OperatorDef) -> Result<(), RuntimeError> {
    if op.inputs.len() % 2 != 0 {
        return Err(shape_mismatch(op, "inputs must come in (tensor, weight) pairs".to_string()));
    }
    let first = ws.fetch_float(input(op, 0)?)?;
    let w0 = scalar(ws, op, input(op, 1)?)?;
    let mut out = first.mapv(|x| x * w0);
    for pair in op.inputs[2..].chunks(2) {
        let x = ws.fetch_float(&pair[0])?;
        same_shape(op, &out, x, &pair[0])?;
        let w = scalar(ws, op, &pair[1])?;
        Zip::from(&mut out).and(x).par_for_each(|o, &v| *o += w * v);
    }
    ws.set(output(op, 0)?, Blob::Float(out));
    Ok(())
}

fn scatter_weighted_sum(ws: &mut Workspace, op: &OperatorDef) -> Result<(), RuntimeError> {
    if op.inputs.len() % 2 != 1 {
        return Err(shape_mismatch(
            op,
            "expected [X0, w0, indices] followed by (slice, weight) pairs".to_string(),
        ));
    }
    let target = ws.fetch_float(input(op, 0)?)?;
    let shape = target.shape().to_vec();
    let mut data = flat(target);
    let w0 = scalar(ws, op, input(op, 1)?)?;
    let indices = ws.fetch_int(input(op, 2)?)?;
    let (rows, block) = rows_and_block(&shape);

    let mut slices = Vec::new();
    for pair in op.inputs[3..].chunks(2) {
        let values = flat(ws.fetch_float(&pair[0])?);
        sparse_rows(op, indices, values.len(), rows, block)?;
        slices.push((values, scalar(ws, op, &pair[1])?));
    }
    let row_ids = sparse_rows(op, indices, indices.len() * block, rows, block)?;

    for (k, &row) in row_ids.iter().enumerate() {
        let dst = &mut data[row * block..(row + 1) * block];
        dst.iter_mut().for_each(|x| *x *= w0);
        for (values, weight) in &slices {
            let src = &values[k * block..(k + 1) * block];
            dst.iter_mut().zip(src).for_each(|(d, &s)| *d += weight * s);
        }
    }
    ws.set(output(op, 0)?, Blob::Float(reshape(&shape, data)?));
    Ok(())
}

fn momentum_sgd(ws: &mut Workspace, op: &OperatorDef) -> Result<(), RuntimeError> {
    let mut grad = ws.fetch_float(input(op, 0)?)?.clone();
    let mut moment = ws.fetch_float(input(op, 1)?)?.clone();
    same_shape(op, &grad, &moment, input(op, 1)?)?;
    let lr = scalar(ws, op, input(op, 2)?)?;
    let momentum = float_arg(op, "momentum")?;
    let nesterov = op.get_arg("nesterov").and_then(Argument::as_int).unwrap_or(0) != 0;

    Zip::from(&mut grad).and(&mut moment).par_for_each(|g, m| {
        if nesterov {
            let previous = *m;
            let next = momentum * previous + lr * *g;
            *m = next;
            *g = (1.0 + momentum) * next - momentum * previous;
        } else {
            let adjusted = lr * *g + momentum * *m;
            *m = adjusted;
            *g = adjusted;
        }
    });
    ws.set(output(op, 0)?, Blob::Float(grad));
    ws.set(output(op, 1)?, Blob::Float(moment));
    Ok(())
}

// --- Adagrad ---

fn adagrad(ws: &mut Workspace, op: &OperatorDef) -> Result<(), RuntimeError> {
    let mut param = ws.fetch_float(input(op, 0)?)?.clone();
    let mut history = ws.fetch_float(input(op, 1)?)?.clone();
    let grad = ws.fetch_float(input(op, 2)?)?;
    same_shape(op, &param, &history, input(op, 1)?)?;
    same_shape(op, &param, grad, input(op, 2)?)?;
    let lr = scalar(ws, op, input(op, 3)?)?;
    let epsilon = float_arg(op, "epsilon")?;

    Zip::from(&mut param)
        .and(&mut history)
        .and(grad)
        .par_for_each(|w, h, &g| {
            *h += g * g;
            *w += lr * g / (h.sqrt() + epsilon);
        });
    ws.set(output(op, 0)?, Blob::Float(param));
    ws.set(output(op, 1)?, Blob::Float(history));
    Ok(())
}

fn sparse_adagrad(ws: &mut Workspace, op: &OperatorDef) -> Result<(), RuntimeError> {
    let param = ws.fetch_float(input(op, 0)?)?;
    let shape = param.shape().to_vec();
    let mut w = flat(param);
    let history = ws.fetch_float(input(op, 1)?)?;
    same_shape(op, param, history, input(op, 1)?)?;
    let mut h = flat(history);
    let indices = ws.fetch_int(input(op, 2)?)?;
    let values = flat(ws.fetch_float(input(op, 3)?)?);
    let lr = scalar(ws, op, input(op, 4)?)?;
    let epsilon = float_arg(op, "epsilon")?;

    let (rows, block) = rows_and_block(&shape);
    for (k, row) in sparse_rows(op, indices, values.len(), rows, block)?.into_iter().enumerate() {
        for j in 0..block {
            let (i, g) = (row * block + j, values[k * block + j]);
            h[i] += g * g;
            w[i] += lr * g / (h[i].sqrt() + epsilon);
        }
    }
    ws.set(output(op, 0)?, Blob::Float(reshape(&shape, w)?));
    ws.set(output(op, 1)?, Blob::Float(reshape(&shape, h)?));
    Ok(())
}

// --- FTRL ---

#[derive(Clone, Copy)]
struct FtrlParams {
    alpha_inv: f32,
    beta: f32,
    lambda1: f32,
    lambda2: f32,
}

impl FtrlParams {
    fn from_op(op: &OperatorDef) -> Result<Self, RuntimeError> {
        let alpha = float_arg(op, "alpha")?;
        if alpha <= 0.0 {
            return Err(invalid_arg(op, "alpha"));
        }
        Ok(FtrlParams {
            alpha_inv: 1.0 / alpha,
            beta: float_arg(op, "beta")?,
            lambda1: float_arg(op, "lambda1")?,
            lambda2: float_arg(op, "lambda2")?,
        })
    }

    /// Updates one coordinate; `nz` is its `[n, z]` accumulator pair.
    fn update(self, w: &mut f32, nz: &mut [f32], g: f32) {
        let n = nz[0];
        let n_new = n + g * g;
        let sigma = (n_new.sqrt() - n.sqrt()) * self.alpha_inv;
        let z = nz[1] + g - sigma * *w;
        nz[0] = n_new;
        nz[1] = z;
        *w = if z.abs() <= self.lambda1 {
            0.0
        } else {
            (z.signum() * self.lambda1 - z)
                / ((self.beta + n_new.sqrt()) * self.alpha_inv + self.lambda2)
        };
    }
}

fn ftrl_state(op: &OperatorDef, param: &ArrayD<f32>, nz: &ArrayD<f32>) -> Result<(), RuntimeError> {
    let mut expected = param.shape().to_vec();
    expected.push(2);
    if nz.shape() != expected.as_slice() {
        return Err(shape_mismatch(
            op,
            format!("accumulator has shape {:?}, expected {:?}", nz.shape(), expected),
        ));
    }
    Ok(())
}

fn ftrl(ws: &mut Workspace, op: &OperatorDef) -> Result<(), RuntimeError> {
    let param = ws.fetch_float(input(op, 0)?)?;
    let nz = ws.fetch_float(input(op, 1)?)?;
    let grad = ws.fetch_float(input(op, 2)?)?;
    ftrl_state(op, param, nz)?;
    same_shape(op, param, grad, input(op, 2)?)?;
    let params = FtrlParams::from_op(op)?;

    let (shape, nz_shape) = (param.shape().to_vec(), nz.shape().to_vec());
    let (mut w, mut acc, g) = (flat(param), flat(nz), flat(grad));
    w.par_iter_mut()
        .zip(acc.par_chunks_mut(2))
        .zip(g.par_iter())
        .for_each(|((w, nz), &g)| params.update(w, nz, g));
    ws.set(output(op, 0)?, Blob::Float(reshape(&shape, w)?));
    ws.set(output(op, 1)?, Blob::Float(reshape(&nz_shape, acc)?));
    Ok(())
}

fn sparse_ftrl(ws: &mut Workspace, op: &OperatorDef) -> Result<(), RuntimeError> {
    let param = ws.fetch_float(input(op, 0)?)?;
    let nz = ws.fetch_float(input(op, 1)?)?;
    ftrl_state(op, param, nz)?;
    let indices = ws.fetch_int(input(op, 2)?)?;
    let values = flat(ws.fetch_float(input(op, 3)?)?);
    let params = FtrlParams::from_op(op)?;

    let (shape, nz_shape) = (param.shape().to_vec(), nz.shape().to_vec());
    let (mut w, mut acc) = (flat(param), flat(nz));
    let (rows, block) = rows_and_block(&shape);
    for (k, row) in sparse_rows(op, indices, values.len(), rows, block)?.into_iter().enumerate() {
        for j in 0..block {
            let i = row * block + j;
            params.update(&mut w[i], &mut acc[2 * i..2 * i + 2], values[k * block + j]);
        }
    }
    ws.set(output(op, 0)?, Blob::Float(reshape(&shape, w)?));
    ws.set(output(op, 1)?, Blob::Float(reshape(&nz_shape, acc)?));
    Ok(())
}

// --- Adam ---

#[derive(Clone, Copy)]
struct AdamStep {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    correction: f32,
}

impl AdamStep {
    fn from_op(ws: &Workspace, op: &OperatorDef, lr_slot: usize) -> Result<Self, RuntimeError> {
        let lr = scalar(ws, op, input(op, lr_slot)?)?;
        let counter = input(op, lr_slot + 1)?;
        let iter = ws
            .fetch_int(counter)?
            .iter()
            .next()
            .copied()
            .ok_or_else(|| shape_mismatch(op, format!("'{counter}' is empty")))?;
        let beta1 = float_arg(op, "beta1")?;
        let beta2 = float_arg(op, "beta2")?;
        // Evaluated in f64 so the exponent keeps the counter's full range.
        let t = iter.saturating_add(1) as f64;
        let correction =
            (1.0 - f64::from(beta2).powf(t)).sqrt() / (1.0 - f64::from(beta1).powf(t));
        Ok(AdamStep {
            lr,
            beta1,
            beta2,
            epsilon: float_arg(op, "epsilon")?,
            correction: correction as f32,
        })
    }

    fn update(self, w: &mut f32, m1: &mut f32, m2: &mut f32, g: f32) {
        *m1 = *m1 * self.beta1 + g * (1.0 - self.beta1);
        *m2 = *m2 * self.beta2 + g * g * (1.0 - self.beta2);
        *w += self.lr * self.correction * *m1 / (m2.sqrt() + self.epsilon);
    }
}

fn adam(ws: &mut Workspace, op: &OperatorDef) -> Result<(), RuntimeError> {
    let mut param = ws.fetch_float(input(op, 0)?)?.clone();
    let mut m1 = ws.fetch_float(input(op, 1)?)?.clone();
    let mut m2 = ws.fetch_float(input(op, 2)?)?.clone();
    let grad = ws.fetch_float(input(op, 3)?)?;
    same_shape(op, &param, &m1, input(op, 1)?)?;
    same_shape(op, &param, &m2, input(op, 2)?)?;
    same_shape(op, &param, grad, input(op, 3)?)?;
    let step = AdamStep::from_op(ws, op, 4)?;

    Zip::from(&mut param)
        .and(&mut m1)
        .and(&mut m2)
        .and(grad)
        .par_for_each(|w, m1, m2, &g| step.update(w, m1, m2, g));
    ws.set(output(op, 0)?, Blob::Float(param));
    ws.set(output(op, 1)?, Blob::Float(m1));
    ws.set(output(op, 2)?, Blob::Float(m2));
    Ok(())
}

fn sparse_adam(ws: &mut Workspace, op: &OperatorDef) -> Result<(), RuntimeError> {
    let param = ws.fetch_float(input(op, 0)?)?;
    let first = ws.fetch_float(input(op, 1)?)?;
    let second = ws.fetch_float(input(op, 2)?)?;
    same_shape(op, param, first, input(op, 1)?)?;
    same_shape(op, param, second, input(op, 2)?)?;
    let indices = ws.fetch_int(input(op, 3)?)?;
    let values = flat(ws.fetch_float(input(op, 4)?)?);
    let step = AdamStep::from_op(ws, op, 5)?;

    let shape = param.shape().to_vec();
    let (mut w, mut m1, mut m2) = (flat(param), flat(first), flat(second));
    let (rows, block) = rows_and_block(&shape);
    for (k, row) in sparse_rows(op, indices, values.len(), rows, block)?.into_iter().enumerate() {
        for j in 0..block {
            let i = row * block + j;
            step.update(&mut w[i], &mut m1[i], &mut m2[i], values[k * block + j]);
        }
    }
    ws.set(output(op, 0)?, Blob::Float(reshape(&shape, w)?));
    ws.set(output(op, 1)?, Blob::Float(reshape(&shape, m1)?));
    ws.set(output(op, 2)?, Blob::Float(reshape(&shape, m2)?));
    Ok(())
}

// --- Gradient deduplication ---

fn deduplicate(ws: &mut Workspace, op: &OperatorDef) -> Result<(), RuntimeError> {
    let mean = match op.get_arg("aggregator").and_then(Argument::as_str) {
        Some("sum") => false,
        Some("mean") => true,
        _ => return Err(invalid_arg(op, "aggregator")),
    };
    let indices = ws.fetch_int(input(op, 0)?)?;
    let values = ws.fetch_float(input(op, 1)?)?;
    let n = indices.len();
    let block = if n == 0 { 0 } else { values.len() / n };
    if values.len() != n * block || values.shape().first().copied().unwrap_or(0) != n {
        return Err(shape_mismatch(
            op,
            format!("{} indices for values of shape {:?}", n, values.shape()),
        ));
    }

    let data = flat(values);
    let mut slot_of: HashMap<i64, usize> = HashMap::new();
    let mut unique: Vec<i64> = Vec::new();
    let mut sums: Vec<f32> = Vec::new();
    let mut counts: Vec<u32> = Vec::new();
    for (k, &index) in indices.iter().enumerate() {
        let slot = *slot_of.entry(index).or_insert_with(|| {
            unique.push(index);
            sums.resize(sums.len() + block, 0.0);
            counts.push(0);
            unique.len() - 1
        });
        counts[slot] += 1;
        let src = &data[k * block..(k + 1) * block];
        sums[slot * block..(slot + 1) * block]
            .iter_mut()
            .zip(src)
            .for_each(|(d, &s)| *d += s);
    }
    if mean {
        for (chunk, &count) in sums.chunks_mut(block.max(1)).zip(&counts) {
            chunk.iter_mut().for_each(|x| *x /= count as f32);
        }
    }

    let mut value_shape = values.shape().to_vec();
    if let Some(first) = value_shape.first_mut() {
        *first = unique.len();
    }
    let unique_len = unique.len();
    let new_indices = ArrayD::from_shape_vec(IxDyn(&[unique_len]), unique)?;
    let new_values = reshape(&value_shape, sums)?;
    ws.set(output(op, 0)?, Blob::Int(new_indices));
    ws.set(output(op, 1)?, Blob::Float(new_values));
    Ok(())
}
