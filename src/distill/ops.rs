//! Row-wise numeric kernels shared by the loss terms and the validation runner

use crate::{Error, Result};
use ndarray::{Array2, ArrayView1, Axis};

/// Probabilities below this are clamped before taking logarithms
pub(crate) const LOG_EPSILON: f32 = 1e-10;

/// Integer ratio between an expanded batch and its source batch
///
/// Returns an error when the ratio is not integral, which is always a
/// configuration or programming error.
pub fn tile_factor(rows: usize, base_rows: usize) -> Result<usize> {
    if base_rows == 0 || rows == 0 || rows % base_rows != 0 {
        return Err(Error::ShapeMismatch {
            expected: vec![base_rows],
            got: vec![rows],
        });
    }
    Ok(rows / base_rows)
}

/// Repeat every row `factor` times consecutively: `out[i * factor + j] == x[i]`
pub fn tile_rows(x: &Array2<f32>, factor: usize) -> Array2<f32> {
    if factor == 1 {
        return x.clone();
    }
    let (rows, cols) = x.dim();
    Array2::from_shape_fn((rows * factor, cols), |(r, c)| x[[r / factor, c]])
}

/// Tile `x` so that it has exactly `rows` rows
pub fn tile_to(x: &Array2<f32>, rows: usize) -> Result<Array2<f32>> {
    let factor = tile_factor(rows, x.nrows())?;
    Ok(tile_rows(x, factor))
}

/// Numerically stable softmax along the last axis
pub fn softmax_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut result = x.clone();
    for mut row in result.axis_iter_mut(Axis(0)) {
        let max_val = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max_val).exp());
        let sum: f32 = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    result
}

/// Log-softmax along the last axis
pub fn log_softmax_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut result = x.clone();
    for mut row in result.axis_iter_mut(Axis(0)) {
        let max_val = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let log_sum = row.iter().map(|&v| (v - max_val).exp()).sum::<f32>().ln() + max_val;
        row.mapv_inplace(|v| v - log_sum);
    }
    result
}

/// Shannon entropy (nats) of every probability row
pub fn entropy_rows(probs: &Array2<f32>) -> Vec<f32> {
    probs
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .filter(|&&p| p > LOG_EPSILON)
                .map(|&p| -p * p.ln())
                .sum()
        })
        .collect()
}

fn argmax(row: ArrayView1<'_, f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best_i, best_v), (i, &v)| {
            if v > best_v {
                (i, v)
            } else {
                (best_i, best_v)
            }
        })
        .0
}

/// Index of the largest entry of every row
pub fn argmax_rows(x: &Array2<f32>) -> Vec<usize> {
    x.axis_iter(Axis(0)).map(argmax).collect()
}

/// Fraction of rows whose argmax matches the (tiled) label argmax
///
/// `labels` may be one-hot or soft; it is tiled to the logits row count.
pub fn accuracy(logits: &Array2<f32>, labels: &Array2<f32>) -> Result<f32> {
    if logits.nrows() == 0 {
        return Ok(0.0);
    }
    let factor = tile_factor(logits.nrows(), labels.nrows())?;
    let predicted = argmax_rows(logits);
    let expected = argmax_rows(labels);
    let correct = predicted
        .iter()
        .enumerate()
        .filter(|&(i, &p)| p == expected[i / factor])
        .count();
    Ok(correct as f32 / logits.nrows() as f32)
}

/// Mean softmax cross-entropy and its gradient with respect to the logits
///
/// `labels` must already have the same shape as `logits`.
/// The gradient is `(softmax(logits) - labels) / rows`.
pub fn softmax_cross_entropy(
    labels: &Array2<f32>,
    logits: &Array2<f32>,
) -> Result<(f32, Array2<f32>)> {
    if labels.dim() != logits.dim() {
        return Err(Error::ShapeMismatch {
            expected: logits.shape().to_vec(),
            got: labels.shape().to_vec(),
        });
    }
    let rows = logits.nrows().max(1) as f32;
    let log_probs = log_softmax_rows(logits);
    let loss = -(labels * &log_probs).sum() / rows;
    let grad = (log_probs.mapv(f32::exp) - labels) / rows;
    Ok((loss, grad))
}

/// Product of the row-wise softmax Jacobian with `u`: `p * u - p * <p, u>`
///
/// This is the Hessian-vector product of softmax cross-entropy with respect to
/// its logits, up to the `1 / rows` scale.
pub fn softmax_jvp(probs: &Array2<f32>, u: &Array2<f32>) -> Array2<f32> {
    let mut out = probs * u;
    for (mut row, p_row) in out.axis_iter_mut(Axis(0)).zip(probs.axis_iter(Axis(0))) {
        let dot: f32 = row.sum();
        row.zip_mut_with(&p_row, |o, &p| *o -= p * dot);
    }
    out
}
