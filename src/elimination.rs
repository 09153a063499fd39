//! Log-space variable elimination over chains of transition matrices.
//!
//! `logmatmulexp` is matrix multiplication in log space: shift each operand by
//! a detached row/column maximum, multiply in probability space, then shift
//! back. Folding it over a `[T, S, S]` stack contracts out all intermediate
//! joint states, leaving the exact marginal over the first and last step.

use burn::prelude::*;
use burn::tensor::ElementConversion;

/// Floor on probabilities before taking logs; keeps gradients finite where a
/// whole product row is impossible.
const MIN_PROB: f64 = 1e-300;

/// Detached maximum of a `[M, N]` tensor along `dim`, with non-finite maxima
/// replaced by zero so fully impossible rows shift by nothing.
fn detached_max<B: Backend>(t: &Tensor<B, 2>, dim: usize) -> Tensor<B, 2> {
    let [m, n] = t.dims();
    let host: Vec<f64> = t
        .to_data()
        .convert::<f64>()
        .to_vec()
        .expect("dense tensor data");

    let (len, stride_out, stride_in, count) = if dim == 1 {
        (m, n, 1usize, n)
    } else {
        (n, 1usize, n, m)
    };
    let mut maxes = vec![f64::NEG_INFINITY; len];
    for (i, mx) in maxes.iter_mut().enumerate() {
        for k in 0..count {
            let v = host[i * stride_out + k * stride_in];
            if v > *mx {
                *mx = v;
            }
        }
        if !mx.is_finite() {
            *mx = 0.0;
        }
    }

    let shape = if dim == 1 { [m, 1] } else { [1, n] };
    Tensor::from_data(TensorData::new(maxes, shape), &t.device())
}

/// `log(exp(a) @ exp(b))`, numerically stabilized.
pub fn logmatmulexp<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 2> {
    let a_max = detached_max(&a, 1); // [M, 1]
    let b_max = detached_max(&b, 0); // [1, N]
    let prod = (a - a_max.clone()).exp().matmul((b - b_max.clone()).exp());
    prod.clamp_min(MIN_PROB).log() + a_max + b_max
}

/// Folds `logmatmulexp` over the leading axis of a `[T, S, S]` stack,
/// returning the `[S, S]` log marginal over (state at step -1, state at the
/// last step).
pub fn sequential_logmatmulexp<B: Backend>(logp: Tensor<B, 3>) -> Tensor<B, 2> {
    let [t, s, _] = logp.dims();
    let mut result = logp.clone().slice([0..1, 0..s, 0..s]).reshape([s, s]);
    for step in 1..t {
        let m = logp
            .clone()
            .slice([step..step + 1, 0..s, 0..s])
            .reshape([s, s]);
        result = logmatmulexp(result, m);
    }
    result
}

/// Log-sum-exp over every element, returned as a one-element tensor.
pub fn logsumexp_all<B: Backend, const D: usize>(t: Tensor<B, D>) -> Tensor<B, 1> {
    let n = t.shape().num_elements();
    let flat: Tensor<B, 1> = t.reshape([n]);
    let mx = flat.clone().max();
    let m: f64 = mx.clone().into_scalar().elem();
    if !m.is_finite() {
        // All -inf (or a NaN/inf already present); nothing to stabilize.
        return mx;
    }
    let mx = mx.detach();
    (flat - mx.clone())
        .exp()
        .sum()
        .clamp_min(MIN_PROB)
        .log()
        + mx
}

/// Scalar log-sum-exp with an empty/-inf guard, for host-side filtering.
pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let mx = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !mx.is_finite() {
        return mx;
    }
    let sum: f64 = xs.iter().map(|x| (x - mx).exp()).sum();
    mx + sum.ln()
}
