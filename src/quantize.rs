//! Relaxed-to-integer quantization via cubic B-spline interpolation.
//!
//! A real-valued latent `x` is related to nearby integers through four
//! candidates `floor(x) - 1 .. floor(x) + 2` weighted by cubic spline
//! coefficients in the fractional part. The weights sum to one, vary smoothly
//! in `x`, and concentrate on `round(x)`, so gradients through the weights let
//! a continuous sampler move a latent that is marginalized over integers.

use burn::prelude::*;

/// Number of integer candidates per relaxed value.
pub const NUM_QUANT: usize = 4;

/// Smallest probability admitted before taking logs.
const MIN_PROB: f64 = 1e-30;

/// Cubic B-spline weights over the four candidates `lb-1, lb, lb+1, lb+2`
/// as a function of the fractional part `s = x - floor(x)`.
pub fn spline_weights(s: f64) -> [f64; NUM_QUANT] {
    let t = 1.0 - s;
    let ss = s * s;
    let tt = t * t;
    [
        t * tt / 6.0,
        (4.0 + ss * (3.0 * s - 6.0)) / 6.0,
        (4.0 + tt * (3.0 * t - 6.0)) / 6.0,
        s * ss / 6.0,
    ]
}

/// Integer candidates for a single relaxed value, clamped to `[min, max]`.
///
/// Clamping can make boundary candidates coincide; their probability mass
/// then simply merges.
pub fn candidates(x: f64, min: f64, max: f64) -> [f64; NUM_QUANT] {
    let lb = x.floor();
    let mut out = [0.0; NUM_QUANT];
    for (q, slot) in out.iter_mut().enumerate() {
        *slot = (lb + q as f64 - 1.0).clamp(min, max);
    }
    out
}

/// Scalar enumeration: candidates and their log-weights.
pub fn quantize_enumerate_scalar(x: f64, min: f64, max: f64) -> ([f64; NUM_QUANT], [f64; NUM_QUANT]) {
    let cand = candidates(x, min, max);
    let weights = spline_weights(x - x.floor());
    let mut logits = [0.0; NUM_QUANT];
    for (l, w) in logits.iter_mut().zip(weights.iter()) {
        *l = w.max(MIN_PROB).ln();
    }
    (cand, logits)
}

/// Scalar single-point quantization: one categorical draw over the candidates.
pub fn quantize_scalar(x: f64, min: f64, max: f64, rng: &mut impl rand::Rng) -> f64 {
    let cand = candidates(x, min, max);
    let weights = spline_weights(x - x.floor());
    let u: f64 = rng.random();
    let mut acc = 0.0;
    for (c, w) in cand.iter().zip(weights.iter()) {
        acc += w;
        if u < acc {
            return *c;
        }
    }
    cand[NUM_QUANT - 1]
}

/// Tensor enumeration over a `[C, T]` batch of relaxed values.
///
/// Returns `(candidates, logits)`, both `[C, T, NUM_QUANT]`. The candidate
/// grid is a constant (no gradient); the logits stay on the autodiff graph
/// through the fractional part, so the marginal likelihood built from them is
/// differentiable in `x`.
pub fn quantize_enumerate<B: Backend>(
    x: Tensor<B, 2>,
    min: f64,
    max: f64,
) -> (Tensor<B, 3>, Tensor<B, 3>) {
    let [c, t] = x.dims();
    let device = x.device();

    let host: Vec<f64> = x
        .to_data()
        .convert::<f64>()
        .to_vec()
        .expect("dense tensor data");
    let lb_host: Vec<f64> = host.iter().map(|v| v.floor()).collect();

    let mut cand_host = Vec::with_capacity(c * t * NUM_QUANT);
    for lb in &lb_host {
        for q in 0..NUM_QUANT {
            cand_host.push((lb + q as f64 - 1.0).clamp(min, max));
        }
    }
    let cand = Tensor::<B, 3>::from_data(TensorData::new(cand_host, [c, t, NUM_QUANT]), &device);

    let lb = Tensor::<B, 2>::from_data(TensorData::new(lb_host, [c, t]), &device);
    let s = x - lb;
    let t1 = s.clone().neg().add_scalar(1.0);
    let ss = s.clone().powi_scalar(2);
    let tt = t1.clone().powi_scalar(2);

    let w0 = t1.clone() * tt.clone();
    let w1 = ss.clone() * (s.clone().mul_scalar(3.0).sub_scalar(6.0)) + 4.0;
    let w2 = tt * (t1.mul_scalar(3.0).sub_scalar(6.0)) + 4.0;
    let w3 = s * ss;

    let probs = Tensor::cat(
        vec![
            w0.reshape([c, t, 1]),
            w1.reshape([c, t, 1]),
            w2.reshape([c, t, 1]),
            w3.reshape([c, t, 1]),
        ],
        2,
    )
    .div_scalar(6.0);
    let logits = probs.clamp_min(MIN_PROB).log();

    (cand, logits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::ndarray::NdArray;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    type B = NdArray<f64>;

    #[test]
    fn weights_sum_to_one() {
        for i in 0..=10 {
            let s = i as f64 / 10.0;
            let w = spline_weights(s);
            assert_abs_diff_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
            assert!(w.iter().all(|&wi| wi >= 0.0));
        }
    }

    #[test]
    fn weights_symmetric() {
        let a = spline_weights(0.25);
        let b = spline_weights(0.75);
        for q in 0..NUM_QUANT {
            assert_abs_diff_eq!(a[q], b[NUM_QUANT - 1 - q], epsilon = 1e-12);
        }
    }

    #[test]
    fn integer_input_concentrates_on_itself() {
        let w = spline_weights(0.0);
        // At an exact integer the middle candidates lb and lb+1 carry 4/6 and
        // 1/6; the value itself (candidate index 1) dominates.
        assert_abs_diff_eq!(w[1], 4.0 / 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[0], 1.0 / 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[3], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn candidates_clamped() {
        let c = candidates(0.2, 0.0, 10.0);
        assert_eq!(c, [0.0, 0.0, 1.0, 2.0]);
        let c = candidates(9.9, 0.0, 10.0);
        assert_eq!(c, [8.0, 9.0, 10.0, 10.0]);
    }

    #[test]
    fn tensor_matches_scalar() {
        let values = [0.3, 1.9, 4.5, 7.01];
        let x = Tensor::<B, 2>::from_data(
            TensorData::new(values.to_vec(), [2, 2]),
            &Default::default(),
        );
        let (cand, logits) = quantize_enumerate(x, 0.0, 10.0);
        let cand: Vec<f64> = cand.to_data().to_vec().unwrap();
        let logits: Vec<f64> = logits.to_data().to_vec().unwrap();

        for (i, &v) in values.iter().enumerate() {
            let (c_ref, l_ref) = quantize_enumerate_scalar(v, 0.0, 10.0);
            for q in 0..NUM_QUANT {
                assert_abs_diff_eq!(cand[i * NUM_QUANT + q], c_ref[q], epsilon = 1e-12);
                assert_abs_diff_eq!(logits[i * NUM_QUANT + q], l_ref[q], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn single_draw_follows_weights() {
        let mut rng = SmallRng::seed_from_u64(7);
        let n = 20_000;
        let mut counts = [0usize; NUM_QUANT];
        for _ in 0..n {
            let v = quantize_scalar(3.5, 0.0, 10.0, &mut rng);
            let idx = (v - 2.0) as usize;
            counts[idx] += 1;
        }
        let w = spline_weights(0.5);
        for q in 0..NUM_QUANT {
            let freq = counts[q] as f64 / n as f64;
            assert_abs_diff_eq!(freq, w[q], epsilon = 0.02);
        }
    }
}
