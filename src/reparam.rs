//! Discrete-cosine smoothing of time-indexed latents.
//!
//! The sampler's coordinate for a length-`N` latent row is its orthonormal
//! DCT-II spectrum scaled by `(1 + k)^smooth`. Unit-scale sampler moves then
//! perturb high frequencies by `(1 + k)^-smooth`, biasing exploration toward
//! smooth trajectories without changing the posterior: the map is linear and
//! invertible, so its Jacobian is constant.

use burn::prelude::*;
use ndarray::{Array1, Array2};
use std::f64::consts::PI;

#[derive(Debug, Clone)]
pub struct DctSmoothing {
    len: usize,
    /// Orthonormal DCT-II basis, `basis[[k, n]]`; its transpose is the
    /// inverse transform.
    basis: Array2<f64>,
    /// Frequency scaling `(1 + k)^smooth`.
    weights: Array1<f64>,
}

impl DctSmoothing {
    pub fn new(len: usize, smooth: f64) -> Self {
        let n = len as f64;
        let mut basis = Array2::zeros((len, len));
        for k in 0..len {
            let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
            for j in 0..len {
                basis[[k, j]] = scale * (PI * (2.0 * j as f64 + 1.0) * k as f64 / (2.0 * n)).cos();
            }
        }
        let weights = Array1::from_iter((0..len).map(|k| (1.0 + k as f64).powf(smooth)));
        Self {
            len,
            basis,
            weights,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sampler coordinates of a latent row: scaled spectrum.
    pub fn to_coords(&self, row: &[f64]) -> Vec<f64> {
        (0..self.len)
            .map(|k| {
                let dot: f64 = (0..self.len).map(|j| self.basis[[k, j]] * row[j]).sum();
                dot * self.weights[k]
            })
            .collect()
    }

    /// Latent row from sampler coordinates: inverse transform of the
    /// unscaled spectrum.
    pub fn from_coords(&self, coords: &[f64]) -> Vec<f64> {
        (0..self.len)
            .map(|j| {
                (0..self.len)
                    .map(|k| self.basis[[k, j]] * coords[k] / self.weights[k])
                    .sum()
            })
            .collect()
    }

    /// The inverse map as a constant `[N, N]` matrix `M` with
    /// `row = M @ coords`, for use inside the differentiable potential.
    /// For a `[C, N]` coordinate batch, `rows = coords @ M^T`.
    pub fn inverse_matrix<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let mut data = Vec::with_capacity(self.len * self.len);
        for j in 0..self.len {
            for k in 0..self.len {
                data.push(self.basis[[k, j]] / self.weights[k]);
            }
        }
        Tensor::from_data(TensorData::new(data, [self.len, self.len]), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::ndarray::NdArray;

    type B = NdArray<f64>;

    #[test]
    fn round_trips() {
        let dct = DctSmoothing::new(8, 1.5);
        let row = [3.0, 1.0, -2.0, 0.5, 4.0, 4.0, -1.0, 0.0];
        let coords = dct.to_coords(&row);
        let back = dct.from_coords(&coords);
        for (a, b) in row.iter().zip(back.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn constant_row_is_pure_dc() {
        let dct = DctSmoothing::new(6, 2.0);
        let coords = dct.to_coords(&[5.0; 6]);
        assert_abs_diff_eq!(coords[0], 5.0 * (6.0f64).sqrt(), epsilon = 1e-10);
        for c in &coords[1..] {
            assert_abs_diff_eq!(*c, 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn matrix_matches_from_coords() {
        let dct = DctSmoothing::new(5, 0.7);
        let coords = [0.4, -1.0, 2.2, 0.0, -0.3];
        let want = dct.from_coords(&coords);

        let device = Default::default();
        let m = dct.inverse_matrix::<B>(&device);
        let y = Tensor::<B, 2>::from_data(TensorData::new(coords.to_vec(), [5, 1]), &device);
        let got: Vec<f64> = m.matmul(y).to_data().to_vec().unwrap();
        for (a, b) in got.iter().zip(want.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn smoothing_damps_high_frequencies() {
        let dct = DctSmoothing::new(16, 2.0);
        let mut low = vec![0.0; 16];
        low[1] = 1.0;
        let mut high = vec![0.0; 16];
        high[15] = 1.0;
        let low_row = dct.from_coords(&low);
        let high_row = dct.from_coords(&high);
        let norm = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>().sqrt();
        assert!(norm(&high_row) < norm(&low_row) / 10.0);
    }
}
