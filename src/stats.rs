//! Convergence diagnostics over raw posterior draws.
//!
//! Split R-hat and effective sample size follow the STAN methodology: each
//! chain is split in half, between/within variances give the potential scale
//! reduction, and ESS comes from paired autocorrelation sums with
//! autocovariances computed by FFT (brute force for short chains).

use core::fmt;
use ndarray::{concatenate, prelude::*, stack};
use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};
use std::cmp::Ordering;

/// Five-number style summary of a per-parameter diagnostic.
#[derive(Clone, Debug, PartialEq, PartialOrd)]
pub struct BasicStats {
    pub name: String,
    pub min: f64,
    pub median: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

impl fmt::Display for BasicStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in [{:.2}, {:.2}], median: {:.2}, mean: {:.2} +- {:.2}",
            self.name, self.min, self.max, self.median, self.mean, self.std
        )
    }
}

/// Summary diagnostics of one sampling run.
#[derive(Clone, Debug, PartialEq, PartialOrd)]
pub struct RunStats {
    pub ess: BasicStats,
    pub rhat: BasicStats,
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.ess, self.rhat)
    }
}

impl From<ArrayView3<'_, f64>> for RunStats {
    /// Summarizes a `[chains, draws, params]` array of posterior draws.
    fn from(sample: ArrayView3<f64>) -> Self {
        let (rhat, ess) = split_rhat_mean_ess(sample);
        RunStats {
            ess: basic_stats("ESS", ess),
            rhat: basic_stats("Split R-hat", rhat),
        }
    }
}

fn basic_stats(name: &str, mut data: Array1<f64>) -> BasicStats {
    data.as_slice_mut()
        .expect("contiguous diagnostic array")
        .sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let min = data[0];
    let median = data[data.len() / 2];
    let max = data[data.len() - 1];
    let mean = data.mean().expect("nonempty diagnostic array");
    let std = data.std(1.0);
    BasicStats {
        name: name.to_string(),
        min,
        median,
        max,
        mean,
        std,
    }
}

/// Splits each chain in half along the draw axis: `(c, n, p)` becomes
/// `(2c, n/2, p)`.
fn splitcat(sample: ArrayView3<f64>) -> Array3<f64> {
    let n = sample.shape()[1];
    let half = (n / 2) as i32;
    let half_1 = sample.slice(s![.., ..half, ..]);
    let half_2 = sample.slice(s![.., -half.., ..]);
    concatenate(Axis(0), &[half_1, half_2]).expect("concatenating chain halves")
}

/// Split R-hat and ESS per parameter for a `[chains, draws, params]` sample.
pub fn split_rhat_mean_ess(sample: ArrayView3<f64>) -> (Array1<f64>, Array1<f64>) {
    let splitted = splitcat(sample);
    let (within, var) = withinvar(splitted.view());
    let rhat = (var.clone() / within.clone()).sqrt();
    let ess = ess(splitted.view(), within.view(), var.view());
    (rhat, ess)
}

fn withinvar(sample: ArrayView3<f64>) -> (Array1<f64>, Array1<f64>) {
    let c = sample.shape()[0];
    let n = sample.shape()[1];
    let p = sample.shape()[2];

    let stats: Vec<(f64, f64)> = (0..p)
        .into_par_iter()
        .map(|param_idx| {
            let data_p = sample.slice(s![.., .., param_idx]);

            let chain_means = data_p.mean_axis(Axis(1)).expect("chain means");
            let overall_mean = chain_means.mean().expect("overall mean");

            let diff = &chain_means - overall_mean;
            let between = diff.pow2().sum() * ((n as f64) / ((c - 1) as f64));

            let mut squares = Vec::with_capacity(c);
            for chain_i in 0..c {
                let row = data_p.slice(s![chain_i, ..]);
                let cm = chain_means[chain_i];
                let sq = row.iter().map(|v| (v - cm) * (v - cm)).sum::<f64>() / (n as f64);
                squares.push(sq);
            }
            let within = Array1::from(squares).mean().expect("within variance");
            let var = ((n as f64 - 1.0) / (n as f64)) * within + between / (n as f64);
            (within, var)
        })
        .collect();

    let (within, var): (Vec<f64>, Vec<f64>) = stats.into_iter().unzip();
    (Array1::from_vec(within), Array1::from_vec(var))
}

/// Effective sample size per parameter via paired autocorrelation sums.
fn ess(sample: ArrayView3<f64>, within: ArrayView1<f64>, var: ArrayView1<f64>) -> Array1<f64> {
    let shape = sample.shape();
    let (n_chains, n_steps, n_params) = (shape[0], shape[1], shape[2]);

    let chain_rho: Vec<Array2<f64>> = (0..n_chains)
        .map(|c| autocov(sample.index_axis(Axis(0), c)))
        .collect();
    let chain_rho: Vec<ArrayView2<f64>> = chain_rho.iter().map(|x| x.view()).collect();
    let chain_rho = stack(Axis(0), &chain_rho).expect("stacking autocovariances");
    let avg_rho = chain_rho.mean_axis(Axis(0)).expect("mean autocovariance");

    let diff = -avg_rho
        + within
            .broadcast((n_steps, n_params))
            .expect("broadcasting within variances");
    let rho = -(diff
        / var
            .broadcast((n_steps, n_params))
            .expect("broadcasting variances"))
        + 1.0;

    let tau: Vec<f64> = (0..n_params)
        .into_par_iter()
        .map(|d| {
            let rho_d = rho.index_axis(Axis(1), d).to_owned();

            let mut min = if rho_d.len() >= 2 {
                rho_d[[0]] + rho_d[[1]]
            } else {
                0.0
            };

            let mut out = 0.0;
            for rho_t in rho_d.windows_with_stride(2, 2) {
                let mut p_t = rho_t[0] + rho_t[1];
                if p_t <= 0.0 {
                    break;
                }
                if p_t > min {
                    p_t = min;
                }
                min = p_t;
                out += p_t;
            }
            -1.0 + 2.0 * out
        })
        .collect();
    let tau = Array1::from_vec(tau);
    tau.recip() * n_chains as f64 * n_steps as f64
}

fn autocov(sample: ArrayView2<f64>) -> Array2<f64> {
    if sample.nrows() <= 100 {
        autocov_bf(sample)
    } else {
        autocov_fft(sample)
    }
}

/// FFT autocovariance of each column of an `(n, d)` array, zero-padded to
/// avoid circular wrap-around. rustfft does not normalize, so `1/n_padded` is
/// applied explicitly.
fn autocov_fft(sample: ArrayView2<f64>) -> Array2<f64> {
    let (n, d) = (sample.shape()[0], sample.shape()[1]);
    let mut planner = FftPlanner::<f64>::new();

    let mut n_padded = 1;
    while n_padded < 2 * n - 1 {
        n_padded <<= 1;
    }
    let fft = planner.plan_fft_forward(n_padded);
    let ffti = planner.plan_fft_inverse(n_padded);
    let out: Vec<f64> = sample
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|traj| {
            let traj_mean = traj.sum() / traj.len() as f64;
            let mut x: Vec<Complex<f64>> = traj
                .iter()
                .map(|xi| Complex {
                    re: *xi - traj_mean,
                    im: 0.0,
                })
                .chain([Complex { re: 0.0, im: 0.0 }].repeat(n_padded - n))
                .collect();
            fft.process(x.as_mut_slice());
            x.iter_mut().for_each(|xi| {
                *xi *= xi.conj();
            });
            ffti.process(x.as_mut_slice());
            x.iter_mut()
                .take(n)
                .map(|xi| xi.re / n_padded as f64 / n as f64)
                .collect::<Vec<f64>>()
        })
        .flatten_iter()
        .collect();
    let out = Array2::from_shape_vec((d, n), out).expect("autocovariance shape");
    out.t().to_owned()
}

/// Brute-force autocovariance of each column of an `(n, d)` array.
fn autocov_bf(data: ArrayView2<f64>) -> Array2<f64> {
    let (n, d) = data.dim();
    let mut out = Array2::<f64>::zeros((n, d));

    out.axis_iter_mut(Axis(1))
        .into_par_iter()
        .enumerate()
        .for_each(|(col_idx, mut out_col)| {
            let col_data = data.column(col_idx);
            let col_data = col_data.to_owned() - col_data.mean().expect("nonempty column");

            for lag in 0..n {
                let mut sum_lag = 0.0;
                for t in 0..(n - lag) {
                    sum_lag += col_data[t] * col_data[t + lag];
                }
                out_col[lag] = sum_lag / n as f64;
            }
        });
    out
}
