//! No-U-Turn Sampler over burn autodiff tensors.
//!
//! Independent chains run in parallel via Rayon, each with dual-averaging
//! step-size adaptation, dynamic trajectory lengths capped by a maximum tree
//! depth, and warmup estimation of a diagonal or dense mass matrix from the
//! middle half of the warmup draws.
//!
//! ## Inspiration
//! Tree building follows [mfouesneau/NUTS](https://github.com/mfouesneau/NUTS).

use crate::stats::RunStats;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use nalgebra::{Cholesky, DMatrix};
use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::distr::Distribution as RandDistribution;
// Bind to rand's Distribution to avoid mismatches from transitive rand deps.
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Exp1, StandardNormal};
use rayon::prelude::*;
use std::sync::Arc;

/// A differentiable unnormalized log-density.
pub trait GradientTarget<B: AutodiffBackend>: Send + Sync {
    /// Unnormalized log-density at `position`, as a one-element tensor.
    fn unnorm_logp(&self, position: Tensor<B, 1>) -> Tensor<B, 1>;

    /// Log-density and its gradient, via reverse-mode autodiff.
    fn unnorm_logp_and_grad(&self, position: Tensor<B, 1>) -> (f64, Tensor<B, 1>) {
        let pos = position.detach().require_grad();
        let logp = self.unnorm_logp(pos.clone());
        let logp_val: f64 = logp.clone().into_scalar().elem();
        let grads = logp.backward();
        let grad = match pos.grad(&grads) {
            Some(g) => Tensor::from_inner(g),
            None => pos.zeros_like(),
        };
        (logp_val, grad)
    }
}

/// Structure of the mass matrix estimated during warmup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MassStructure {
    Diagonal,
    Dense,
}

/// Sampler configuration.
#[derive(Debug, Clone, Copy)]
pub struct NutsOptions {
    /// Desired average acceptance probability for dual averaging.
    pub target_accept: f64,
    /// Cap on trajectory doublings per step.
    pub max_tree_depth: usize,
    pub mass: MassStructure,
    /// Render per-chain progress bars while running.
    pub progress: bool,
}

impl Default for NutsOptions {
    fn default() -> Self {
        Self {
            target_accept: 0.8,
            max_tree_depth: 10,
            mass: MassStructure::Diagonal,
            progress: false,
        }
    }
}

/// The kinetic-energy metric. `sigma` is the estimated posterior covariance;
/// momenta are drawn from its inverse, and velocities are `sigma @ momentum`.
#[derive(Debug, Clone)]
enum Mass<B: AutodiffBackend> {
    Identity,
    Diagonal {
        sigma: Tensor<B, 1>,
        inv_sqrt: Tensor<B, 1>,
    },
    Dense {
        sigma: Tensor<B, 2>,
        chol_precision: Tensor<B, 2>,
    },
}

impl<B: AutodiffBackend> Mass<B> {
    fn sample_momentum(&self, dim: usize, rng: &mut SmallRng, device: &B::Device) -> Tensor<B, 1> {
        let z: Vec<f64> = (0..dim).map(|_| StandardNormal.sample(rng)).collect();
        let z = Tensor::<B, 1>::from_data(TensorData::new(z, [dim]), device);
        match self {
            Mass::Identity => z,
            Mass::Diagonal { inv_sqrt, .. } => z * inv_sqrt.clone(),
            Mass::Dense {
                chol_precision, ..
            } => chol_precision
                .clone()
                .matmul(z.reshape([dim, 1]))
                .reshape([dim]),
        }
    }

    fn velocity(&self, momentum: &Tensor<B, 1>) -> Tensor<B, 1> {
        match self {
            Mass::Identity => momentum.clone(),
            Mass::Diagonal { sigma, .. } => momentum.clone() * sigma.clone(),
            Mass::Dense { sigma, .. } => {
                let [dim] = momentum.dims();
                sigma
                    .clone()
                    .matmul(momentum.clone().reshape([dim, 1]))
                    .reshape([dim])
            }
        }
    }

    fn kinetic(&self, momentum: &Tensor<B, 1>) -> f64 {
        0.5 * dot(momentum, &self.velocity(momentum))
    }
}

fn dot<B: AutodiffBackend>(a: &Tensor<B, 1>, b: &Tensor<B, 1>) -> f64 {
    (a.clone() * b.clone()).sum().into_scalar().elem()
}

fn to_host<B: AutodiffBackend>(t: &Tensor<B, 1>) -> Vec<f64> {
    t.to_data()
        .convert::<f64>()
        .to_vec()
        .expect("dense tensor data")
}

/// No-U-Turn Sampler spanning multiple chains.
pub struct Nuts<B, T>
where
    B: AutodiffBackend,
    T: GradientTarget<B>,
{
    chains: Vec<NutsChain<B, T>>,
    progress: bool,
}

impl<B, T> Nuts<B, T>
where
    B: AutodiffBackend,
    T: GradientTarget<B>,
    NutsChain<B, T>: Send,
{
    /// One chain per initial position, all sharing `target`.
    pub fn new(target: T, initial_positions: Vec<Vec<f64>>, options: NutsOptions) -> Self {
        let target = Arc::new(target);
        let progress = options.progress;
        let chains = initial_positions
            .into_iter()
            .map(|pos| NutsChain::new_shared(Arc::clone(&target), pos, options))
            .collect();
        Self { chains, progress }
    }

    /// Re-seeds every chain deterministically from a base seed.
    pub fn set_seed(mut self, seed: u64) -> Self {
        // Note: Burn backend seeding is global; this affects other samplers
        // on the same backend.
        B::seed(seed);
        for (i, chain) in self.chains.iter_mut().enumerate() {
            chain.rng = SmallRng::seed_from_u64(seed + i as u64 + 1);
        }
        self
    }

    /// Runs all chains for `n_collect + n_discard` steps each, adapting
    /// during the first `n_discard`, and returns the collected draws as a
    /// `[chains, n_collect, dim]` array plus summary diagnostics.
    pub fn run(&mut self, n_collect: usize, n_discard: usize) -> (Array3<f64>, RunStats) {
        let multi = self.progress.then(MultiProgress::new);
        let style = ProgressStyle::default_bar()
            .template("{prefix:8} {bar:40.cyan/blue} {pos}/{len} ({eta}) | {msg}")
            .expect("valid progress template")
            .progress_chars("=>-");
        let bars: Vec<Option<ProgressBar>> = (0..self.chains.len())
            .map(|i| {
                multi.as_ref().map(|m| {
                    let pb = m.add(ProgressBar::new((n_collect + n_discard) as u64));
                    pb.set_style(style.clone());
                    pb.set_prefix(format!("Chain {i}"));
                    pb
                })
            })
            .collect();

        let results: Vec<Array2<f64>> = self
            .chains
            .par_iter_mut()
            .zip(bars)
            .map(|(chain, bar)| chain.run(n_collect, n_discard, bar))
            .collect();

        let views: Vec<ArrayView2<f64>> = results.iter().map(|r| r.view()).collect();
        let sample = ndarray::stack(Axis(0), &views).expect("stacking chain samples");
        let stats = RunStats::from(sample.view());
        (sample, stats)
    }
}

/// Single-chain state and adaptation.
pub struct NutsChain<B, T>
where
    B: AutodiffBackend,
    T: GradientTarget<B>,
{
    target: Arc<T>,
    position: Tensor<B, 1>,
    options: NutsOptions,
    mass: Mass<B>,
    epsilon: f64,
    epsilon_bar: f64,
    h_bar: f64,
    mu: f64,
    adapt_m: usize,
    rng: SmallRng,
}

const GAMMA: f64 = 0.05;
const T_0: f64 = 10.0;
const KAPPA: f64 = 0.75;

impl<B, T> NutsChain<B, T>
where
    B: AutodiffBackend,
    T: GradientTarget<B>,
{
    fn new_shared(target: Arc<T>, initial_position: Vec<f64>, options: NutsOptions) -> Self {
        let dim = initial_position.len();
        let device = B::Device::default();
        let position =
            Tensor::<B, 1>::from_data(TensorData::new(initial_position, [dim]), &device);
        let mut thread_rng = rand::rng();
        Self {
            target,
            position,
            options,
            mass: Mass::Identity,
            epsilon: -1.0, // sentinel: searched at run start
            epsilon_bar: 1.0,
            h_bar: 0.0,
            mu: 0.0,
            adapt_m: 0,
            rng: SmallRng::from_rng(&mut thread_rng),
        }
    }

    fn reset_step_size(&mut self) {
        self.epsilon = find_reasonable_epsilon(
            self.target.as_ref(),
            &self.mass,
            &self.position,
            &mut self.rng,
        );
        self.mu = (10.0 * self.epsilon).ln();
        self.epsilon_bar = 1.0;
        self.h_bar = 0.0;
        self.adapt_m = 0;
    }

    fn run(
        &mut self,
        n_collect: usize,
        n_discard: usize,
        bar: Option<ProgressBar>,
    ) -> Array2<f64> {
        let dim = self.position.dims()[0];
        self.reset_step_size();

        // Estimate the mass matrix from the middle half of warmup, then
        // restart step-size adaptation under the new metric.
        let window = if n_discard >= 40 {
            Some((n_discard / 4, 3 * n_discard / 4))
        } else {
            None
        };
        let mut window_draws: Vec<Vec<f64>> = Vec::new();

        let mut sample = Array2::<f64>::zeros((n_collect, dim));
        let total = n_collect + n_discard;
        for m in 0..total {
            let alpha = self.step(m < n_discard);

            if let Some((start, end)) = window {
                if m >= start && m < end {
                    window_draws.push(to_host(&self.position));
                }
                if m + 1 == end {
                    if let Some(mass) =
                        estimate_mass::<B>(&window_draws, self.options.mass, &self.position.device())
                    {
                        self.mass = mass;
                        self.reset_step_size();
                    }
                    window_draws.clear();
                }
            }

            if m >= n_discard {
                let host = to_host(&self.position);
                sample
                    .slice_mut(s![m - n_discard, ..])
                    .assign(&ArrayView1::from(&host));
            }
            if let Some(pb) = &bar {
                pb.inc(1);
                pb.set_message(format!("p(accept)~{alpha:.2}"));
            }
        }
        if let Some(pb) = &bar {
            pb.finish();
        }
        sample
    }

    /// One NUTS update; returns the step's mean Metropolis acceptance
    /// statistic.
    fn step(&mut self, adapting: bool) -> f64 {
        let device = self.position.device();
        let dim = self.position.dims()[0];

        let mom_0 = self.mass.sample_momentum(dim, &mut self.rng, &device);
        let (logp, grad) = self.target.unnorm_logp_and_grad(self.position.clone());
        let joint = logp - self.mass.kinetic(&mom_0);
        let exp1: f64 = Exp1.sample(&mut self.rng);
        let logu = joint - exp1;

        let mut pos_minus = self.position.clone();
        let mut pos_plus = self.position.clone();
        let mut mom_minus = mom_0.clone();
        let mut mom_plus = mom_0.clone();
        let mut grad_minus = grad.clone();
        let mut grad_plus = grad;
        let mut j = 0;
        let mut n = 1usize;
        let mut keep_going = true;
        let mut alpha = 0.0;
        let mut n_alpha = 1usize;

        while keep_going && j < self.options.max_tree_depth {
            let v: i8 = if self.rng.random::<f64>() < 0.5 { -1 } else { 1 };

            let tree = if v == -1 {
                build_tree(
                    self.target.as_ref(),
                    &self.mass,
                    pos_minus.clone(),
                    mom_minus.clone(),
                    grad_minus.clone(),
                    logu,
                    v,
                    j,
                    self.epsilon,
                    joint,
                    &mut self.rng,
                )
            } else {
                build_tree(
                    self.target.as_ref(),
                    &self.mass,
                    pos_plus.clone(),
                    mom_plus.clone(),
                    grad_plus.clone(),
                    logu,
                    v,
                    j,
                    self.epsilon,
                    joint,
                    &mut self.rng,
                )
            };
            if v == -1 {
                pos_minus = tree.pos_minus;
                mom_minus = tree.mom_minus;
                grad_minus = tree.grad_minus;
            } else {
                pos_plus = tree.pos_plus;
                mom_plus = tree.mom_plus;
                grad_plus = tree.grad_plus;
            }

            if tree.keep_going && self.rng.random::<f64>() < tree.n as f64 / n as f64 {
                self.position = tree.pos_prime;
            }
            n += tree.n;
            alpha = tree.alpha;
            n_alpha = tree.n_alpha;

            keep_going = tree.keep_going
                && no_u_turn(&self.mass, &pos_minus, &pos_plus, &mom_minus, &mom_plus);
            j += 1;
        }

        let alpha_stat = alpha / n_alpha as f64;
        if adapting {
            self.adapt_m += 1;
            let m = self.adapt_m as f64;
            let eta = 1.0 / (m + T_0);
            self.h_bar = (1.0 - eta) * self.h_bar + eta * (self.options.target_accept - alpha_stat);
            self.epsilon = (self.mu - m.sqrt() / GAMMA * self.h_bar).exp();
            let eta = m.powf(-KAPPA);
            self.epsilon_bar =
                ((1.0 - eta) * self.epsilon_bar.ln() + eta * self.epsilon.ln()).exp();
        } else {
            self.epsilon = self.epsilon_bar;
        }
        alpha_stat
    }
}

/// Result of one `build_tree` recursion.
struct Subtree<B: AutodiffBackend> {
    pos_minus: Tensor<B, 1>,
    mom_minus: Tensor<B, 1>,
    grad_minus: Tensor<B, 1>,
    pos_plus: Tensor<B, 1>,
    mom_plus: Tensor<B, 1>,
    grad_plus: Tensor<B, 1>,
    pos_prime: Tensor<B, 1>,
    n: usize,
    keep_going: bool,
    alpha: f64,
    n_alpha: usize,
}

#[allow(clippy::too_many_arguments)]
fn build_tree<B, T>(
    target: &T,
    mass: &Mass<B>,
    pos: Tensor<B, 1>,
    mom: Tensor<B, 1>,
    grad: Tensor<B, 1>,
    logu: f64,
    v: i8,
    j: usize,
    epsilon: f64,
    joint_0: f64,
    rng: &mut SmallRng,
) -> Subtree<B>
where
    B: AutodiffBackend,
    T: GradientTarget<B>,
{
    if j == 0 {
        let (pos_prime, mom_prime, grad_prime, logp_prime) =
            leapfrog(target, mass, pos, mom, grad, v as f64 * epsilon);
        let joint = logp_prime - mass.kinetic(&mom_prime);
        let n = (logu < joint) as usize;
        let keep_going = (logu - 1000.0) < joint;
        let alpha = (joint - joint_0).exp().min(1.0);
        Subtree {
            pos_minus: pos_prime.clone(),
            mom_minus: mom_prime.clone(),
            grad_minus: grad_prime.clone(),
            pos_plus: pos_prime.clone(),
            mom_plus: mom_prime,
            grad_plus: grad_prime,
            pos_prime,
            n,
            keep_going,
            alpha,
            n_alpha: 1,
        }
    } else {
        let mut tree = build_tree(target, mass, pos, mom, grad, logu, v, j - 1, epsilon, joint_0, rng);
        if tree.keep_going {
            let next = if v == -1 {
                build_tree(
                    target,
                    mass,
                    tree.pos_minus.clone(),
                    tree.mom_minus.clone(),
                    tree.grad_minus.clone(),
                    logu,
                    v,
                    j - 1,
                    epsilon,
                    joint_0,
                    rng,
                )
            } else {
                build_tree(
                    target,
                    mass,
                    tree.pos_plus.clone(),
                    tree.mom_plus.clone(),
                    tree.grad_plus.clone(),
                    logu,
                    v,
                    j - 1,
                    epsilon,
                    joint_0,
                    rng,
                )
            };
            if v == -1 {
                tree.pos_minus = next.pos_minus;
                tree.mom_minus = next.mom_minus;
                tree.grad_minus = next.grad_minus;
            } else {
                tree.pos_plus = next.pos_plus;
                tree.mom_plus = next.mom_plus;
                tree.grad_plus = next.grad_plus;
            }

            if rng.random::<f64>() < next.n as f64 / (tree.n + next.n).max(1) as f64 {
                tree.pos_prime = next.pos_prime;
            }
            tree.n += next.n;
            tree.keep_going = next.keep_going
                && no_u_turn(
                    mass,
                    &tree.pos_minus,
                    &tree.pos_plus,
                    &tree.mom_minus,
                    &tree.mom_plus,
                );
            tree.alpha += next.alpha;
            tree.n_alpha += next.n_alpha;
        }
        tree
    }
}

fn no_u_turn<B: AutodiffBackend>(
    mass: &Mass<B>,
    pos_minus: &Tensor<B, 1>,
    pos_plus: &Tensor<B, 1>,
    mom_minus: &Tensor<B, 1>,
    mom_plus: &Tensor<B, 1>,
) -> bool {
    let diff = pos_plus.clone() - pos_minus.clone();
    dot(&diff, &mass.velocity(mom_minus)) >= 0.0 && dot(&diff, &mass.velocity(mom_plus)) >= 0.0
}

fn leapfrog<B, T>(
    target: &T,
    mass: &Mass<B>,
    pos: Tensor<B, 1>,
    mom: Tensor<B, 1>,
    grad: Tensor<B, 1>,
    epsilon: f64,
) -> (Tensor<B, 1>, Tensor<B, 1>, Tensor<B, 1>, f64)
where
    B: AutodiffBackend,
    T: GradientTarget<B>,
{
    let mom = mom + grad.mul_scalar(epsilon * 0.5);
    let pos = pos + mass.velocity(&mom).mul_scalar(epsilon);
    let (logp, grad) = target.unnorm_logp_and_grad(pos.clone());
    let mom = mom + grad.clone().mul_scalar(epsilon * 0.5);
    (pos, mom, grad, logp)
}

fn all_finite(v: &[f64]) -> bool {
    v.iter().all(|x| x.is_finite())
}

fn find_reasonable_epsilon<B, T>(
    target: &T,
    mass: &Mass<B>,
    position: &Tensor<B, 1>,
    rng: &mut SmallRng,
) -> f64
where
    B: AutodiffBackend,
    T: GradientTarget<B>,
{
    let dim = position.dims()[0];
    let device = position.device();
    let mom = mass.sample_momentum(dim, rng, &device);
    let (logp, grad) = target.unnorm_logp_and_grad(position.clone());

    let mut epsilon = 1.0;
    let (mut pos_prime, mut mom_prime, mut grad_prime, mut logp_prime) = leapfrog(
        target,
        mass,
        position.clone(),
        mom.clone(),
        grad.clone(),
        epsilon,
    );

    let mut k = 1.0;
    let mut guard = 0;
    while (!logp_prime.is_finite() || !all_finite(&to_host(&grad_prime))) && guard < 64 {
        k *= 0.5;
        (pos_prime, mom_prime, grad_prime, logp_prime) = leapfrog(
            target,
            mass,
            position.clone(),
            mom.clone(),
            grad.clone(),
            epsilon * k,
        );
        guard += 1;
    }
    let _ = (pos_prime, grad_prime);
    epsilon = 0.5 * k * epsilon;

    let mut log_accept =
        logp_prime - logp - (mass.kinetic(&mom_prime) - mass.kinetic(&mom));
    let a = if log_accept > 0.5f64.ln() { 1.0 } else { -1.0 };

    let mut guard = 0;
    while a * log_accept > -a * 2.0f64.ln() && guard < 64 {
        epsilon *= 2.0f64.powf(a);
        let (_, mom_prime, _, logp_prime) = leapfrog(
            target,
            mass,
            position.clone(),
            mom.clone(),
            grad.clone(),
            epsilon,
        );
        log_accept = logp_prime - logp - (mass.kinetic(&mom_prime) - mass.kinetic(&mom));
        guard += 1;
    }

    epsilon
}

/// Covariance estimate from warmup draws, shrunk toward a small diagonal.
fn estimate_mass<B: AutodiffBackend>(
    draws: &[Vec<f64>],
    structure: MassStructure,
    device: &B::Device,
) -> Option<Mass<B>> {
    let n = draws.len();
    if n < 10 {
        return None;
    }
    let dim = draws[0].len();
    let n_f = n as f64;
    let shrink = n_f / (n_f + 5.0);
    let pad = 1e-3 * (5.0 / (n_f + 5.0));

    let mut mean = vec![0.0; dim];
    for d in draws {
        for (m, x) in mean.iter_mut().zip(d.iter()) {
            *m += x;
        }
    }
    for m in mean.iter_mut() {
        *m /= n_f;
    }

    match structure {
        MassStructure::Diagonal => {
            let mut var = vec![0.0; dim];
            for d in draws {
                for ((v, x), m) in var.iter_mut().zip(d.iter()).zip(mean.iter()) {
                    *v += (x - m) * (x - m);
                }
            }
            let sigma: Vec<f64> = var
                .into_iter()
                .map(|v| (shrink * v / (n_f - 1.0) + pad).max(1e-8))
                .collect();
            let inv_sqrt: Vec<f64> = sigma.iter().map(|v| 1.0 / v.sqrt()).collect();
            Some(Mass::Diagonal {
                sigma: Tensor::from_data(TensorData::new(sigma, [dim]), device),
                inv_sqrt: Tensor::from_data(TensorData::new(inv_sqrt, [dim]), device),
            })
        }
        MassStructure::Dense => {
            let mut cov = DMatrix::<f64>::zeros(dim, dim);
            for d in draws {
                for i in 0..dim {
                    for j in 0..dim {
                        cov[(i, j)] += (d[i] - mean[i]) * (d[j] - mean[j]);
                    }
                }
            }
            cov /= n_f - 1.0;
            cov *= shrink;
            for i in 0..dim {
                cov[(i, i)] += pad;
            }

            let chol_sigma = Cholesky::new(cov.clone())?;
            let precision = chol_sigma.inverse();
            let chol_precision = Cholesky::new(precision)?.l();

            let sigma_vec: Vec<f64> = (0..dim)
                .flat_map(|i| (0..dim).map(move |j| (i, j)))
                .map(|(i, j)| cov[(i, j)])
                .collect();
            let chol_vec: Vec<f64> = (0..dim)
                .flat_map(|i| (0..dim).map(move |j| (i, j)))
                .map(|(i, j)| chol_precision[(i, j)])
                .collect();
            Some(Mass::Dense {
                sigma: Tensor::from_data(TensorData::new(sigma_vec, [dim, dim]), device),
                chol_precision: Tensor::from_data(TensorData::new(chol_vec, [dim, dim]), device),
            })
        }
    }
}
