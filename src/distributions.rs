//! Priors over global parameters and likelihood kernels for transitions.
//!
//! Global parameters are sampled on an unconstrained coordinate and mapped to
//! their support by a [`Bijection`]; the log-Jacobian of the map joins the
//! potential so the prior is over the constrained value. Transition kernels
//! come in two forms: scalar [`StepDist`]s for forward simulation and rank-3
//! lattice kernels ([`binomial_logp`], [`poisson_logp`]) for the enumerated
//! likelihood, where combinatorial terms are constants computed host-side on
//! the detached integer lattices.

use burn::prelude::*;
use burn::tensor::activation::{log_sigmoid, sigmoid};
use rand::rngs::SmallRng;
use rand::Rng;
// Bind to rand's Distribution to avoid mismatches from transitive rand deps.
use rand::distr::Distribution as RandDistribution;
use statrs::function::gamma::ln_gamma;

const LN_2PI: f64 = 1.837_877_066_409_345_4;

/// Probability floor/ceiling before taking logs on the graph.
const PROB_EPS: f64 = 1e-10;

/// Map between an unconstrained sampler coordinate and a prior's support.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bijection {
    /// Support is the whole real line.
    Identity,
    /// Support is `(0, inf)`; `y = exp(z)`.
    Exp,
    /// Support is `(low, high)`; `y = low + (high - low) * sigmoid(z)`.
    Interval { low: f64, high: f64 },
}

impl Bijection {
    pub fn constrain(&self, z: f64) -> f64 {
        match *self {
            Bijection::Identity => z,
            Bijection::Exp => z.exp(),
            Bijection::Interval { low, high } => low + (high - low) / (1.0 + (-z).exp()),
        }
    }

    pub fn unconstrain(&self, y: f64) -> f64 {
        match *self {
            Bijection::Identity => y,
            Bijection::Exp => y.max(1e-300).ln(),
            Bijection::Interval { low, high } => {
                let width = high - low;
                let frac = ((y - low) / width).clamp(1e-12, 1.0 - 1e-12);
                (frac / (1.0 - frac)).ln()
            }
        }
    }

    /// Constrained value and log-Jacobian for a one-element tensor coordinate.
    pub fn constrain_tensor<B: Backend>(&self, z: Tensor<B, 1>) -> (Tensor<B, 1>, Tensor<B, 1>) {
        match *self {
            Bijection::Identity => {
                let log_jac = z.zeros_like();
                (z, log_jac)
            }
            Bijection::Exp => (z.clone().exp(), z),
            Bijection::Interval { low, high } => {
                let width = high - low;
                let y = sigmoid(z.clone()).mul_scalar(width).add_scalar(low);
                let log_jac =
                    log_sigmoid(z.clone()) + log_sigmoid(z.neg()) + width.ln();
                (y, log_jac)
            }
        }
    }
}

/// A univariate prior over one global parameter.
pub trait Prior<B: Backend> {
    /// Bijection from the sampler's unconstrained coordinate to the support.
    fn bijection(&self) -> Bijection;

    /// Draw a constrained value.
    fn sample(&self, rng: &mut SmallRng) -> f64;

    /// Log-density at a constrained value (one-element tensor, kept on the
    /// graph).
    fn log_prob(&self, value: Tensor<B, 1>) -> Tensor<B, 1>;
}

#[derive(Debug, Clone, Copy)]
pub struct Normal {
    pub loc: f64,
    pub scale: f64,
}

impl Normal {
    pub fn new(loc: f64, scale: f64) -> Self {
        Self { loc, scale }
    }
}

impl<B: Backend> Prior<B> for Normal {
    fn bijection(&self) -> Bijection {
        Bijection::Identity
    }

    fn sample(&self, rng: &mut SmallRng) -> f64 {
        let dist = rand_distr::Normal::new(self.loc, self.scale).expect("valid normal parameters");
        dist.sample(rng)
    }

    fn log_prob(&self, value: Tensor<B, 1>) -> Tensor<B, 1> {
        let z = value.sub_scalar(self.loc).div_scalar(self.scale);
        z.powi_scalar(2)
            .mul_scalar(-0.5)
            .sub_scalar(self.scale.ln() + 0.5 * LN_2PI)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LogNormal {
    pub loc: f64,
    pub scale: f64,
}

impl LogNormal {
    pub fn new(loc: f64, scale: f64) -> Self {
        Self { loc, scale }
    }
}

impl<B: Backend> Prior<B> for LogNormal {
    fn bijection(&self) -> Bijection {
        Bijection::Exp
    }

    fn sample(&self, rng: &mut SmallRng) -> f64 {
        let dist =
            rand_distr::LogNormal::new(self.loc, self.scale).expect("valid lognormal parameters");
        dist.sample(rng)
    }

    fn log_prob(&self, value: Tensor<B, 1>) -> Tensor<B, 1> {
        let log_y = value.clamp_min(1e-300).log();
        let z = log_y.clone().sub_scalar(self.loc).div_scalar(self.scale);
        z.powi_scalar(2).mul_scalar(-0.5) - log_y - (self.scale.ln() + 0.5 * LN_2PI)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Uniform {
    pub low: f64,
    pub high: f64,
}

impl Uniform {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }
}

impl<B: Backend> Prior<B> for Uniform {
    fn bijection(&self) -> Bijection {
        Bijection::Interval {
            low: self.low,
            high: self.high,
        }
    }

    fn sample(&self, rng: &mut SmallRng) -> f64 {
        rng.random_range(self.low..self.high)
    }

    fn log_prob(&self, value: Tensor<B, 1>) -> Tensor<B, 1> {
        value.zeros_like().sub_scalar((self.high - self.low).ln())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Beta {
    pub alpha: f64,
    pub beta: f64,
}

impl Beta {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self { alpha, beta }
    }
}

impl<B: Backend> Prior<B> for Beta {
    fn bijection(&self) -> Bijection {
        Bijection::Interval {
            low: 0.0,
            high: 1.0,
        }
    }

    fn sample(&self, rng: &mut SmallRng) -> f64 {
        let dist = rand_distr::Beta::new(self.alpha, self.beta).expect("valid beta parameters");
        dist.sample(rng)
    }

    fn log_prob(&self, value: Tensor<B, 1>) -> Tensor<B, 1> {
        let ln_b = ln_gamma(self.alpha) + ln_gamma(self.beta) - ln_gamma(self.alpha + self.beta);
        let v = value.clamp(PROB_EPS, 1.0 - PROB_EPS);
        v.clone().log().mul_scalar(self.alpha - 1.0)
            + v.neg().add_scalar(1.0).log().mul_scalar(self.beta - 1.0)
            - ln_b
    }
}

/// A scalar distribution used when simulating one transition step forward.
pub trait StepDist {
    fn sample(&self, rng: &mut SmallRng) -> f64;
    /// Log-mass with extended support: values outside the support get `-inf`.
    fn log_prob(&self, value: f64) -> f64;
}

/// Binomial over a real-valued (integer-intended) trial count.
#[derive(Debug, Clone, Copy)]
pub struct Binomial {
    pub count: f64,
    pub prob: f64,
}

impl Binomial {
    pub fn new(count: f64, prob: f64) -> Self {
        Self { count, prob }
    }
}

impl StepDist for Binomial {
    fn sample(&self, rng: &mut SmallRng) -> f64 {
        let n = self.count.max(0.0).round() as u64;
        let p = self.prob.clamp(0.0, 1.0);
        let dist = rand_distr::Binomial::new(n, p).expect("valid binomial parameters");
        dist.sample(rng) as f64
    }

    fn log_prob(&self, value: f64) -> f64 {
        let n = self.count.round();
        let k = value.round();
        if k < 0.0 || k > n || n < 0.0 {
            return f64::NEG_INFINITY;
        }
        let p = self.prob.clamp(PROB_EPS, 1.0 - PROB_EPS);
        ln_gamma(n + 1.0) - ln_gamma(k + 1.0) - ln_gamma(n - k + 1.0)
            + k * p.ln()
            + (n - k) * (-p).ln_1p()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Poisson {
    pub rate: f64,
}

impl Poisson {
    pub fn new(rate: f64) -> Self {
        Self { rate }
    }
}

impl StepDist for Poisson {
    fn sample(&self, rng: &mut SmallRng) -> f64 {
        let dist = rand_distr::Poisson::new(self.rate.max(1e-10)).expect("valid poisson rate");
        dist.sample(rng)
    }

    fn log_prob(&self, value: f64) -> f64 {
        let k = value.round();
        if k < 0.0 {
            return f64::NEG_INFINITY;
        }
        let rate = self.rate.max(1e-10);
        k * rate.ln() - rate - ln_gamma(k + 1.0)
    }
}

fn broadcast_dims(a: [usize; 3], b: [usize; 3]) -> [usize; 3] {
    [a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2])]
}

/// Constant tensor of per-element values computed host-side from a lattice.
fn host_map<B: Backend>(t: &Tensor<B, 3>, f: impl Fn(f64) -> f64) -> Tensor<B, 3> {
    let dims = t.dims();
    let host: Vec<f64> = t
        .to_data()
        .convert::<f64>()
        .to_vec()
        .expect("dense tensor data");
    let mapped: Vec<f64> = host.into_iter().map(f).collect();
    Tensor::from_data(TensorData::new(mapped, dims), &t.device())
}

/// Binomial log-mass over broadcastable lattices.
///
/// `count` and `value` are integer-valued constant lattices (typically
/// `[T, S, 1]` and `[T, 1, S]`); `prob` stays on the graph. Out-of-support
/// cells (`value > count` after clamping) get `-inf`, which the guarded
/// log-sum-exp downstream treats as zero mass.
pub fn binomial_logp<B: Backend>(
    count: Tensor<B, 3>,
    prob: Tensor<B, 3>,
    value: Tensor<B, 3>,
) -> Tensor<B, 3> {
    let p = prob.clamp(PROB_EPS, 1.0 - PROB_EPS);
    let on_graph = value.clone() * p.clone().log()
        + (count.clone() - value.clone()) * p.neg().log1p();

    // ln C(n, k) and the support mask are constants of the integer lattices.
    let dims = broadcast_dims(count.dims(), value.dims());
    let n3 = count.expand(dims);
    let k3 = value.expand(dims);
    let n_host: Vec<f64> = n3
        .to_data()
        .convert::<f64>()
        .to_vec()
        .expect("dense tensor data");
    let k_host: Vec<f64> = k3
        .to_data()
        .convert::<f64>()
        .to_vec()
        .expect("dense tensor data");
    let comb: Vec<f64> = n_host
        .iter()
        .zip(k_host.iter())
        .map(|(&n, &k)| {
            if k < 0.0 || k > n || n < 0.0 {
                f64::NEG_INFINITY
            } else {
                ln_gamma(n + 1.0) - ln_gamma(k + 1.0) - ln_gamma(n - k + 1.0)
            }
        })
        .collect();
    let comb = Tensor::from_data(TensorData::new(comb, dims), &n3.device());

    on_graph + comb
}

/// Poisson log-mass over broadcastable lattices; `rate` stays on the graph,
/// `value` is an integer-valued constant lattice.
pub fn poisson_logp<B: Backend>(rate: Tensor<B, 3>, value: Tensor<B, 3>) -> Tensor<B, 3> {
    let lam = rate.clamp_min(PROB_EPS);
    let on_graph = value.clone() * lam.clone().log() - lam;
    let norm = host_map(&value, |k| {
        if k < 0.0 {
            f64::NEG_INFINITY
        } else {
            -ln_gamma(k + 1.0)
        }
    });
    on_graph + norm
}
