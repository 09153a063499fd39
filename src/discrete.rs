//! Forward-filter backward-sample over joint discrete states.
//!
//! Each timestep contributes an `S x S` matrix of log-masses from previous to
//! current joint state. The forward pass folds them into filtered
//! log-weights; the backward pass draws an exact joint trajectory from the
//! conditional chain, one categorical draw per step.

use crate::elimination::log_sum_exp;
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::Rng;

/// Forward filter state over `S` joint states.
#[derive(Debug, Clone)]
pub struct Ffbs {
    num_states: usize,
    /// Filtered log-weights after each observed step, `alpha[t][j]`.
    alpha: Vec<Vec<f64>>,
    /// Per-step log transition matrices, kept for the backward pass.
    mats: Vec<Array2<f64>>,
}

impl Ffbs {
    pub fn new(num_states: usize) -> Self {
        Self {
            num_states,
            alpha: Vec::new(),
            mats: Vec::new(),
        }
    }

    /// Number of steps observed so far.
    pub fn len(&self) -> usize {
        self.mats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mats.is_empty()
    }

    /// Folds in the next step's `S x S` log transition matrix.
    ///
    /// The first matrix's rows range over a dummy previous axis (the initial
    /// state is deterministic), so they are summed out like any other.
    pub fn observe(&mut self, logm: Array2<f64>) {
        let s = self.num_states;
        assert_eq!(logm.dim(), (s, s), "transition matrix shape");

        let next = match self.alpha.last() {
            None => (0..s)
                .map(|j| {
                    let col: Vec<f64> = (0..s).map(|i| logm[[i, j]]).collect();
                    log_sum_exp(&col)
                })
                .collect::<Vec<f64>>(),
            Some(prev) => (0..s)
                .map(|j| {
                    let terms: Vec<f64> = (0..s).map(|i| prev[i] + logm[[i, j]]).collect();
                    log_sum_exp(&terms)
                })
                .collect(),
        };
        self.alpha.push(next);
        self.mats.push(logm);
    }

    /// Total log-mass of all trajectories observed so far.
    pub fn log_evidence(&self) -> f64 {
        match self.alpha.last() {
            Some(last) => log_sum_exp(last),
            None => 0.0,
        }
    }

    /// Draws one joint trajectory, `states[t]` in `0..S`.
    pub fn sample(&self, rng: &mut SmallRng) -> Vec<usize> {
        let t = self.mats.len();
        if t == 0 {
            return Vec::new();
        }
        let s = self.num_states;
        let mut states = vec![0usize; t];

        states[t - 1] = sample_log_categorical(&self.alpha[t - 1], rng);
        for step in (0..t - 1).rev() {
            let next = states[step + 1];
            let logits: Vec<f64> = (0..s)
                .map(|i| self.alpha[step][i] + self.mats[step + 1][[i, next]])
                .collect();
            states[step] = sample_log_categorical(&logits, rng);
        }
        states
    }
}

/// One categorical draw from unnormalized log-weights.
pub fn sample_log_categorical(logits: &[f64], rng: &mut SmallRng) -> usize {
    let total = log_sum_exp(logits);
    debug_assert!(total.is_finite(), "no feasible state");
    let u: f64 = rng.random();
    let mut acc = 0.0;
    for (i, &l) in logits.iter().enumerate() {
        acc += (l - total).exp();
        if u < acc {
            return i;
        }
    }
    logits.len() - 1
}
