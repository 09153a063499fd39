//! Joint-state enumeration grids for exact discrete marginalization.
//!
//! With `C` compartments and `NUM_QUANT = Q` integer candidates per cell, each
//! timestep has `S = Q^C` joint candidate states. A joint state index encodes
//! one candidate index per compartment, compartment 0 in the most significant
//! digit. Transition log-probabilities are evaluated on broadcastable rank-3
//! lattices:
//!
//! - previous-state values: `[T, S, 1]` (joint index on axis 1),
//! - current-state values:  `[T, 1, S]` (joint index on axis 2),
//!
//! so elementwise arithmetic over them broadcasts to the full `[T, S, S]`
//! transition matrix stack without any per-compartment reshaping.
//!
//! The previous-state lattice at step `t` holds the candidates of step `t-1`;
//! at `t = 0` it holds the deterministic initial counts, so its rows are
//! identical there.

use crate::quantize::NUM_QUANT;
use burn::prelude::*;
use std::collections::BTreeMap;

/// Number of joint candidate states for `n_comp` compartments.
pub fn num_states(n_comp: usize) -> usize {
    NUM_QUANT.pow(n_comp as u32)
}

/// Candidate index of compartment `comp` within joint state `state`.
pub fn decode(state: usize, comp: usize, n_comp: usize) -> usize {
    (state / NUM_QUANT.pow((n_comp - 1 - comp) as u32)) % NUM_QUANT
}

/// Per-compartment candidate indices for every joint state, as an `Int`
/// index tensor of shape `[S]`.
fn digit_index<B: Backend>(comp: usize, n_comp: usize, device: &B::Device) -> Tensor<B, 1, Int> {
    let s = num_states(n_comp);
    let digits: Vec<i64> = (0..s).map(|j| decode(j, comp, n_comp) as i64).collect();
    Tensor::from_data(TensorData::new(digits, [s]), device)
}

/// Named compartment value lattices handed to transition evaluation.
///
/// Each value is a rank-3 tensor broadcastable against the others; previous
/// and current lattices differ in which axis carries the joint state index.
#[derive(Debug, Clone)]
pub struct StateGrid<B: Backend> {
    grids: BTreeMap<String, Tensor<B, 3>>,
    device: B::Device,
}

impl<B: Backend> StateGrid<B> {
    pub(crate) fn new(device: B::Device) -> Self {
        Self {
            grids: BTreeMap::new(),
            device,
        }
    }

    pub(crate) fn insert(&mut self, name: impl Into<String>, grid: Tensor<B, 3>) {
        self.grids.insert(name.into(), grid);
    }

    /// Lattice of candidate values for a compartment.
    ///
    /// Panics if `name` is not a configured compartment; that is a bug in the
    /// caller's dynamics, not a data error.
    pub fn get(&self, name: &str) -> Tensor<B, 3> {
        self.grids
            .get(name)
            .unwrap_or_else(|| panic!("unknown compartment {name:?}"))
            .clone()
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

/// Time slice a transition evaluation covers.
///
/// The vectorized path evaluates all steps at once (`start = 0`,
/// `len = duration`); the per-step recovery path evaluates one step at a
/// time. Observed data enters through [`TimeWindow::column`], which lifts the
/// matching slice of a host series into a broadcastable `[len, 1, 1]` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: usize,
    len: usize,
}

impl TimeWindow {
    pub fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Timesteps covered by this window.
    pub fn times(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.len
    }

    /// The matching slice of a host-side series as a `[len, 1, 1]` column.
    pub fn column<B: Backend>(&self, series: &[f64], device: &B::Device) -> Tensor<B, 3> {
        let slice = series[self.start..self.start + self.len].to_vec();
        Tensor::from_data(TensorData::new(slice, [self.len, 1, 1]), device)
    }
}

/// Lattices for the whole-horizon (vectorized) evaluation.
pub struct EnumGrids<B: Backend> {
    /// Previous-state candidate values, `[T, S, 1]` per compartment.
    pub prev: StateGrid<B>,
    /// Current-state candidate values, `[T, 1, S]` per compartment.
    pub curr: StateGrid<B>,
    /// Summed quantization log-weights of the current joint state, `[T, 1, S]`.
    pub quant_logp: Tensor<B, 3>,
}

/// Builds the whole-horizon lattices from per-cell candidates and log-weights.
///
/// `candidates` and `logits` are `[C, T, NUM_QUANT]` (from
/// [`crate::quantize::quantize_enumerate`]); `init` holds the deterministic
/// count of each compartment at `t = -1`, in `names` order.
pub fn enum_grids<B: Backend>(
    names: &[String],
    init: &[f64],
    candidates: Tensor<B, 3>,
    logits: Tensor<B, 3>,
) -> EnumGrids<B> {
    let n_comp = names.len();
    let [c_dim, t, _q] = candidates.dims();
    debug_assert_eq!(c_dim, n_comp);
    debug_assert_eq!(init.len(), n_comp);
    let s = num_states(n_comp);
    let device = candidates.device();

    let mut prev = StateGrid::new(device.clone());
    let mut curr = StateGrid::new(device.clone());
    let mut quant_logp: Option<Tensor<B, 2>> = None;

    for (comp, name) in names.iter().enumerate() {
        let idx = digit_index::<B>(comp, n_comp, &device);

        // Candidate values of this compartment for every (t, joint state).
        let cand_c = candidates
            .clone()
            .slice([comp..comp + 1, 0..t, 0..NUM_QUANT])
            .reshape([t, NUM_QUANT]);
        let values = cand_c.select(1, idx.clone()); // [T, S]

        curr.insert(name.clone(), values.clone().reshape([t, 1, s]));

        // Shift right by one step and pad with the initial count.
        let init_row = Tensor::<B, 2>::full([1, s], init[comp], &device);
        let shifted = if t > 1 {
            Tensor::cat(vec![init_row, values.slice([0..t - 1, 0..s])], 0)
        } else {
            init_row
        };
        prev.insert(name.clone(), shifted.reshape([t, s, 1]));

        let logits_c = logits
            .clone()
            .slice([comp..comp + 1, 0..t, 0..NUM_QUANT])
            .reshape([t, NUM_QUANT]);
        let logp_c = logits_c.select(1, idx); // [T, S]
        quant_logp = Some(match quant_logp {
            Some(acc) => acc + logp_c,
            None => logp_c,
        });
    }

    let quant_logp = quant_logp
        .expect("at least one compartment")
        .reshape([t, 1, s]);

    EnumGrids {
        prev,
        curr,
        quant_logp,
    }
}

/// Single-step lattices for the per-step recovery path.
///
/// `cands` and `logits` are one `[NUM_QUANT]` row per compartment for the
/// current step. Returns the current-state lattice `[1, 1, S]` and the summed
/// quantization log-weights per joint state.
pub fn step_curr_grid<B: Backend>(
    names: &[String],
    cands: &[[f64; NUM_QUANT]],
    logits: &[[f64; NUM_QUANT]],
    device: &B::Device,
) -> (StateGrid<B>, Vec<f64>) {
    let n_comp = names.len();
    let s = num_states(n_comp);

    let mut grid = StateGrid::new(device.clone());
    let mut quant = vec![0.0; s];
    for (comp, name) in names.iter().enumerate() {
        let values: Vec<f64> = (0..s).map(|j| cands[comp][decode(j, comp, n_comp)]).collect();
        for (j, q) in quant.iter_mut().enumerate() {
            *q += logits[comp][decode(j, comp, n_comp)];
        }
        grid.insert(
            name.clone(),
            Tensor::from_data(TensorData::new(values, [1, 1, s]), device),
        );
    }
    (grid, quant)
}

/// Single-step previous-state lattice `[1, S, 1]` from the preceding step's
/// candidates.
pub fn step_prev_grid<B: Backend>(
    names: &[String],
    cands: &[[f64; NUM_QUANT]],
    device: &B::Device,
) -> StateGrid<B> {
    let n_comp = names.len();
    let s = num_states(n_comp);

    let mut grid = StateGrid::new(device.clone());
    for (comp, name) in names.iter().enumerate() {
        let values: Vec<f64> = (0..s).map(|j| cands[comp][decode(j, comp, n_comp)]).collect();
        grid.insert(
            name.clone(),
            Tensor::from_data(TensorData::new(values, [1, s, 1]), device),
        );
    }
    grid
}

/// Previous-state lattice for the first step: constant initial counts, which
/// broadcast over the (dummy) previous joint-state axis.
pub fn init_prev_grid<B: Backend>(
    names: &[String],
    init: &[f64],
    device: &B::Device,
) -> StateGrid<B> {
    let mut grid = StateGrid::new(device.clone());
    for (name, &value) in names.iter().zip(init.iter()) {
        grid.insert(
            name.clone(),
            Tensor::from_data(TensorData::new(vec![value], [1, 1, 1]), device),
        );
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::ndarray::NdArray;

    type B = NdArray<f64>;

    #[test]
    fn decode_round_trips() {
        let n_comp = 3;
        let s = num_states(n_comp);
        assert_eq!(s, 64);
        for state in 0..s {
            let digits: Vec<usize> = (0..n_comp).map(|c| decode(state, c, n_comp)).collect();
            let rebuilt = digits
                .iter()
                .fold(0usize, |acc, &d| acc * NUM_QUANT + d);
            assert_eq!(rebuilt, state);
        }
    }

    #[test]
    fn compartment_zero_is_most_significant() {
        let n_comp = 2;
        // State Q advances compartment 0 by one and resets compartment 1.
        assert_eq!(decode(NUM_QUANT, 0, n_comp), 1);
        assert_eq!(decode(NUM_QUANT, 1, n_comp), 0);
    }

    #[test]
    fn grids_match_hand_built_lattices() {
        let names = vec!["S".to_string(), "I".to_string()];
        let init = [99.0, 1.0];
        let (c, t) = (2, 3);
        let device = Default::default();

        // Distinct candidate values so placement errors are visible.
        let cand_host: Vec<f64> = (0..c * t * NUM_QUANT).map(|i| i as f64).collect();
        let logit_host: Vec<f64> = (0..c * t * NUM_QUANT).map(|i| -(i as f64) / 10.0).collect();
        let candidates =
            Tensor::<B, 3>::from_data(TensorData::new(cand_host.clone(), [c, t, NUM_QUANT]), &device);
        let logits =
            Tensor::<B, 3>::from_data(TensorData::new(logit_host.clone(), [c, t, NUM_QUANT]), &device);

        let grids = enum_grids(&names, &init, candidates, logits);
        let s = num_states(c);

        let curr_s: Vec<f64> = grids.curr.get("S").to_data().to_vec().unwrap();
        let prev_i: Vec<f64> = grids.prev.get("I").to_data().to_vec().unwrap();
        let quant: Vec<f64> = grids.quant_logp.to_data().to_vec().unwrap();

        let cand = |comp: usize, step: usize, q: usize| cand_host[(comp * t + step) * NUM_QUANT + q];
        let logit =
            |comp: usize, step: usize, q: usize| logit_host[(comp * t + step) * NUM_QUANT + q];

        for step in 0..t {
            for j in 0..s {
                assert_abs_diff_eq!(curr_s[step * s + j], cand(0, step, decode(j, 0, c)));
                let expect_prev = if step == 0 {
                    init[1]
                } else {
                    cand(1, step - 1, decode(j, 1, c))
                };
                assert_abs_diff_eq!(prev_i[step * s + j], expect_prev);
                let expect_quant = logit(0, step, decode(j, 0, c)) + logit(1, step, decode(j, 1, c));
                assert_abs_diff_eq!(quant[step * s + j], expect_quant, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn step_grids_agree_with_whole_horizon() {
        let names = vec!["X".to_string()];
        let device = Default::default();
        let cands = [[1.0, 2.0, 3.0, 4.0]];
        let logits = [[-0.1, -0.2, -0.3, -0.4]];

        let (curr, quant) = step_curr_grid::<B>(&names, &cands, &logits, &device);
        let values: Vec<f64> = curr.get("X").to_data().to_vec().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(quant, vec![-0.1, -0.2, -0.3, -0.4]);

        let prev = step_prev_grid::<B>(&names, &cands, &device);
        assert_eq!(prev.get("X").dims(), [1, NUM_QUANT, 1]);
    }
}
