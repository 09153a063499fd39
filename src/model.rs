//! Discrete-time, discrete-value compartmental models.
//!
//! A [`CompartmentalModel`] owns a user-supplied [`Dynamics`] implementation
//! and a fixed configuration (compartment names, duration, population). The
//! same dynamics are executed three ways:
//!
//! - **generative**: forward simulation through a [`Trace`], used for prior
//!   prediction, conditioning round trips and forecasting;
//! - **vectorized**: the exact marginal likelihood over all quantized latent
//!   trajectories, obtained by enumerating `Q^C` joint candidate states per
//!   step and eliminating them with log-space matrix products. This is the
//!   differentiable density [`CompartmentalModel::fit`] hands to NUTS;
//! - **per-step recovery**: after fitting, each posterior draw of the relaxed
//!   auxiliary trajectory is turned back into integer compartment counts by
//!   forward-filter backward-sampling over the same transition law.
//!
//! The continuous sampler never sees integers: it moves a relaxed auxiliary
//! matrix (one row per compartment, one column per timestep) on an
//! unconstrained coordinate, while quantization spreads each cell's mass over
//! four nearby integers with smooth weights.

use crate::discrete::Ffbs;
use crate::distributions::{Bijection, Prior};
use crate::elimination::{logsumexp_all, sequential_logmatmulexp};
use crate::error::{Error, Result};
use crate::grid::{self, StateGrid, TimeWindow};
use crate::nuts::{GradientTarget, MassStructure, Nuts, NutsOptions};
use crate::quantize::{self, NUM_QUANT};
use crate::reparam::DctSmoothing;
use crate::stats::RunStats;
use crate::trace::{SiteId, Trace};
use burn::prelude::*;
use burn::tensor::activation::{log_sigmoid, sigmoid};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use ndarray::{Array1, Array2, Array3};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// Host value of a one-element parameter tensor, for forward simulation.
pub fn scalar<B: Backend>(t: &Tensor<B, 1>) -> f64 {
    t.clone().into_scalar().elem()
}

fn to_vec<B: Backend, const D: usize>(t: &Tensor<B, D>) -> Vec<f64> {
    t.to_data()
        .convert::<f64>()
        .to_vec()
        .expect("dense tensor data")
}

/// Starting point for the sampler, produced by [`Dynamics::heuristic`].
#[derive(Debug, Clone)]
pub struct InitialPoint {
    /// Relaxed auxiliary trajectory, `[compartments, duration]`.
    pub auxiliary: Array2<f64>,
    /// Starting values for (a subset of) global parameters; omitted globals
    /// start at a prior draw.
    pub globals: BTreeMap<String, f64>,
}

/// Initial value of one compartment at `t = -1`.
#[derive(Debug, Clone)]
pub enum InitialValue<B: Backend> {
    /// A deterministic count. Required by the enumerated likelihood.
    Count(u32),
    /// Per-particle counts (length 1, or one per posterior draw). Only the
    /// per-step recovery and generative paths accept this.
    Tensor(Tensor<B, 1>),
}

enum GlobalMode<'a, B: AutodiffBackend> {
    /// Draw from priors, with conditioned names overriding.
    Draw { rng: &'a mut SmallRng },
    /// Read unconstrained coordinates from a sampler position.
    Replay { position: &'a Tensor<B, 1> },
}

/// Execution context for [`Dynamics::global_model`].
///
/// Each `sample` call declares one global site. The set and order of sites
/// must be the same on every execution; it is discovered once by a prior-mode
/// run at the start of `fit`.
pub struct GlobalCtx<'a, B: AutodiffBackend> {
    mode: GlobalMode<'a, B>,
    conditioned: &'a BTreeMap<String, f64>,
    device: B::Device,
    logp: Tensor<B, 1>,
    layout: Vec<(String, Bijection)>,
    values: BTreeMap<String, f64>,
    cursor: usize,
}

impl<'a, B: AutodiffBackend> GlobalCtx<'a, B> {
    fn draw(rng: &'a mut SmallRng, conditioned: &'a BTreeMap<String, f64>, device: B::Device) -> Self {
        let logp = Tensor::zeros([1], &device);
        Self {
            mode: GlobalMode::Draw { rng },
            conditioned,
            device,
            logp,
            layout: Vec::new(),
            values: BTreeMap::new(),
            cursor: 0,
        }
    }

    fn replay(position: &'a Tensor<B, 1>, conditioned: &'a BTreeMap<String, f64>) -> Self {
        let device = position.device();
        let logp = Tensor::zeros([1], &device);
        Self {
            mode: GlobalMode::Replay { position },
            conditioned,
            device,
            logp,
            layout: Vec::new(),
            values: BTreeMap::new(),
            cursor: 0,
        }
    }

    /// Declares a global parameter with the given prior and returns its
    /// value as a one-element tensor (kept on the graph when replaying a
    /// sampler position).
    pub fn sample(&mut self, name: &str, prior: &impl Prior<B>) -> Tensor<B, 1> {
        let bijection = prior.bijection();
        let idx = self.cursor;
        self.cursor += 1;
        self.layout.push((name.to_string(), bijection));

        match &mut self.mode {
            GlobalMode::Replay { position } => {
                let z = position.clone().slice([idx..idx + 1]);
                let (y, log_jac) = bijection.constrain_tensor(z);
                self.logp = self.logp.clone() + prior.log_prob(y.clone()) + log_jac;
                y
            }
            GlobalMode::Draw { rng } => {
                let v = match self.conditioned.get(name) {
                    Some(&v) => v,
                    None => prior.sample(rng),
                };
                self.values.insert(name.to_string(), v);
                Tensor::from_data(TensorData::new(vec![v], [1]), &self.device)
            }
        }
    }

    fn into_parts(self) -> (Vec<(String, Bijection)>, BTreeMap<String, f64>, Tensor<B, 1>) {
        (self.layout, self.values, self.logp)
    }
}

/// User-supplied model dynamics.
///
/// `Params` carries the sampled global parameters as one-element tensors so
/// the enumerated likelihood stays differentiable in them; forward simulation
/// reads them with [`scalar`]. Models without global parameters use
/// `type Params = ()` and an empty `global_model`.
pub trait Dynamics<B: AutodiffBackend>: Send + Sync {
    type Params: Clone + Send;

    /// A rough starting point for the sampler.
    fn heuristic(&self) -> InitialPoint;

    /// Declares global parameters and bundles them into `Params`.
    fn global_model(&self, ctx: &mut GlobalCtx<'_, B>) -> Self::Params;

    /// Compartment counts just before the first step.
    fn initialize(&self, params: &Self::Params) -> BTreeMap<String, InitialValue<B>>;

    /// Simulates one step forward, mutating `state` and logging sampled
    /// flows (and any observation likelihoods) into `trace`.
    fn transition_fwd(
        &self,
        params: &Self::Params,
        state: &mut BTreeMap<String, f64>,
        t: usize,
        trace: &mut Trace,
    );

    /// Joint transition (and observation) log-probability over candidate
    /// lattices, broadcastable to `[window.len(), S, S]`.
    ///
    /// Must agree with `transition_fwd`: same flows, same observation terms.
    fn transition_bwd(
        &self,
        params: &Self::Params,
        prev: &StateGrid<B>,
        curr: &StateGrid<B>,
        window: &TimeWindow,
    ) -> Tensor<B, 3>;

    /// Extra deterministic series (recorded by `transition_fwd`) to carry
    /// through prediction, besides the compartments themselves.
    fn series(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether `fit` should adapt a dense mass matrix over the globals and
    /// auxiliary coordinates instead of a diagonal one.
    fn full_mass(&self) -> bool {
        false
    }
}

/// Options for [`CompartmentalModel::fit`].
#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    /// Posterior draws to collect per chain.
    pub num_samples: usize,
    /// Warmup (adaptation) steps per chain, discarded.
    pub warmup: usize,
    pub num_chains: usize,
    pub max_tree_depth: usize,
    pub target_accept: f64,
    /// Discrete-cosine smoothing exponent for the auxiliary coordinates;
    /// `None` samples the raw unconstrained values.
    pub smooth: Option<f64>,
    pub seed: u64,
    pub progress: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            num_samples: 100,
            warmup: 100,
            num_chains: 1,
            max_tree_depth: 5,
            target_accept: 0.8,
            smooth: None,
            seed: 0,
            progress: false,
        }
    }
}

/// Posterior draws from [`CompartmentalModel::fit`].
#[derive(Debug, Clone)]
pub struct Samples {
    /// Constrained global parameter draws, one array per site.
    pub globals: BTreeMap<String, Array1<f64>>,
    /// Relaxed auxiliary draws, `[draws, compartments, duration]`.
    pub auxiliary: Array3<f64>,
}

impl Samples {
    pub fn num_draws(&self) -> usize {
        self.auxiliary.dim().0
    }
}

/// Integer trajectories recovered by [`CompartmentalModel::predict`].
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Compartment counts, `[draws, duration + forecast]` per compartment.
    pub compartments: BTreeMap<String, Array2<f64>>,
    /// Extra recorded series, same shape.
    pub series: BTreeMap<String, Array2<f64>>,
    /// The global draws these trajectories condition on.
    pub globals: BTreeMap<String, Array1<f64>>,
}

/// One prior/conditioned simulation from [`CompartmentalModel::generate`].
#[derive(Debug, Clone)]
pub struct Generated {
    pub globals: BTreeMap<String, f64>,
    /// Every logged site with its value.
    pub values: BTreeMap<SiteId, f64>,
}

impl Generated {
    /// Time series of a named site, sorted by timestep.
    pub fn series(&self, name: &str) -> Vec<f64> {
        self.values
            .iter()
            .filter_map(|(id, &v)| match id {
                SiteId::Timed { name: n, .. } if n == name => Some(v),
                _ => None,
            })
            .collect()
    }
}

/// A compartmental model bound to a fixed configuration.
pub struct CompartmentalModel<B, D>
where
    B: AutodiffBackend,
    D: Dynamics<B>,
{
    dynamics: D,
    compartments: Vec<String>,
    duration: usize,
    population: u32,
    samples: Option<Samples>,
    layout: Vec<(String, Bijection)>,
    fit_seed: u64,
    _backend: PhantomData<B>,
}

impl<B, D> CompartmentalModel<B, D>
where
    B: AutodiffBackend,
    D: Dynamics<B>,
{
    /// Validates the configuration eagerly.
    pub fn new(
        dynamics: D,
        compartments: Vec<&str>,
        duration: usize,
        population: u32,
    ) -> Result<Self> {
        if duration < 1 {
            return Err(Error::InvalidConfig("duration must be >= 1".into()));
        }
        if population < 2 {
            return Err(Error::InvalidConfig("population must be >= 2".into()));
        }
        if compartments.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one compartment is required".into(),
            ));
        }
        let compartments: Vec<String> = compartments.into_iter().map(String::from).collect();
        let mut seen = std::collections::BTreeSet::new();
        for name in compartments.iter().chain(dynamics.series().iter()) {
            if !seen.insert(name.clone()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate compartment or series name {name:?}"
                )));
            }
        }
        Ok(Self {
            dynamics,
            compartments,
            duration,
            population,
            samples: None,
            layout: Vec::new(),
            fit_seed: 0,
            _backend: PhantomData,
        })
    }

    pub fn duration(&self) -> usize {
        self.duration
    }

    pub fn population(&self) -> u32 {
        self.population
    }

    pub fn compartments(&self) -> &[String] {
        &self.compartments
    }

    pub fn samples(&self) -> Option<&Samples> {
        self.samples.as_ref()
    }

    fn num_states(&self) -> usize {
        grid::num_states(self.compartments.len())
    }

    /// Initial counts in compartment order, scalars only; the enumerated
    /// likelihood cannot shift-and-pad a per-particle tensor.
    fn scalar_init(&self, params: &D::Params) -> Result<Vec<f64>> {
        let map = self.dynamics.initialize(params);
        self.compartments
            .iter()
            .map(|name| match map.get(name) {
                None => Err(Error::MissingCompartment {
                    compartment: name.clone(),
                }),
                Some(InitialValue::Count(v)) => Ok(*v as f64),
                Some(InitialValue::Tensor(_)) => Err(Error::TensorInitialState {
                    compartment: name.clone(),
                }),
            })
            .collect()
    }

    /// Initial counts for one simulated particle; tensors are indexed by
    /// particle when they carry one value per draw.
    fn host_init(&self, params: &D::Params, particle: usize) -> Result<Vec<f64>> {
        let map = self.dynamics.initialize(params);
        self.compartments
            .iter()
            .map(|name| match map.get(name) {
                None => Err(Error::MissingCompartment {
                    compartment: name.clone(),
                }),
                Some(InitialValue::Count(v)) => Ok(*v as f64),
                Some(InitialValue::Tensor(t)) => {
                    let host = to_vec(t);
                    match host.len() {
                        1 => Ok(host[0]),
                        n if particle < n => Ok(host[particle]),
                        n => Err(Error::Shape(format!(
                            "initial tensor for {name:?} has {n} entries, need particle {particle}"
                        ))),
                    }
                }
            })
            .collect()
    }

    fn auxiliary_bijection(&self) -> Bijection {
        Bijection::Interval {
            low: -0.5,
            high: self.population as f64 + 0.5,
        }
    }

    /// Exact log marginal likelihood of a relaxed auxiliary trajectory,
    /// differentiable in `aux` and in the global parameters inside `params`.
    ///
    /// Carries a constant `+ log S` offset from the dummy previous-state axis
    /// at `t = 0` (its rows are identical, and the final log-sum-exp ranges
    /// over both axes). Constant offsets do not affect sampling.
    fn marginal_loglik(&self, params: &D::Params, aux: Tensor<B, 2>) -> Result<Tensor<B, 1>> {
        let t = self.duration;
        let s = self.num_states();
        let (candidates, logits) =
            quantize::quantize_enumerate(aux, 0.0, self.population as f64);
        let init = self.scalar_init(params)?;
        let grids = grid::enum_grids(&self.compartments, &init, candidates, logits);
        let window = TimeWindow::new(0, t);
        let bwd = self
            .dynamics
            .transition_bwd(params, &grids.prev, &grids.curr, &window);
        let logp = (bwd + grids.quant_logp).expand([t, s, s]);
        let chain = sequential_logmatmulexp(logp);
        Ok(logsumexp_all(chain))
    }

    /// Log density handed to NUTS: global priors and transform Jacobians
    /// plus the marginal likelihood. NaN is reported, not fatal; the sampler
    /// treats it as a rejected region.
    fn unconstrained_logp(
        &self,
        layout: &[(String, Bijection)],
        dct_mt: Option<&Tensor<B, 2>>,
        position: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        let n_global = layout.len();
        let c = self.compartments.len();
        let t = self.duration;

        let empty = BTreeMap::new();
        let mut ctx = GlobalCtx::replay(&position, &empty);
        let params = self.dynamics.global_model(&mut ctx);
        let (found, _, prior_logp) = ctx.into_parts();
        if found.len() != n_global
            || found.iter().zip(layout.iter()).any(|(a, b)| a.0 != b.0)
        {
            panic!("global_model must declare the same sites on every execution");
        }

        let coords = position
            .slice([n_global..n_global + c * t])
            .reshape([c, t]);
        let aux_z = match dct_mt {
            Some(mt) => coords.matmul(mt.clone()),
            None => coords,
        };

        // Interval transform onto [-0.5, population + 0.5] with its
        // log-Jacobian; the masked-uniform prior contributes nothing else.
        let width = self.population as f64 + 1.0;
        let aux = sigmoid(aux_z.clone()).mul_scalar(width).add_scalar(-0.5);
        let jacobian = (log_sigmoid(aux_z.clone()) + log_sigmoid(aux_z.neg()))
            .sum()
            .add_scalar((c * t) as f64 * width.ln());

        let marginal = self
            .marginal_loglik(&params, aux)
            .unwrap_or_else(|e| panic!("{e}"));
        let total = prior_logp + jacobian + marginal;

        let value: f64 = total.clone().into_scalar().elem();
        if value.is_nan() {
            eprintln!("Warning: potential is NaN at a sampler position");
        }
        total
    }

    /// Exact log marginal likelihood at given global values and a relaxed
    /// auxiliary trajectory (globals not covered by `globals` fall back to a
    /// seeded prior draw).
    pub fn log_marginal(
        &self,
        globals: &BTreeMap<String, f64>,
        auxiliary: &Array2<f64>,
    ) -> Result<f64> {
        let c = self.compartments.len();
        if auxiliary.dim() != (c, self.duration) {
            return Err(Error::Shape(format!(
                "auxiliary must be [{c}, {}], got {:?}",
                self.duration,
                auxiliary.dim()
            )));
        }
        let device = B::Device::default();
        let mut rng = SmallRng::seed_from_u64(0);
        let mut ctx = GlobalCtx::draw(&mut rng, globals, device.clone());
        let params = self.dynamics.global_model(&mut ctx);

        let host: Vec<f64> = auxiliary.iter().cloned().collect();
        let aux = Tensor::<B, 2>::from_data(TensorData::new(host, [c, self.duration]), &device);
        let marginal = self.marginal_loglik(&params, aux)?;
        Ok(marginal.into_scalar().elem())
    }

    /// Fits the relaxed model with NUTS and stores the posterior draws.
    pub fn fit(&mut self, options: &FitOptions) -> Result<RunStats> {
        let device = B::Device::default();
        let c = self.compartments.len();
        let t = self.duration;

        // One prior-mode execution discovers the global site layout and
        // fallback starting values, and validates `initialize`.
        let mut rng = SmallRng::seed_from_u64(options.seed);
        let empty = BTreeMap::new();
        let ctx_params = {
            let mut ctx = GlobalCtx::draw(&mut rng, &empty, device.clone());
            let params = self.dynamics.global_model(&mut ctx);
            (ctx.into_parts(), params)
        };
        let ((layout, prior_values, _), params0) = ctx_params;
        self.scalar_init(&params0)?;

        let point = self.dynamics.heuristic();
        if point.auxiliary.dim() != (c, t) {
            return Err(Error::Heuristic(format!(
                "auxiliary must be [{c}, {t}], got {:?}",
                point.auxiliary.dim()
            )));
        }

        let dct = options.smooth.map(|s| DctSmoothing::new(t, s));
        let aux_bij = self.auxiliary_bijection();

        let n_global = layout.len();
        let mut position0 = Vec::with_capacity(n_global + c * t);
        for (name, bijection) in &layout {
            let y = point
                .globals
                .get(name)
                .or_else(|| prior_values.get(name))
                .copied()
                .expect("prior draw covers every declared global");
            position0.push(bijection.unconstrain(y));
        }
        for comp in 0..c {
            let row: Vec<f64> = (0..t)
                .map(|k| aux_bij.unconstrain(point.auxiliary[[comp, k]]))
                .collect();
            match &dct {
                Some(d) => position0.extend(d.to_coords(&row)),
                None => position0.extend(row),
            }
        }

        let dct_mt = dct
            .as_ref()
            .map(|d| d.inverse_matrix::<B>(&device).transpose());
        let nuts_options = NutsOptions {
            target_accept: options.target_accept,
            max_tree_depth: options.max_tree_depth,
            mass: if self.dynamics.full_mass() {
                MassStructure::Dense
            } else {
                MassStructure::Diagonal
            },
            progress: options.progress,
        };
        let target = EnumeratedTarget {
            model: &*self,
            layout: layout.clone(),
            dct_mt,
        };
        let positions = vec![position0; options.num_chains.max(1)];
        let mut sampler = Nuts::new(target, positions, nuts_options).set_seed(options.seed);
        let (draws, stats) = sampler.run(options.num_samples, options.warmup);

        // Decode the raw draws: constrain globals, undo the smoothing
        // transform, map auxiliary coordinates back onto the count interval.
        let (n_chains, n_per, dim) = draws.dim();
        let n_draws = n_chains * n_per;
        let flat = draws
            .into_shape_with_order((n_draws, dim))
            .map_err(|e| Error::Shape(e.to_string()))?;

        let mut globals = BTreeMap::new();
        for (i, (name, bijection)) in layout.iter().enumerate() {
            let column =
                Array1::from_iter((0..n_draws).map(|d| bijection.constrain(flat[[d, i]])));
            globals.insert(name.clone(), column);
        }

        let mut auxiliary = Array3::zeros((n_draws, c, t));
        for d in 0..n_draws {
            for comp in 0..c {
                let coords: Vec<f64> = (0..t)
                    .map(|k| flat[[d, n_global + comp * t + k]])
                    .collect();
                let row = match &dct {
                    Some(dct) => dct.from_coords(&coords),
                    None => coords,
                };
                for (k, z) in row.into_iter().enumerate() {
                    auxiliary[[d, comp, k]] = aux_bij.constrain(z);
                }
            }
        }

        self.samples = Some(Samples { globals, auxiliary });
        self.layout = layout;
        self.fit_seed = options.seed;
        Ok(stats)
    }

    /// Recovers integer trajectories for every posterior draw and extends
    /// them `forecast` steps past the observed horizon.
    pub fn predict(&self, forecast: usize) -> Result<Prediction> {
        self.predict_seeded(forecast, self.fit_seed.wrapping_add(1))
    }

    /// Like [`predict`](Self::predict) with an explicit seed.
    pub fn predict_seeded(&self, forecast: usize, seed: u64) -> Result<Prediction> {
        let samples = self.samples.as_ref().ok_or(Error::MissingSamples)?;
        let n_draws = samples.num_draws();
        let horizon = self.duration + forecast;

        let rows: Result<Vec<BTreeMap<String, Vec<f64>>>> = (0..n_draws)
            .into_par_iter()
            .map(|p| self.predict_one(samples, p, forecast, seed))
            .collect();
        let rows = rows?;

        let mut compartments = BTreeMap::new();
        let mut series = BTreeMap::new();
        for name in self.compartments.iter().chain(self.dynamics.series().iter()) {
            let mut arr = Array2::zeros((n_draws, horizon));
            for (p, row) in rows.iter().enumerate() {
                let values = row.get(name).ok_or_else(|| {
                    Error::Shape(format!("no recorded series for {name:?}"))
                })?;
                if values.len() != horizon {
                    return Err(Error::Shape(format!(
                        "series {name:?} has {} steps, expected {horizon}",
                        values.len()
                    )));
                }
                for (k, &v) in values.iter().enumerate() {
                    arr[[p, k]] = v;
                }
            }
            if self.compartments.contains(name) {
                compartments.insert(name.clone(), arr);
            } else {
                series.insert(name.clone(), arr);
            }
        }

        Ok(Prediction {
            compartments,
            series,
            globals: samples.globals.clone(),
        })
    }

    /// One posterior draw: conditioned FFBS over the observed horizon, then
    /// a conditioned generative replay that extends into the forecast.
    fn predict_one(
        &self,
        samples: &Samples,
        particle: usize,
        forecast: usize,
        seed: u64,
    ) -> Result<BTreeMap<String, Vec<f64>>> {
        let c = self.compartments.len();
        let t = self.duration;
        let s = self.num_states();
        let pop = self.population as f64;
        let device = B::Device::default();

        let base = seed ^ (particle as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut rng = SmallRng::seed_from_u64(base);

        let conditioned: BTreeMap<String, f64> = samples
            .globals
            .iter()
            .map(|(name, col)| (name.clone(), col[particle]))
            .collect();
        let mut ctx_rng = SmallRng::seed_from_u64(base.wrapping_add(1));
        let mut ctx = GlobalCtx::draw(&mut ctx_rng, &conditioned, device.clone());
        let params = self.dynamics.global_model(&mut ctx);
        let init = self.host_init(&params, particle)?;

        // Forward filter over the observed horizon, one step at a time.
        let mut ffbs = Ffbs::new(s);
        let mut cand_history: Vec<Vec<[f64; NUM_QUANT]>> = Vec::with_capacity(t);
        for step in 0..t {
            let mut cands = Vec::with_capacity(c);
            let mut logits = Vec::with_capacity(c);
            for comp in 0..c {
                let (cand, logit) = quantize::quantize_enumerate_scalar(
                    samples.auxiliary[[particle, comp, step]],
                    0.0,
                    pop,
                );
                cands.push(cand);
                logits.push(logit);
            }

            let prev = if step == 0 {
                grid::init_prev_grid::<B>(&self.compartments, &init, &device)
            } else {
                grid::step_prev_grid::<B>(&self.compartments, &cand_history[step - 1], &device)
            };
            let (curr, quant) =
                grid::step_curr_grid::<B>(&self.compartments, &cands, &logits, &device);
            let window = TimeWindow::new(step, 1);
            let bwd = self.dynamics.transition_bwd(&params, &prev, &curr, &window);
            let host = to_vec(&bwd.expand([1, s, s]));
            let mut logm = Array2::from_shape_vec((s, s), host)
                .map_err(|e| Error::Shape(e.to_string()))?;
            for i in 0..s {
                for j in 0..s {
                    logm[[i, j]] += quant[j];
                }
            }
            ffbs.observe(logm);
            cand_history.push(cands);
        }
        let states = ffbs.sample(&mut rng);

        // Decode the sampled joint states back into compartment counts.
        let mut recovered = Vec::with_capacity(c * t);
        for (step, &state) in states.iter().enumerate() {
            for (comp, name) in self.compartments.iter().enumerate() {
                let value = cand_history[step][comp][grid::decode(state, comp, c)];
                recovered.push((SiteId::timed(name.clone(), step), value));
            }
        }

        // Generative replay conditioned on the recovered counts; past the
        // horizon the dynamics run free, continuing from the recovered state.
        let mut trace = Trace::new(base.wrapping_add(2));
        trace.condition(recovered);
        let mut state: BTreeMap<String, f64> = self
            .compartments
            .iter()
            .cloned()
            .zip(init.iter().cloned())
            .collect();
        for step in 0..t + forecast {
            self.dynamics
                .transition_fwd(&params, &mut state, step, &mut trace);
            for name in &self.compartments {
                let v = trace.record(SiteId::timed(name.clone(), step), state[name]);
                state.insert(name.clone(), v);
            }
        }

        let mut out = BTreeMap::new();
        for name in self.compartments.iter().chain(self.dynamics.series().iter()) {
            out.insert(name.clone(), trace.series(name));
        }
        Ok(out)
    }

    /// Simulates the model forward from its priors, with `fixed` sites
    /// pinned. Returns every logged site, so a second call conditioned on
    /// the first call's sampled sites reproduces it exactly.
    pub fn generate(&self, fixed: &BTreeMap<SiteId, f64>, seed: u64) -> Result<Generated> {
        let device = B::Device::default();
        let conditioned: BTreeMap<String, f64> = fixed
            .iter()
            .filter_map(|(id, &v)| match id {
                SiteId::Global(name) => Some((name.clone(), v)),
                SiteId::Timed { .. } => None,
            })
            .collect();

        let mut rng = SmallRng::seed_from_u64(seed);
        let mut ctx = GlobalCtx::draw(&mut rng, &conditioned, device);
        let params = self.dynamics.global_model(&mut ctx);
        let (_, globals, _) = ctx.into_parts();
        let init = self.host_init(&params, 0)?;

        let mut trace = Trace::new(seed.wrapping_add(1));
        trace.condition(
            fixed
                .iter()
                .filter(|(id, _)| matches!(id, SiteId::Timed { .. }))
                .map(|(id, &v)| (id.clone(), v)),
        );
        let mut state: BTreeMap<String, f64> = self
            .compartments
            .iter()
            .cloned()
            .zip(init.iter().cloned())
            .collect();
        for step in 0..self.duration {
            self.dynamics
                .transition_fwd(&params, &mut state, step, &mut trace);
            for name in &self.compartments {
                let v = trace.record(SiteId::timed(name.clone(), step), state[name]);
                state.insert(name.clone(), v);
            }
        }

        let values: BTreeMap<SiteId, f64> =
            trace.sites().map(|(id, v)| (id.clone(), v)).collect();
        Ok(Generated { globals, values })
    }
}

/// The differentiable density `fit` hands to the sampler.
struct EnumeratedTarget<'m, B, D>
where
    B: AutodiffBackend,
    D: Dynamics<B>,
{
    model: &'m CompartmentalModel<B, D>,
    layout: Vec<(String, Bijection)>,
    dct_mt: Option<Tensor<B, 2>>,
}

impl<'m, B, D> GradientTarget<B> for EnumeratedTarget<'m, B, D>
where
    B: AutodiffBackend,
    D: Dynamics<B>,
{
    fn unnorm_logp(&self, position: Tensor<B, 1>) -> Tensor<B, 1> {
        self.model
            .unconstrained_logp(&self.layout, self.dct_mt.as_ref(), position)
    }
}
