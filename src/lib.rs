//! # epi-mcmc
//!
//! Bayesian inference for **discrete-time, discrete-value compartmental
//! epidemic models**. Population counts move between a small set of
//! compartments through user-defined stochastic flows; observed time series
//! enter through per-step likelihoods. Fitting runs the **No-U-Turn Sampler**
//! on a continuous relaxation whose exact marginal likelihood is computed by
//! enumerating quantized latent states, so no discrete variable is ever
//! sampled during inference; integer trajectories are recovered afterwards by
//! forward-filter backward-sampling.
//!
//! The workflow is:
//! 1. implement [`model::Dynamics`] (priors, initial counts, forward
//!    simulation, and the matching transition log-probability over candidate
//!    lattices);
//! 2. wrap it in a [`model::CompartmentalModel`];
//! 3. call [`fit`](model::CompartmentalModel::fit), then
//!    [`predict`](model::CompartmentalModel::predict) for posterior integer
//!    trajectories and forecasts.
//!
//! ## Example: a stochastic SIR model
//!
//! ```rust
//! use burn::backend::Autodiff;
//! use burn::prelude::Tensor;
//! use epi_mcmc::distributions::{binomial_logp, Beta, Binomial, LogNormal};
//! use epi_mcmc::model::{
//!     scalar, CompartmentalModel, Dynamics, FitOptions, GlobalCtx, InitialPoint, InitialValue,
//! };
//! use epi_mcmc::grid::{StateGrid, TimeWindow};
//! use epi_mcmc::trace::{SiteId, Trace};
//! use ndarray::Array2;
//! use std::collections::BTreeMap;
//!
//! type B = Autodiff<burn::backend::NdArray<f64>>;
//!
//! struct Sir {
//!     population: f64,
//!     recovery_time: f64,
//!     /// Observed new infections per step.
//!     obs: Vec<f64>,
//! }
//!
//! #[derive(Clone)]
//! struct SirParams {
//!     r0: Tensor<B, 1>,
//!     rho: Tensor<B, 1>,
//! }
//!
//! impl Dynamics<B> for Sir {
//!     type Params = SirParams;
//!
//!     fn heuristic(&self) -> InitialPoint {
//!         // Start every latent near the observed counts, scaled up by a
//!         // plausible response rate.
//!         let t = self.obs.len();
//!         let mut auxiliary = Array2::zeros((2, t));
//!         let mut s = self.population - 1.0;
//!         let mut i = 1.0;
//!         for (k, &o) in self.obs.iter().enumerate() {
//!             let new = (o * 2.0).min(s);
//!             s -= new;
//!             i = (i + new) * 0.9;
//!             auxiliary[[0, k]] = s;
//!             auxiliary[[1, k]] = i.max(0.5);
//!         }
//!         InitialPoint {
//!             auxiliary,
//!             globals: BTreeMap::new(),
//!         }
//!     }
//!
//!     fn global_model(&self, ctx: &mut GlobalCtx<'_, B>) -> SirParams {
//!         SirParams {
//!             r0: ctx.sample("R0", &LogNormal::new(0.0, 1.0)),
//!             rho: ctx.sample("rho", &Beta::new(10.0, 10.0)),
//!         }
//!     }
//!
//!     fn initialize(&self, _params: &SirParams) -> BTreeMap<String, InitialValue<B>> {
//!         BTreeMap::from([
//!             ("S".to_string(), InitialValue::Count(self.population as u32 - 1)),
//!             ("I".to_string(), InitialValue::Count(1)),
//!         ])
//!     }
//!
//!     fn transition_fwd(
//!         &self,
//!         params: &SirParams,
//!         state: &mut BTreeMap<String, f64>,
//!         t: usize,
//!         trace: &mut Trace,
//!     ) {
//!         let (s, i) = (state["S"], state["I"]);
//!         let rate = scalar(&params.r0) / self.recovery_time;
//!         let p_inf = 1.0 - (-rate * i / self.population).exp();
//!         let p_rec = 1.0 / self.recovery_time;
//!
//!         let s2i = trace.sample(SiteId::timed("S2I", t), &Binomial::new(s, p_inf));
//!         let i2r = trace.sample(SiteId::timed("I2R", t), &Binomial::new(i, p_rec));
//!         state.insert("S".to_string(), s - s2i);
//!         state.insert("I".to_string(), i + s2i - i2r);
//!
//!         if t < self.obs.len() {
//!             trace.record(SiteId::timed("obs", t), self.obs[t]);
//!         } else {
//!             trace.sample(
//!                 SiteId::timed("obs", t),
//!                 &Binomial::new(s2i, scalar(&params.rho)),
//!             );
//!         }
//!     }
//!
//!     fn transition_bwd(
//!         &self,
//!         params: &SirParams,
//!         prev: &StateGrid<B>,
//!         curr: &StateGrid<B>,
//!         window: &TimeWindow,
//!     ) -> Tensor<B, 3> {
//!         let device = prev.device();
//!         let s_prev = prev.get("S");
//!         let i_prev = prev.get("I");
//!         let s2i = s_prev.clone() - curr.get("S");
//!         let i2r = s2i.clone() + i_prev.clone() - curr.get("I");
//!
//!         let rate = params.r0.clone().div_scalar(-self.recovery_time).reshape([1, 1, 1]);
//!         let p_inf = i_prev
//!             .clone()
//!             .mul(rate.div_scalar(self.population))
//!             .exp()
//!             .neg()
//!             .add_scalar(1.0);
//!         let p_rec = s2i.clone().ones_like().div_scalar(self.recovery_time);
//!         let rho = params.rho.clone().reshape([1, 1, 1]).expand(s2i.dims());
//!
//!         let obs = window.column::<B>(&self.obs, device);
//!         binomial_logp(s_prev, p_inf, s2i.clone())
//!             + binomial_logp(i_prev, p_rec, i2r)
//!             + binomial_logp(s2i, rho, obs)
//!     }
//!
//!     fn series(&self) -> Vec<String> {
//!         vec!["obs".to_string()]
//!     }
//! }
//!
//! let obs = vec![1.0, 2.0, 1.0, 3.0, 2.0];
//! let dynamics = Sir {
//!     population: 20.0,
//!     recovery_time: 4.0,
//!     obs: obs.clone(),
//! };
//! let mut model =
//!     CompartmentalModel::<B, _>::new(dynamics, vec!["S", "I"], obs.len(), 20).unwrap();
//! let stats = model
//!     .fit(&FitOptions {
//!         num_samples: 20,
//!         warmup: 20,
//!         ..Default::default()
//!     })
//!     .unwrap();
//! println!("{stats}");
//!
//! let prediction = model.predict(2).unwrap();
//! let infected = &prediction.compartments["I"];
//! assert_eq!(infected.dim(), (20, obs.len() + 2));
//! ```

pub mod discrete;
pub mod distributions;
pub mod elimination;
pub mod error;
pub mod grid;
pub mod model;
pub mod nuts;
pub mod quantize;
pub mod reparam;
pub mod stats;
pub mod trace;

pub use error::{Error, Result};
pub use model::{CompartmentalModel, Dynamics, FitOptions, Prediction, Samples};
