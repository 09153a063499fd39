//! Error types for model construction and the fit/predict workflow.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by [`crate::model::CompartmentalModel`].
///
/// Configuration problems are detected eagerly at construction; usage
/// problems (such as predicting before fitting) are detected at the first
/// call that cannot proceed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Invalid model configuration (duration, population or compartments).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The heuristic initial point does not match the model configuration.
    #[error("invalid heuristic: {0}")]
    Heuristic(String),

    /// `predict` was called before `fit` produced posterior samples.
    #[error("missing samples, try running .fit() first")]
    MissingSamples,

    /// A tensor-valued initial compartment value reached the enumerated
    /// (vectorized) inference path, which supports scalar counts only.
    #[error("tensor-valued initial value for compartment {compartment:?} is not supported by enumerated inference; use a scalar count")]
    TensorInitialState {
        /// Offending compartment name.
        compartment: String,
    },

    /// A compartment required by the configuration was not produced by
    /// `initialize`.
    #[error("initialize() produced no value for compartment {compartment:?}")]
    MissingCompartment {
        /// Missing compartment name.
        compartment: String,
    },

    /// Shape or bookkeeping mismatch in sampler output.
    #[error("shape mismatch: {0}")]
    Shape(String),
}
