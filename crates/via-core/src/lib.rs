//! Online time-series decomposition and anomaly probability calculation.
//!
//! `algo::TrendDecomposition` learns a series' long-term trend and its
//! daily and weekly seasonality from a stream of values, so residuals can
//! be modelled by a `prior`. `calculator::ProbabilityAndInfluenceCalculator`
//! turns the residual probabilities of a result's features into a single
//! probability and ranks the influencer values which explain it.

pub mod aggregator;
pub mod algo;
pub mod calculator;
pub mod checkpoint;
pub mod config;
pub mod feature;
pub mod influence;
pub mod interner;
pub mod prior;
pub mod stats;
pub mod time;

pub use algo::{Part, TrendDecomposition};
pub use calculator::{
    AnnotatedProbabilityBuilder, CorrelateInfluencerValue, CorrelateParams, Influence, InfluencerValue,
    MultivariateParams, Params, ProbabilityAndInfluenceCalculator, SimpleAnnotatedProbability,
};
pub use checkpoint::{CheckpointError, Checkpointable};
pub use config::{CalculatorConfig, ConfigError, DecompositionConfig};
pub use feature::Feature;
pub use interner::{Interned, Interner};
pub use prior::{
    Calculation, ConjugatePrior, MultivariateNormalPrior, MultivariatePrior, NormalPrior, SampleWeights, Tail,
};
