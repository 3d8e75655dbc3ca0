pub mod bucketing;
pub mod decomposition;
pub mod forgetting;
pub mod periodicity;
pub mod regression;
pub mod seasonal;
pub mod spline;
pub mod trend;

// Re-exports for convenience
pub use decomposition::{Part, TrendDecomposition};
pub use forgetting::ExponentialForgetting;
pub use periodicity::{PeriodicityResult, PeriodicityTest, RandomizedPeriodicity};
pub use seasonal::SeasonalComponent;
