//! # via-sim - Synthetic Replay for via-core
//!
//! Generates a seasonal metric with a known anomaly and replays it through
//! the decomposition and probability calculator.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   buckets   ┌─────────────────────────────────────┐
//! │  generator   │────────────▶│              Detector               │
//! │ (seeded rng) │             │                                     │
//! └──────────────┘             │  TrendDecomposition ─▶ detrend      │
//!                              │  NormalPrior        ─▶ probability  │
//!                              │  Calculator         ─▶ influences   │
//!                              └─────────────────────────────────────┘
//!                                              │
//!                                              ▼
//!                                          Report(s)
//! ```
//!
//! Each bucket is scored before the models learn it, so the reported
//! probability is a one step ahead prediction.

pub mod generator;
pub mod replay;

pub use generator::{Anomaly, Bucket, SeriesConfig, generate};
pub use replay::{BaselinePoint, Detector, Report, replay};
