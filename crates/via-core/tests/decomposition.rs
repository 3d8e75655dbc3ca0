use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;
use via_core::checkpoint::Checkpointable;
use via_core::stats::normal_quantile;
use via_core::time::{DAY, HOUR, WEEK};
use via_core::{DecompositionConfig, TrendDecomposition};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn signal(t: i64) -> f64 {
    let trend = 0.01 * t as f64 / HOUR as f64;
    200.0 + trend + 40.0 * (2.0 * PI * t as f64 / DAY as f64).sin()
}

fn trained(seed: u64, weeks: i64, f: impl Fn(i64) -> f64) -> TrendDecomposition {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 2.0).unwrap();
    let mut decomposition = TrendDecomposition::with_config(&DecompositionConfig::default());
    for t in (0..weeks * WEEK).step_by(HOUR as usize) {
        decomposition.add_point(t, f(t) + noise.sample(&mut rng));
        decomposition.propagate_forwards_to(t);
    }
    decomposition
}

#[test]
fn test_baseline_tracks_trend_and_seasonality() {
    init_logging();
    let mut rng = StdRng::seed_from_u64(42);
    let noise = Normal::new(0.0, 2.0).unwrap();
    let mut decomposition = TrendDecomposition::with_config(&DecompositionConfig::default());

    let warm_up = 4 * WEEK;
    let q = -normal_quantile(0.005);
    let mut error = 0.0;
    let mut magnitude = 0.0;
    let mut outside = 0;
    let mut n = 0;
    for t in (0..6 * WEEK).step_by(HOUR as usize) {
        let value = signal(t) + noise.sample(&mut rng);
        if t >= warm_up {
            let (lower, upper) = decomposition.baseline(t, 0.0);
            assert_eq!(lower, upper);
            error += (lower - signal(t)).abs();
            magnitude += signal(t).abs();
            let sd = decomposition.mean_variance().sqrt();
            if (value - lower).abs() > q * sd {
                outside += 1;
            }
            n += 1;
        }
        decomposition.add_point(t, value);
        decomposition.propagate_forwards_to(t);
    }

    assert!(decomposition.initialized());
    assert_eq!(decomposition.period(), DAY);
    assert!(error / magnitude < 0.05, "relative error = {}", error / magnitude);
    let rate = outside as f64 / n as f64;
    assert!(rate < 0.1, "violation rate = {}", rate);
}

#[test]
fn test_propagation_is_idempotent() {
    let mut once = trained(1, 3, signal);
    let mut twice = once.clone();
    let t = 3 * WEEK + 5 * HOUR;
    once.propagate_forwards_to(t);
    twice.propagate_forwards_to(t);
    twice.propagate_forwards_to(t);
    assert_eq!(once.checksum(), twice.checksum());

    // Going backwards is ignored too.
    twice.propagate_forwards_to(t - DAY);
    assert_eq!(once.checksum(), twice.checksum());
}

#[test]
fn test_swap() {
    let mut a = trained(2, 3, signal);
    let mut b = trained(3, 1, |_| 10.0);
    let (ca, cb) = (a.checksum(), b.checksum());
    assert_ne!(ca, cb);
    a.swap(&mut b);
    assert_eq!(a.checksum(), cb);
    assert_eq!(b.checksum(), ca);
}

#[test]
fn test_checkpoint_round_trip_periodic() {
    let decomposition = trained(4, 4, signal);
    assert!(!decomposition.seasonal_components().is_empty());
    let bytes = decomposition.to_checkpoint().unwrap();
    let restored = TrendDecomposition::from_checkpoint(&bytes).unwrap();
    assert_eq!(restored.to_checkpoint().unwrap(), bytes);
    assert_eq!(restored.checksum(), decomposition.checksum());

    let t = 4 * WEEK + 3 * HOUR;
    assert_eq!(restored.baseline(t, 70.0), decomposition.baseline(t, 70.0));
}

#[test]
fn test_checkpoint_round_trip_flat() {
    let decomposition = trained(5, 2, |_| 10.0);
    assert!(decomposition.seasonal_components().is_empty());
    let bytes = decomposition.to_checkpoint().unwrap();
    let restored = TrendDecomposition::from_checkpoint(&bytes).unwrap();
    assert_eq!(restored.to_checkpoint().unwrap(), bytes);
}

#[test]
fn test_restored_decomposition_keeps_learning() {
    init_logging();
    let mut original = trained(6, 3, signal);
    let bytes = original.to_checkpoint().unwrap();
    let mut restored = TrendDecomposition::from_checkpoint(&bytes).unwrap();
    for t in (3 * WEEK..3 * WEEK + DAY).step_by(HOUR as usize) {
        original.add_point(t, signal(t));
        original.propagate_forwards_to(t);
        restored.add_point(t, signal(t));
        restored.propagate_forwards_to(t);
    }
    assert_eq!(original.checksum(), restored.checksum());
}
