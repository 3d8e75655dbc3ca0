use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use via_core::calculator::correct_for_empty_bucket;
use via_core::influence::InfluenceCalculator;
use via_core::prior::{Calculation, Tail};
use via_core::{
    CalculatorConfig, ConjugatePrior, Feature, InfluencerValue, Interner, NormalPrior, Params,
    ProbabilityAndInfluenceCalculator, SampleWeights,
};

fn learned(mean: f64, sd: f64, n: usize, seed: u64) -> NormalPrior {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(mean, sd).unwrap();
    let samples: Vec<f64> = (0..n).map(|_| normal.sample(&mut rng)).collect();
    let mut prior = NormalPrior::non_informative(0.0);
    prior.add_samples(&vec![SampleWeights::default(); n], &samples);
    prior
}

fn new_calculator() -> ProbabilityAndInfluenceCalculator {
    ProbabilityAndInfluenceCalculator::with_config(&CalculatorConfig::default())
}

/// Fill `params` with the bucket's statistic, probability and tail.
fn bucket<'a>(prior: &'a NormalPrior, feature: Feature, value: f64, count: f64) -> Params<'a> {
    let mut params = Params::new(feature, prior);
    params.value = [value].into_iter().collect();
    params.sample = value;
    params.count = count;
    let (lower, upper, tail) =
        prior.probability_of_less_likely_samples(feature.calculation(), &params.weights, value).unwrap();
    params.probability = (lower + upper) / 2.0;
    params.tail = tail;
    params
}

#[test]
fn test_empty_bucket_boundaries() {
    for calculation in [Calculation::TwoSided, Calculation::OneSidedBelow, Calculation::OneSidedAbove] {
        for p in [1e-8, 0.05, 0.5, 1.0] {
            assert_eq!(correct_for_empty_bucket(calculation, &[3.0], true, 0.0, p), p);
            assert_eq!(correct_for_empty_bucket(calculation, &[3.0], false, 0.0, p), p);
            assert_eq!(correct_for_empty_bucket(calculation, &[3.0], true, 1.0, p), 1.0);
        }
    }
}

#[test]
fn test_low_sum_is_anomalous() {
    let mut rng = StdRng::seed_from_u64(7);
    let normal = Normal::new(50.0, 2.0).unwrap();
    let mut prior = NormalPrior::non_informative(0.0);
    let mut calculator = new_calculator();
    for _ in 0..100 {
        let sum = normal.sample(&mut rng);
        let p = calculator.add_probability(Feature::Sum, &prior, 0, &SampleWeights::default(), sum, false, 0.0, 1.0);
        prior.add_samples(&[SampleWeights::default()], &[sum]);
        if let Some((p, _)) = p {
            assert!((0.0..=1.0).contains(&p));
        }
    }

    let mut bucket = new_calculator();
    let (p, _) =
        bucket.add_probability(Feature::Sum, &prior, 0, &SampleWeights::default(), 5.0, false, 0.0, 1.0).unwrap();
    assert!(p < 0.01, "p = {}", p);
    assert!(bucket.calculate().unwrap() < 0.01);
}

#[test]
fn test_sum_influence() {
    let prior = learned(12.0, 2.0, 100, 11);
    let mut calculator = new_calculator();
    calculator.plug_influence_calculator(Feature::Sum.influence_calculator());
    let mut interner = Interner::new();

    let mut params = bucket(&prior, Feature::Sum, 52.8, 2.0);
    calculator.add_raw_probability(params.probability, 1.0);
    let values = vec![InfluencerValue::new("i2", &[12.3], 1.0), InfluencerValue::new("i1", &[40.5], 1.0)];
    calculator.add_influences(&mut interner, "I", values, &mut params, 1.0);

    let (p, influences) = calculator.calculate_with_influences().unwrap();
    assert!(p < 1e-6, "p = {}", p);
    assert!(!influences.is_empty());
    assert_eq!(interner.resolve(influences[0].name), Some("I"));
    assert_eq!(interner.resolve(influences[0].value), Some("i1"));
    assert!((influences[0].score - 1.0).abs() < 0.05, "score = {}", influences[0].score);
    assert!(influences[1..].iter().all(|i| i.score < influences[0].score));
}

#[test]
fn test_indicator_values_all_score_one() {
    let prior = learned(1.0, 0.1, 20, 12);
    let mut calculator = new_calculator();
    calculator.plug_influence_calculator(Feature::Indicator.influence_calculator());
    let mut interner = Interner::new();

    let names: Vec<String> = (0..7).map(|i| format!("host-{i}")).collect();
    let values: Vec<_> = names.iter().map(|name| InfluencerValue::new(name, &[1.0], 1.0)).collect();
    let mut params = Params::new(Feature::Indicator, &prior);
    params.value = [1.0].into_iter().collect();
    params.count = 7.0;
    params.probability = 1e-3;
    calculator.add_raw_probability(1e-3, 1.0);
    calculator.add_influences(&mut interner, "host", values, &mut params, 1.0);

    assert_eq!(params.influences.len(), names.len());
    assert!(params.influences.iter().all(|&(_, score)| score == 1.0));

    // Constant features never aggregate influencer probabilities.
    let (_, influences) = calculator.calculate_with_influences().unwrap();
    assert!(influences.is_empty());
}

#[test]
fn test_mean_influence_scores_follow_the_sort_order() {
    let prior = learned(10.0, 1.0, 100, 13);
    let mut calculator = new_calculator();
    calculator.plug_influence_calculator(Feature::Mean.influence_calculator());
    let mut interner = Interner::new();

    let means = [30.0, 25.0, 18.0, 12.0, 10.0];
    let names = ["a", "b", "c", "d", "e"];
    let mean = means.iter().sum::<f64>() / means.len() as f64;
    let values: Vec<_> = names.iter().zip(means).map(|(name, m)| InfluencerValue::new(name, &[m], 1.0)).collect();
    let mut params = bucket(&prior, Feature::Mean, mean, 5.0);
    calculator.add_influences(&mut interner, "I", values, &mut params, 1.0);

    // Removing a larger mean leaves a smaller, less anomalous remainder.
    let scores: Vec<_> = params.influences.iter().map(|&(_, score)| score).collect();
    assert!(!scores.is_empty());
    assert_eq!(params.influences[0].0, "a");
    assert!(scores.windows(2).all(|w| w[0] >= w[1]), "{:?}", params.influences);
}

#[test]
fn test_variance_influence_scores_follow_the_sort_order() {
    let prior = learned(4.0, 0.5, 100, 16);
    let variances = [4.0, 9.0, 3.0, 6.0];
    let names = ["c", "a", "d", "b"];
    let statistics: Vec<[f64; 2]> = variances.iter().map(|&v| [v, 10.0]).collect();
    let values: Vec<_> = names.iter().zip(&statistics).map(|(name, s)| InfluencerValue::new(name, s, 5.0)).collect();

    // Equal counts and means, so the bucket variance is the mean of the values' variances.
    let variance = variances.iter().sum::<f64>() / variances.len() as f64;
    let mut params = bucket(&prior, Feature::Variance, variance, 20.0);
    params.value = [variance, 10.0].into_iter().collect();
    params.influencer_values = values;
    params.cutoff = 0.0;
    assert_eq!(params.tail, Tail::Right);
    assert!(params.probability < 0.01, "p = {}", params.probability);

    Feature::Variance.influence_calculator().compute_influences(&mut params);

    // Removing a larger variance leaves a smaller, less anomalous remainder.
    let order: Vec<_> = params.influences.iter().map(|&(value, _)| value).collect();
    assert_eq!(order, ["a", "b", "c", "d"]);
    let scores: Vec<_> = params.influences.iter().map(|&(_, score)| score).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]), "{:?}", params.influences);
    assert!(scores[0] > scores[3], "{:?}", params.influences);
}

#[test]
fn test_log_probability_influence_scores_follow_the_sort_order() {
    let prior = learned(10.0, 1.0, 100, 14);
    let mut calculator = new_calculator();
    calculator.plug_influence_calculator(Feature::Min.influence_calculator());
    let mut interner = Interner::new();

    let values = vec![
        InfluencerValue::new("x", &[9.5], 1.0),
        InfluencerValue::new("y", &[2.0], 1.0),
        InfluencerValue::new("z", &[6.0], 1.0),
    ];
    let mut params = bucket(&prior, Feature::Min, 2.0, 3.0);
    calculator.add_influences(&mut interner, "I", values, &mut params, 1.0);

    let order: Vec<_> = params.influences.iter().map(|&(value, _)| value).collect();
    assert_eq!(order.first(), Some(&"y"));
    let scores: Vec<_> = params.influences.iter().map(|&(_, score)| score).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]), "{:?}", params.influences);
}

#[test]
fn test_adding_calculators_matches_feeding_directly() {
    let prior = learned(10.0, 1.0, 50, 15);
    let samples = [[9.0, 13.2], [10.5, 6.1], [14.0, 10.1]];
    let weights = [1.0, 0.5, 2.0];

    let mut direct = new_calculator();
    let mut combined = new_calculator();
    for (pair, &weight) in samples.iter().zip(&weights) {
        for &sample in pair {
            let mut part = new_calculator();
            part.add_probability(Feature::Mean, &prior, 0, &SampleWeights::default(), sample, false, 0.0, 1.0)
                .unwrap();
            combined.add(&part, weight);
            direct
                .add_probability(Feature::Mean, &prior, 0, &SampleWeights::default(), sample, false, 0.0, weight)
                .unwrap();
        }
    }
    let (direct, combined) = (direct.calculate().unwrap(), combined.calculate().unwrap());
    assert!((direct - combined).abs() <= 1e-10 * direct.max(1e-300), "{} vs {}", direct, combined);
}
