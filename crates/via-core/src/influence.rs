//! Influence Calculators
//!
//! An influencer value's influence on an anomalous bucket is judged by
//! recomputing the bucket's probability for a counterfactual statistic:
//! the statistic without the value's contribution, or the value's
//! contribution alone. Comparing log-probabilities gives a score in
//! `[0, 1]`.
//!
//! Which counterfactual makes sense depends on the feature:
//!
//! - sums and counts remove the value's contribution (complement);
//! - extremes and rare values keep only the value's contribution
//!   (intersection), since removing a value which did not set the
//!   extreme changes nothing;
//! - means and variances remove the value's share of the statistic.
//!
//! Candidates are sorted so that the most influential come first, which
//! lets the univariate calculation stop at the first value below the
//! cutoff.

use crate::aggregator::{JointProbabilityOfLessLikelySamples, ProbabilityOfExtremeSample};
use crate::algo::TrendDecomposition;
use crate::calculator::{
    CorrelateInfluencerValue, CorrelateParams, InfluencerValue, MultivariateParams, Params, correct_for_empty_bucket,
    correct_for_empty_bucket_pair, effective_count,
};
use crate::prior::{Calculation, SampleWeights, Tail};
use crate::stats::{MeanAccumulator, MeanVarAccumulator, SMALLEST_PROBABILITY, truncate};
use crate::time::Time;
use smallvec::SmallVec;
use std::cmp::Ordering;
use tracing::error;

/// `numerator / denominator`, with `0 / 0` defined as `zero_over_zero`.
fn ratio(numerator: f64, denominator: f64, zero_over_zero: f64) -> f64 {
    if denominator == 0.0 {
        if numerator == 0.0 {
            zero_over_zero
        } else if numerator > 0.0 {
            f64::MAX
        } else {
            -f64::MAX
        }
    } else {
        numerator / denominator
    }
}

/// How much of `logp` the log-probability of the value alone explains.
pub fn intersection_influence(logp: f64, logpi: f64) -> f64 {
    truncate(ratio(logpi, logp, 1.0), 0.0, 1.0)
}

/// How much of `logp` is lost when the value is removed.
pub fn complement_influence(logp: f64, logpi: f64) -> f64 {
    truncate(1.0 - ratio(logpi, logp, 0.0), 0.0, 1.0)
}

/// Scores the values of an influencer field.
///
/// Implementations read the influencer values from the params and push
/// `(value, score)` pairs to `influences`.
pub trait InfluenceCalculator {
    fn compute_influences(&self, params: &mut Params<'_>);

    fn compute_correlate_influences(&self, params: &mut CorrelateParams<'_>);

    fn compute_multivariate_influences(&self, params: &mut MultivariateParams<'_>);
}

/// For features where influence is undefined.
#[derive(Clone, Copy, Debug, Default)]
pub struct InfluenceUnavailableCalculator;

impl InfluenceCalculator for InfluenceUnavailableCalculator {
    fn compute_influences(&self, params: &mut Params<'_>) {
        params.influences.clear();
    }

    fn compute_correlate_influences(&self, params: &mut CorrelateParams<'_>) {
        params.influences.clear();
    }

    fn compute_multivariate_influences(&self, params: &mut MultivariateParams<'_>) {
        params.influences.clear();
    }
}

/// Every value of an indicator feature is fully influential.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndicatorInfluenceCalculator;

impl InfluenceCalculator for IndicatorInfluenceCalculator {
    fn compute_influences(&self, params: &mut Params<'_>) {
        params.influences = params.influencer_values.iter().map(|v| (v.value, 1.0)).collect();
    }

    fn compute_correlate_influences(&self, params: &mut CorrelateParams<'_>) {
        params.influences = params.influencer_values.iter().map(|v| (v.value, 1.0)).collect();
    }

    fn compute_multivariate_influences(&self, params: &mut MultivariateParams<'_>) {
        params.influences = params.influencer_values.iter().map(|v| (v.value, 1.0)).collect();
    }
}

/// Influence of values on a large sum or count: how much less anomalous
/// the bucket would be without each value.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogProbabilityComplementInfluenceCalculator;

impl InfluenceCalculator for LogProbabilityComplementInfluenceCalculator {
    fn compute_influences(&self, params: &mut Params<'_>) {
        params.influences.clear();
        if params.tail == Tail::Right {
            sort_by_value(Tail::Right, &mut params.influencer_values);
            params.influences =
                univariate_influences(Calculation::OneSidedAbove, value_difference, complement_influence, params);
        }
    }

    fn compute_correlate_influences(&self, params: &mut CorrelateParams<'_>) {
        params.influences.clear();
        if params.tail == Tail::Right {
            params.influences = correlate_influences(
                Calculation::OneSidedAbove,
                correlate_value_difference,
                complement_influence,
                params,
            );
        }
    }

    fn compute_multivariate_influences(&self, params: &mut MultivariateParams<'_>) {
        params.influences = multivariate_influences(
            |tail| (tail == Tail::Right).then_some(Calculation::OneSidedAbove),
            multivariate_value_difference,
            complement_influence,
            params,
        );
    }
}

/// Influence of values on an extreme or rare statistic: how anomalous
/// each value is on its own.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogProbabilityInfluenceCalculator;

impl InfluenceCalculator for LogProbabilityInfluenceCalculator {
    fn compute_influences(&self, params: &mut Params<'_>) {
        params.influences.clear();
        if let Some(calculation) = one_sided(params.tail) {
            sort_by_value(params.tail, &mut params.influencer_values);
            params.influences = univariate_influences(calculation, value_intersection, intersection_influence, params);
        }
    }

    fn compute_correlate_influences(&self, params: &mut CorrelateParams<'_>) {
        params.influences.clear();
        if let Some(calculation) = one_sided(params.tail) {
            params.influences =
                correlate_influences(calculation, correlate_value_intersection, intersection_influence, params);
        }
    }

    fn compute_multivariate_influences(&self, params: &mut MultivariateParams<'_>) {
        params.influences =
            multivariate_influences(one_sided, multivariate_value_intersection, intersection_influence, params);
    }
}

/// Influence of values on a mean.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeanInfluenceCalculator;

impl InfluenceCalculator for MeanInfluenceCalculator {
    fn compute_influences(&self, params: &mut Params<'_>) {
        params.influences.clear();
        if let Some(calculation) = one_sided(params.tail) {
            let mean = params.value.first().copied().unwrap_or(0.0);
            sort_by_mean(params.tail, mean, params.count, &mut params.influencer_values);
            params.influences = univariate_influences(calculation, mean_difference, complement_influence, params);
        }
    }

    fn compute_correlate_influences(&self, params: &mut CorrelateParams<'_>) {
        params.influences.clear();
        if let Some(calculation) = one_sided(params.tail) {
            params.influences =
                correlate_influences(calculation, correlate_mean_difference, complement_influence, params);
        }
    }

    fn compute_multivariate_influences(&self, params: &mut MultivariateParams<'_>) {
        params.influences =
            multivariate_influences(one_sided, multivariate_mean_difference, complement_influence, params);
    }
}

/// Influence of values on a variance.
#[derive(Clone, Copy, Debug, Default)]
pub struct VarianceInfluenceCalculator;

impl InfluenceCalculator for VarianceInfluenceCalculator {
    fn compute_influences(&self, params: &mut Params<'_>) {
        params.influences.clear();
        if let Some(calculation) = one_sided(params.tail) {
            let (variance, mean) = (params.value.first().copied(), params.value.get(1).copied());
            let variance = MeanVarAccumulator::from_ml(params.count, mean.unwrap_or(0.0), variance.unwrap_or(0.0));
            sort_by_variance(params.tail, &variance, &mut params.influencer_values);
            params.influences = univariate_influences(calculation, variance_difference, complement_influence, params);
        }
    }

    fn compute_correlate_influences(&self, params: &mut CorrelateParams<'_>) {
        params.influences.clear();
        if let Some(calculation) = one_sided(params.tail) {
            params.influences =
                correlate_influences(calculation, correlate_variance_difference, complement_influence, params);
        }
    }

    fn compute_multivariate_influences(&self, params: &mut MultivariateParams<'_>) {
        params.influences =
            multivariate_influences(one_sided, multivariate_variance_difference, complement_influence, params);
    }
}

/// The one-sided calculation testing `tail`.
fn one_sided(tail: Tail) -> Option<Calculation> {
    match tail {
        Tail::Left => Some(Calculation::OneSidedBelow),
        Tail::Right => Some(Calculation::OneSidedAbove),
        Tail::Undetermined | Tail::Mixed => None,
    }
}

fn detrend(trend: Option<&TrendDecomposition>, time: Time, value: f64, confidence: f64) -> f64 {
    match trend {
        Some(trend) => trend.detrend(time, value, confidence),
        None => value,
    }
}

// Candidate orderings, most influential first.

fn sort_by_value(tail: Tail, values: &mut [InfluencerValue<'_>]) {
    let key = |v: &InfluencerValue<'_>| v.statistic.first().copied().unwrap_or(0.0);
    match tail {
        Tail::Left => values.sort_by(|a, b| key(a).total_cmp(&key(b))),
        _ => values.sort_by(|a, b| key(b).total_cmp(&key(a))),
    }
}

/// Lexicographic `(statistic, count)` order of what remains after each
/// value is removed: for the right tail the smallest remaining statistic
/// comes first, for the left tail the largest, ties going to the value
/// which leaves the fewest behind.
fn compare_remainders(tail: Tail, (sl, nl): (f64, f64), (sr, nr): (f64, f64)) -> Ordering {
    match tail {
        Tail::Left => sr.total_cmp(&sl).then(nl.total_cmp(&nr)),
        _ => sl.total_cmp(&sr).then(nl.total_cmp(&nr)),
    }
}

fn sort_by_mean(tail: Tail, mean: f64, count: f64, values: &mut [InfluencerValue<'_>]) {
    let remainder = |v: &InfluencerValue<'_>| {
        let mut all = MeanAccumulator::from_moments(count, mean);
        all.remove(&MeanAccumulator::from_moments(v.count, v.statistic.first().copied().unwrap_or(0.0)));
        (all.mean(), all.count())
    };
    values.sort_by(|a, b| compare_remainders(tail, remainder(a), remainder(b)));
}

fn sort_by_variance(tail: Tail, variance: &MeanVarAccumulator, values: &mut [InfluencerValue<'_>]) {
    let remainder = |v: &InfluencerValue<'_>| {
        let mut all = *variance;
        all.remove(&variance_of(v.count, &v.statistic, 0, 1));
        (all.ml_variance(), all.count())
    };
    values.sort_by(|a, b| compare_remainders(tail, remainder(a), remainder(b)));
}

/// Moments from a `[variances.., means..]` layout for coordinate `i` of `d`.
fn variance_of(count: f64, statistic: &[f64], i: usize, d: usize) -> MeanVarAccumulator {
    let variance = statistic.get(i).copied().unwrap_or(0.0);
    let mean = statistic.get(d + i).copied().unwrap_or(0.0);
    MeanVarAccumulator::from_ml(count, mean, variance)
}

fn scale_for_remainder(weights: &mut SampleWeights, n: f64, ni: f64) {
    if n - ni > 0.0 {
        weights.count_variance_scale *= n / (n - ni);
    }
}

// Counterfactual samples for a univariate feature.

fn value_difference(params: &Params<'_>, v: &InfluencerValue<'_>) -> (f64, SampleWeights) {
    let value = params.value.first().copied().unwrap_or(0.0) - v.statistic.first().copied().unwrap_or(0.0);
    (detrend(params.trend, params.time, value, params.confidence), params.weights)
}

fn value_intersection(params: &Params<'_>, v: &InfluencerValue<'_>) -> (f64, SampleWeights) {
    let value = v.statistic.first().copied().unwrap_or(0.0);
    (detrend(params.trend, params.time, value, params.confidence), params.weights)
}

fn mean_difference(params: &Params<'_>, v: &InfluencerValue<'_>) -> (f64, SampleWeights) {
    let mut remainder = MeanAccumulator::from_moments(params.count, params.value.first().copied().unwrap_or(0.0));
    remainder.remove(&MeanAccumulator::from_moments(v.count, v.statistic.first().copied().unwrap_or(0.0)));
    let mut weights = params.weights;
    scale_for_remainder(&mut weights, params.count, v.count);
    (detrend(params.trend, params.time, remainder.mean(), params.confidence), weights)
}

fn variance_difference(params: &Params<'_>, v: &InfluencerValue<'_>) -> (f64, SampleWeights) {
    let mut remainder = variance_of(params.count, &params.value, 0, 1);
    remainder.remove(&variance_of(v.count, &v.statistic, 0, 1));
    let mut weights = params.weights;
    scale_for_remainder(&mut weights, params.count, v.count);
    (remainder.ml_variance(), weights)
}

/// Score the (sorted) influencer values of a univariate feature, stopping
/// at the first value below the cutoff.
fn univariate_influences<'a, C, I>(
    calculation: Calculation,
    counterfactual: C,
    influence: I,
    params: &Params<'a>,
) -> Vec<(&'a str, f64)>
where
    C: Fn(&Params<'a>, &InfluencerValue<'a>) -> (f64, SampleWeights),
    I: Fn(f64, f64) -> f64,
{
    let values = &params.influencer_values;
    if values.len() == 1 {
        return vec![(values[0].value, 1.0)];
    }
    if params.probability == 1.0 {
        return values.iter().map(|v| (v.value, 1.0)).collect();
    }

    let logp = params.probability.max(SMALLEST_PROBABILITY).ln();
    let mut result = Vec::with_capacity(values.len());
    for (i, v) in values.iter().enumerate() {
        let (sample, weights) = counterfactual(params, v);
        let Some((lower, upper, _)) = params.prior.probability_of_less_likely_samples(calculation, &weights, sample)
        else {
            error!(influencer = params.influencer_name, value = v.value, sample, "failed to compute influence");
            continue;
        };
        let pi = truncate((lower + upper) / 2.0, SMALLEST_PROBABILITY, 1.0);
        let pi = correct_for_empty_bucket(
            params.feature.calculation(),
            &[sample],
            params.count - v.count == 0.0,
            params.probability_bucket_empty,
            pi,
        );
        let pi = params.feature.adjust_probability(params.elapsed_time, pi);
        let score = influence(logp, pi.ln());

        if score >= params.cutoff {
            result.push((v.value, score));
        } else if params.include_cutoff {
            result.push((v.value, score));
            result.extend(values[i + 1..].iter().map(|rest| (rest.value, 0.5 * score)));
            break;
        } else {
            break;
        }
    }
    result
}

// Counterfactual samples for a correlated pair.

type PairSample = ([f64; 2], [SampleWeights; 2]);

fn correlate_value_difference(params: &CorrelateParams<'_>, i: usize, v: &CorrelateInfluencerValue<'_>) -> PairSample {
    let sample = std::array::from_fn(|j| {
        let value = params.values[i].get(j).copied().unwrap_or(0.0) - v.statistic.get(j).copied().unwrap_or(0.0);
        detrend(params.trends[i][j], params.times[i][j], value, params.confidence)
    });
    (sample, params.weights[i])
}

fn correlate_value_intersection(
    params: &CorrelateParams<'_>,
    i: usize,
    v: &CorrelateInfluencerValue<'_>,
) -> PairSample {
    let sample = std::array::from_fn(|j| {
        let value = v.statistic.get(j).copied().unwrap_or(0.0);
        detrend(params.trends[i][j], params.times[i][j], value, params.confidence)
    });
    (sample, params.weights[i])
}

fn correlate_mean_difference(params: &CorrelateParams<'_>, i: usize, v: &CorrelateInfluencerValue<'_>) -> PairSample {
    let mut weights = params.weights[i];
    let sample = std::array::from_fn(|j| {
        let (n, ni) = (params.counts[i][j], v.count[j]);
        let mut remainder = MeanAccumulator::from_moments(n, params.values[i].get(j).copied().unwrap_or(0.0));
        remainder.remove(&MeanAccumulator::from_moments(ni, v.statistic.get(j).copied().unwrap_or(0.0)));
        scale_for_remainder(&mut weights[j], n, ni);
        detrend(params.trends[i][j], params.times[i][j], remainder.mean(), params.confidence)
    });
    (sample, weights)
}

fn correlate_variance_difference(
    params: &CorrelateParams<'_>,
    i: usize,
    v: &CorrelateInfluencerValue<'_>,
) -> PairSample {
    let mut weights = params.weights[i];
    let sample = std::array::from_fn(|j| {
        let (n, ni) = (params.counts[i][j], v.count[j]);
        let mut remainder = variance_of(n, &params.values[i], j, 2);
        remainder.remove(&variance_of(ni, &v.statistic, j, 2));
        scale_for_remainder(&mut weights[j], n, ni);
        remainder.ml_variance()
    });
    (sample, weights)
}

/// Score influencer values against the most anomalous correlate. The
/// other correlates are taken to be unaffected.
fn correlate_influences<'a, C, I>(
    calculation: Calculation,
    counterfactual: C,
    influence: I,
    params: &CorrelateParams<'a>,
) -> Vec<(&'a str, f64)>
where
    C: Fn(&CorrelateParams<'a>, usize, &CorrelateInfluencerValue<'a>) -> PairSample,
    I: Fn(f64, f64) -> f64,
{
    let values = &params.influencer_values;
    if values.len() == 1 {
        return vec![(values[0].value, 1.0)];
    }
    if params.probability == 1.0 {
        return values.iter().map(|v| (v.value, 1.0)).collect();
    }
    let Some(i) = params.most_anomalous_correlate.filter(|&i| i < params.priors.len()) else {
        return Vec::new();
    };

    let logp = params.probability.max(SMALLEST_PROBABILITY).ln();
    let n = params.priors.len();
    let neff = effective_count(n);
    let mut template = ProbabilityOfExtremeSample::new();
    for _ in 1..n {
        template.add(1.0, neff);
    }
    let (prior, coordinate) = params.priors[i];
    let elapsed_time = params.elapsed_times[i][0].min(params.elapsed_times[i][1]);

    let mut result = Vec::with_capacity(values.len());
    for v in values {
        let (sample, weights) = counterfactual(params, i, v);
        let probability = prior
            .probability_of_less_likely_samples(calculation, &weights, &sample, &[coordinate])
            .and_then(|p| p.first().copied());
        let Some(probability) = probability else {
            error!(influencer = params.influencer_name, value = v.value, "failed to compute influence");
            continue;
        };
        let pi = truncate((probability.marginal * probability.conditional).sqrt(), SMALLEST_PROBABILITY, 1.0);
        let bucket_empty = [params.counts[i][0] - v.count[0] == 0.0, params.counts[i][1] - v.count[1] == 0.0];
        let pi = correct_for_empty_bucket_pair(
            params.feature.calculation(),
            sample[coordinate],
            bucket_empty,
            params.probability_bucket_empty[i],
            pi,
        );
        let pi = params.feature.adjust_probability(elapsed_time, pi);

        let mut aggregator = template.clone();
        aggregator.add(pi, neff);
        let Some(pi) = aggregator.calculate() else {
            continue;
        };
        let score = influence(logp, pi.ln());
        if params.include_cutoff || score >= params.cutoff {
            result.push((v.value, score));
        }
    }
    result
}

// Counterfactual samples for a vector valued feature.

type VectorSample = (SmallVec<[f64; 2]>, SmallVec<[SampleWeights; 2]>);

fn multivariate_value_difference(params: &MultivariateParams<'_>, v: &InfluencerValue<'_>) -> VectorSample {
    let sample = (0..params.prior.dimension())
        .map(|j| {
            let value = params.value.get(j).copied().unwrap_or(0.0) - v.statistic.get(j).copied().unwrap_or(0.0);
            detrend(params.trends.get(j).copied().flatten(), params.time, value, params.confidence)
        })
        .collect();
    (sample, params.weights.clone())
}

fn multivariate_value_intersection(params: &MultivariateParams<'_>, v: &InfluencerValue<'_>) -> VectorSample {
    let sample = (0..params.prior.dimension())
        .map(|j| {
            let value = v.statistic.get(j).copied().unwrap_or(0.0);
            detrend(params.trends.get(j).copied().flatten(), params.time, value, params.confidence)
        })
        .collect();
    (sample, params.weights.clone())
}

fn multivariate_mean_difference(params: &MultivariateParams<'_>, v: &InfluencerValue<'_>) -> VectorSample {
    let mut weights = params.weights.clone();
    for w in &mut weights {
        scale_for_remainder(w, params.count, v.count);
    }
    let sample = (0..params.prior.dimension())
        .map(|j| {
            let value = params.value.get(j).copied().unwrap_or(0.0);
            let mut remainder = MeanAccumulator::from_moments(params.count, value);
            remainder.remove(&MeanAccumulator::from_moments(v.count, v.statistic.get(j).copied().unwrap_or(0.0)));
            detrend(params.trends.get(j).copied().flatten(), params.time, remainder.mean(), params.confidence)
        })
        .collect();
    (sample, weights)
}

fn multivariate_variance_difference(params: &MultivariateParams<'_>, v: &InfluencerValue<'_>) -> VectorSample {
    let d = params.prior.dimension();
    let mut weights = params.weights.clone();
    for w in &mut weights {
        scale_for_remainder(w, params.count, v.count);
    }
    let sample = (0..d)
        .map(|j| {
            let mut remainder = variance_of(params.count, &params.value, j, d);
            remainder.remove(&variance_of(v.count, &v.statistic, j, d));
            remainder.ml_variance()
        })
        .collect();
    (sample, weights)
}

/// Score influencer values of a vector valued feature. Each coordinate
/// on a tail `calculation_for` accepts contributes its marginal and
/// conditional probabilities to joint aggregates.
fn multivariate_influences<'a, T, C, I>(
    calculation_for: T,
    counterfactual: C,
    influence: I,
    params: &MultivariateParams<'a>,
) -> Vec<(&'a str, f64)>
where
    T: Fn(Tail) -> Option<Calculation>,
    C: Fn(&MultivariateParams<'a>, &InfluencerValue<'a>) -> VectorSample,
    I: Fn(f64, f64) -> f64,
{
    let values = &params.influencer_values;
    if values.len() == 1 {
        return vec![(values[0].value, 1.0)];
    }
    if params.probability == 1.0 {
        return values.iter().map(|v| (v.value, 1.0)).collect();
    }
    let coordinates: SmallVec<[(usize, Calculation); 2]> = params
        .tail
        .iter()
        .enumerate()
        .filter_map(|(i, &tail)| Some((i, calculation_for(tail)?)))
        .collect();
    if coordinates.is_empty() {
        return Vec::new();
    }

    let logp = params.probability.max(SMALLEST_PROBABILITY).ln();
    let mut result = Vec::with_capacity(values.len());
    'values: for v in values {
        let (sample, weights) = counterfactual(params, v);
        let mut marginal = JointProbabilityOfLessLikelySamples::new();
        let mut conditional = JointProbabilityOfLessLikelySamples::new();
        for &(i, calculation) in &coordinates {
            let probability = params
                .prior
                .probability_of_less_likely_samples(calculation, &weights, &sample, &[i])
                .and_then(|p| p.first().copied());
            let Some(probability) = probability else {
                error!(influencer = params.influencer_name, value = v.value, "failed to compute influence");
                continue 'values;
            };
            marginal.add(probability.marginal, 1.0);
            conditional.add(probability.conditional, 1.0);
        }
        let (Some(pm), Some(pc)) = (marginal.calculate(), conditional.calculate()) else {
            continue;
        };
        let pi = truncate((pm * pc).sqrt(), SMALLEST_PROBABILITY, 1.0);
        let pi = correct_for_empty_bucket(
            params.feature.calculation(),
            &sample,
            params.count - v.count == 0.0,
            params.probability_bucket_empty,
            pi,
        );
        let pi = params.feature.adjust_probability(params.elapsed_time, pi);
        let score = influence(logp, pi.ln());
        if params.include_cutoff || score >= params.cutoff {
            result.push((v.value, score));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::Feature;
    use crate::prior::{ConjugatePrior, MultivariateNormalPrior, MultivariatePrior, NormalPrior};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn prior(mean: f64) -> NormalPrior {
        let mut rng = StdRng::seed_from_u64(3);
        let normal = Normal::new(mean, 1.0).unwrap();
        let samples: Vec<f64> = (0..50).map(|_| normal.sample(&mut rng)).collect();
        let mut prior = NormalPrior::non_informative(0.0);
        prior.add_samples(&[SampleWeights::default(); 50], &samples);
        prior
    }

    /// Fill the probability and tail the way the calculator would, then
    /// run `calculator` with a fixed cutoff.
    fn compute<'a>(
        calculator: &dyn InfluenceCalculator,
        prior: &'a NormalPrior,
        feature: Feature,
        value: &[f64],
        count: f64,
        values: Vec<InfluencerValue<'a>>,
    ) -> Vec<(&'a str, f64)> {
        let mut params = Params::new(feature, prior);
        params.value = SmallVec::from_slice(value);
        params.count = count;
        params.sample = value[0];
        let (lower, upper, tail) = prior
            .probability_of_less_likely_samples(feature.calculation(), &params.weights, value[0])
            .unwrap();
        params.probability = (lower + upper) / 2.0;
        params.tail = tail;
        params.influencer_name = "I";
        params.influencer_values = values;
        params.cutoff = 0.5;
        params.include_cutoff = false;
        calculator.compute_influences(&mut params);
        params.influences
    }

    #[test]
    fn test_influence_functions() {
        assert_eq!(intersection_influence(-10.0, -10.0), 1.0);
        assert_eq!(intersection_influence(-10.0, -5.0), 0.5);
        assert_eq!(intersection_influence(0.0, 0.0), 1.0);
        assert_eq!(complement_influence(-10.0, -10.0), 0.0);
        assert_eq!(complement_influence(-10.0, -2.0), 0.8);
        assert_eq!(complement_influence(0.0, 0.0), 1.0);
    }

    #[test]
    fn test_sort_orders() {
        let mut values = vec![
            InfluencerValue::new("a", &[1.0], 1.0),
            InfluencerValue::new("b", &[18.0], 1.0),
            InfluencerValue::new("c", &[5.0], 1.0),
        ];
        sort_by_value(Tail::Right, &mut values);
        assert_eq!(values.iter().map(|v| v.value).collect::<Vec<_>>(), ["b", "c", "a"]);
        sort_by_value(Tail::Left, &mut values);
        assert_eq!(values.iter().map(|v| v.value).collect::<Vec<_>>(), ["a", "c", "b"]);

        // Removing "high" lowers the remaining mean the most.
        let mut values = vec![
            InfluencerValue::new("low", &[5.0], 10.0),
            InfluencerValue::new("high", &[20.0], 10.0),
        ];
        sort_by_mean(Tail::Right, 12.5, 20.0, &mut values);
        assert_eq!(values[0].value, "high");
        sort_by_mean(Tail::Left, 12.5, 20.0, &mut values);
        assert_eq!(values[0].value, "low");
    }

    #[test]
    fn test_indicator_scores_every_value_one() {
        let prior = prior(10.0);
        let values: Vec<_> = ["a", "b", "c", "d"].into_iter().map(|v| InfluencerValue::new(v, &[1.0], 1.0)).collect();
        let influences = compute(&IndicatorInfluenceCalculator, &prior, Feature::Indicator, &[1.0], 4.0, values);
        assert_eq!(influences, vec![("a", 1.0), ("b", 1.0), ("c", 1.0), ("d", 1.0)]);
    }

    #[test]
    fn test_unavailable_scores_nothing() {
        let prior = prior(10.0);
        let values = vec![InfluencerValue::new("a", &[1.0], 1.0), InfluencerValue::new("b", &[1.0], 1.0)];
        let influences = compute(&InfluenceUnavailableCalculator, &prior, Feature::TimeOfDay, &[30.0], 2.0, values);
        assert!(influences.is_empty());
    }

    #[test]
    fn test_log_probability_complement() {
        let prior = prior(10.0);
        let single = vec![InfluencerValue::new("i1", &[20.0], 1.0)];
        let influences =
            compute(&LogProbabilityComplementInfluenceCalculator, &prior, Feature::Count, &[20.0], 1.0, single);
        assert_eq!(influences, vec![("i1", 1.0)]);

        // Only "i3" carries the spike: without it the count is normal.
        let values = vec![
            InfluencerValue::new("i1", &[1.0], 1.0),
            InfluencerValue::new("i2", &[1.0], 1.0),
            InfluencerValue::new("i3", &[18.0], 1.0),
        ];
        let influences =
            compute(&LogProbabilityComplementInfluenceCalculator, &prior, Feature::Count, &[20.0], 3.0, values);
        assert_eq!(influences.len(), 1);
        assert_eq!(influences[0].0, "i3");
        assert!((influences[0].1 - 1.0).abs() < 1e-3, "score = {}", influences[0].1);

        // A low count is not attributed by the complement calculation.
        let values = vec![InfluencerValue::new("i1", &[1.0], 1.0), InfluencerValue::new("i2", &[1.0], 1.0)];
        let influences =
            compute(&LogProbabilityComplementInfluenceCalculator, &prior, Feature::Count, &[2.0], 2.0, values);
        assert!(influences.is_empty());
    }

    #[test]
    fn test_log_probability() {
        let prior = prior(10.0);
        let single = vec![InfluencerValue::new("i1", &[5.0], 1.0)];
        let influences = compute(&LogProbabilityInfluenceCalculator, &prior, Feature::UniqueCount, &[5.0], 1.0, single);
        assert_eq!(influences, vec![("i1", 1.0)]);

        // The values which are themselves as low as the bucket explain it.
        let values = vec![
            InfluencerValue::new("i1", &[9.0], 1.0),
            InfluencerValue::new("i2", &[5.0], 1.0),
            InfluencerValue::new("i3", &[5.0], 1.0),
        ];
        let influences = compute(&LogProbabilityInfluenceCalculator, &prior, Feature::UniqueCount, &[5.0], 3.0, values);
        let names: Vec<_> = influences.iter().map(|(v, _)| *v).collect();
        assert_eq!(names, ["i2", "i3"]);
        for (_, score) in influences {
            assert!((score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_mean() {
        let prior = prior(10.0);
        let single = vec![InfluencerValue::new("i1", &[5.0], 1.0)];
        let influences = compute(&MeanInfluenceCalculator, &prior, Feature::Mean, &[5.0], 1.0, single);
        assert_eq!(influences, vec![("i1", 1.0)]);

        // "i1" drags the mean up; the rest are unremarkable.
        let values = vec![
            InfluencerValue::new("i1", &[20.0], 5.0),
            InfluencerValue::new("i2", &[10.0], 7.0),
            InfluencerValue::new("i3", &[10.0], 8.0),
        ];
        let influences = compute(&MeanInfluenceCalculator, &prior, Feature::Mean, &[12.5], 20.0, values);
        assert_eq!(influences.len(), 1);
        assert_eq!(influences[0].0, "i1");

        // Two values equally responsible: neither alone explains it.
        let values = vec![InfluencerValue::new("i1", &[15.0], 5.0), InfluencerValue::new("i2", &[15.0], 6.0)];
        let influences = compute(&MeanInfluenceCalculator, &prior, Feature::Mean, &[15.0], 11.0, values);
        assert!(influences.is_empty(), "{:?}", influences);

        let values = vec![InfluencerValue::new("i1", &[5.0], 5.0), InfluencerValue::new("i2", &[5.0], 6.0)];
        let influences = compute(&MeanInfluenceCalculator, &prior, Feature::Mean, &[5.0], 11.0, values);
        assert!(influences.is_empty(), "{:?}", influences);
    }

    #[test]
    fn test_variance() {
        let prior = prior(1.0);
        // One value with a huge spread inflates the bucket variance.
        let values = vec![
            InfluencerValue::new("i1", &[40.0, 10.0], 5.0),
            InfluencerValue::new("i2", &[1.0, 10.0], 10.0),
            InfluencerValue::new("i3", &[1.0, 10.0], 10.0),
        ];
        let total = {
            let mut all = MeanVarAccumulator::new();
            for v in &values {
                all.merge(&variance_of(v.count, &v.statistic, 0, 1));
            }
            all
        };
        let influences = compute(
            &VarianceInfluenceCalculator,
            &prior,
            Feature::Variance,
            &[total.ml_variance(), total.mean()],
            total.count(),
            values,
        );
        assert_eq!(influences.first().map(|(v, _)| *v), Some("i1"));
        assert_eq!(influences.len(), 1);
    }

    #[test]
    fn test_include_cutoff_halves_remaining() {
        let prior = prior(10.0);
        let mut params = Params::new(Feature::Count, &prior);
        params.value = SmallVec::from_slice(&[20.0]);
        params.count = 3.0;
        params.probability = 1e-10;
        params.tail = Tail::Right;
        params.influencer_values = vec![
            InfluencerValue::new("i1", &[1.0], 1.0),
            InfluencerValue::new("i2", &[1.0], 1.0),
            InfluencerValue::new("i3", &[18.0], 1.0),
        ];
        params.cutoff = 0.5;
        params.include_cutoff = true;
        LogProbabilityComplementInfluenceCalculator.compute_influences(&mut params);
        assert_eq!(params.influences.len(), 3);
        assert_eq!(params.influences[0].0, "i3");
        let (_, second) = params.influences[1];
        let (_, third) = params.influences[2];
        assert!(second < 0.5);
        assert!((third - 0.5 * second).abs() < 1e-12);
    }

    #[test]
    fn test_multivariate_mean() {
        let mut rng = StdRng::seed_from_u64(5);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut prior = MultivariateNormalPrior::non_informative(2, 0.0);
        let samples: Vec<Vec<f64>> =
            (0..200).map(|_| vec![10.0 + normal.sample(&mut rng), 20.0 + normal.sample(&mut rng)]).collect();
        prior.add_samples(&vec![SampleWeights::default(); samples.len()], &samples);

        let mut params = MultivariateParams::new(Feature::MeanLatLong, &prior);
        params.value = SmallVec::from_slice(&[12.5, 20.0]);
        params.sample = SmallVec::from_slice(&[12.5, 20.0]);
        params.count = 20.0;
        let (p, tail) = prior
            .joint_probability_of_less_likely_samples(Calculation::TwoSided, &params.weights, &params.sample)
            .unwrap();
        params.probability = p;
        params.tail = tail;
        params.influencer_values = vec![
            InfluencerValue::new("i1", &[20.0, 20.0], 5.0),
            InfluencerValue::new("i2", &[10.0, 20.0], 15.0),
        ];
        params.cutoff = 0.5;
        MeanInfluenceCalculator.compute_multivariate_influences(&mut params);
        assert_eq!(params.influences.len(), 1);
        assert_eq!(params.influences[0].0, "i1");
    }
}
