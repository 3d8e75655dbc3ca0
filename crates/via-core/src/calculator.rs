//! Probability and Influence Calculator
//!
//! Folds the probabilities of every feature of a result into a single
//! anomaly probability and attributes it to influencer field values.
//!
//! Each feature probability is corrected for the chance that the bucket
//! would have been empty, pulled toward one for young time-of-day models
//! and added to an aggregator. Influences are computed by the feature's
//! influence calculator: each influencer value is scored by how much of
//! the event's log-probability it explains, and the score is committed
//! to a per-value aggregator as the probability `exp(score * ln p)`.
//! When all results are in, the per-value aggregates are compared with
//! the total to rank the influencers.

use crate::aggregator::{AggregationStyle, Aggregator, ProbabilityAggregator, ProbabilityOfExtremeSample};
use crate::algo::TrendDecomposition;
use crate::config::CalculatorConfig;
use crate::feature::Feature;
use crate::influence::{InfluenceCalculator, intersection_influence};
use crate::interner::{Interned, Interner};
use crate::prior::{Calculation, ConjugatePrior, MultivariatePrior, SampleWeights, Tail};
use crate::stats::{SMALLEST_PROBABILITY, truncate};
use crate::time::Time;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use tracing::{debug, error, trace};

/// Discount applied to each correlate's probability when `n` correlates
/// are aggregated, since correlated series are not independent.
const EFFECTIVE_COUNT: [f64; 9] = [1.0, 0.8, 0.7, 0.65, 0.6, 0.57, 0.54, 0.52, 0.51];

pub fn effective_count(n: usize) -> f64 {
    match n {
        0 => 1.0,
        n if n <= EFFECTIVE_COUNT.len() => EFFECTIVE_COUNT[n - 1],
        _ => 0.5,
    }
}

/// Whether an empty bucket would itself be anomalous in the direction
/// being tested; if so the empty-bucket probability counts against `p`.
fn one_sided_empty_bucket_correction(calculation: Calculation, values: &[f64], probability_empty: f64) -> f64 {
    match calculation {
        Calculation::TwoSided => 0.0,
        Calculation::OneSidedBelow if values.iter().all(|&v| v >= 0.0) => 2.0 * probability_empty,
        Calculation::OneSidedAbove if values.iter().all(|&v| v <= 0.0) => 2.0 * probability_empty,
        _ => 0.0,
    }
}

/// Mix the probability of the observed value with the probability the
/// bucket is empty.
pub fn correct_for_empty_bucket(
    calculation: Calculation,
    values: &[f64],
    bucket_empty: bool,
    probability_empty: f64,
    probability: f64,
) -> f64 {
    let corrected = (1.0 - probability_empty) * probability;
    if bucket_empty {
        probability_empty + corrected
    } else {
        f64::min(one_sided_empty_bucket_correction(calculation, values, probability_empty) + corrected, 1.0)
    }
}

/// `correct_for_empty_bucket` for a correlated pair, where either
/// series' bucket may be empty.
pub fn correct_for_empty_bucket_pair(
    calculation: Calculation,
    value: f64,
    bucket_empty: [bool; 2],
    probability_empty: [f64; 2],
    probability: f64,
) -> f64 {
    let [e0, e1] = probability_empty;
    match bucket_empty {
        [false, false] => {
            let p_state = (1.0 - e0) * (1.0 - e1);
            let correction = one_sided_empty_bucket_correction(calculation, &[value], 1.0 - p_state);
            f64::min(correction + p_state * probability, 1.0)
        }
        [false, true] => {
            let p_state = (1.0 - e0) * e1;
            let correction = one_sided_empty_bucket_correction(calculation, &[value], e0);
            f64::min(correction + p_state + (1.0 - p_state) * probability, 1.0)
        }
        [true, false] => {
            let p_state = e0 * (1.0 - e1);
            let correction = one_sided_empty_bucket_correction(calculation, &[value], e1);
            f64::min(correction + p_state + (1.0 - p_state) * probability, 1.0)
        }
        [true, true] => {
            let p_state = e0 * e1;
            p_state + (1.0 - p_state) * probability
        }
    }
}

/// Whether a correlated result was driven by the correlate's marginal
/// or conditional probability.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    #[default]
    Unconditional,
    Conditional,
}

/// An influencer value's share of the bucket statistic.
///
/// `statistic` is laid out like the feature value: the statistic itself,
/// or `[variances.., means..]` for variance features.
#[derive(Clone, Debug, PartialEq)]
pub struct InfluencerValue<'a> {
    pub value: &'a str,
    pub statistic: SmallVec<[f64; 4]>,
    pub count: f64,
}

impl<'a> InfluencerValue<'a> {
    pub fn new(value: &'a str, statistic: &[f64], count: f64) -> Self {
        Self { value, statistic: SmallVec::from_slice(statistic), count }
    }
}

/// An influencer value's share of both statistics of a correlated pair.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrelateInfluencerValue<'a> {
    pub value: &'a str,
    pub statistic: SmallVec<[f64; 4]>,
    pub count: [f64; 2],
}

/// Inputs and outputs for a univariate feature.
#[derive(Clone)]
pub struct Params<'a> {
    pub feature: Feature,
    pub trend: Option<&'a TrendDecomposition>,
    pub prior: &'a dyn ConjugatePrior,
    pub elapsed_time: Time,
    pub time: Time,
    /// The bucket statistic before detrending.
    pub value: SmallVec<[f64; 2]>,
    pub count: f64,
    /// The value presented to the prior.
    pub sample: f64,
    pub weights: SampleWeights,
    pub bucket_empty: bool,
    pub probability_bucket_empty: f64,
    pub probability: f64,
    pub tail: Tail,
    pub confidence: f64,
    pub partitioning_fields: Vec<(&'a str, &'a str)>,
    pub influencer_name: &'a str,
    pub influencer_values: Vec<InfluencerValue<'a>>,
    pub cutoff: f64,
    pub include_cutoff: bool,
    pub influences: Vec<(&'a str, f64)>,
}

impl<'a> Params<'a> {
    pub fn new(feature: Feature, prior: &'a dyn ConjugatePrior) -> Self {
        Self {
            feature,
            trend: None,
            prior,
            elapsed_time: 0,
            time: 0,
            value: SmallVec::new(),
            count: 0.0,
            sample: 0.0,
            weights: SampleWeights::default(),
            bucket_empty: false,
            probability_bucket_empty: 0.0,
            probability: 1.0,
            tail: Tail::Undetermined,
            confidence: 0.0,
            partitioning_fields: Vec::new(),
            influencer_name: "",
            influencer_values: Vec::new(),
            cutoff: 1.0,
            include_cutoff: false,
            influences: Vec::new(),
        }
    }
}

/// Inputs and outputs for a vector valued feature.
#[derive(Clone)]
pub struct MultivariateParams<'a> {
    pub feature: Feature,
    /// One per coordinate.
    pub trends: SmallVec<[Option<&'a TrendDecomposition>; 2]>,
    pub prior: &'a dyn MultivariatePrior,
    pub elapsed_time: Time,
    pub time: Time,
    pub value: SmallVec<[f64; 4]>,
    pub count: f64,
    pub sample: SmallVec<[f64; 2]>,
    pub weights: SmallVec<[SampleWeights; 2]>,
    pub bucket_empty: bool,
    pub probability_bucket_empty: f64,
    pub probability: f64,
    pub tail: SmallVec<[Tail; 2]>,
    pub confidence: f64,
    pub partitioning_fields: Vec<(&'a str, &'a str)>,
    pub influencer_name: &'a str,
    pub influencer_values: Vec<InfluencerValue<'a>>,
    pub cutoff: f64,
    pub include_cutoff: bool,
    pub influences: Vec<(&'a str, f64)>,
}

impl<'a> MultivariateParams<'a> {
    pub fn new(feature: Feature, prior: &'a dyn MultivariatePrior) -> Self {
        let d = prior.dimension();
        Self {
            feature,
            trends: SmallVec::from_elem(None, d),
            prior,
            elapsed_time: 0,
            time: 0,
            value: SmallVec::new(),
            count: 0.0,
            sample: SmallVec::new(),
            weights: SmallVec::from_elem(SampleWeights::default(), d),
            bucket_empty: false,
            probability_bucket_empty: 0.0,
            probability: 1.0,
            tail: SmallVec::new(),
            confidence: 0.0,
            partitioning_fields: Vec::new(),
            influencer_name: "",
            influencer_values: Vec::new(),
            cutoff: 1.0,
            include_cutoff: false,
            influences: Vec::new(),
        }
    }
}

/// Inputs and outputs for a series modelled jointly with correlates.
///
/// Each correlate `i` pairs this series with another: `priors[i]` is the
/// bivariate prior and the coordinate of this series in it, and every
/// other per-correlate vector is indexed the same way with pairs ordered
/// by the prior's coordinates.
#[derive(Clone)]
pub struct CorrelateParams<'a> {
    pub feature: Feature,
    pub priors: Vec<(&'a dyn MultivariatePrior, usize)>,
    pub trends: Vec<[Option<&'a TrendDecomposition>; 2]>,
    pub elapsed_times: Vec<[Time; 2]>,
    pub times: Vec<[Time; 2]>,
    pub values: Vec<SmallVec<[f64; 4]>>,
    pub counts: Vec<[f64; 2]>,
    pub samples: Vec<[f64; 2]>,
    pub weights: Vec<[SampleWeights; 2]>,
    pub bucket_empty: Vec<[bool; 2]>,
    pub probability_bucket_empty: Vec<[f64; 2]>,
    pub probability: f64,
    pub tail: Tail,
    pub result_kind: ResultKind,
    pub most_anomalous_correlate: Option<usize>,
    /// Labels of the series each correlate pairs with.
    pub correlated_labels: Vec<&'a str>,
    pub confidence: f64,
    pub partitioning_fields: Vec<(&'a str, &'a str)>,
    pub influencer_name: &'a str,
    /// Shares of the most anomalous correlate's statistics.
    pub influencer_values: Vec<CorrelateInfluencerValue<'a>>,
    pub cutoff: f64,
    pub include_cutoff: bool,
    pub influences: Vec<(&'a str, f64)>,
}

impl<'a> CorrelateParams<'a> {
    pub fn new(feature: Feature) -> Self {
        Self {
            feature,
            priors: Vec::new(),
            trends: Vec::new(),
            elapsed_times: Vec::new(),
            times: Vec::new(),
            values: Vec::new(),
            counts: Vec::new(),
            samples: Vec::new(),
            weights: Vec::new(),
            bucket_empty: Vec::new(),
            probability_bucket_empty: Vec::new(),
            probability: 1.0,
            tail: Tail::Undetermined,
            result_kind: ResultKind::Unconditional,
            most_anomalous_correlate: None,
            correlated_labels: Vec::new(),
            confidence: 0.0,
            partitioning_fields: Vec::new(),
            influencer_name: "",
            influencer_values: Vec::new(),
            cutoff: 1.0,
            include_cutoff: false,
            influences: Vec::new(),
        }
    }

    /// Append a correlate with no trend, observed at `time`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_correlate(
        &mut self,
        prior: &'a dyn MultivariatePrior,
        coordinate: usize,
        label: &'a str,
        time: Time,
        elapsed_time: [Time; 2],
        value: &[f64],
        count: [f64; 2],
        sample: [f64; 2],
    ) {
        self.priors.push((prior, coordinate));
        self.trends.push([None, None]);
        self.elapsed_times.push(elapsed_time);
        self.times.push([time, time]);
        self.values.push(SmallVec::from_slice(value));
        self.counts.push(count);
        self.samples.push(sample);
        self.weights.push([SampleWeights::default(); 2]);
        self.bucket_empty.push([false, false]);
        self.probability_bucket_empty.push([0.0, 0.0]);
        self.correlated_labels.push(label);
    }
}

/// A scored influencer value.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Influence {
    pub name: Interned,
    pub value: Interned,
    pub score: f64,
}

/// The probability of one attribute of a result.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AttributeProbability {
    pub attribute: String,
    pub id: usize,
    pub attribute_probability: f64,
    pub probability: f64,
    pub kind: ResultKind,
    pub feature: Feature,
    pub correlated: Option<String>,
}

/// Receives the per-attribute probabilities of a result.
pub trait AnnotatedProbabilityBuilder {
    fn add_attribute_probability(&mut self, record: AttributeProbability);
}

/// A result: the overall probability, its attribute probabilities and
/// resolved influences.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SimpleAnnotatedProbability {
    pub probability: Option<f64>,
    pub attributes: Vec<AttributeProbability>,
    pub influences: Vec<(String, String, f64)>,
}

impl SimpleAnnotatedProbability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finalize from a calculator, resolving influence handles.
    pub fn finish(&mut self, calculator: &ProbabilityAndInfluenceCalculator, interner: &Interner) -> bool {
        let Some((probability, influences)) = calculator.calculate_with_influences() else {
            return false;
        };
        self.probability = Some(probability);
        self.influences = influences
            .iter()
            .filter_map(|influence| {
                Some((
                    interner.resolve(influence.name)?.to_string(),
                    interner.resolve(influence.value)?.to_string(),
                    influence.score,
                ))
            })
            .collect();
        true
    }
}

impl AnnotatedProbabilityBuilder for SimpleAnnotatedProbability {
    fn add_attribute_probability(&mut self, record: AttributeProbability) {
        self.attributes.push(record);
    }
}

/// Log-probability and influence cutoff for an event of probability `p`.
fn influence_cutoff(probability: f64) -> (f64, f64) {
    let logp = probability.max(SMALLEST_PROBABILITY).ln();
    (logp, 0.5 / f64::max(-logp, 1.0))
}

#[derive(Clone)]
pub struct ProbabilityAndInfluenceCalculator {
    cutoff: f64,
    influence_calculator: Option<&'static dyn InfluenceCalculator>,
    probability_template: ProbabilityAggregator,
    probability: ProbabilityAggregator,
    influencer_probabilities: BTreeMap<(Interned, Interned), ProbabilityAggregator>,
}

impl ProbabilityAndInfluenceCalculator {
    /// A calculator with no aggregators; add them with `add_aggregator`.
    pub fn new(cutoff: f64) -> Self {
        Self::with_style(cutoff, AggregationStyle::Min)
    }

    fn with_style(cutoff: f64, style: AggregationStyle) -> Self {
        Self {
            cutoff,
            influence_calculator: None,
            probability_template: ProbabilityAggregator::new(style),
            probability: ProbabilityAggregator::new(style),
            influencer_probabilities: BTreeMap::new(),
        }
    }

    /// A calculator aggregating with both the joint and the extreme
    /// sample aggregators.
    pub fn with_config(config: &CalculatorConfig) -> Self {
        let mut calculator = Self::with_style(config.cutoff, config.aggregation);
        calculator.add_aggregator(Aggregator::joint());
        calculator.add_aggregator(Aggregator::extreme());
        calculator
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    pub fn empty(&self) -> bool {
        self.probability.empty()
    }

    pub fn add_aggregator(&mut self, aggregator: Aggregator) {
        self.probability_template.add_aggregator(aggregator.clone(), 1.0);
        self.probability.add_aggregator(aggregator, 1.0);
    }

    pub fn plug_influence_calculator(&mut self, calculator: &'static dyn InfluenceCalculator) {
        self.influence_calculator = Some(calculator);
    }

    /// Fold a finished calculator in as a single probability. Influencers
    /// seen only by `other` aggregate the way `other` does.
    pub fn add(&mut self, other: &ProbabilityAndInfluenceCalculator, weight: f64) {
        let Some(p) = other.probability.calculate() else {
            return;
        };
        self.probability.add(p, weight);
        for (key, aggregator) in &other.influencer_probabilities {
            let Some(pi) = aggregator.calculate() else {
                continue;
            };
            self.influencer_probabilities
                .entry(*key)
                .or_insert_with(|| other.probability_template.clone())
                .add(pi, weight);
        }
    }

    /// Add the probability of an attribute and record it with `builder`.
    pub fn add_attribute_probability(
        &mut self,
        attribute: &str,
        id: usize,
        attribute_probability: f64,
        params: &mut Params<'_>,
        builder: &mut dyn AnnotatedProbabilityBuilder,
        weight: f64,
    ) -> bool {
        let Some((probability, tail)) = self.add_probability(
            params.feature,
            params.prior,
            params.elapsed_time,
            &params.weights,
            params.sample,
            params.bucket_empty,
            params.probability_bucket_empty,
            weight,
        ) else {
            return false;
        };
        params.probability = probability;
        params.tail = tail;
        builder.add_attribute_probability(AttributeProbability {
            attribute: attribute.to_string(),
            id,
            attribute_probability,
            probability,
            kind: ResultKind::Unconditional,
            feature: params.feature,
            correlated: None,
        });
        true
    }

    /// As `add_attribute_probability` for a vector valued feature.
    pub fn add_attribute_multivariate_probability(
        &mut self,
        attribute: &str,
        id: usize,
        attribute_probability: f64,
        params: &mut MultivariateParams<'_>,
        builder: &mut dyn AnnotatedProbabilityBuilder,
        weight: f64,
    ) -> bool {
        let Some((probability, tail)) = self.add_multivariate_probability(
            params.feature,
            params.prior,
            params.elapsed_time,
            &params.weights,
            &params.sample,
            params.bucket_empty,
            params.probability_bucket_empty,
            weight,
        ) else {
            return false;
        };
        params.probability = probability;
        params.tail = tail;
        builder.add_attribute_probability(AttributeProbability {
            attribute: attribute.to_string(),
            id,
            attribute_probability,
            probability,
            kind: ResultKind::Unconditional,
            feature: params.feature,
            correlated: None,
        });
        true
    }

    /// As `add_attribute_probability` for a series with correlates.
    pub fn add_attribute_correlate_probability(
        &mut self,
        attribute: &str,
        id: usize,
        attribute_probability: f64,
        params: &mut CorrelateParams<'_>,
        builder: &mut dyn AnnotatedProbabilityBuilder,
        weight: f64,
    ) -> bool {
        if !self.add_correlate_probability(params, weight) {
            return false;
        }
        let correlated = params
            .most_anomalous_correlate
            .and_then(|i| params.correlated_labels.get(i))
            .map(|label| label.to_string());
        builder.add_attribute_probability(AttributeProbability {
            attribute: attribute.to_string(),
            id,
            attribute_probability,
            probability: params.probability,
            kind: params.result_kind,
            feature: params.feature,
            correlated,
        });
        true
    }

    /// Add a probability computed elsewhere to the total and to every
    /// influencer value seen so far.
    pub fn add_raw_probability(&mut self, probability: f64, weight: f64) {
        self.probability.add(probability, weight);
        for aggregator in self.influencer_probabilities.values_mut() {
            aggregator.add(probability, weight);
        }
    }

    /// Add the probability of `sample` under `prior`. Returns the
    /// corrected probability and tail, or `None` if the prior could not
    /// compute one.
    #[allow(clippy::too_many_arguments)]
    pub fn add_probability(
        &mut self,
        feature: Feature,
        prior: &dyn ConjugatePrior,
        elapsed_time: Time,
        weights: &SampleWeights,
        sample: f64,
        bucket_empty: bool,
        probability_bucket_empty: f64,
        weight: f64,
    ) -> Option<(f64, Tail)> {
        let calculation = feature.calculation();
        let Some((lower, upper, tail)) = prior.probability_of_less_likely_samples(calculation, weights, sample) else {
            debug!(?feature, sample, "failed to compute probability");
            return None;
        };
        let p = correct_for_empty_bucket(
            calculation,
            &[sample],
            bucket_empty,
            probability_bucket_empty,
            (lower + upper) / 2.0,
        );
        let p = feature.adjust_probability(elapsed_time, p);
        if !feature.is_constant() {
            self.probability.add(p, weight);
        }
        trace!(?feature, sample, p, "added probability");
        Some((p, tail))
    }

    /// Add the joint probability of a vector `sample`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_multivariate_probability(
        &mut self,
        feature: Feature,
        prior: &dyn MultivariatePrior,
        elapsed_time: Time,
        weights: &[SampleWeights],
        sample: &[f64],
        bucket_empty: bool,
        probability_bucket_empty: f64,
        weight: f64,
    ) -> Option<(f64, SmallVec<[Tail; 2]>)> {
        let calculation = feature.calculation();
        let Some((p, tail)) = prior.joint_probability_of_less_likely_samples(calculation, weights, sample) else {
            debug!(?feature, ?sample, "failed to compute probability");
            return None;
        };
        let p = correct_for_empty_bucket(calculation, sample, bucket_empty, probability_bucket_empty, p);
        let p = feature.adjust_probability(elapsed_time, p);
        if !feature.is_constant() {
            self.probability.add(p, weight);
        }
        Some((p, tail))
    }

    /// Add the probability of a series given its correlates. Each
    /// correlate's probability is the geometric mean of its marginal and
    /// conditional probabilities; they are combined as extreme samples
    /// discounted by the effective number of correlates. Sets the result
    /// probability, tail, kind and most anomalous correlate on `params`.
    pub fn add_correlate_probability(&mut self, params: &mut CorrelateParams<'_>, weight: f64) -> bool {
        let n = params.priors.len();
        if n == 0 {
            return false;
        }
        let feature = params.feature;
        let calculation = feature.calculation();
        let neff = effective_count(n);

        let mut aggregator = ProbabilityOfExtremeSample::new();
        let mut min_probability = 1.0;
        let mut tail = Tail::Undetermined;
        let mut result_kind = ResultKind::Unconditional;
        let mut most_anomalous = None;
        for i in 0..n {
            let (prior, coordinate) = params.priors[i];
            let (weights, samples) = (&params.weights[i], &params.samples[i]);
            let Some(probabilities) =
                prior.probability_of_less_likely_samples(calculation, weights, samples, &[coordinate])
            else {
                error!(correlate = i, "failed to compute probability");
                continue;
            };
            let Some(probability) = probabilities.first() else {
                continue;
            };
            let p = correct_for_empty_bucket_pair(
                calculation,
                params.samples[i][coordinate],
                params.bucket_empty[i],
                params.probability_bucket_empty[i],
                (probability.marginal * probability.conditional).sqrt(),
            );
            aggregator.add(p, neff);
            if most_anomalous.is_none() || p < min_probability {
                min_probability = p;
                tail = probability.tail;
                most_anomalous = Some(i);
                result_kind = if probability.marginal < probability.conditional {
                    ResultKind::Unconditional
                } else {
                    ResultKind::Conditional
                };
            }
        }
        let Some(i) = most_anomalous else {
            return false;
        };
        let Some(p) = aggregator.calculate() else {
            return false;
        };
        let elapsed_time = params.elapsed_times[i][0].min(params.elapsed_times[i][1]);
        let p = feature.adjust_probability(elapsed_time, p);
        if !feature.is_constant() {
            self.probability.add(p, weight);
        }
        params.probability = p;
        params.tail = tail;
        params.result_kind = result_kind;
        params.most_anomalous_correlate = Some(i);
        true
    }

    /// Compute and commit the influences of the values of `name` on the
    /// probability in `params`.
    pub fn add_influences<'a>(
        &mut self,
        interner: &mut Interner,
        name: &'a str,
        values: Vec<InfluencerValue<'a>>,
        params: &mut Params<'a>,
        weight: f64,
    ) {
        let Some(calculator) = self.influence_calculator else {
            error!(influencer = name, "no influence calculator plugged in");
            return;
        };
        let partition = partition_value(&params.partitioning_fields, name);
        if values.is_empty() && partition.is_none() {
            return;
        }
        let (logp, cutoff) = influence_cutoff(params.probability);
        params.influencer_name = name;
        params.influencer_values = values;
        params.cutoff = cutoff;
        params.include_cutoff = true;
        params.influences.clear();
        calculator.compute_influences(params);
        let influences = std::mem::take(&mut params.influences);
        self.commit_influences(interner, params.feature, name, partition, &influences, logp, weight);
        params.influences = influences;
    }

    /// As `add_influences` for a vector valued feature.
    pub fn add_multivariate_influences<'a>(
        &mut self,
        interner: &mut Interner,
        name: &'a str,
        values: Vec<InfluencerValue<'a>>,
        params: &mut MultivariateParams<'a>,
        weight: f64,
    ) {
        let Some(calculator) = self.influence_calculator else {
            error!(influencer = name, "no influence calculator plugged in");
            return;
        };
        let partition = partition_value(&params.partitioning_fields, name);
        if values.is_empty() && partition.is_none() {
            return;
        }
        let (logp, cutoff) = influence_cutoff(params.probability);
        params.influencer_name = name;
        params.influencer_values = values;
        params.cutoff = cutoff;
        params.include_cutoff = true;
        params.influences.clear();
        calculator.compute_multivariate_influences(params);
        let influences = std::mem::take(&mut params.influences);
        self.commit_influences(interner, params.feature, name, partition, &influences, logp, weight);
        params.influences = influences;
    }

    /// As `add_influences` for a series with correlates.
    pub fn add_correlate_influences<'a>(
        &mut self,
        interner: &mut Interner,
        name: &'a str,
        values: Vec<CorrelateInfluencerValue<'a>>,
        params: &mut CorrelateParams<'a>,
        weight: f64,
    ) {
        let Some(calculator) = self.influence_calculator else {
            error!(influencer = name, "no influence calculator plugged in");
            return;
        };
        let partition = partition_value(&params.partitioning_fields, name);
        if values.is_empty() && partition.is_none() {
            return;
        }
        let (logp, cutoff) = influence_cutoff(params.probability);
        params.influencer_name = name;
        params.influencer_values = values;
        params.cutoff = cutoff;
        params.include_cutoff = true;
        params.influences.clear();
        calculator.compute_correlate_influences(params);
        let influences = std::mem::take(&mut params.influences);
        self.commit_influences(interner, params.feature, name, partition, &influences, logp, weight);
        params.influences = influences;
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_influences(
        &mut self,
        interner: &mut Interner,
        feature: Feature,
        name: &str,
        partition: Option<&str>,
        influences: &[(&str, f64)],
        logp: f64,
        weight: f64,
    ) {
        let name_handle = interner.intern(name);
        let fallback;
        let influences = match (influences.is_empty(), partition) {
            (true, Some(value)) => {
                fallback = [(value, 1.0)];
                &fallback[..]
            }
            _ => influences,
        };
        for &(value, score) in influences {
            let key = (name_handle, interner.intern(value));
            let aggregator = self
                .influencer_probabilities
                .entry(key)
                .or_insert_with(|| self.probability_template.clone());
            if !feature.is_constant() {
                aggregator.add((score * logp).exp(), weight);
            }
            trace!(influencer = name, value, score, "committed influence");
        }
    }

    /// The aggregate probability, or `None` if nothing was added.
    pub fn calculate(&self) -> Option<f64> {
        self.probability.calculate()
    }

    /// The aggregate probability and the influences scoring at least the
    /// cutoff, most influential first.
    pub fn calculate_with_influences(&self) -> Option<(f64, Vec<Influence>)> {
        let probability = self.calculate()?;
        let logp = probability.max(SMALLEST_PROBABILITY).ln();
        let mut influences: Vec<Influence> = self
            .influencer_probabilities
            .iter()
            .filter_map(|(&(name, value), aggregator)| {
                let pi = aggregator.calculate()?;
                let score = intersection_influence(logp, pi.max(SMALLEST_PROBABILITY).ln());
                (score >= self.cutoff).then_some(Influence { name, value, score })
            })
            .collect();
        influences.sort_by(|a, b| b.score.total_cmp(&a.score));
        Some((truncate(probability, SMALLEST_PROBABILITY, 1.0), influences))
    }
}

fn partition_value<'a>(fields: &[(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    fields.iter().find(|(field, _)| *field == name).map(|(_, value)| *value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::JointProbabilityOfLessLikelySamples;
    use crate::prior::NormalPrior;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn prior(mean: f64) -> NormalPrior {
        let mut rng = StdRng::seed_from_u64(1);
        let normal = Normal::new(mean, 1.0).unwrap();
        let samples: Vec<f64> = (0..50).map(|_| normal.sample(&mut rng)).collect();
        let mut prior = NormalPrior::non_informative(0.0);
        prior.add_samples(&[SampleWeights::default(); 50], &samples);
        prior
    }

    #[test]
    fn test_effective_count() {
        assert_eq!(effective_count(1), 1.0);
        assert_eq!(effective_count(3), 0.7);
        assert_eq!(effective_count(9), 0.51);
        assert_eq!(effective_count(20), 0.5);
    }

    #[test]
    fn test_empty_bucket_correction_boundaries() {
        for calculation in [Calculation::TwoSided, Calculation::OneSidedBelow, Calculation::OneSidedAbove] {
            for p in [1e-10, 0.01, 0.3, 1.0] {
                assert_eq!(correct_for_empty_bucket(calculation, &[1.0], false, 0.0, p), p);
                assert_eq!(correct_for_empty_bucket(calculation, &[1.0], true, 1.0, p), 1.0);
            }
        }
        // An empty bucket would be a low value, so low values are less surprising.
        let p = correct_for_empty_bucket(Calculation::OneSidedBelow, &[2.0], false, 0.1, 0.01);
        assert!((p - (0.2 + 0.9 * 0.01)).abs() < 1e-12);
        let p = correct_for_empty_bucket(Calculation::OneSidedAbove, &[2.0], false, 0.1, 0.01);
        assert!((p - 0.9 * 0.01).abs() < 1e-12);
        let p = correct_for_empty_bucket(Calculation::TwoSided, &[2.0], true, 0.25, 0.1);
        assert!((p - (0.25 + 0.75 * 0.1)).abs() < 1e-12);
    }

    #[test]
    fn test_pair_empty_bucket_correction() {
        let p = correct_for_empty_bucket_pair(Calculation::TwoSided, 1.0, [false, false], [0.0, 0.0], 0.01);
        assert_eq!(p, 0.01);
        let p = correct_for_empty_bucket_pair(Calculation::TwoSided, 1.0, [true, true], [0.5, 0.5], 0.2);
        assert!((p - (0.25 + 0.75 * 0.2)).abs() < 1e-12);
        let p = correct_for_empty_bucket_pair(Calculation::TwoSided, 1.0, [false, true], [0.2, 0.5], 0.1);
        assert!((p - (0.4 + 0.6 * 0.1)).abs() < 1e-12);
    }

    #[test]
    fn test_probability_is_min_of_joint_and_extreme() {
        let mut calculator = ProbabilityAndInfluenceCalculator::new(0.5);
        calculator.add_aggregator(Aggregator::joint());
        calculator.add_aggregator(Aggregator::extreme());
        assert!(calculator.empty());
        assert_eq!(calculator.calculate(), None);

        let prior = prior(10.0);
        let mut joint = JointProbabilityOfLessLikelySamples::new();
        let mut extreme = ProbabilityOfExtremeSample::new();
        for sample in [9.5, 11.0, 13.5, 10.2] {
            let (p, _) = calculator
                .add_probability(Feature::Mean, &prior, 0, &SampleWeights::default(), sample, false, 0.0, 1.0)
                .unwrap();
            joint.add(p, 1.0);
            extreme.add(p, 1.0);
        }
        let expected = joint.calculate().unwrap().min(extreme.calculate().unwrap());
        assert!((calculator.calculate().unwrap() - expected).abs() < 1e-10);
    }

    #[test]
    fn test_constant_features_do_not_contribute() {
        let mut calculator = ProbabilityAndInfluenceCalculator::with_config(&CalculatorConfig::default());
        let prior = prior(10.0);
        let result =
            calculator.add_probability(Feature::Indicator, &prior, 0, &SampleWeights::default(), 30.0, false, 0.0, 1.0);
        assert!(result.is_some());
        assert!(calculator.empty());
    }

    #[test]
    fn test_failed_prior_is_reported() {
        let mut calculator = ProbabilityAndInfluenceCalculator::with_config(&CalculatorConfig::default());
        let prior = prior(10.0);
        let result =
            calculator.add_probability(Feature::Mean, &prior, 0, &SampleWeights::default(), f64::NAN, false, 0.0, 1.0);
        assert!(result.is_none());
        assert_eq!(calculator.calculate(), None);
    }

    #[test]
    fn test_add_influences_without_calculator_is_a_no_op() {
        let mut calculator = ProbabilityAndInfluenceCalculator::with_config(&CalculatorConfig::default());
        let prior = prior(10.0);
        let mut interner = Interner::new();
        let mut params = Params::new(Feature::Sum, &prior);
        params.probability = 1e-6;
        calculator.add_raw_probability(1e-6, 1.0);
        let values = vec![InfluencerValue::new("a", &[1.0], 1.0)];
        calculator.add_influences(&mut interner, "host", values, &mut params, 1.0);
        let (p, influences) = calculator.calculate_with_influences().unwrap();
        assert!((p - 1e-6).abs() < 1e-12);
        assert!(influences.is_empty());
    }

    #[test]
    fn test_partition_fallback() {
        let mut calculator = ProbabilityAndInfluenceCalculator::with_config(&CalculatorConfig::default());
        calculator.plug_influence_calculator(Feature::TimeOfDay.influence_calculator());
        let prior = prior(10.0);
        let mut interner = Interner::new();
        let mut params = Params::new(Feature::TimeOfDay, &prior);
        params.partitioning_fields = vec![("host", "web-1")];
        params.probability = 1e-4;
        calculator.add_raw_probability(1e-4, 1.0);
        calculator.add_influences(&mut interner, "host", Vec::new(), &mut params, 1.0);

        let (_, influences) = calculator.calculate_with_influences().unwrap();
        assert_eq!(influences.len(), 1);
        assert_eq!(interner.resolve(influences[0].name), Some("host"));
        assert_eq!(interner.resolve(influences[0].value), Some("web-1"));
        assert!((influences[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_sum_style_aggregation() {
        let config = CalculatorConfig { aggregation: AggregationStyle::Sum, ..CalculatorConfig::default() };
        let mut calculator = ProbabilityAndInfluenceCalculator::with_config(&config);
        calculator.add_raw_probability(0.1, 1.0);
        calculator.add_raw_probability(0.5, 1.0);
        let mut joint = JointProbabilityOfLessLikelySamples::new();
        joint.add(0.1, 1.0);
        joint.add(0.5, 1.0);
        let expected = (joint.calculate().unwrap() + 0.19) / 2.0;
        assert!((calculator.calculate().unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_added_influencers_keep_their_aggregation_style() {
        let config = CalculatorConfig { aggregation: AggregationStyle::Sum, ..CalculatorConfig::default() };
        let mut other = ProbabilityAndInfluenceCalculator::with_config(&config);
        other.plug_influence_calculator(Feature::TimeOfDay.influence_calculator());
        let prior = prior(10.0);
        let mut interner = Interner::new();
        let mut params = Params::new(Feature::TimeOfDay, &prior);
        params.partitioning_fields = vec![("host", "web-1")];
        params.probability = 1e-4;
        other.add_raw_probability(1e-4, 1.0);
        other.add_influences(&mut interner, "host", Vec::new(), &mut params, 1.0);

        let mut calculator = ProbabilityAndInfluenceCalculator::new(0.5);
        calculator.add_aggregator(Aggregator::joint());
        calculator.add_aggregator(Aggregator::extreme());
        calculator.add(&other, 1.0);

        assert_eq!(calculator.probability.style(), AggregationStyle::Min);
        assert_eq!(calculator.influencer_probabilities.len(), 1);
        for aggregator in calculator.influencer_probabilities.values() {
            assert_eq!(aggregator.style(), AggregationStyle::Sum);
        }
    }
}
