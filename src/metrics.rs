//! Aggregate statistics per (dataset, model, condition).
//!
//! Accuracy is computed over graded samples only; refusal rate over all
//! samples. The two denominators are independent by design. Robustness
//! thresholds are evaluated per question, then reported as the fraction of
//! qualifying questions that pass.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::condition::Condition;
use crate::config::MetricsConfig;
use crate::scorer::ScoredSample;

// =============================================================================
// Threshold specs
// =============================================================================

/// A per-question robustness threshold: at least `numerator` correct out of
/// `denominator` samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdSpec {
    pub numerator: u32,
    pub denominator: u32,
}

impl ThresholdSpec {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Key used in the summary mapping, e.g. "23/25".
    pub fn label(&self) -> String {
        format!("{}/{}", self.numerator, self.denominator)
    }
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error(
        "robust threshold {numerator}/{denominator} exceeds samples per question \
         ({samples_per_question})"
    )]
    InvalidThreshold {
        numerator: u32,
        denominator: u32,
        samples_per_question: usize,
    },
    #[error(
        "duplicate sample index {sample_index} for question {question_id} \
         ({dataset}, {model_id}, {condition})"
    )]
    DuplicateSample {
        dataset: String,
        model_id: String,
        condition: Condition,
        question_id: String,
        sample_index: usize,
    },
}

// =============================================================================
// Summary records
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryMetrics {
    pub dataset: String,
    pub model_id: String,
    pub condition: Condition,
    pub n_questions: usize,
    pub n_samples: usize,
    pub n_graded: usize,
    pub n_samples_per_question: usize,
    pub mean_accuracy: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub refusal_rate: f64,
    pub mean_reasoning_tokens: f64,
    /// Threshold label ("23/25") to fraction of qualifying questions passing.
    pub robust_thresholds: BTreeMap<String, f64>,
    pub per_subject_accuracy: BTreeMap<String, f64>,
    pub per_difficulty_accuracy: BTreeMap<String, f64>,
}

/// Relative performance of a condition against the configured baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionComparison {
    pub dataset: String,
    pub model_id: String,
    pub condition: Condition,
    pub mean_accuracy: f64,
    pub baseline_accuracy: f64,
    pub delta_accuracy: f64,
    /// None when the baseline accuracy is zero.
    pub relative_accuracy: Option<f64>,
}

// =============================================================================
// Wilson interval
// =============================================================================

/// Wilson score interval for a binomial proportion, continuity correction
/// omitted. Degrades gracefully: n = 0 returns [0, 0] rather than erroring.
pub fn wilson_interval(accuracy: f64, n: usize, confidence: f64) -> (f64, f64) {
    if n == 0 {
        return (0.0, 0.0);
    }

    let accuracy = accuracy.clamp(0.0, 1.0);

    let z = if (confidence - 0.90).abs() < 1e-9 {
        1.645
    } else if (confidence - 0.99).abs() < 1e-9 {
        2.576
    } else {
        1.96
    };

    let n = n as f64;
    let denominator = 1.0 + z * z / n;
    let center = (accuracy + z * z / (2.0 * n)) / denominator;
    let spread =
        z * (accuracy * (1.0 - accuracy) / n + z * z / (4.0 * n * n)).sqrt() / denominator;

    ((center - spread).max(0.0), (center + spread).min(1.0))
}

// =============================================================================
// Aggregation
// =============================================================================

#[derive(Default)]
struct QuestionAgg {
    samples: usize,
    graded: usize,
    correct: usize,
    refusals: usize,
    token_sum: u64,
    subject: Option<String>,
    difficulty: Option<String>,
    seen_indices: HashSet<usize>,
}

#[derive(Default)]
struct AccuracyBucket {
    correct: usize,
    graded: usize,
}

/// Compute summary metrics for every (dataset, model, condition) present in
/// `scored`. Threshold specs are validated before any computation starts.
pub fn compute_metrics(
    scored: &[ScoredSample],
    cfg: &MetricsConfig,
    n_samples_per_question: usize,
) -> Result<Vec<SummaryMetrics>, AggregationError> {
    for spec in &cfg.robust_thresholds {
        if spec.denominator as usize > n_samples_per_question {
            return Err(AggregationError::InvalidThreshold {
                numerator: spec.numerator,
                denominator: spec.denominator,
                samples_per_question: n_samples_per_question,
            });
        }
    }

    // (dataset, model, condition) -> question_id -> per-question tallies.
    type GroupKey = (String, String, Condition);
    let mut groups: BTreeMap<GroupKey, BTreeMap<String, QuestionAgg>> = BTreeMap::new();

    for sample in scored {
        let raw = &sample.parsed.raw;
        let group_key = (raw.dataset.clone(), raw.model_id.clone(), raw.condition);
        let agg = groups
            .entry(group_key)
            .or_default()
            .entry(raw.question_id.clone())
            .or_default();

        if !agg.seen_indices.insert(raw.sample_index) {
            return Err(AggregationError::DuplicateSample {
                dataset: raw.dataset.clone(),
                model_id: raw.model_id.clone(),
                condition: raw.condition,
                question_id: raw.question_id.clone(),
                sample_index: raw.sample_index,
            });
        }

        agg.samples += 1;
        agg.token_sum += u64::from(sample.parsed.reasoning_token_estimate);
        if sample.is_refusal {
            agg.refusals += 1;
        }
        if let Some(correct) = sample.is_correct {
            agg.graded += 1;
            if correct {
                agg.correct += 1;
            }
        }
        if agg.subject.is_none() {
            agg.subject = raw.subject.clone();
        }
        if agg.difficulty.is_none() {
            agg.difficulty = raw.difficulty.clone();
        }
    }

    let mut summaries = Vec::with_capacity(groups.len());

    for ((dataset, model_id, condition), questions) in groups {
        let mut n_samples = 0usize;
        let mut n_graded = 0usize;
        let mut n_correct = 0usize;
        let mut n_refusals = 0usize;
        let mut token_sum = 0u64;
        let mut subjects: BTreeMap<String, AccuracyBucket> = BTreeMap::new();
        let mut difficulties: BTreeMap<String, AccuracyBucket> = BTreeMap::new();
        // label -> (passing, qualifying)
        let mut threshold_counts: Vec<(ThresholdSpec, usize, usize)> = cfg
            .robust_thresholds
            .iter()
            .map(|spec| (*spec, 0usize, 0usize))
            .collect();

        for agg in questions.values() {
            n_samples += agg.samples;
            n_graded += agg.graded;
            n_correct += agg.correct;
            n_refusals += agg.refusals;
            token_sum += agg.token_sum;

            if agg.graded > 0 {
                if let Some(subject) = &agg.subject {
                    let bucket = subjects.entry(subject.clone()).or_default();
                    bucket.correct += agg.correct;
                    bucket.graded += agg.graded;
                }
                if let Some(difficulty) = &agg.difficulty {
                    let bucket = difficulties.entry(difficulty.clone()).or_default();
                    bucket.correct += agg.correct;
                    bucket.graded += agg.graded;
                }
            }

            for (spec, passing, qualifying) in threshold_counts.iter_mut() {
                // Questions with fewer recorded samples than the denominator
                // cannot be evaluated at this threshold and are excluded.
                if agg.samples < spec.denominator as usize {
                    continue;
                }
                *qualifying += 1;
                if agg.correct >= spec.numerator as usize {
                    *passing += 1;
                }
            }
        }

        let n_questions = questions.len();
        if n_samples == 0 {
            continue;
        }

        let mean_accuracy = if n_graded > 0 {
            (n_correct as f64 / n_graded as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let (ci_lower, ci_upper) = wilson_interval(mean_accuracy, n_graded, cfg.confidence_level);

        let robust_thresholds = threshold_counts
            .into_iter()
            .filter(|(_, _, qualifying)| *qualifying > 0)
            .map(|(spec, passing, qualifying)| {
                (spec.label(), passing as f64 / qualifying as f64)
            })
            .collect();

        let per_subject_accuracy = subjects
            .into_iter()
            .filter(|(_, b)| b.graded > 0)
            .map(|(k, b)| (k, b.correct as f64 / b.graded as f64))
            .collect();

        let per_difficulty_accuracy = difficulties
            .into_iter()
            .filter(|(_, b)| b.graded > 0)
            .map(|(k, b)| (k, b.correct as f64 / b.graded as f64))
            .collect();

        summaries.push(SummaryMetrics {
            dataset,
            model_id,
            condition,
            n_questions,
            n_samples,
            n_graded,
            n_samples_per_question,
            mean_accuracy,
            ci_lower,
            ci_upper,
            refusal_rate: n_refusals as f64 / n_samples as f64,
            mean_reasoning_tokens: token_sum as f64 / n_samples as f64,
            robust_thresholds,
            per_subject_accuracy,
            per_difficulty_accuracy,
        });
    }

    Ok(summaries)
}

/// Relative accuracy of each condition against the baseline condition,
/// matched by (dataset, model).
pub fn compute_condition_comparison(
    summaries: &[SummaryMetrics],
    baseline: Condition,
) -> Vec<ConditionComparison> {
    let baselines: BTreeMap<(&str, &str), &SummaryMetrics> = summaries
        .iter()
        .filter(|s| s.condition == baseline)
        .map(|s| ((s.dataset.as_str(), s.model_id.as_str()), s))
        .collect();

    summaries
        .iter()
        .filter_map(|row| {
            let base = baselines.get(&(row.dataset.as_str(), row.model_id.as_str()))?;
            let relative_accuracy = (base.mean_accuracy > 0.0)
                .then(|| row.mean_accuracy / base.mean_accuracy);
            Some(ConditionComparison {
                dataset: row.dataset.clone(),
                model_id: row.model_id.clone(),
                condition: row.condition,
                mean_accuracy: row.mean_accuracy,
                baseline_accuracy: base.mean_accuracy,
                delta_accuracy: row.mean_accuracy - base.mean_accuracy,
                relative_accuracy,
            })
        })
        .collect()
}

/// Fixed-width human-readable table of the summary rows.
pub fn format_summary_table(summaries: &[SummaryMetrics]) -> String {
    if summaries.is_empty() {
        return "No data available.".to_string();
    }

    let rule = "=".repeat(100);
    let mut lines = vec![
        rule.clone(),
        format!(
            "{:<12} {:<18} {:<20} {:>10} {:>17} {:>9}",
            "Dataset", "Model", "Condition", "Accuracy", "CI 95%", "Refusal"
        ),
        rule.clone(),
    ];

    for row in summaries {
        let ci = format!("[{:.3}, {:.3}]", row.ci_lower, row.ci_upper);
        lines.push(format!(
            "{:<12} {:<18} {:<20} {:>10.4} {:>17} {:>9.4}",
            row.dataset,
            row.model_id,
            row.condition.id(),
            row.mean_accuracy,
            ci,
            row.refusal_rate,
        ));
    }

    lines.push(rule);
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{ExtractedAnswer, ParsedSample};
    use crate::sampler::RawSample;
    use crate::scorer::{GradingMethod, ScoredSample};

    fn sample(
        question_id: &str,
        sample_index: usize,
        is_correct: Option<bool>,
        is_refusal: bool,
        subject: Option<&str>,
        tokens: u32,
    ) -> ScoredSample {
        ScoredSample {
            parsed: ParsedSample {
                raw: RawSample {
                    dataset: "toy".into(),
                    question_id: question_id.into(),
                    model_id: "m".into(),
                    condition: Condition::BaselineMc,
                    sample_index,
                    subject: subject.map(String::from),
                    difficulty: Some("hard".into()),
                    completion_text: String::new(),
                    attempt_count: 1,
                    latency_ms: 0,
                    error: None,
                },
                extracted_answer: if is_refusal {
                    ExtractedAnswer::Refusal
                } else {
                    ExtractedAnswer::Letter('A')
                },
                reasoning_token_estimate: tokens,
            },
            is_correct,
            is_refusal,
            grading_method: if is_correct.is_some() {
                GradingMethod::Direct
            } else {
                GradingMethod::Ungraded
            },
        }
    }

    fn cfg(thresholds: Vec<ThresholdSpec>) -> MetricsConfig {
        MetricsConfig {
            confidence_level: 0.95,
            robust_thresholds: thresholds,
            baseline_condition: Condition::BaselineMc,
        }
    }

    #[test]
    fn wilson_zero_samples_is_defined() {
        assert_eq!(wilson_interval(0.0, 0, 0.95), (0.0, 0.0));
    }

    #[test]
    fn wilson_contains_the_point_estimate() {
        for &(correct, n) in &[(0usize, 25usize), (13, 25), (23, 25), (25, 25), (1, 1)] {
            let accuracy = correct as f64 / n as f64;
            let (lower, upper) = wilson_interval(accuracy, n, 0.95);
            assert!(lower >= 0.0 && upper <= 1.0);
            assert!(
                lower <= accuracy + 1e-12 && accuracy <= upper + 1e-12,
                "interval [{lower}, {upper}] must contain {accuracy}"
            );
        }
    }

    #[test]
    fn refusals_are_excluded_from_the_accuracy_denominator() {
        // 1 question, 25 samples: 23 correct, 2 refusals.
        let mut rows = Vec::new();
        for i in 0..23 {
            rows.push(sample("q1", i, Some(true), false, None, 10));
        }
        for i in 23..25 {
            rows.push(sample("q1", i, None, true, None, 0));
        }

        let specs = vec![
            ThresholdSpec::new(25, 25),
            ThresholdSpec::new(23, 25),
            ThresholdSpec::new(13, 25),
        ];
        let summaries = compute_metrics(&rows, &cfg(specs), 25).unwrap();
        assert_eq!(summaries.len(), 1);
        let s = &summaries[0];

        assert_eq!(s.n_samples, 25);
        assert_eq!(s.n_graded, 23);
        assert!((s.mean_accuracy - 1.0).abs() < 1e-12);
        assert!((s.refusal_rate - 2.0 / 25.0).abs() < 1e-12);
        assert_eq!(s.robust_thresholds["23/25"], 1.0);
        assert_eq!(s.robust_thresholds["13/25"], 1.0);
        assert_eq!(s.robust_thresholds["25/25"], 0.0);
        assert!(s.ci_lower <= s.mean_accuracy && s.mean_accuracy <= s.ci_upper);
    }

    #[test]
    fn threshold_fractions_are_monotone_in_the_numerator() {
        // q1: 20/20 correct, q2: 15/20, q3: 8/20.
        let mut rows = Vec::new();
        for (q, correct) in [("q1", 20usize), ("q2", 15), ("q3", 8)] {
            for i in 0..20 {
                rows.push(sample(q, i, Some(i < correct), false, None, 0));
            }
        }

        let specs = vec![
            ThresholdSpec::new(8, 20),
            ThresholdSpec::new(15, 20),
            ThresholdSpec::new(20, 20),
        ];
        let summaries = compute_metrics(&rows, &cfg(specs), 20).unwrap();
        let t = &summaries[0].robust_thresholds;

        assert_eq!(t["8/20"], 1.0);
        assert!((t["15/20"] - 2.0 / 3.0).abs() < 1e-12);
        assert!((t["20/20"] - 1.0 / 3.0).abs() < 1e-12);
        assert!(t["8/20"] >= t["15/20"] && t["15/20"] >= t["20/20"]);
    }

    #[test]
    fn short_questions_are_excluded_from_threshold_denominators() {
        let mut rows = Vec::new();
        // q1 has the full 10 samples, all correct.
        for i in 0..10 {
            rows.push(sample("q1", i, Some(true), false, None, 0));
        }
        // q2 has only 4 samples; it cannot be evaluated at 10/10.
        for i in 0..4 {
            rows.push(sample("q2", i, Some(false), false, None, 0));
        }

        let summaries =
            compute_metrics(&rows, &cfg(vec![ThresholdSpec::new(10, 10)]), 10).unwrap();
        assert_eq!(summaries[0].robust_thresholds["10/10"], 1.0);
    }

    #[test]
    fn subjects_without_graded_samples_are_omitted() {
        let rows = vec![
            sample("q1", 0, Some(true), false, Some("physics"), 5),
            sample("q2", 0, None, true, Some("law"), 0),
        ];

        let summaries = compute_metrics(&rows, &cfg(vec![]), 1).unwrap();
        let s = &summaries[0];
        assert_eq!(s.per_subject_accuracy.len(), 1);
        assert_eq!(s.per_subject_accuracy["physics"], 1.0);
        assert!(!s.per_subject_accuracy.contains_key("law"));
    }

    #[test]
    fn oversized_threshold_is_a_config_failure() {
        let rows = vec![sample("q1", 0, Some(true), false, None, 0)];
        let err = compute_metrics(&rows, &cfg(vec![ThresholdSpec::new(26, 26)]), 25).unwrap_err();
        assert!(matches!(err, AggregationError::InvalidThreshold { .. }));
    }

    #[test]
    fn duplicate_sample_index_names_the_question() {
        let rows = vec![
            sample("q7", 3, Some(true), false, None, 0),
            sample("q7", 3, Some(false), false, None, 0),
        ];
        let err = compute_metrics(&rows, &cfg(vec![]), 25).unwrap_err();
        match err {
            AggregationError::DuplicateSample {
                question_id,
                sample_index,
                ..
            } => {
                assert_eq!(question_id, "q7");
                assert_eq!(sample_index, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_graded_samples_degrades_gracefully() {
        let rows = vec![
            sample("q1", 0, None, true, None, 4),
            sample("q1", 1, None, false, None, 6),
        ];
        let summaries = compute_metrics(&rows, &cfg(vec![]), 2).unwrap();
        let s = &summaries[0];
        assert_eq!(s.mean_accuracy, 0.0);
        assert_eq!((s.ci_lower, s.ci_upper), (0.0, 0.0));
        assert!((s.mean_reasoning_tokens - 5.0).abs() < 1e-12);
        assert!((s.refusal_rate - 0.5).abs() < 1e-12);
    }

    #[test]
    fn comparison_rows_measure_against_baseline() {
        let rows_baseline: Vec<ScoredSample> = (0..4)
            .map(|i| sample("q1", i, Some(i < 2), false, None, 0))
            .collect();
        let mut rows_persona: Vec<ScoredSample> = (0..4)
            .map(|i| sample("q1", i, Some(true), false, None, 0))
            .collect();
        for row in &mut rows_persona {
            row.parsed.raw.condition = Condition::ExpertDeepMc;
        }

        let mut all = rows_baseline;
        all.extend(rows_persona);
        let summaries = compute_metrics(&all, &cfg(vec![]), 4).unwrap();
        let comparisons = compute_condition_comparison(&summaries, Condition::BaselineMc);

        let persona = comparisons
            .iter()
            .find(|c| c.condition == Condition::ExpertDeepMc)
            .unwrap();
        assert!((persona.baseline_accuracy - 0.5).abs() < 1e-12);
        assert!((persona.delta_accuracy - 0.5).abs() < 1e-12);
        assert_eq!(persona.relative_accuracy, Some(2.0));
    }

    #[test]
    fn summary_table_lists_every_row() {
        let rows = vec![sample("q1", 0, Some(true), false, None, 0)];
        let summaries = compute_metrics(&rows, &cfg(vec![]), 1).unwrap();
        let table = format_summary_table(&summaries);
        assert!(table.contains("baseline_mc"));
        assert!(table.contains("Accuracy"));
    }
}
