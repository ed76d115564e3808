//! Experiment orchestration: sampling → scoring → metrics.
//!
//! Each phase writes its JSONL artifact, so phases can be skipped and
//! re-run independently. A completed run always produces full output files;
//! failed samples are visibly marked in the records, never dropped.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::condition::Condition;
use crate::config::{ConfigError, ExperimentConfig, ModelConfig};
use crate::dataset::{build_question_lookup, load_questions, DatasetError, Question};
use crate::gateway::{ChatGateway, RetryPolicy};
use crate::metrics::{
    compute_condition_comparison, compute_metrics, format_summary_table, AggregationError,
    SummaryMetrics,
};
use crate::parser::{parse_sample, ExtractedAnswer, ParsedSample, RefusalLexicon};
use crate::sampler::{run_sampling, sample_question, RawSample, SamplerError, SamplingStopReason};
use crate::scorer::{JudgeContext, ScoredSample, Scorer};
use crate::store::{read_jsonl, write_jsonl, JsonlResultStore, MemoryResultStore, StoreError};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sampler(#[from] SamplerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("no questions could be loaded from any dataset")]
    NoQuestions,
}

/// Phase and filter controls for a run.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub models_filter: Option<Vec<String>>,
    pub conditions_filter: Option<Vec<Condition>>,
    pub skip_sampling: bool,
    pub skip_scoring: bool,
    pub skip_existing: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            models_filter: None,
            conditions_filter: None,
            skip_sampling: false,
            skip_scoring: false,
            skip_existing: true,
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub questions_loaded: usize,
    pub summaries: Vec<SummaryMetrics>,
    pub cancelled: bool,
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(AtomicOrdering::Relaxed))
}

fn load_all_questions(cfg: &ExperimentConfig) -> Result<Vec<Question>, RunnerError> {
    let mut all = Vec::new();
    for ds in &cfg.datasets {
        match load_questions(&ds.path, &ds.name) {
            Ok(questions) => {
                info!(dataset = %ds.name, count = questions.len(), "loaded questions");
                all.extend(questions);
            }
            Err(DatasetError::NotFound(path)) => {
                warn!(dataset = %ds.name, path = %path.display(), "dataset file not found, skipping");
            }
            Err(e) => {
                warn!(dataset = %ds.name, error = %e, "failed to load dataset, skipping");
            }
        }
    }
    if all.is_empty() {
        return Err(RunnerError::NoQuestions);
    }
    Ok(all)
}

fn selected_models<'c>(cfg: &'c ExperimentConfig, opts: &RunnerOptions) -> Vec<&'c ModelConfig> {
    cfg.models
        .iter()
        .filter(|m| {
            opts.models_filter
                .as_ref()
                .is_none_or(|filter| filter.iter().any(|id| id == &m.id))
        })
        .collect()
}

fn selected_conditions(cfg: &ExperimentConfig, opts: &RunnerOptions) -> Vec<Condition> {
    cfg.conditions
        .iter()
        .copied()
        .filter(|c| {
            opts.conditions_filter
                .as_ref()
                .is_none_or(|filter| filter.contains(c))
        })
        .collect()
}

fn judge_context(cfg: &ExperimentConfig) -> Option<JudgeContext> {
    cfg.judge_model().map(|model| JudgeContext {
        model: model.chat_model(),
        temperature: cfg.judge.temperature,
        max_tokens: cfg.judge.max_tokens,
        retry: RetryPolicy::new(
            cfg.judge.max_retries,
            Duration::from_millis(cfg.sampling.retry_base_delay_ms),
        ),
    })
}

/// Run the full pipeline for every selected (model, condition) pair.
pub async fn run_full_experiment(
    gateway: &dyn ChatGateway,
    cfg: &ExperimentConfig,
    opts: &RunnerOptions,
    cancel: Option<&AtomicBool>,
) -> Result<RunReport, RunnerError> {
    cfg.validate()?;

    std::fs::create_dir_all(cfg.output.raw_dir())?;
    std::fs::create_dir_all(cfg.output.scored_dir())?;
    std::fs::create_dir_all(cfg.output.summaries_dir())?;

    let run_id = Uuid::new_v4();
    let all_questions = load_all_questions(cfg)?;
    let lookup = build_question_lookup(&all_questions);

    let models = selected_models(cfg, opts);
    let conditions = selected_conditions(cfg, opts);
    let mut cancelled = false;

    // --- Phase 1: sampling ---
    if opts.skip_sampling {
        eprintln!("[sampling] skipped");
    } else {
        'sampling: for model in &models {
            for &condition in &conditions {
                if cancelled || is_cancelled(cancel) {
                    cancelled = true;
                    break 'sampling;
                }

                eprintln!(
                    "[sampling] model={} condition={} ({} questions x {} samples)",
                    model.id,
                    condition,
                    all_questions.len(),
                    cfg.sampling.num_samples_per_question
                );

                let store = JsonlResultStore::open(cfg.output.raw_path(&model.id, condition))?;
                let report = run_sampling(
                    gateway,
                    &store,
                    &all_questions,
                    condition,
                    model,
                    &cfg.sampling,
                    opts.skip_existing,
                    cancel,
                )
                .await?;

                eprintln!(
                    "[sampling]   {} new, {} skipped, {} failed",
                    report.samples.len(),
                    report.skipped_existing,
                    report.failed
                );

                if report.stop_reason == SamplingStopReason::Cancelled {
                    cancelled = true;
                }
            }
        }
    }

    // --- Phase 2: scoring ---
    let scorer = Scorer::new(gateway, judge_context(cfg));
    let lexicon = RefusalLexicon::new(cfg.scoring.refusal_indicators.clone());
    let mut all_scored: Vec<ScoredSample> = Vec::new();

    if opts.skip_scoring {
        eprintln!("[scoring] skipped, loading existing scored files");
        for model in &models {
            for &condition in &conditions {
                let path = cfg.output.scored_path(&model.id, condition);
                if path.exists() {
                    all_scored.extend(read_jsonl::<ScoredSample>(&path)?);
                }
            }
        }
    } else {
        for model in &models {
            for &condition in &conditions {
                let raw_path = cfg.output.raw_path(&model.id, condition);
                if !raw_path.exists() {
                    warn!(path = %raw_path.display(), "raw file not found, skipping scoring");
                    continue;
                }

                let raw_samples: Vec<RawSample> = read_jsonl(&raw_path)?;
                eprintln!(
                    "[scoring] model={} condition={} ({} samples)",
                    model.id,
                    condition,
                    raw_samples.len()
                );

                let parsed: Vec<ParsedSample> = raw_samples
                    .into_iter()
                    .map(|raw| {
                        let num_options = lookup
                            .get(&(raw.dataset.clone(), raw.question_id.clone()))
                            .map(|q| q.options.len())
                            .unwrap_or(0);
                        let condition = raw.condition;
                        parse_sample(raw, condition, num_options, &lexicon)
                    })
                    .collect();

                let scored = scorer
                    .score_batch(parsed, &lookup, cfg.sampling.concurrency, cancel)
                    .await;

                write_jsonl(cfg.output.scored_path(&model.id, condition), scored.iter())?;
                all_scored.extend(scored);
            }
        }
    }

    // --- Phase 3: metrics ---
    let summaries = if all_scored.is_empty() {
        warn!("no scored samples; skipping metrics");
        Vec::new()
    } else {
        let summaries = compute_metrics(
            &all_scored,
            &cfg.metrics,
            cfg.sampling.num_samples_per_question,
        )?;

        let summaries_dir = cfg.output.summaries_dir();
        write_jsonl(summaries_dir.join("summary_metrics.jsonl"), summaries.iter())?;

        let comparisons =
            compute_condition_comparison(&summaries, cfg.metrics.baseline_condition);
        if !comparisons.is_empty() {
            write_jsonl(
                summaries_dir.join("condition_comparison.jsonl"),
                comparisons.iter(),
            )?;
        }

        let table = format_summary_table(&summaries);
        std::fs::write(summaries_dir.join("summary_metrics.txt"), &table)?;
        eprintln!("{table}");

        summaries
    };

    Ok(RunReport {
        run_id,
        questions_loaded: all_questions.len(),
        summaries,
        cancelled,
    })
}

// =============================================================================
// Quick test
// =============================================================================

#[derive(Debug)]
pub struct QuickTestRow {
    pub question_id: String,
    pub extracted: ExtractedAnswer,
    pub correct_letter: Option<char>,
    pub is_correct: Option<bool>,
    pub completion_snippet: String,
}

#[derive(Debug)]
pub struct QuickTestReport {
    pub model_id: String,
    pub condition: Condition,
    pub accuracy: f64,
    pub rows: Vec<QuickTestRow>,
}

/// Run a handful of questions through sampling and direct scoring, without
/// touching the judge or the output directories.
pub async fn run_quick_test(
    gateway: &dyn ChatGateway,
    cfg: &ExperimentConfig,
    model_id: &str,
    condition: Condition,
    num_questions: usize,
    num_samples: usize,
) -> Result<QuickTestReport, RunnerError> {
    cfg.validate()?;

    let model = cfg
        .model(model_id)
        .ok_or_else(|| RunnerError::UnknownModel(model_id.to_string()))?;

    let all_questions = load_all_questions(cfg)?;
    let questions = &all_questions[..num_questions.min(all_questions.len())];

    let mut sampling = cfg.sampling.clone();
    sampling.num_samples_per_question = num_samples.max(1);

    let store = MemoryResultStore::new();
    let lexicon = RefusalLexicon::new(cfg.scoring.refusal_indicators.clone());

    let mut rows = Vec::new();
    for question in questions {
        let report = sample_question(
            gateway, &store, question, condition, model, &sampling, false, None,
        )
        .await?;

        for raw in report.samples {
            let snippet: String = raw.completion_text.chars().take(200).collect();
            let parsed = parse_sample(raw, condition, question.options.len(), &lexicon);
            let correct_letter = question.correct_letter();
            let is_correct = match (&parsed.extracted_answer, correct_letter) {
                (ExtractedAnswer::Letter(letter), Some(gold)) => {
                    Some(letter.eq_ignore_ascii_case(&gold))
                }
                _ => None,
            };
            rows.push(QuickTestRow {
                question_id: question.id.clone(),
                extracted: parsed.extracted_answer,
                correct_letter,
                is_correct,
                completion_snippet: snippet.replace('\n', " "),
            });
        }
    }

    let graded = rows.iter().filter(|r| r.is_correct.is_some()).count();
    let correct = rows.iter().filter(|r| r.is_correct == Some(true)).count();
    let accuracy = if graded > 0 {
        correct as f64 / graded as f64
    } else {
        0.0
    };

    Ok(QuickTestReport {
        model_id: model_id.to_string(),
        condition,
        accuracy,
        rows,
    })
}
