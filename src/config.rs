//! Experiment configuration.
//!
//! The YAML file describes datasets, models, conditions, sampling, judge and
//! metrics settings. API keys are resolved from the environment exactly once
//! into [`ApiCredentials`]; constructors receive the struct and never read
//! the environment themselves.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::condition::Condition;
use crate::gateway::ChatModel;
use crate::metrics::ThresholdSpec;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// =============================================================================
// Credentials
// =============================================================================

/// Provider credentials and transport knobs, resolved once from the
/// environment.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: String,
    pub openrouter_referer: Option<String>,
    pub openrouter_app_title: Option<String>,
    pub timeout: Duration,
}

impl Default for ApiCredentials {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            anthropic_api_key: None,
            openrouter_api_key: None,
            openrouter_base_url: crate::gateway::openai::OPENROUTER_BASE_URL.to_string(),
            openrouter_referer: None,
            openrouter_app_title: None,
            timeout: Duration::from_secs(120),
        }
    }
}

impl ApiCredentials {
    pub fn from_env() -> Self {
        let timeout = std::env::var("PERSONA_HARNESS_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        Self {
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            openrouter_api_key: std::env::var("OPENROUTER_API_KEY").ok(),
            openrouter_base_url: std::env::var("OPENROUTER_BASE_URL")
                .unwrap_or_else(|_| crate::gateway::openai::OPENROUTER_BASE_URL.to_string()),
            openrouter_referer: std::env::var("OPENROUTER_REFERER").ok(),
            openrouter_app_title: std::env::var("OPENROUTER_APP_TITLE").ok(),
            timeout,
        }
    }
}

// =============================================================================
// Config sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Dataset name carried into every record, e.g. "gpqa".
    pub name: String,
    /// Path to the question JSONL file.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    OpenRouter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Short id used in file names and records, e.g. "gpt-4o-mini".
    pub id: String,
    pub provider: Provider,
    /// Provider-side model name.
    pub model_name: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_max_output_tokens() -> u32 {
    4_096
}

impl ModelConfig {
    pub fn chat_model(&self) -> ChatModel {
        match self.provider {
            Provider::OpenAi => ChatModel::openai(&self.model_name),
            Provider::Anthropic => ChatModel::anthropic(&self.model_name),
            Provider::OpenRouter => ChatModel::openrouter(&self.model_name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub num_samples_per_question: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_tokens: u32,
    /// Retries after the first attempt, per sample.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Maximum (question, sample_index) units in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Minimum reasoning length requested by long-form prompts.
    #[serde(default = "default_min_reasoning_tokens")]
    pub min_reasoning_tokens: u32,
}

fn default_temperature() -> f32 {
    1.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}
fn default_concurrency() -> usize {
    4
}
fn default_min_reasoning_tokens() -> u32 {
    200
}

impl SamplingConfig {
    pub fn retry_policy(&self) -> crate::gateway::RetryPolicy {
        crate::gateway::RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub enabled: bool,
    /// References a model id from `models`.
    pub model_id: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_judge_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_judge_max_tokens() -> u32 {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Case-insensitive substrings that mark a response as a refusal.
    #[serde(default = "default_refusal_indicators")]
    pub refusal_indicators: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            refusal_indicators: default_refusal_indicators(),
        }
    }
}

fn default_refusal_indicators() -> Vec<String> {
    crate::parser::DEFAULT_REFUSAL_INDICATORS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    #[serde(default = "default_robust_thresholds")]
    pub robust_thresholds: Vec<ThresholdSpec>,
    /// Condition the comparison rows are computed against.
    #[serde(default = "default_baseline_condition")]
    pub baseline_condition: Condition,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            confidence_level: default_confidence_level(),
            robust_thresholds: default_robust_thresholds(),
            baseline_condition: default_baseline_condition(),
        }
    }
}

fn default_confidence_level() -> f64 {
    0.95
}

fn default_robust_thresholds() -> Vec<ThresholdSpec> {
    vec![
        ThresholdSpec::new(25, 25),
        ThresholdSpec::new(23, 25),
        ThresholdSpec::new(13, 25),
    ]
}

fn default_baseline_condition() -> Condition {
    Condition::BaselineMc
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub base_dir: PathBuf,
}

impl OutputConfig {
    pub fn raw_dir(&self) -> PathBuf {
        self.base_dir.join("raw")
    }

    pub fn scored_dir(&self) -> PathBuf {
        self.base_dir.join("scored")
    }

    pub fn summaries_dir(&self) -> PathBuf {
        self.base_dir.join("summaries")
    }

    pub fn raw_path(&self, model_id: &str, condition: Condition) -> PathBuf {
        self.raw_dir()
            .join(format!("raw_{model_id}_{}.jsonl", condition.id()))
    }

    pub fn scored_path(&self, model_id: &str, condition: Condition) -> PathBuf {
        self.scored_dir()
            .join(format!("scored_{model_id}_{}.jsonl", condition.id()))
    }
}

// =============================================================================
// Top-level config
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub datasets: Vec<DatasetConfig>,
    pub models: Vec<ModelConfig>,
    pub conditions: Vec<Condition>,
    pub sampling: SamplingConfig,
    pub judge: JudgeConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub output: OutputConfig,
}

impl ExperimentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: ExperimentConfig =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural validation, run before any network call.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.datasets.is_empty() {
            return Err(ConfigError::Invalid("no datasets configured".into()));
        }
        if self.models.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one model must be configured".into(),
            ));
        }
        if self.conditions.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one condition must be configured".into(),
            ));
        }
        if self.sampling.num_samples_per_question == 0 {
            return Err(ConfigError::Invalid(
                "sampling.num_samples_per_question must be >= 1".into(),
            ));
        }
        if self.sampling.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "sampling.concurrency must be >= 1".into(),
            ));
        }

        let mut model_ids = std::collections::HashSet::new();
        for m in &self.models {
            if !model_ids.insert(m.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate model id: {}",
                    m.id
                )));
            }
        }

        if self.judge.enabled && !model_ids.contains(self.judge.model_id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "judge.model_id references unknown model: {}",
                self.judge.model_id
            )));
        }

        for spec in &self.metrics.robust_thresholds {
            if spec.denominator == 0 {
                return Err(ConfigError::Invalid(
                    "robust threshold denominator must be >= 1".into(),
                ));
            }
            if spec.numerator > spec.denominator {
                return Err(ConfigError::Invalid(format!(
                    "robust threshold {}/{} has numerator > denominator",
                    spec.numerator, spec.denominator
                )));
            }
        }

        let confidence = self.metrics.confidence_level;
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "confidence_level must be in (0, 1): {confidence}"
            )));
        }

        Ok(())
    }

    pub fn model(&self, id: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn judge_model(&self) -> Option<&ModelConfig> {
        if !self.judge.enabled {
            return None;
        }
        self.model(&self.judge.model_id)
    }
}
