//! Question datasets.
//!
//! Questions arrive as JSONL, one object per line. Malformed or invariant-
//! violating lines are skipped with a warning; the load never aborts on a
//! single bad row.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("question file not found: {0}")]
    NotFound(PathBuf),
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no valid questions in {0}")]
    Empty(PathBuf),
}

/// One benchmark question. Immutable input to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    /// Dataset the question belongs to, e.g. "gpqa" or "mmlu_pro".
    pub dataset: String,
    pub id: String,
    pub question_text: String,
    /// Pre-labeled options ("A. ...", "B. ..."); empty for open questions.
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub correct_option_letter: Option<String>,
    #[serde(default)]
    pub correct_answer_text: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Question {
    pub fn is_multiple_choice(&self) -> bool {
        !self.options.is_empty()
    }

    /// Gold option letter, uppercased, when this is a gradable MCQ.
    pub fn correct_letter(&self) -> Option<char> {
        if !self.is_multiple_choice() {
            return None;
        }
        self.correct_option_letter
            .as_deref()
            .and_then(|s| s.trim().chars().next())
            .map(|c| c.to_ascii_uppercase())
    }

    /// Whether the gold letter references one of the options.
    fn letter_in_range(&self) -> bool {
        match self.correct_letter() {
            Some(letter) => {
                let idx = (letter as u8).wrapping_sub(b'A') as usize;
                idx < self.options.len()
            }
            None => false,
        }
    }
}

/// JSONL wire shape; `dataset` comes from configuration, not the file.
#[derive(Debug, Deserialize)]
struct QuestionRow {
    id: serde_json::Value,
    question_text: String,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    correct_option_letter: Option<String>,
    #[serde(default)]
    correct_answer_text: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    difficulty: Option<String>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

/// Load questions from a JSONL file, tagging each with `dataset_name`.
pub fn load_questions(
    path: impl AsRef<Path>,
    dataset_name: &str,
) -> Result<Vec<Question>, DatasetError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(DatasetError::NotFound(path.to_path_buf()));
    }

    let raw = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut questions = Vec::new();
    for (line_num, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let row: QuestionRow = match serde_json::from_str(line) {
            Ok(row) => row,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = line_num + 1,
                    error = %e,
                    "skipping invalid question line"
                );
                continue;
            }
        };

        // Ids may arrive as strings or numbers; normalize to string.
        let id = match &row.id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let question = Question {
            dataset: dataset_name.to_string(),
            id,
            question_text: row.question_text,
            options: row.options,
            correct_option_letter: row.correct_option_letter,
            correct_answer_text: row.correct_answer_text,
            subject: row.subject,
            difficulty: row.difficulty,
            metadata: row.metadata,
        };

        if question.is_multiple_choice() && !question.letter_in_range() {
            warn!(
                path = %path.display(),
                line = line_num + 1,
                question_id = %question.id,
                "skipping MCQ whose correct_option_letter does not reference an option"
            );
            continue;
        }

        questions.push(question);
    }

    if questions.is_empty() {
        return Err(DatasetError::Empty(path.to_path_buf()));
    }

    Ok(questions)
}

/// Lookup from (dataset, question id) to question.
pub fn build_question_lookup(questions: &[Question]) -> HashMap<(String, String), &Question> {
    questions
        .iter()
        .map(|q| ((q.dataset.clone(), q.id.clone()), q))
        .collect()
}
