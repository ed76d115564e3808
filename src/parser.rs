//! Response parsing: answer extraction and reasoning-length estimation.
//!
//! Implements the contract between free-form model completions and the
//! normalized answers the scorer consumes. Extraction is deterministic:
//! explicit answer markers first, then a standalone-letter fallback near the
//! end of the response. Anything that yields no signal degrades to the
//! refusal sentinel, never to an error.

use serde::{Deserialize, Serialize};

use crate::condition::{AnswerFormat, Condition};
use crate::sampler::RawSample;

/// Phrases that mark a response as a refusal or statement of inability.
/// The live list is configurable; this is the default vocabulary.
pub const DEFAULT_REFUSAL_INDICATORS: &[&str] = &[
    "i am not able to",
    "i cannot answer",
    "i can't answer",
    "i'm not able to",
    "i am unable to",
    "i'm unable to",
    "as a language model",
    "as an ai",
    "as an artificial intelligence",
    "i do not have enough information",
    "i don't have enough information",
    "i'm not an expert",
    "i am not an expert",
    "i don't know",
    "i do not know",
    "i'm not sure",
    "i am not sure",
    "i cannot provide",
    "i can't provide",
    "i'm not qualified",
    "i am not qualified",
    "beyond my capabilities",
    "outside my knowledge",
    "i refuse to",
    "i will not answer",
    "i won't answer",
];

/// Case-insensitive substring matcher over the refusal vocabulary.
#[derive(Debug, Clone)]
pub struct RefusalLexicon {
    phrases: Vec<String>,
}

impl Default for RefusalLexicon {
    fn default() -> Self {
        Self::new(DEFAULT_REFUSAL_INDICATORS.iter().map(|s| s.to_string()))
    }
}

impl RefusalLexicon {
    pub fn new(phrases: impl IntoIterator<Item = String>) -> Self {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        let lower = text.to_ascii_lowercase();
        self.phrases.iter().any(|p| lower.contains(p.as_str()))
    }
}

/// Normalized answer extracted from a completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExtractedAnswer {
    /// An option letter for multiple-choice conditions.
    Letter(char),
    /// The normalized final-answer text for open conditions.
    Text(String),
    /// The refusal sentinel: no usable signal in the completion.
    Refusal,
}

impl ExtractedAnswer {
    pub fn is_refusal(&self) -> bool {
        matches!(self, ExtractedAnswer::Refusal)
    }
}

/// RawSample plus the parser's outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedSample {
    #[serde(flatten)]
    pub raw: RawSample,
    pub extracted_answer: ExtractedAnswer,
    pub reasoning_token_estimate: u32,
}

// =============================================================================
// Letter extraction
// =============================================================================

/// Markers scanned in priority order. The generic "answer" marker comes last
/// so "final answer: X" never resolves through it.
const ANSWER_MARKERS: &[&str] = &[
    "the correct answer is",
    "correct answer is",
    "correct answer:",
    "final answer",
    "answer:",
];

/// Characters skipped between a marker and its letter.
const MARKER_SEPARATORS: &[char] = &[' ', '\t', ':', '-', '"', '\'', '(', '[', '*'];

fn letter_limit(num_options: usize) -> usize {
    // A-J at most, mirroring ten-option benchmark sets.
    num_options.clamp(1, 10)
}

fn valid_letter(c: char, limit: usize) -> Option<char> {
    let upper = c.to_ascii_uppercase();
    if !upper.is_ascii_uppercase() {
        return None;
    }
    let idx = (upper as u8 - b'A') as usize;
    (idx < limit).then_some(upper)
}

/// Letter immediately following `marker` in `text`, if it is a standalone
/// token within the valid option range.
fn letter_after_marker(text: &str, marker: &str, limit: usize) -> Option<char> {
    let lower = text.to_ascii_lowercase();
    let start = lower.find(marker)? + marker.len();
    let rest = &text[start..];

    let mut chars = rest.char_indices().skip_while(|(_, c)| MARKER_SEPARATORS.contains(c));
    let (idx, candidate) = chars.next()?;
    let letter = valid_letter(candidate, limit)?;

    // Standalone check: the next character must not extend the token.
    let next = rest[idx..].chars().nth(1);
    if next.is_some_and(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(letter)
}

/// First standalone option letter in `line`.
fn standalone_letter(line: &str, limit: usize) -> Option<char> {
    let chars: Vec<char> = line.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            if let Some(letter) = valid_letter(c, limit) {
                let prev_ok = i == 0 || !chars[i - 1].is_ascii_alphanumeric();
                let next_ok = i + 1 >= chars.len() || !chars[i + 1].is_ascii_alphanumeric();
                if prev_ok && next_ok {
                    return Some(letter);
                }
            }
        }
    }
    None
}

/// Extract a single option letter from a multiple-choice completion.
///
/// Explicit answer markers win; otherwise the tail of the response is
/// scanned for a standalone capital letter within the option range.
pub fn extract_mcq_letter(text: &str, num_options: usize) -> Option<char> {
    let cleaned = text.trim();
    if cleaned.is_empty() {
        return None;
    }
    let limit = letter_limit(num_options);

    for marker in ANSWER_MARKERS {
        if let Some(letter) = letter_after_marker(cleaned, marker, limit) {
            return Some(letter);
        }
    }

    // Fallback: standalone letter in the last three lines, scanning upward.
    let lines: Vec<&str> = cleaned.lines().collect();
    let tail_start = lines.len().saturating_sub(3);
    for line in lines[tail_start..].iter().rev() {
        if let Some(letter) = standalone_letter(line, limit) {
            return Some(letter);
        }
    }

    None
}

// =============================================================================
// Open-answer extraction
// =============================================================================

fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack.to_ascii_lowercase().find(needle)
}

/// Extract the final-answer text from an open-ended completion: the content
/// of a "Final answer:" line, else the last non-empty line.
pub fn extract_open_answer(text: &str) -> Option<String> {
    for line in text.lines() {
        if let Some(idx) = find_ascii_ci(line, "final answer") {
            let after = &line[idx + "final answer".len()..];
            let answer = after
                .trim_start_matches([':', '-', ' ', '\t'])
                .trim()
                .trim_end_matches(['.', '!', '?'])
                .trim();
            if !answer.is_empty() {
                return Some(answer.to_string());
            }
        }
    }

    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
}

// =============================================================================
// Reasoning estimation
// =============================================================================

/// Split a completion into the reasoning segment and the answer line.
/// Everything before the first marker line counts as reasoning.
pub fn reasoning_segment(text: &str) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if find_ascii_ci(line, "final answer").is_some()
            || find_ascii_ci(line, "the correct answer is").is_some()
        {
            return lines[..i].join("\n").trim().to_string();
        }
    }
    text.trim().to_string()
}

/// Approximate token count from whitespace-delimited words and characters.
/// Empty input is 0; non-empty input is at least 1. Never divides by zero.
pub fn estimate_reasoning_tokens(text: &str) -> u32 {
    if text.trim().is_empty() {
        return 0;
    }
    let word_count = text.split_whitespace().count();
    let char_count = text.chars().count();
    // 1 token ~ 0.75 words ~ 4 chars; average the two estimates.
    let word_based = word_count * 4 / 3;
    let char_based = char_count / 4;
    (((word_based + char_based) / 2).max(1)) as u32
}

// =============================================================================
// Parse entry point
// =============================================================================

/// Parse one raw sample under its condition. `num_options` is the option
/// count of the sampled question (0 for open questions).
pub fn parse_sample(
    raw: RawSample,
    condition: Condition,
    num_options: usize,
    lexicon: &RefusalLexicon,
) -> ParsedSample {
    let reasoning = reasoning_segment(&raw.completion_text);
    let reasoning_token_estimate = estimate_reasoning_tokens(&reasoning);

    let extracted_answer = if raw.completion_text.trim().is_empty() {
        ExtractedAnswer::Refusal
    } else {
        match condition.answer_format() {
            AnswerFormat::MultipleChoice => {
                match extract_mcq_letter(&raw.completion_text, num_options) {
                    Some(letter) => ExtractedAnswer::Letter(letter),
                    None => ExtractedAnswer::Refusal,
                }
            }
            AnswerFormat::Open => {
                if lexicon.matches(&raw.completion_text) {
                    ExtractedAnswer::Refusal
                } else {
                    match extract_open_answer(&raw.completion_text) {
                        Some(text) => ExtractedAnswer::Text(text),
                        None => ExtractedAnswer::Refusal,
                    }
                }
            }
        }
    };

    ParsedSample {
        raw,
        extracted_answer,
        reasoning_token_estimate,
    }
}
