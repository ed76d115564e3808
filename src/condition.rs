//! Experiment conditions.
//!
//! Six fixed conditions, each a pure function of (persona strength,
//! reasoning depth, answer format). A closed enum keeps prompt construction
//! and scoring dispatch exhaustive; nothing downstream branches on free-form
//! strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Strength of the persona preamble injected into the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaStrength {
    /// No persona text at all.
    None,
    /// One-sentence "world-class expert" framing.
    Shallow,
    /// Detailed expert biography with method instructions.
    DeepExpert,
    /// Detailed low-capability persona (unreliable guesser).
    DeepNaive,
}

/// How much visible reasoning the prompt asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningDepth {
    /// Answer immediately in the fixed short format.
    Short,
    /// Think out loud first, then a final-answer line.
    Long,
}

/// Shape of the expected answer, which selects the scoring path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerFormat {
    /// One option letter; graded by direct comparison.
    MultipleChoice,
    /// Free text; graded by the judge model.
    Open,
}

/// The (persona, depth, format) triple a condition denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionProfile {
    pub persona: PersonaStrength,
    pub depth: ReasoningDepth,
    pub format: AnswerFormat,
}

/// The six experiment conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// No persona, short-format MCQ.
    BaselineMc,
    /// Shallow expert persona, short-format MCQ.
    ExpertShallowMc,
    /// Deep expert persona, long reasoning, MCQ.
    ExpertDeepMc,
    /// Deep naive persona, long reasoning, MCQ.
    NaiveDeepMc,
    /// No persona, long reasoning, open-ended.
    BaselineOpen,
    /// Deep expert persona, long reasoning, open-ended.
    ExpertDeepOpen,
}

impl Condition {
    pub const ALL: [Condition; 6] = [
        Condition::BaselineMc,
        Condition::ExpertShallowMc,
        Condition::ExpertDeepMc,
        Condition::NaiveDeepMc,
        Condition::BaselineOpen,
        Condition::ExpertDeepOpen,
    ];

    pub fn profile(self) -> ConditionProfile {
        match self {
            Condition::BaselineMc => ConditionProfile {
                persona: PersonaStrength::None,
                depth: ReasoningDepth::Short,
                format: AnswerFormat::MultipleChoice,
            },
            Condition::ExpertShallowMc => ConditionProfile {
                persona: PersonaStrength::Shallow,
                depth: ReasoningDepth::Short,
                format: AnswerFormat::MultipleChoice,
            },
            Condition::ExpertDeepMc => ConditionProfile {
                persona: PersonaStrength::DeepExpert,
                depth: ReasoningDepth::Long,
                format: AnswerFormat::MultipleChoice,
            },
            Condition::NaiveDeepMc => ConditionProfile {
                persona: PersonaStrength::DeepNaive,
                depth: ReasoningDepth::Long,
                format: AnswerFormat::MultipleChoice,
            },
            Condition::BaselineOpen => ConditionProfile {
                persona: PersonaStrength::None,
                depth: ReasoningDepth::Long,
                format: AnswerFormat::Open,
            },
            Condition::ExpertDeepOpen => ConditionProfile {
                persona: PersonaStrength::DeepExpert,
                depth: ReasoningDepth::Long,
                format: AnswerFormat::Open,
            },
        }
    }

    pub fn answer_format(self) -> AnswerFormat {
        self.profile().format
    }

    /// Stable id used in file names and JSONL records.
    pub fn id(self) -> &'static str {
        match self {
            Condition::BaselineMc => "baseline_mc",
            Condition::ExpertShallowMc => "expert_shallow_mc",
            Condition::ExpertDeepMc => "expert_deep_mc",
            Condition::NaiveDeepMc => "naive_deep_mc",
            Condition::BaselineOpen => "baseline_open",
            Condition::ExpertDeepOpen => "expert_deep_open",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Condition::ALL
            .into_iter()
            .find(|c| c.id() == s)
            .ok_or_else(|| format!("unknown condition: {s}"))
    }
}
