//! Prompt construction for the six experiment conditions and the judge.
//!
//! Domain logic for rendering evaluation prompts. Provider-agnostic.

use crate::condition::{AnswerFormat, Condition, PersonaStrength, ReasoningDepth};
use crate::dataset::Question;
use crate::gateway::Message;

pub const BASE_SYSTEM_PROMPT: &str =
    "You are a very intelligent assistant, who follows instructions directly.";

/// Persona preamble, or None when the condition carries no persona.
fn persona_text(persona: PersonaStrength, domain: &str) -> Option<String> {
    match persona {
        PersonaStrength::None => None,
        PersonaStrength::Shallow => Some(format!(
            "You are a world-class expert in {domain}. You have deep knowledge of \
             {domain} and always choose the most accurate answer."
        )),
        PersonaStrength::DeepExpert => Some(format!(
            "You are Dr. Alex Rivera, a world-class expert in {domain}. You hold \
             multiple advanced degrees and have spent over 20 years researching and \
             teaching {domain}. You are meticulous, analytical, and calm. You always \
             approach problems by carefully unpacking the question, enumerating \
             possibilities, checking each step, and only then committing to an answer. \
             You dislike hand-waving and insist on sound reasoning grounded in \
             {domain} principles."
        )),
        PersonaStrength::DeepNaive => Some(
            "You are a 4-year-old child. You speak in very simple, short sentences. \
             You often say that you do not know things. You do not understand advanced \
             science. You may guess, but your guesses are not very reliable."
                .to_string(),
        ),
    }
}

fn options_block(question: &Question) -> String {
    question.options.join("\n")
}

fn mcq_short(question: &Question, persona: Option<String>) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(p) = persona {
        parts.push(p);
        parts.push(String::new());
    }
    parts.push("What is the correct answer to this question:".into());
    parts.push(question.question_text.clone());
    parts.push(String::new());
    parts.push("Choices:".into());
    parts.push(options_block(question));
    parts.push(String::new());
    parts.push(
        "Format your response as follows: \"The correct answer is (insert answer here)\"".into(),
    );
    parts.join("\n")
}

fn mcq_long(question: &Question, persona: Option<String>, min_reasoning_tokens: u32) -> String {
    let domain = question.subject.as_deref().unwrap_or("the relevant subject");
    let mut parts: Vec<String> = Vec::new();
    if let Some(p) = persona {
        parts.push(p);
        parts.push(String::new());
    }
    parts.push(format!(
        "You will now answer a multiple-choice question in {domain}."
    ));
    parts.push(format!(
        "First, think out loud in detail as this persona. Your reasoning should be \
         at least {min_reasoning_tokens} tokens long. Do not rush to an answer. \
         Examine the question, the options, and any relevant principles."
    ));
    parts.push(
        "After you finish reasoning, on a new line write exactly: \"Final answer: X\" \
         where X is the letter of the correct option (A, B, C, etc.)."
            .into(),
    );
    parts.push("Do not include explanations after the final answer line.".into());
    parts.push(String::new());
    parts.push("Question:".into());
    parts.push(question.question_text.clone());
    parts.push(String::new());
    parts.push("Choices:".into());
    parts.push(options_block(question));
    parts.join("\n")
}

fn open_long(question: &Question, persona: Option<String>, min_reasoning_tokens: u32) -> String {
    let domain = question.subject.as_deref().unwrap_or("the relevant subject");
    let mut parts: Vec<String> = Vec::new();

    match persona {
        Some(p) => {
            parts.push(p);
            parts.push(String::new());
            parts.push(format!(
                "You will now answer a difficult open-ended question in {domain}."
            ));
            parts.push(format!(
                "As this persona, think through the problem carefully and in detail. \
                 Your reasoning should be at least {min_reasoning_tokens} tokens long. \
                 Unpack the question, consider relevant concepts, and work step by step."
            ));
        }
        None => {
            parts.push("You will answer a difficult question. Think step by step.".into());
            parts.push(format!(
                "First, reason in detail for at least {min_reasoning_tokens} tokens. \
                 Break the problem into parts and solve each part carefully."
            ));
        }
    }

    parts.push(
        "After you finish reasoning, on a new line write exactly: \
         \"Final answer: [your short final answer]\" where the final answer is concise."
            .into(),
    );
    parts.push("Do not add any text after the final answer line.".into());
    parts.push(String::new());
    parts.push("Question:".into());
    parts.push(question.question_text.clone());
    parts.join("\n")
}

/// Render the user-turn content for a (question, condition) pair.
pub fn build_user_content(
    question: &Question,
    condition: Condition,
    min_reasoning_tokens: u32,
) -> String {
    let profile = condition.profile();
    let domain = question.subject.as_deref().unwrap_or("the relevant subject");
    let persona = persona_text(profile.persona, domain);

    match (profile.format, profile.depth) {
        (AnswerFormat::MultipleChoice, ReasoningDepth::Short) => mcq_short(question, persona),
        (AnswerFormat::MultipleChoice, ReasoningDepth::Long) => {
            mcq_long(question, persona, min_reasoning_tokens)
        }
        (AnswerFormat::Open, _) => open_long(question, persona, min_reasoning_tokens),
    }
}

/// Messages for a sampling call.
pub fn build_chat_messages(
    question: &Question,
    condition: Condition,
    min_reasoning_tokens: u32,
) -> Vec<Message> {
    vec![
        Message::system(BASE_SYSTEM_PROMPT),
        Message::user(build_user_content(question, condition, min_reasoning_tokens)),
    ]
}

/// Messages for a judge grading call: question, gold answer, candidate answer,
/// one-word verdict contract.
pub fn build_judge_messages(
    question_text: &str,
    gold_answer: &str,
    candidate_answer: &str,
) -> Vec<Message> {
    let system = "You are a strict grading assistant. You decide whether a student's \
                  final answer is correct given the question and the official correct \
                  answer. Be fair but strict: minor wording differences are acceptable \
                  if the meaning is the same, but incorrect facts or significant \
                  omissions should be marked incorrect.";

    let user = format!(
        "Question:\n{question_text}\n\n\
         Official correct answer:\n{gold_answer}\n\n\
         Student's final answer:\n{candidate_answer}\n\n\
         Respond with exactly one word: 'correct' if the student's answer is \
         essentially correct, or 'incorrect' otherwise. Do not explain."
    );

    vec![Message::system(system), Message::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mcq_question() -> Question {
        Question {
            dataset: "toy".into(),
            id: "q1".into(),
            question_text: "Which gas do plants absorb?".into(),
            options: vec!["A. Oxygen".into(), "B. Carbon dioxide".into()],
            correct_option_letter: Some("B".into()),
            correct_answer_text: None,
            subject: Some("biology".into()),
            difficulty: None,
            metadata: Default::default(),
        }
    }

    fn open_question() -> Question {
        Question {
            options: vec![],
            correct_option_letter: None,
            correct_answer_text: Some("carbon dioxide".into()),
            ..mcq_question()
        }
    }

    #[test]
    fn short_mcq_uses_correct_answer_is_format() {
        let content = build_user_content(&mcq_question(), Condition::BaselineMc, 200);
        assert!(content.contains("The correct answer is"));
        assert!(content.contains("B. Carbon dioxide"));
        assert!(!content.contains("Final answer"));
    }

    #[test]
    fn persona_appears_only_in_persona_conditions() {
        let baseline = build_user_content(&mcq_question(), Condition::BaselineMc, 200);
        assert!(!baseline.contains("world-class expert"));

        let shallow = build_user_content(&mcq_question(), Condition::ExpertShallowMc, 200);
        assert!(shallow.contains("world-class expert in biology"));

        let deep = build_user_content(&mcq_question(), Condition::ExpertDeepMc, 200);
        assert!(deep.contains("Dr. Alex Rivera"));

        let naive = build_user_content(&mcq_question(), Condition::NaiveDeepMc, 200);
        assert!(naive.contains("4-year-old"));
    }

    #[test]
    fn long_conditions_state_the_reasoning_floor() {
        let content = build_user_content(&mcq_question(), Condition::ExpertDeepMc, 350);
        assert!(content.contains("at least 350 tokens"));
        assert!(content.contains("Final answer: X"));
    }

    #[test]
    fn open_conditions_skip_options_and_ask_for_text() {
        let content = build_user_content(&open_question(), Condition::ExpertDeepOpen, 200);
        assert!(!content.contains("Choices:"));
        assert!(content.contains("Final answer: [your short final answer]"));
    }

    #[test]
    fn judge_prompt_carries_all_three_texts() {
        let messages = build_judge_messages("Why is the sky blue?", "Rayleigh scattering", "light scatters");
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("Rayleigh scattering"));
        assert!(messages[1].content.contains("light scatters"));
        assert!(messages[1].content.contains("exactly one word"));
    }
}
