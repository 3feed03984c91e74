//! Answer generation: prompt assembly, model call and structured parsing.
//!
//! The model is asked for a JSON object `{"answer": ..., "reasoning": ...}`.
//! Parsing is tolerant: the output is first read as JSON (optionally inside a
//! Markdown code fence), then the outermost `{...}` span is extracted from
//! the raw text. If both fail, or the provider errors, a fixed degraded
//! answer is returned instead of an error.

use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};

use crate::generation::{GenerationProvider, Prompt};
use crate::models::{AnswerResult, ChatTurn, Record};

pub const SYSTEM_PROMPT: &str = "You are November QA, an expert analyst. \
Answer user questions truthfully using ONLY the supplied context. \
If the context lacks the answer, say you do not know. \
Provide concise answers (1-3 sentences) and include precise details like dates or counts. \
Respect privacy: never fabricate members or data.";

pub const FORMAT_INSTRUCTIONS: &str = "Respond with a single JSON object and nothing else. \
It must have exactly two string fields: \"answer\" (the natural-language answer) and \
\"reasoning\" (a brief description of how the answer was derived from the context).";

pub const DEGRADED_ANSWER: &str =
    "I found relevant information but couldn't format the answer properly.";
pub const DEGRADED_REASONING: &str = "Generated from context";

const NO_INSIGHTS: &str = "No additional computed insights.";

#[derive(Debug, Deserialize)]
struct StructuredAnswer {
    answer: String,
    #[serde(default)]
    reasoning: String,
}

/// Output of one generation attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAnswer {
    pub answer: String,
    pub reasoning: String,
    /// Provider failure message when the degraded answer was substituted.
    pub error: Option<String>,
}

impl GeneratedAnswer {
    fn degraded(error: Option<String>) -> Self {
        Self {
            answer: DEGRADED_ANSWER.to_string(),
            reasoning: DEGRADED_REASONING.to_string(),
            error,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.answer == DEGRADED_ANSWER && self.reasoning == DEGRADED_REASONING
    }
}

fn numeric_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("valid numeric regex"))
}

/// `- [YYYY-MM-DD HH:MM] name (user_id): text`, one line per record.
pub fn format_context(records: &[&Record]) -> String {
    records
        .iter()
        .map(|r| {
            format!(
                "- [{}] {} ({}): {}",
                r.timestamp.format("%Y-%m-%d %H:%M"),
                r.author_name,
                r.author_id,
                r.text_clean
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Computed hints for counting and temporal questions.
pub fn derive_insights(question: &str, records: &[&Record]) -> String {
    let lower = question.to_lowercase();
    let mut insights = Vec::new();

    if lower.contains("how many") {
        let count: usize = records
            .iter()
            .map(|r| numeric_pattern().find_iter(&r.text_clean).count())
            .sum();
        if count > 0 {
            insights.push(format!("Numeric mentions in context: {}", count));
        }
    }
    if lower.contains("when") {
        if let Some(earliest) = records.iter().map(|r| r.timestamp).min() {
            insights.push(format!(
                "Earliest timestamp in context: {}",
                earliest.format("%Y-%m-%d %H:%M")
            ));
        }
    }
    if insights.is_empty() {
        insights.push(NO_INSIGHTS.to_string());
    }

    insights
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_prompt(question: &str, records: &[&Record], history: &[ChatTurn]) -> Prompt {
    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        history: history.to_vec(),
        user: format!(
            "Question: {}\n\nContext:\n{}\n\nInsights:\n{}\n\n{}",
            question,
            format_context(records),
            derive_insights(question, records),
            FORMAT_INSTRUCTIONS
        ),
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse model output into `(answer, reasoning)`.
pub fn parse_response(raw: &str) -> Option<(String, String)> {
    if let Ok(parsed) = serde_json::from_str::<StructuredAnswer>(strip_code_fence(raw)) {
        return Some((parsed.answer, parsed.reasoning));
    }
    tracing::warn!("qa.parse_failed");

    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<StructuredAnswer>(&raw[start..=end])
        .ok()
        .map(|parsed| (parsed.answer, parsed.reasoning))
}

pub struct AnswerGenerator {
    provider: Arc<dyn GenerationProvider>,
}

impl AnswerGenerator {
    pub fn new(provider: Arc<dyn GenerationProvider>) -> Self {
        Self { provider }
    }

    /// Generate an answer grounded in `records`. Never fails.
    ///
    /// With no records the model is not called and the no-context answer is
    /// returned.
    pub async fn generate(
        &self,
        question: &str,
        records: &[&Record],
        history: &[ChatTurn],
    ) -> GeneratedAnswer {
        if records.is_empty() {
            return GeneratedAnswer {
                answer: AnswerResult::NO_ANSWER.to_string(),
                reasoning: AnswerResult::NO_CONTEXT_REASONING.to_string(),
                error: None,
            };
        }

        let prompt = build_prompt(question, records, history);
        let raw = match self.provider.generate(&prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    model = self.provider.model_name(),
                    error = %e,
                    "qa.generation_failed"
                );
                return GeneratedAnswer::degraded(Some(format!("{:#}", e)));
            }
        };

        match parse_response(&raw) {
            Some((answer, reasoning)) => GeneratedAnswer {
                answer,
                reasoning,
                error: None,
            },
            None => {
                tracing::warn!(raw_len = raw.len(), "qa.fallback_answer");
                GeneratedAnswer::degraded(None)
            }
        }
    }
}
