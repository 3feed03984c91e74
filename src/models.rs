//! Core data models used throughout the question-answering pipeline.
//!
//! Raw messages flow in from a [`source`](crate::source), are normalized into
//! [`Record`]s inside a [`Corpus`], projected into [`IndexedDocument`]s for the
//! dense and sparse indices, and come back out of a query as
//! [`RetrievalHit`]s and finally an [`AnswerResult`].

use std::fmt;

use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Maximum length, in characters, of a citation snippet.
pub const SNIPPET_MAX_CHARS: usize = 280;

/// Timestamp as delivered by the upstream source.
///
/// Upstream data mixes offset-aware (`2024-05-01T10:00:00+02:00`) and naive
/// (`2024-05-01T10:00:00`) values. Naive timestamps are interpreted as UTC
/// by [`RawTimestamp::to_utc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTimestamp {
    Aware(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
}

impl RawTimestamp {
    /// Parse an ISO-8601 / RFC 3339 timestamp, with or without an offset.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Ok(aware) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Self::Aware(aware));
        }
        for fmt in [
            "%Y-%m-%dT%H:%M:%S%.f",
            "%Y-%m-%d %H:%M:%S%.f",
            "%Y-%m-%dT%H:%M",
        ] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
                return Ok(Self::Naive(naive));
            }
        }
        Err(anyhow!("unrecognised timestamp: '{}'", raw))
    }

    pub fn to_utc(self) -> DateTime<Utc> {
        match self {
            Self::Aware(ts) => ts.with_timezone(&Utc),
            Self::Naive(ts) => ts.and_utc(),
        }
    }
}

impl fmt::Display for RawTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aware(ts) => write!(f, "{}", ts.to_rfc3339()),
            Self::Naive(ts) => write!(f, "{}", ts.format("%Y-%m-%dT%H:%M:%S%.f")),
        }
    }
}

impl Serialize for RawTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RawTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RawTimestamp::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A single user-authored message as received from the upstream source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub timestamp: RawTimestamp,
    pub message: String,
}

/// All messages fetched from a source, plus cache metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesBundle {
    /// Total number of messages reported upstream.
    pub total: usize,
    pub messages: Vec<RawMessage>,
    /// Upstream `ETag`, used for conditional refetches.
    #[serde(default)]
    pub etag: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Named entity span extracted from a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpan {
    pub text: String,
    /// NER-style label, e.g. `PERSON` or `GPE`.
    pub label: String,
}

/// Normalized, immutable representation of one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    pub timestamp: DateTime<Utc>,
    pub text_original: String,
    pub text_clean: String,
    /// UTC date (`YYYY-MM-DD`) used for grouping.
    pub temporal_key: String,
    pub token_count: usize,
    #[serde(default)]
    pub entities: Vec<EntitySpan>,
}

impl Record {
    pub fn to_document(&self) -> IndexedDocument {
        IndexedDocument {
            id: Some(self.id.clone()),
            text: self.text_clean.clone(),
        }
    }
}

/// The normalized corpus. Rebuilt wholesale on every refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Corpus {
    pub records: Vec<Record>,
    /// Number of raw messages the corpus was built from.
    pub source_total: usize,
    pub processed_at: DateTime<Utc>,
}

impl Corpus {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn documents(&self) -> Vec<IndexedDocument> {
        self.records.iter().map(Record::to_document).collect()
    }
}

/// Text plus identifier as consumed by the dense and sparse indices.
///
/// Documents built from the corpus always carry an `id`. Documents without
/// one can only come from custom retrievers and are keyed by a content prefix
/// during fusion (see [`fusion_key`](crate::retrieval::fusion_key)).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: Option<String>,
    pub text: String,
}

/// One fused retrieval result. Lives for a single query.
#[derive(Debug, Clone)]
pub struct RetrievalHit {
    pub document: IndexedDocument,
    /// 1-indexed position in the fused list.
    pub rank: usize,
    /// Weighted reciprocal-rank-fusion score.
    pub score: f64,
}

/// Speaker of a conversation-history turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// A source message backing an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub message_id: String,
    pub user_name: String,
    pub timestamp: DateTime<Utc>,
    /// Prefix of the cleaned text, at most [`SNIPPET_MAX_CHARS`] characters.
    pub snippet: String,
}

impl Citation {
    pub fn from_record(record: &Record) -> Self {
        Self {
            message_id: record.id.clone(),
            user_name: record.author_name.clone(),
            timestamp: record.timestamp,
            snippet: truncate_chars(&record.text_clean, SNIPPET_MAX_CHARS),
        }
    }
}

/// Trust metadata attached to every answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Guardrails {
    pub has_context: bool,
    pub hallucination_supported: bool,
    pub hallucination_score: f64,
    pub hallucination_error: Option<String>,
    /// Set when the generation provider failed and a degraded answer was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_error: Option<String>,
}

/// The result of one `ask` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResult {
    pub question: String,
    pub answer: String,
    pub reasoning: String,
    /// Always within `[0.0, 1.0]`.
    pub confidence: f64,
    pub citations: Vec<Citation>,
    pub guardrails: Guardrails,
}

impl AnswerResult {
    pub const NO_ANSWER: &'static str = "I could not find an answer in the member data.";
    pub const NO_CONTEXT_REASONING: &'static str = "no_context";

    /// Result returned when retrieval produced no passages.
    pub fn empty(question: &str) -> Self {
        Self {
            question: question.to_string(),
            answer: Self::NO_ANSWER.to_string(),
            reasoning: Self::NO_CONTEXT_REASONING.to_string(),
            confidence: 0.0,
            citations: Vec::new(),
            guardrails: Guardrails::default(),
        }
    }

    pub fn from_answer(
        question: &str,
        answer: &str,
        reasoning: &str,
        confidence: f64,
        records: &[&Record],
        guardrails: Guardrails,
    ) -> Self {
        Self {
            question: question.to_string(),
            answer: answer.trim().to_string(),
            reasoning: reasoning.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            citations: records.iter().map(|r| Citation::from_record(r)).collect(),
            guardrails,
        }
    }
}

/// Take at most `max` characters from `text` (never splits a code point).
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(text: &str) -> Record {
        Record {
            id: "m1".to_string(),
            author_id: "u1".to_string(),
            author_name: "Layla".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            text_original: text.to_string(),
            text_clean: text.to_string(),
            temporal_key: "2024-05-01".to_string(),
            token_count: text.split_whitespace().count(),
            entities: Vec::new(),
        }
    }

    #[test]
    fn test_parse_aware_timestamp_converts_to_utc() {
        let ts = RawTimestamp::parse("2024-05-01T12:00:00+02:00").unwrap();
        assert_eq!(
            ts.to_utc(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_naive_timestamp_assumed_utc() {
        let ts = RawTimestamp::parse("2024-05-01T10:00:00.250").unwrap();
        assert!(matches!(ts, RawTimestamp::Naive(_)));
        assert_eq!(ts.to_utc().format("%H:%M:%S").to_string(), "10:00:00");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RawTimestamp::parse("yesterday").is_err());
    }

    #[test]
    fn test_raw_message_deserializes_mixed_timestamps() {
        let json = r#"[
            {"id":"a","user_id":"u","user_name":"N","timestamp":"2024-01-01T00:00:00Z","message":"x"},
            {"id":"b","user_id":"u","user_name":"N","timestamp":"2024-01-01T00:00:00","message":"y"}
        ]"#;
        let msgs: Vec<RawMessage> = serde_json::from_str(json).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].timestamp.to_utc(), msgs[1].timestamp.to_utc());
    }

    #[test]
    fn test_citation_snippet_bounded() {
        let long = "é".repeat(500);
        let citation = Citation::from_record(&record(&long));
        assert_eq!(citation.snippet.chars().count(), SNIPPET_MAX_CHARS);
    }

    #[test]
    fn test_from_answer_clamps_confidence_and_trims() {
        let r = record("hello");
        let result = AnswerResult::from_answer(
            "q",
            "  answer \n",
            "why",
            1.7,
            &[&r],
            Guardrails::default(),
        );
        assert_eq!(result.answer, "answer");
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.citations[0].message_id, "m1");
    }

    #[test]
    fn test_role_serde_lowercase() {
        let turn: ChatTurn = serde_json::from_str(r#"{"role":"ai","content":"hi"}"#).unwrap();
        assert_eq!(turn.role, Role::Ai);
    }
}
