//! Offline evaluation against a gold question set.
//!
//! The dataset is JSONL, one `{"question": ..., "expected_answer": ...}` per
//! line. Each question goes through [`QaService::ask`]; the answer is scored
//! by embedding cosine similarity, case-insensitive containment (either
//! direction) and the verifier's support flag. Averages are rounded to four
//! decimals in the JSON report.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::embedding::{cosine_similarity, create_provider, EmbeddingProvider};
use crate::qa::QaService;

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationExample {
    pub question: String,
    pub expected_answer: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationOutcome {
    pub question: String,
    pub expected_answer: String,
    pub answer: String,
    pub confidence: f64,
    pub semantic_similarity: f64,
    pub lexical_overlap: bool,
    pub supported: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationSummary {
    pub average_similarity: f64,
    pub lexical_accuracy: f64,
    pub support_rate: f64,
    pub examples: Vec<EvaluationOutcome>,
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

impl EvaluationSummary {
    pub fn from_outcomes(examples: Vec<EvaluationOutcome>) -> Self {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        Self {
            average_similarity: round4(mean(examples.iter().map(|o| o.semantic_similarity))),
            lexical_accuracy: round4(mean(examples.iter().map(|o| flag(o.lexical_overlap)))),
            support_rate: round4(mean(examples.iter().map(|o| flag(o.supported)))),
            examples,
        }
    }
}

/// Case-insensitive containment in either direction.
pub fn lexical_overlap(expected: &str, predicted: &str) -> bool {
    let expected = expected.trim().to_lowercase();
    let predicted = predicted.trim().to_lowercase();
    predicted.contains(&expected) || expected.contains(&predicted)
}

pub fn load_dataset(path: &Path) -> Result<Vec<EvaluationExample>> {
    if !path.exists() {
        bail!("Evaluation dataset not found at {}", path.display());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid example", path.display(), i + 1))
        })
        .collect()
}

pub struct EvaluationHarness {
    service: Arc<QaService>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl EvaluationHarness {
    pub fn new(service: Arc<QaService>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { service, embedder }
    }

    async fn similarity(&self, expected: &str, predicted: &str) -> Result<f64> {
        let vectors = self
            .embedder
            .embed(&[expected.to_string(), predicted.to_string()])
            .await?;
        match vectors.as_slice() {
            [a, b] => Ok(cosine_similarity(a, b) as f64),
            _ => bail!("embedding provider returned {} vectors for 2 texts", vectors.len()),
        }
    }

    pub async fn run(&self, examples: &[EvaluationExample]) -> Result<EvaluationSummary> {
        let mut outcomes = Vec::with_capacity(examples.len());
        for example in examples {
            tracing::info!(question = %example.question, "evaluation.run_example");
            let answer = self.service.ask(&example.question, &[], false).await?;
            outcomes.push(EvaluationOutcome {
                semantic_similarity: self
                    .similarity(&example.expected_answer, &answer.answer)
                    .await?,
                lexical_overlap: lexical_overlap(&example.expected_answer, &answer.answer),
                supported: answer.guardrails.hallucination_supported,
                confidence: answer.confidence,
                answer: answer.answer,
                question: example.question.clone(),
                expected_answer: example.expected_answer.clone(),
            });
        }
        Ok(EvaluationSummary::from_outcomes(outcomes))
    }
}

pub fn write_summary(summary: &EvaluationSummary, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(output, serde_json::to_string_pretty(summary)?)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    tracing::info!(path = %output.display(), "evaluation.report_written");
    Ok(())
}

pub async fn run_evaluate(
    config: &Config,
    dataset: Option<PathBuf>,
    output: Option<PathBuf>,
) -> Result<()> {
    let dataset =
        dataset.unwrap_or_else(|| config.storage.data_dir.join("eval").join("gold.jsonl"));
    let output = output.unwrap_or_else(|| config.storage.reports_dir.join("evaluation.json"));

    let examples = load_dataset(&dataset)?;
    let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
    let harness = EvaluationHarness::new(crate::services::shared_services(config)?, embedder);
    let summary = harness.run(&examples).await?;
    write_summary(&summary, &output)?;

    println!("Evaluated {} examples", summary.examples.len());
    println!("  average similarity: {:.4}", summary.average_similarity);
    println!("  lexical accuracy:   {:.4}", summary.lexical_accuracy);
    println!("  support rate:       {:.4}", summary.support_rate);
    println!("Report written to {}", output.display());
    println!("ok");
    Ok(())
}
