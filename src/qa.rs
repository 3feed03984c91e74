//! Question answering: the `ask` pipeline.
//!
//! ```text
//! ensure index ready → fused retrieval → (no hits: empty answer)
//!   → generate → verify → estimate confidence → AnswerResult
//! ```
//!
//! Only dependency failures (no corpus, no index, a failing retriever)
//! surface as errors. Malformed model output, generation outages and
//! verifier outages are absorbed and reported through the result's
//! guardrails.

use anyhow::{bail, Result};
use std::sync::Arc;

use crate::answer::AnswerGenerator;
use crate::config::{Config, RetrievalConfig};
use crate::confidence::{apply_verdict, estimate_confidence};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::generation::{create_generator, GenerationProvider};
use crate::index::IndexManager;
use crate::models::{AnswerResult, ChatTurn, Guardrails, Record};
use crate::retrieval::FusionRetriever;
use crate::verifier::{create_classifier, EntailmentVerifier, NliClassifier};

pub struct QaService {
    index: Arc<IndexManager>,
    retrieval: RetrievalConfig,
    generator: AnswerGenerator,
    verifier: EntailmentVerifier,
}

impl QaService {
    pub fn new(
        index: Arc<IndexManager>,
        retrieval: RetrievalConfig,
        generator: Arc<dyn GenerationProvider>,
        verifier: EntailmentVerifier,
    ) -> Self {
        Self {
            index,
            retrieval,
            generator: AnswerGenerator::new(generator),
            verifier,
        }
    }

    /// Wire every provider from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
        let generator: Arc<dyn GenerationProvider> =
            Arc::from(create_generator(&config.generation)?);
        let classifier: Arc<dyn NliClassifier> = Arc::from(create_classifier(&config.verifier)?);

        tracing::info!(
            embedding = embedder.model_name(),
            generation = generator.model_name(),
            verifier = %config.verifier.provider,
            "qa.services_ready"
        );

        Ok(Self::new(
            Arc::new(IndexManager::from_config(config, embedder)),
            config.retrieval.clone(),
            generator,
            EntailmentVerifier::new(classifier, config.verifier.threshold),
        ))
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    /// Answer `question` from the member corpus.
    ///
    /// `force_refresh` refetches the corpus and rebuilds the indices first.
    pub async fn ask(
        &self,
        question: &str,
        history: &[ChatTurn],
        force_refresh: bool,
    ) -> Result<AnswerResult> {
        let question = question.trim();
        if question.is_empty() {
            bail!("question must not be empty");
        }

        let snapshot = self.index.ensure_ready(force_refresh).await?;
        let retriever =
            FusionRetriever::for_snapshot(snapshot.clone(), self.index.embedder(), &self.retrieval)?;
        let hits = retriever.retrieve(question).await?;

        let mut records: Vec<&Record> = Vec::with_capacity(hits.len());
        for hit in &hits {
            match hit.document.id.as_deref().and_then(|id| snapshot.record(id)) {
                Some(record) => records.push(record),
                None => tracing::warn!(rank = hit.rank, "qa.unknown_document"),
            }
        }

        if records.is_empty() {
            tracing::info!(question, "qa.no_context");
            return Ok(AnswerResult::empty(question));
        }

        let generated = self.generator.generate(question, &records, history).await;

        let passages: Vec<&str> = records.iter().map(|r| r.text_clean.as_str()).collect();
        let verdict = self.verifier.evaluate(&generated.answer, &passages).await;

        let confidence = apply_verdict(
            estimate_confidence(question, records.len()),
            verdict.supported,
        );

        tracing::info!(
            passages = records.len(),
            supported = verdict.supported,
            hallucination_score = verdict.score,
            confidence,
            generation = snapshot.generation,
            "qa.answered"
        );

        let guardrails = Guardrails {
            has_context: true,
            hallucination_supported: verdict.supported,
            hallucination_score: verdict.score,
            hallucination_error: verdict.error,
            generation_error: generated.error,
        };
        Ok(AnswerResult::from_answer(
            question,
            &generated.answer,
            &generated.reasoning,
            confidence,
            &records,
            guardrails,
        ))
    }
}

/// Answer one question and print the result.
pub async fn run_ask(config: &Config, question: &str, refresh: bool) -> Result<()> {
    let service = crate::services::shared_services(config)?;
    let result = service.ask(question, &[], refresh).await?;

    println!("Answer:     {}", result.answer);
    println!("Reasoning:  {}", result.reasoning);
    println!("Confidence: {:.3}", result.confidence);
    println!(
        "Supported:  {} (score {:.3})",
        result.guardrails.hallucination_supported, result.guardrails.hallucination_score
    );
    if let Some(err) = &result.guardrails.hallucination_error {
        println!("  verifier error: {}", err);
    }
    if let Some(err) = &result.guardrails.generation_error {
        println!("  generation error: {}", err);
    }
    println!();

    if result.citations.is_empty() {
        println!("No citations.");
    }
    for (i, citation) in result.citations.iter().enumerate() {
        println!(
            "{}. [{}] {} @ {}",
            i + 1,
            citation.message_id,
            citation.user_name,
            citation.timestamp.format("%Y-%m-%d %H:%M")
        );
        println!("    {}", citation.snippet);
    }
    Ok(())
}
