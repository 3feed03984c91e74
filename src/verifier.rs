//! Entailment-based answer verification.
//!
//! Each retrieved passage is scored as a premise against the generated
//! answer as hypothesis. The best entailment probability across passages is
//! the answer's support score.
//!
//! When the classifier is unavailable the verifier fails open: the verdict
//! is `supported = true, score = 0.5` with the failure recorded in
//! [`Verdict::error`], which is surfaced to callers through the answer's
//! guardrails.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::config::VerifierConfig;
use crate::http::{build_client, send_with_retry, RetryPolicy};

/// Score reported when the classifier fails.
pub const FAIL_OPEN_SCORE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub score: f64,
}

#[async_trait]
pub trait NliClassifier: Send + Sync {
    /// Label distribution for `(premise, hypothesis)`.
    async fn classify(&self, premise: &str, hypothesis: &str) -> Result<Vec<LabelScore>>;
}

/// Score of the first label containing `"entail"` (any case), else 0.
pub fn extract_entailment(scores: &[LabelScore]) -> f64 {
    scores
        .iter()
        .find(|s| s.label.to_lowercase().contains("entail"))
        .map(|s| s.score)
        .unwrap_or(0.0)
}

/// Accepts `[{label, score}]`, `[[{label, score}]]` or a single object.
fn parse_label_scores(json: Value) -> Result<Vec<LabelScore>> {
    let candidates = match json {
        Value::Array(mut items) => {
            if matches!(items.first(), Some(Value::Array(_))) {
                items.swap_remove(0)
            } else {
                Value::Array(items)
            }
        }
        object @ Value::Object(_) => Value::Array(vec![object]),
        other => bail!("Invalid NLI response: {}", other),
    };
    serde_json::from_value(candidates).map_err(|e| anyhow!("Invalid NLI response: {}", e))
}

/// Unavailable classifier; every call fails.
pub struct DisabledClassifier;

#[async_trait]
impl NliClassifier for DisabledClassifier {
    async fn classify(&self, _premise: &str, _hypothesis: &str) -> Result<Vec<LabelScore>> {
        bail!("NLI classifier is disabled")
    }
}

/// Text-classification endpoint in the Hugging Face inference format.
///
/// Posts `{"inputs": {"text": premise, "text_pair": hypothesis}}`.
pub struct HttpNliClassifier {
    url: String,
    model: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpNliClassifier {
    pub fn new(config: &VerifierConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow!("verifier.url required for http verifier"))?;
        Ok(Self {
            url,
            model: config.model.clone(),
            client: build_client(config.timeout_secs)?,
            policy: RetryPolicy::provider(1),
        })
    }
}

#[async_trait]
impl NliClassifier for HttpNliClassifier {
    async fn classify(&self, premise: &str, hypothesis: &str) -> Result<Vec<LabelScore>> {
        let body = serde_json::json!({
            "inputs": {"text": premise, "text_pair": hypothesis},
            "parameters": {"top_k": null, "truncation": true},
        });
        let response = send_with_retry("NLI classifier", self.policy, || {
            let req = self.client.post(&self.url).json(&body);
            match std::env::var("HF_API_TOKEN") {
                Ok(token) => req.bearer_auth(token),
                Err(_) => req,
            }
        })
        .await?;
        let json: Value = response.json().await?;
        tracing::debug!(model = %self.model, "verifier.classified");
        parse_label_scores(json)
    }
}

pub fn create_classifier(config: &VerifierConfig) -> Result<Box<dyn NliClassifier>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledClassifier)),
        "http" => Ok(Box::new(HttpNliClassifier::new(config)?)),
        other => bail!("Unknown verifier provider: {}", other),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub supported: bool,
    pub score: f64,
    pub evaluated_documents: usize,
    pub error: Option<String>,
}

pub struct EntailmentVerifier {
    classifier: Arc<dyn NliClassifier>,
    threshold: f64,
}

impl EntailmentVerifier {
    pub fn new(classifier: Arc<dyn NliClassifier>, threshold: f64) -> Self {
        Self {
            classifier,
            threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub async fn evaluate(&self, answer: &str, passages: &[&str]) -> Verdict {
        if passages.is_empty() {
            return Verdict {
                supported: false,
                score: 0.0,
                evaluated_documents: 0,
                error: None,
            };
        }

        match self.score_passages(answer, passages).await {
            Ok(scores) => {
                let best = scores.iter().copied().fold(0.0f64, f64::max);
                let verdict = Verdict {
                    supported: best >= self.threshold,
                    score: best,
                    evaluated_documents: scores.len(),
                    error: None,
                };
                tracing::debug!(
                    supported = verdict.supported,
                    score = verdict.score,
                    documents = verdict.evaluated_documents,
                    "verifier.verdict"
                );
                verdict
            }
            Err(e) => {
                tracing::warn!(error = %e, "verifier.failed");
                Verdict {
                    supported: true,
                    score: FAIL_OPEN_SCORE,
                    evaluated_documents: 0,
                    error: Some(format!("{:#}", e)),
                }
            }
        }
    }

    async fn score_passages(&self, answer: &str, passages: &[&str]) -> Result<Vec<f64>> {
        let mut scores = Vec::with_capacity(passages.len());
        for passage in passages {
            let labels = self.classifier.classify(passage, answer).await?;
            scores.push(extract_entailment(&labels));
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Entailment score looked up by premise substring.
    struct KeywordClassifier {
        rules: Vec<(&'static str, f64)>,
    }

    #[async_trait]
    impl NliClassifier for KeywordClassifier {
        async fn classify(&self, premise: &str, _hypothesis: &str) -> Result<Vec<LabelScore>> {
            let score = self
                .rules
                .iter()
                .find(|(kw, _)| premise.contains(kw))
                .map(|(_, s)| *s)
                .unwrap_or(0.0);
            Ok(vec![
                LabelScore {
                    label: "CONTRADICTION".to_string(),
                    score: 1.0 - score,
                },
                LabelScore {
                    label: "ENTAILMENT".to_string(),
                    score,
                },
            ])
        }
    }

    fn verifier(rules: Vec<(&'static str, f64)>) -> EntailmentVerifier {
        EntailmentVerifier::new(Arc::new(KeywordClassifier { rules }), 0.55)
    }

    #[test]
    fn test_extract_entailment() {
        let scores = vec![
            LabelScore {
                label: "neutral".to_string(),
                score: 0.2,
            },
            LabelScore {
                label: "Entailment".to_string(),
                score: 0.7,
            },
        ];
        assert_eq!(extract_entailment(&scores), 0.7);
        assert_eq!(extract_entailment(&scores[..1]), 0.0);
    }

    #[test]
    fn test_parse_label_score_shapes() {
        let flat = serde_json::json!([{"label": "entailment", "score": 0.9}]);
        let nested = serde_json::json!([[{"label": "entailment", "score": 0.9}]]);
        let single = serde_json::json!({"label": "entailment", "score": 0.9});
        for json in [flat, nested, single] {
            let parsed = parse_label_scores(json).unwrap();
            assert_eq!(extract_entailment(&parsed), 0.9);
        }
        assert!(parse_label_scores(serde_json::json!("oops")).is_err());
    }

    #[tokio::test]
    async fn test_no_passages_unsupported() {
        let verdict = verifier(vec![]).evaluate("answer", &[]).await;
        assert!(!verdict.supported);
        assert_eq!(verdict.score, 0.0);
        assert_eq!(verdict.evaluated_documents, 0);
        assert!(verdict.error.is_none());
    }

    #[tokio::test]
    async fn test_best_passage_wins() {
        let verdict = verifier(vec![("London", 0.8), ("Paris", 0.3)])
            .evaluate("June in London", &["Paris trip", "London trip", "other"])
            .await;
        assert!(verdict.supported);
        assert_eq!(verdict.score, 0.8);
        assert_eq!(verdict.evaluated_documents, 3);
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let v = verifier(vec![("x", 0.55)]);
        assert!(v.evaluate("a", &["x"]).await.supported);
        let v = verifier(vec![("x", 0.54)]);
        assert!(!v.evaluate("a", &["x"]).await.supported);
    }

    #[tokio::test]
    async fn test_classifier_failure_fails_open() {
        let v = EntailmentVerifier::new(Arc::new(DisabledClassifier), 0.55);
        let verdict = v.evaluate("answer", &["passage"]).await;
        assert!(verdict.supported);
        assert_eq!(verdict.score, FAIL_OPEN_SCORE);
        assert_eq!(verdict.evaluated_documents, 0);
        assert!(verdict.error.unwrap().contains("disabled"));
    }
}
