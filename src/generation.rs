//! Text-generation providers.
//!
//! A [`GenerationProvider`] turns a [`Prompt`] (system text, prior turns and
//! the user message) into raw model output. Providers own their retry
//! policy; callers invoke `generate` exactly once per question.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::GenerationConfig;
use crate::http::{build_client, send_with_retry, RetryPolicy};
use crate::models::{ChatTurn, Role};

/// A fully rendered chat prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub history: Vec<ChatTurn>,
    pub user: String,
}

impl Prompt {
    /// OpenAI-style `messages` array, also accepted by Ollama's `/api/chat`.
    pub fn to_messages(&self) -> Vec<Value> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(json!({"role": "system", "content": self.system}));
        for turn in &self.history {
            let role = match turn.role {
                Role::User => "user",
                Role::Ai => "assistant",
            };
            messages.push(json!({"role": role, "content": turn.content}));
        }
        messages.push(json!({"role": "user", "content": self.user}));
        messages
    }
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &Prompt) -> Result<String>;
}

/// Used when `generation.provider = "disabled"`; every call fails.
pub struct DisabledGenerator;

#[async_trait]
impl GenerationProvider for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &Prompt) -> Result<String> {
        bail!("Generation provider is disabled")
    }
}

/// Chat completion through Ollama's `POST /api/chat` in JSON mode.
pub struct OllamaGenerator {
    model: String,
    url: String,
    temperature: f64,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            temperature: config.temperature,
            client: build_client(config.timeout_secs)?,
            policy: RetryPolicy::provider(config.max_retries),
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": prompt.to_messages(),
            "stream": false,
            "format": "json",
            "options": {"temperature": self.temperature},
        });
        let endpoint = format!("{}/api/chat", self.url.trim_end_matches('/'));
        let response = send_with_retry("Ollama API", self.policy, || {
            self.client.post(&endpoint).json(&body)
        })
        .await?;
        let json: Value = response.json().await?;
        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Invalid Ollama response: missing message.content"))
    }
}

/// OpenAI-compatible `POST /v1/chat/completions`.
///
/// Sends `OPENAI_API_KEY` as a bearer token when set, so local
/// OpenAI-compatible servers work without one.
pub struct OpenAIGenerator {
    model: String,
    url: String,
    temperature: f64,
    api_key: Option<String>,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            temperature: config.temperature,
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            client: build_client(config.timeout_secs)?,
            policy: RetryPolicy::provider(config.max_retries),
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": prompt.to_messages(),
            "temperature": self.temperature,
            "response_format": {"type": "json_object"},
        });
        let endpoint = format!("{}/v1/chat/completions", self.url.trim_end_matches('/'));
        let response = send_with_retry("OpenAI API", self.policy, || {
            let req = self.client.post(&endpoint).json(&body);
            match &self.api_key {
                Some(key) => req.bearer_auth(key),
                None => req,
            }
        })
        .await?;
        let json: Value = response.json().await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
    }
}

pub fn create_generator(config: &GenerationConfig) -> Result<Box<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledGenerator)),
        "ollama" => Ok(Box::new(OllamaGenerator::new(config)?)),
        "openai" => Ok(Box::new(OpenAIGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_messages_order_and_roles() {
        let prompt = Prompt {
            system: "sys".to_string(),
            history: vec![
                ChatTurn {
                    role: Role::User,
                    content: "earlier question".to_string(),
                },
                ChatTurn {
                    role: Role::Ai,
                    content: "earlier answer".to_string(),
                },
            ],
            user: "now".to_string(),
        };
        let messages = prompt.to_messages();
        let roles: Vec<&str> = messages
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(messages[3]["content"], "now");
    }

    #[tokio::test]
    async fn test_disabled_generator_errors() {
        let prompt = Prompt {
            system: String::new(),
            history: Vec::new(),
            user: "q".to_string(),
        };
        assert!(DisabledGenerator.generate(&prompt).await.is_err());
    }

    #[test]
    fn test_create_generator() {
        let mut config = GenerationConfig::default();
        assert_eq!(
            create_generator(&config).unwrap().model_name(),
            "mistral:instruct"
        );
        config.provider = "bogus".to_string();
        assert!(create_generator(&config).is_err());
    }
}
