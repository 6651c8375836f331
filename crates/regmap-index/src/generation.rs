//! Hypothetical passage generation for HyDE retrieval.
//!
//! A requirement is rewritten by a chat model into the kind of policy text
//! that would satisfy it. That passage is embedded and searched instead of
//! the raw requirement, bridging regulatory and internal-policy vocabulary.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default chat model for passage generation.
pub const DEFAULT_GENERATION_MODEL: &str = "gpt-4o-mini";

const HYDE_SYSTEM_PROMPT: &str = "You write internal information security policy text for a \
regulated financial institution. Given a regulatory requirement, write the policy section that \
would satisfy it: two or three sentences in formal policy language (\"The organization shall...\"), \
naming the relevant roles, controls and processes. Output only the policy text.";

/// Generates a hypothetical passage for a query.
#[async_trait]
pub trait PassageGenerator: Send + Sync {
    async fn generate(&self, query: &str) -> Result<String>;
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Chat completions-based generator for any OpenAI-compatible API.
pub struct ChatPassageGenerator {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

impl ChatPassageGenerator {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            model,
            api_key,
            max_tokens: 200,
            temperature: 0.3,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Strip a leading `<think>` block and surrounding whitespace.
    fn clean_passage(response: &str) -> String {
        let text = match response.rsplit_once("</think>") {
            Some((_, after_think)) => after_think,
            None => response,
        };
        text.trim().to_string()
    }
}

#[async_trait]
impl PassageGenerator for ChatPassageGenerator {
    async fn generate(&self, query: &str) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: HYDE_SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format!("Regulatory requirement: {}", query),
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut req_builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            req_builder = req_builder.bearer_auth(key);
        }

        let response = req_builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Generation API error ({}): {}", status.as_u16(), body));
        }

        let completion: ChatCompletionResponse = response.json().await?;
        let passage = completion
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .map(Self::clean_passage)
            .unwrap_or_default();

        if passage.is_empty() {
            return Err(anyhow!("Generation returned an empty passage"));
        }

        debug!(chars = passage.len(), "Generated hypothetical passage");
        Ok(passage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_passage() {
        assert_eq!(
            ChatPassageGenerator::clean_passage("  The organization shall enforce MFA. "),
            "The organization shall enforce MFA."
        );
        assert_eq!(
            ChatPassageGenerator::clean_passage("<think>plan</think>\nThe organization shall log."),
            "The organization shall log."
        );
        assert_eq!(ChatPassageGenerator::clean_passage("<think>only</think>"), "");
    }

    #[test]
    fn test_generator_new() {
        let generator = ChatPassageGenerator::new(
            "http://localhost:1234".to_string(),
            DEFAULT_GENERATION_MODEL.to_string(),
            None,
        )
        .with_max_tokens(128)
        .with_temperature(0.0);
        assert_eq!(generator.base_url, "http://localhost:1234");
        assert_eq!(generator.model, DEFAULT_GENERATION_MODEL);
        assert_eq!(generator.max_tokens, 128);
        assert!(generator.api_key.is_none());
    }

    #[test]
    fn test_prompt_asks_for_policy_language() {
        assert!(HYDE_SYSTEM_PROMPT.contains("The organization shall"));
    }
}
