//! Ollama-backed evaluator.
//!
//! Sends one chat request per dimension and parses the reply as a JSON
//! judgment.

use super::{EvaluationError, Evaluator};
use crate::models::{DimensionDescriptor, Judgment};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Configuration for the Ollama client.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub ollama_url: String,
    pub model_name: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model_name: "llama3.2:latest".to_string(),
            temperature: 0.1,
            timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: String,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Evaluator that scores dimensions with a local or remote Ollama model.
pub struct OllamaEvaluator {
    config: OllamaConfig,
    http_client: reqwest::Client,
}

impl OllamaEvaluator {
    pub fn new(config: OllamaConfig) -> Result<Self, EvaluationError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| EvaluationError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    async fn send_prompt(&self, prompt: String) -> Result<String, EvaluationError> {
        let url = format!("{}/api/chat", self.config.ollama_url.trim_end_matches('/'));

        let request = OllamaChatRequest {
            model: self.config.model_name.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
            stream: false,
            format: "json".to_string(),
            options: OllamaOptions {
                temperature: self.config.temperature,
            },
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EvaluationError::Timeout(self.config.timeout_seconds)
                } else if e.is_connect() {
                    EvaluationError::Transport(format!(
                        "Cannot connect to Ollama at {}",
                        self.config.ollama_url
                    ))
                } else {
                    EvaluationError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EvaluationError::Api { status, body });
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| EvaluationError::Malformed(format!("Failed to parse Ollama response: {}", e)))?;

        Ok(chat_response.message.content)
    }
}

#[async_trait]
impl Evaluator for OllamaEvaluator {
    async fn evaluate(
        &self,
        dimension: &DimensionDescriptor,
        context: &str,
    ) -> Result<Judgment, EvaluationError> {
        debug!("Evaluating dimension {} with {}", dimension.id, self.config.model_name);
        let reply = self.send_prompt(build_prompt(dimension, context)).await?;
        parse_judgment(&reply)
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }
}

/// Build the user prompt for one dimension.
pub fn build_prompt(dimension: &DimensionDescriptor, context: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "Evaluate the business below on one dimension: {} ({}).\n",
        dimension.title, dimension.category
    ));
    if !dimension.guidance.is_empty() {
        prompt.push_str(&format!("Focus: {}\n", dimension.guidance));
    }
    prompt.push_str("\nRespond with a single JSON object:\n");
    prompt.push_str(r#"{"score": 0-100, "findings": ["..."], "redFlags": ["..."], "strengths": ["..."], "followUpQuestions": ["..."]}"#);
    prompt.push_str("\n\n=== BUSINESS CONTEXT ===\n\n");
    prompt.push_str(context);
    prompt.push_str("\n\n=== END OF CONTEXT ===\n");
    prompt
}

/// Extract a judgment from a model reply.
///
/// Accepts surrounding prose or code fences, clamps the score to 0-100 and
/// treats missing lists as empty.
pub fn parse_judgment(reply: &str) -> Result<Judgment, EvaluationError> {
    let start = reply
        .find('{')
        .ok_or_else(|| EvaluationError::Malformed("no JSON object in reply".to_string()))?;
    let end = reply
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| EvaluationError::Malformed("unterminated JSON object".to_string()))?;

    let json: Value = serde_json::from_str(&reply[start..=end])
        .map_err(|e| EvaluationError::Malformed(e.to_string()))?;

    let score = json
        .get("score")
        .and_then(Value::as_f64)
        .ok_or_else(|| EvaluationError::Malformed("missing numeric score".to_string()))?;

    Ok(Judgment {
        score: score.round().clamp(0.0, 100.0) as u8,
        findings: string_list(&json, "findings"),
        red_flags: string_list(&json, "redFlags"),
        strengths: string_list(&json, "strengths"),
        follow_up_questions: string_list(&json, "followUpQuestions"),
    })
}

fn string_list(json: &Value, key: &str) -> Vec<String> {
    json.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// System prompt for dimension scoring
const SYSTEM_PROMPT: &str = r#"You are an experienced venture analyst.
You score one evaluation dimension at a time from 0 (absent) to 100 (exemplary),
citing only evidence present in the supplied context.
Ask follow-up questions for anything the context does not cover.
Only output valid JSON, no explanations or markdown."#;
