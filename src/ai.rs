use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::AiError;

const SUMMARY_SYSTEM_PROMPT: &str = r#"You are an AI assistant that analyzes support conversations.
Your job is to:
1. Summarize the main issue or request
2. Identify key discussion points
3. Extract any action items or promises made
4. Determine the current status and next steps
5. Assess the urgency and sentiment

Respond in JSON format with the following structure:
{
    "summary": "Brief overview of the issue",
    "main_issue": "The core problem or request",
    "key_points": ["point 1", "point 2", ...],
    "action_items": ["action 1", "action 2", ...],
    "promises": ["promise 1", "promise 2", ...],
    "next_steps": "What should happen next",
    "urgency": "low|medium|high",
    "sentiment": "positive|neutral|negative",
    "suggested_tags": ["tag1", "tag2", ...]
}"#;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }
}

/// Structured result of a `full_extraction` job.
///
/// All fields are optional: the model is asked for the full shape but only
/// what it actually returned is stored. Unstructured output is carried via
/// the fallback form `{summary, raw_response}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThreadSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_issue: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_items: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub promises: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_steps: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urgency: Option<Urgency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_tags: Vec<String>,
    /// Set only on the fallback path, preserving the model's raw text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ThreadSummary {
    /// Parse a model response. Models wrap JSON in prose or code fences
    /// often enough that we extract the outermost braces before parsing.
    /// Anything that still fails to parse as the expected shape is wrapped
    /// as `{summary: text, raw_response: text}` — malformed model output is
    /// never an error.
    pub fn parse(content: &str) -> Self {
        let cleaned = match (content.find('{'), content.rfind('}')) {
            (Some(start), Some(end)) if start < end => &content[start..=end],
            _ => content,
        };
        match serde_json::from_str(cleaned) {
            Ok(summary) => summary,
            Err(_) => Self {
                summary: Some(content.to_string()),
                raw_response: Some(content.to_string()),
                ..Self::default()
            },
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.raw_response.is_some()
    }
}

/// Seam for the pipeline: anything that can turn a thread transcript into a
/// `ThreadSummary`. Production uses `AiClient`; tests substitute a stub.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> Result<ThreadSummary, AiError>;
}

/// Configuration for the text-generation endpoint.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_url: "https://ai.hackclub.com/proxy/v1/chat/completions".to_string(),
            api_key: None,
            model: "openai/gpt-4".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Minimal chat-completions client: one `POST` per call, bearer auth,
/// bounded timeout.
#[derive(Debug)]
pub struct AiClient {
    client: reqwest::Client,
    api_url: String,
    model: String,
}

impl AiClient {
    /// Build the client. Fails fast with `MissingApiKey` when the key is
    /// absent — no AI call is attempted without one.
    pub fn new(config: &AiConfig) -> Result<Self, AiError> {
        let key = match config.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => return Err(AiError::MissingApiKey),
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|e| AiError::MalformedResponse(format!("invalid API key header: {}", e)))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            model: config.model.clone(),
        })
    }

    /// One chat-completions round trip; returns the assistant message text.
    async fn chat(&self, system_prompt: &str, user_content: &str) -> Result<String, AiError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_content},
            ],
            "temperature": 0.7,
        });

        let resp = self.client.post(&self.api_url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AiError::UpstreamStatus {
                status: status.as_u16(),
            });
        }

        let parsed: ChatResponse = resp.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AiError::MalformedResponse("response carried no choices".to_string()))
    }
}

#[async_trait]
impl Summarizer for AiClient {
    async fn summarize(&self, transcript: &str) -> Result<ThreadSummary, AiError> {
        let user_content = format!("Analyze this support thread:\n\n{}", transcript);
        let content = self.chat(SUMMARY_SYSTEM_PROMPT, &user_content).await?;
        Ok(ThreadSummary::parse(&content))
    }
}

/// Stand-in summarizer for deployments without an API key: enqueueing still
/// works, but every summarization call fails fast with the precondition
/// error instead of reaching the network.
pub struct UnconfiguredSummarizer;

#[async_trait]
impl Summarizer for UnconfiguredSummarizer {
    async fn summarize(&self, _transcript: &str) -> Result<ThreadSummary, AiError> {
        Err(AiError::MissingApiKey)
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}
