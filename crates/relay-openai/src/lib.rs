//! OpenAI-compatible LLM gateway (`chat/completions`, OpenRouter by default).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use relay_core::{
    config::LlmConfig,
    errors::Error,
    model::{client::LlmGateway, types::ChatMessage},
    Result,
};

const DATE_PLACEHOLDER: &str = "{CURRENTDATE}";
const FIRST_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Clone, Debug)]
pub struct OpenAiCompatClient {
    api_key: String,
    model: String,
    endpoint: String,
    system_prompt: String,
    max_retries: u32,
    first_backoff: Duration,
    http: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(cfg: &LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::External(format!("http client build error: {e}")))?;
        Ok(Self {
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            system_prompt: cfg.system_prompt.clone(),
            max_retries: cfg.max_retries.max(1),
            first_backoff: FIRST_BACKOFF,
            http,
        })
    }

    /// First wait after a 429; doubles on every further attempt.
    pub fn with_first_backoff(mut self, backoff: Duration) -> Self {
        self.first_backoff = backoff;
        self
    }

    fn system_content(&self) -> String {
        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
        self.system_prompt.replace(DATE_PLACEHOLDER, &now)
    }

    async fn post_once(&self, body: &CompletionRequest<'_>) -> Result<Option<String>> {
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("request error: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Llm(format!(
                "completion failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let parsed: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| Error::Llm(format!("json error: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(Error::Llm("no content in completion".to_string()));
        }
        Ok(Some(content))
    }
}

/// System prompts first, then the history, then the user turn if any.
fn build_messages<'a>(
    system: &[&'a str],
    history: &'a [ChatMessage],
    user: Option<&'a str>,
) -> Vec<WireMessage<'a>> {
    let mut messages = Vec::with_capacity(history.len() + system.len() + 1);
    messages.extend(
        system
            .iter()
            .copied()
            .filter(|s| !s.trim().is_empty())
            .map(|s| WireMessage {
                role: "system",
                content: s,
            }),
    );
    messages.extend(history.iter().map(|m| WireMessage {
        role: m.role.as_str(),
        content: &m.content,
    }));
    if let Some(text) = user {
        messages.push(WireMessage {
            role: "user",
            content: text,
        });
    }
    messages
}

impl OpenAiCompatClient {
    async fn request(&self, messages: Vec<WireMessage<'_>>) -> Result<String> {
        let body = CompletionRequest {
            model: &self.model,
            messages,
        };

        let mut delay = self.first_backoff;
        for attempt in 1..=self.max_retries {
            if let Some(reply) = self.post_once(&body).await? {
                return Ok(reply);
            }
            tracing::warn!(
                attempt,
                retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                "llm rate limited"
            );
            if attempt < self.max_retries {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        Err(Error::Llm(format!(
            "rate limited after {} attempts",
            self.max_retries
        )))
    }
}

#[async_trait]
impl LlmGateway for OpenAiCompatClient {
    async fn complete(&self, history: &[ChatMessage], text: &str) -> Result<String> {
        let system = self.system_content();
        self.request(build_messages(&[system.as_str()], history, Some(text)))
            .await
    }

    async fn remind(&self, history: &[ChatMessage], instruction: &str) -> Result<String> {
        let system = self.system_content();
        self.request(build_messages(&[system.as_str(), instruction], history, None))
            .await
    }
}
