//! LLM chat-completions adapter.
//!
//! One thin client shared by translation, tagging, classification,
//! subtitle translation and QC judging. Requests ask for a forced JSON
//! object when the provider supports `response_format`; decoding always
//! goes through the same fallback chain (strip reasoning wrappers, strip
//! code fences, parse whole body, regex-extract an object or array), so
//! providers without structured output still work.

use crate::config::LlmConfig;
use crate::{Result, error::RetubeError};
use log::{debug, warn};
use regex::Regex;
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::OnceLock;
use std::time::Duration;

pub mod enhancer;
pub mod prompts;

pub use enhancer::{CategoryCatalog, Enhancer, FlatCategory};

fn think_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<\s*think\s*>.*?<\s*/\s*think\s*>").unwrap())
}

fn think_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)```\s*think[^\n]*\n.*?```").unwrap())
}

fn json_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").unwrap())
}

fn json_array_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\[.*\]").unwrap())
}

/// Remove reasoning-model thought wrappers before JSON parsing.
///
/// Handles `<think>…</think>` tags and ```think fenced blocks. This is a
/// textual wrapper, not a provider flag, so it lives here and not at the
/// call sites.
pub fn strip_reasoning_thoughts(text: &str) -> String {
    let cleaned = think_tag_re().replace_all(text, "");
    let cleaned = think_fence_re().replace_all(&cleaned, "");
    cleaned.trim().to_string()
}

/// Strip a surrounding markdown code fence, if present.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let without_open = trimmed
        .trim_start_matches('`')
        .trim_start_matches(|c: char| c.is_ascii_alphanumeric())
        .trim_start();
    without_open.trim_end_matches('`').trim().to_string()
}

/// Decode a model reply into JSON: whole-body parse first, then extraction
/// of the first object, then the first array.
pub fn extract_json(text: &str) -> Option<Value> {
    let cleaned = strip_code_fence(&strip_reasoning_thoughts(text));
    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return Some(value);
    }
    if let Some(m) = json_object_re().find(&cleaned) {
        if let Ok(value) = serde_json::from_str::<Value>(m.as_str()) {
            return Some(value);
        }
    }
    if let Some(m) = json_array_re().find(&cleaned) {
        if let Ok(value) = serde_json::from_str::<Value>(m.as_str()) {
            return Some(value);
        }
    }
    None
}

/// Validate an endpoint base URL before building a client.
fn validate_base_url(base_url: &str) -> Result<()> {
    let parsed = url::Url::parse(base_url)
        .map_err(|e| RetubeError::config(format!("Invalid base URL: {}", e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RetubeError::config(
            "Base URL must use http or https protocol",
        ));
    }
    if parsed.host().is_none() {
        return Err(RetubeError::config("Base URL must contain a valid hostname"));
    }
    Ok(())
}

/// OpenAI-compatible chat client.
#[derive(Debug, Clone)]
pub struct ChatClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    retry_attempts: u32,
    retry_delay_ms: u64,
}

impl ChatClient {
    /// Create a client from the unified configuration.
    ///
    /// Fails when the API key is absent; callers treat that as the
    /// feature being disabled rather than a task failure.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .as_ref()
            .ok_or_else(|| RetubeError::config("Missing LLM API key"))?;
        Self::new(
            config.base_url.clone(),
            api_key.clone(),
            config.model.clone(),
            config.temperature,
            config.retry_attempts,
            config.retry_delay_ms,
        )
    }

    /// Create a client with explicit settings (used by the subtitle
    /// translator's endpoint overrides).
    pub fn new(
        base_url: String,
        api_key: String,
        model: String,
        temperature: f32,
        retry_attempts: u32,
        retry_delay_ms: u64,
    ) -> Result<Self> {
        validate_base_url(&base_url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| RetubeError::llm_service(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            temperature,
            retry_attempts,
            retry_delay_ms,
        })
    }

    /// Model name this client sends.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Issue a chat completion expecting a JSON object back.
    ///
    /// `response_format = json_object` is requested; on a 4xx complaining
    /// about it the request is replayed without the flag, and the decode
    /// fallback picks the object out of free text.
    pub async fn chat_json(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<Value> {
        let raw = match self.chat_raw(system, user, max_tokens, true).await {
            Ok(raw) => raw,
            Err(e) => {
                // Providers without structured output reject the flag
                // outright; retry plain once before giving up.
                let text = e.to_string().to_lowercase();
                if text.contains("response_format") || text.contains("json_object") {
                    debug!("Provider rejected response_format, retrying without it");
                    self.chat_raw(system, user, max_tokens, false).await?
                } else {
                    return Err(e);
                }
            }
        };
        extract_json(&raw).ok_or_else(|| {
            RetubeError::llm_service(format!(
                "no JSON found in model reply: {}",
                raw.chars().take(200).collect::<String>()
            ))
        })
    }

    /// Issue a chat completion and return the raw text content.
    pub async fn chat_raw(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        force_json: bool,
    ) -> Result<String> {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": self.temperature,
            "max_tokens": max_tokens,
        });
        if force_json {
            body["response_format"] = json!({"type": "json_object"});
        }

        let mut attempts = 0u32;
        loop {
            let result = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    let value: Value = response.json().await?;
                    return Ok(Self::content_from_response(&value));
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    // 5xx are transient; 4xx are not worth retrying.
                    if status.is_server_error() && attempts < self.retry_attempts {
                        attempts += 1;
                        warn!("LLM request got {}, retry {}", status, attempts);
                        tokio::time::sleep(Duration::from_millis(self.retry_delay_ms)).await;
                        continue;
                    }
                    return Err(RetubeError::llm_service(format!(
                        "chat completion failed {}: {}",
                        status,
                        text.chars().take(300).collect::<String>()
                    )));
                }
                Err(e) if attempts < self.retry_attempts => {
                    attempts += 1;
                    warn!("LLM request error ({}), retry {}", e, attempts);
                    tokio::time::sleep(Duration::from_millis(self.retry_delay_ms)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pull the assistant text out of a completion response, tolerating
    /// providers that return `content` as a segment list or only populate
    /// `reasoning_content`.
    fn content_from_response(value: &Value) -> String {
        let message = &value["choices"][0]["message"];
        if let Some(text) = message["content"].as_str() {
            return text.to_string();
        }
        if let Some(segments) = message["content"].as_array() {
            return segments
                .iter()
                .filter_map(|seg| seg["text"].as_str())
                .collect::<Vec<_>>()
                .join("");
        }
        message["reasoning_content"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_strip_reasoning_thoughts() {
        let input = "<think>let me reason\nabout this</think>{\"a\":1}";
        assert_eq!(strip_reasoning_thoughts(input), "{\"a\":1}");
        let fenced = "```think\nhidden reasoning\n```\n{\"a\":2}";
        assert_eq!(strip_reasoning_thoughts(fenced), "{\"a\":2}");
        assert_eq!(strip_reasoning_thoughts("plain"), "plain");
    }

    #[test]
    fn test_base_url_validation() {
        assert!(validate_base_url("https://api.openai.com/v1").is_ok());
        assert!(validate_base_url("http://127.0.0.1:8000/v1").is_ok());
        let err = ChatClient::new("ftp://invalid.url".into(), "k".into(), "m".into(), 0.3, 0, 0)
            .unwrap_err();
        assert!(err.to_string().contains("http or https"));
        assert!(validate_base_url("not a url").is_err());
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"x\":1}\n```"), "{\"x\":1}");
        assert_eq!(strip_code_fence("{\"x\":1}"), "{\"x\":1}");
    }

    #[test]
    fn test_extract_json_fallback_chain() {
        assert_eq!(extract_json("{\"a\":1}").unwrap()["a"], 1);
        assert_eq!(
            extract_json("the answer is {\"a\":2} hope that helps").unwrap()["a"],
            2
        );
        let arr = extract_json("tags: [\"x\",\"y\"]").unwrap();
        assert_eq!(arr[0], "x");
        assert!(extract_json("no json here").is_none());
    }

    #[tokio::test]
    async fn test_chat_json_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "{\"translation\":\"你好\"}"}}]
            })))
            .mount(&server)
            .await;
        let client =
            ChatClient::new(server.uri(), "test-key".into(), "m".into(), 0.3, 0, 0).unwrap();
        let value = client.chat_json("sys", "user", 100).await.unwrap();
        assert_eq!(value["translation"], "你好");
    }

    #[tokio::test]
    async fn test_chat_json_strips_think_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "<think>hmm</think>{\"tags\":[\"a\"]}"}}]
            })))
            .mount(&server)
            .await;
        let client = ChatClient::new(server.uri(), "k".into(), "m".into(), 0.3, 0, 0).unwrap();
        let value = client.chat_json("sys", "user", 100).await.unwrap();
        assert_eq!(value["tags"][0], "a");
    }

    #[tokio::test]
    async fn test_chat_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "{\"ok\":true}"}}]
            })))
            .mount(&server)
            .await;
        let client = ChatClient::new(server.uri(), "k".into(), "m".into(), 0.3, 2, 0).unwrap();
        let value = client.chat_json("sys", "user", 50).await.unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn test_chat_gives_up_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let client = ChatClient::new(server.uri(), "k".into(), "m".into(), 0.3, 1, 0).unwrap();
        assert!(client.chat_json("sys", "user", 50).await.is_err());
    }

    #[test]
    fn test_content_from_segment_list() {
        let value = json!({
            "choices": [{"message": {"content": [
                {"type": "text", "text": "part one "},
                {"type": "text", "text": "part two"}
            ]}}]
        });
        assert_eq!(ChatClient::content_from_response(&value), "part one part two");
    }
}
