//! Text moderation adapter.
//!
//! Wraps the cloud text-moderation service and adds an in-process
//! deny-list of promotional / contact-leak phrases that always runs: a
//! deny-list hit forces a review even when the service passes the text.
//! Texts beyond the provider's 600-character hard limit are split into
//! ≤500-character chunks; the overall verdict is the AND over chunks.

use crate::config::ModerationConfig;
use crate::{Result, error::RetubeError};
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

/// Provider hard limit per call, characters.
const PROVIDER_CHAR_LIMIT: usize = 600;
/// Chunk size used when splitting long texts.
const CHUNK_CHARS: usize = 500;

/// Promotional / contact-leak phrases that always force a manual review.
const DENY_LIST: &[&str] = &[
    "订阅", "关注", "点击链接", "私信", "微信", "联系我", "更多资源",
    "加我", "添加", "群号", "公众号", "频道", "欢迎", "来撩", "加+",
    "投稿", "打赏", "赞助", "咨询", "购买", "出售", "售卖", "广告",
    "优惠", "抽奖", "免费", "特价", "淘宝", "店铺", "联系方式", "联系电话",
    "客服", "营销", "推广", "引流", "商务合作", "官网", "活动", "链接",
];

/// Fixed label descriptions; unknown labels pass through untouched.
const LABEL_DESCRIPTIONS: &[(&str, &str)] = &[
    ("political_content", "涉政内容"),
    ("sexual_content", "色情低俗"),
    ("violence", "暴恐内容"),
    ("contraband", "违禁内容"),
    ("ad", "商业广告"),
    ("abuse", "辱骂内容"),
    ("spam", "垃圾信息"),
    ("religion", "宗教内容"),
    ("pt_to_contact", "疑似引流广告词汇"),
    ("suspected_contact_leak", "疑似引流广告词汇"),
];

/// One moderation finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationDetail {
    /// Provider label or the local deny-list label.
    pub label: String,
    /// Human-readable description mapped from the label.
    pub description: String,
    /// Provider confidence 0-100, when given.
    pub confidence: Option<f64>,
    /// `pass`, `review`, or `block`.
    pub suggestion: String,
    /// Short free-text reason.
    pub reason: String,
}

/// Aggregate moderation outcome; serialized into the task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationOutcome {
    /// Overall verdict; `false` routes the task to manual review.
    pub pass: bool,
    /// Findings across chunks and the deny-list.
    pub details: Vec<ModerationDetail>,
}

impl ModerationOutcome {
    fn passing() -> Self {
        Self {
            pass: true,
            details: Vec::new(),
        }
    }
}

/// Map a label to its fixed description; unknown labels pass through.
fn describe_label(label: &str) -> String {
    LABEL_DESCRIPTIONS
        .iter()
        .find(|(l, _)| *l == label)
        .map(|(_, d)| d.to_string())
        .unwrap_or_else(|| label.to_string())
}

/// Client of the cloud text-moderation service.
pub struct ModerationClient {
    client: Client,
    config: ModerationConfig,
}

impl ModerationClient {
    /// Create a client; fails when the access keys are absent so the
    /// engine can skip the stage with a warning instead of failing tasks.
    pub fn from_config(config: &ModerationConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty()
            || config.access_key_id.is_none()
            || config.access_key_secret.is_none()
        {
            return Err(RetubeError::config("moderation service is not configured"));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RetubeError::moderation_api(format!("HTTP client build failed: {}", e)))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Moderate one text with chunking and the local deny-list.
    pub async fn moderate_text(&self, text: &str, service_type: &str) -> Result<ModerationOutcome> {
        let text = text.trim();
        if text.is_empty() {
            debug!("Empty text, moderation passes trivially");
            return Ok(ModerationOutcome::passing());
        }

        let deny_hits: Vec<&str> = DENY_LIST.iter().filter(|w| text.contains(*w)).copied().collect();
        if !deny_hits.is_empty() {
            warn!("Deny-list hit: {}", deny_hits.join(", "));
        }

        let char_len = text.chars().count();
        let mut outcome = if char_len > PROVIDER_CHAR_LIMIT {
            self.moderate_long(text, service_type).await?
        } else {
            self.moderate_chunk(text, service_type).await?
        };

        // The deny-list overrides a service pass; hits always demand a
        // human look even when the provider saw nothing.
        if !deny_hits.is_empty() && outcome.pass {
            outcome.pass = false;
            let shown: Vec<&str> = deny_hits.iter().take(5).copied().collect();
            let ellipsis = if deny_hits.len() > 5 { "..." } else { "" };
            outcome.details.push(ModerationDetail {
                label: "suspected_contact_leak".into(),
                description: describe_label("suspected_contact_leak"),
                confidence: Some(95.0),
                suggestion: "review".into(),
                reason: format!("检测到潜在引流/广告词汇: {}{}", shown.join(", "), ellipsis),
            });
        }
        Ok(outcome)
    }

    async fn moderate_long(&self, text: &str, service_type: &str) -> Result<ModerationOutcome> {
        let chars: Vec<char> = text.chars().collect();
        let mut merged = ModerationOutcome::passing();
        let chunk_count = chars.len().div_ceil(CHUNK_CHARS);
        info!(
            "Text of {} chars split into {} moderation chunks",
            chars.len(),
            chunk_count
        );
        for chunk in chars.chunks(CHUNK_CHARS) {
            let piece: String = chunk.iter().collect();
            let result = self.moderate_chunk(&piece, service_type).await?;
            merged.pass = merged.pass && result.pass;
            merged.details.extend(result.details);
        }
        Ok(merged)
    }

    async fn moderate_chunk(&self, text: &str, service_type: &str) -> Result<ModerationOutcome> {
        let body = json!({
            "service": service_type,
            "serviceParameters": {"content": text},
        });
        let response = self
            .client
            .post(self.config.endpoint.trim_end_matches('/'))
            .basic_auth(
                self.config.access_key_id.as_deref().unwrap_or(""),
                self.config.access_key_secret.as_deref(),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| RetubeError::moderation_api(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RetubeError::moderation_api(format!(
                "service returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| RetubeError::moderation_api(format!("response unparseable: {}", e)))?;
        Ok(parse_response(&value))
    }
}

/// Parse the provider response body into the aggregate outcome.
fn parse_response(value: &Value) -> ModerationOutcome {
    let mut outcome = ModerationOutcome::passing();
    let data = &value["data"];
    let risk_level = data["riskLevel"].as_str().unwrap_or("unknown");
    if matches!(risk_level, "high" | "middle") {
        outcome.pass = false;
    }

    if let Some(items) = data["result"].as_array() {
        for item in items {
            let label = item["label"].as_str().unwrap_or("unknown");
            if label == "nonLabel" {
                continue;
            }
            if label != "normal" {
                outcome.pass = false;
            }
            let mut risk_words: Vec<String> = Vec::new();
            match &item["riskWords"] {
                Value::String(s) => risk_words.extend(
                    s.split(',').map(str::trim).filter(|w| !w.is_empty()).map(str::to_string),
                ),
                Value::Array(items) => risk_words
                    .extend(items.iter().filter_map(Value::as_str).map(str::to_string)),
                _ => {}
            }
            let description = if !risk_words.is_empty() {
                format!("命中的风险词: {}", risk_words.join("，"))
            } else if let Some(api_desc) = item["description"].as_str() {
                api_desc.to_string()
            } else {
                describe_label(label)
            };
            let suggestion = match risk_level {
                "high" => "block",
                "middle" => "review",
                _ => "pass",
            };
            outcome.details.push(ModerationDetail {
                label: label.to_string(),
                description,
                confidence: item["confidence"].as_f64(),
                suggestion: suggestion.into(),
                reason: format!("风险等级: {}", risk_level),
            });
        }
    }

    if !outcome.pass && outcome.details.is_empty() {
        outcome.details.push(ModerationDetail {
            label: "unknown".into(),
            description: describe_label("unknown"),
            confidence: None,
            suggestion: "review".into(),
            reason: format!("未明确原因的风险，风险等级: {}", risk_level),
        });
    }
    if outcome.pass && outcome.details.is_empty() {
        outcome.details.push(ModerationDetail {
            label: "nonLabel".into(),
            description: "内容正常".into(),
            confidence: None,
            suggestion: "pass".into(),
            reason: format!("内容正常，风险等级: {}", risk_level),
        });
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn client(endpoint: String) -> ModerationClient {
        ModerationClient::from_config(&ModerationConfig {
            endpoint,
            access_key_id: Some("id".into()),
            access_key_secret: Some("secret".into()),
            service_type: "comment_detection".into(),
        })
        .unwrap()
    }

    fn clean_response() -> Value {
        json!({"code": 200, "data": {"riskLevel": "none", "result": [{"label": "nonLabel"}]}})
    }

    #[tokio::test]
    async fn test_clean_text_passes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(clean_response()))
            .mount(&server)
            .await;
        let outcome = client(server.uri())
            .moderate_text("a perfectly ordinary travel video", "comment_detection")
            .await
            .unwrap();
        assert!(outcome.pass);
        assert_eq!(outcome.details[0].label, "nonLabel");
    }

    #[tokio::test]
    async fn test_deny_list_overrides_service_pass() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(clean_response()))
            .mount(&server)
            .await;
        let outcome = client(server.uri())
            .moderate_text("精彩视频，加我微信了解更多", "comment_detection")
            .await
            .unwrap();
        assert!(!outcome.pass);
        assert!(
            outcome
                .details
                .iter()
                .any(|d| d.label == "suspected_contact_leak" && d.suggestion == "review")
        );
    }

    #[tokio::test]
    async fn test_high_risk_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "data": {"riskLevel": "high", "result": [
                    {"label": "ad", "confidence": 99.0, "riskWords": "低价,代购"}
                ]}
            })))
            .mount(&server)
            .await;
        let outcome = client(server.uri())
            .moderate_text("some text", "comment_detection")
            .await
            .unwrap();
        assert!(!outcome.pass);
        let detail = &outcome.details[0];
        assert_eq!(detail.label, "ad");
        assert_eq!(detail.suggestion, "block");
        assert!(detail.description.contains("低价"));
    }

    #[tokio::test]
    async fn test_long_text_chunks_and_ands() {
        let server = MockServer::start().await;
        // First chunk dirty, the rest clean; the AND makes the whole fail.
        Mock::given(method("POST"))
            .respond_with(move |req: &Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                let content = body["serviceParameters"]["content"].as_str().unwrap();
                if content.contains("坏词") {
                    ResponseTemplate::new(200).set_body_json(json!({
                        "code": 200,
                        "data": {"riskLevel": "middle", "result": [{"label": "spam"}]}
                    }))
                } else {
                    ResponseTemplate::new(200).set_body_json(json!({
                        "code": 200,
                        "data": {"riskLevel": "none", "result": [{"label": "nonLabel"}]}
                    }))
                }
            })
            .mount(&server)
            .await;
        let mut text = String::from("坏词");
        text.push_str(&"好".repeat(900));
        let outcome = client(server.uri())
            .moderate_text(&text, "comment_detection")
            .await
            .unwrap();
        assert!(!outcome.pass);
        // Details from both chunks are concatenated.
        assert!(outcome.details.len() >= 2);
    }

    #[tokio::test]
    async fn test_empty_text_passes_without_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"service": "comment_detection"})))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        let outcome = client(server.uri())
            .moderate_text("   ", "comment_detection")
            .await
            .unwrap();
        assert!(outcome.pass);
    }

    #[test]
    fn test_unknown_label_passes_through() {
        assert_eq!(describe_label("brand_new_label"), "brand_new_label");
        assert_eq!(describe_label("ad"), "商业广告");
    }
}
