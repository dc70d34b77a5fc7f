//! Batched subtitle translation with repair passes.
//!
//! Cues are translated in fixed-size batches on a bounded worker pool.
//! The reply must echo the batch length; mismatches are right-padded and
//! truncated rather than failed. Two repair passes follow the main sweep:
//! the first re-requests likely-untranslated cues in smaller sub-batches,
//! the second switches to a strict prompt that forbids retaining the
//! source text. Translation never fails the pipeline; the worst case is
//! the original text passing through.

use crate::config::SubtitleConfig;
use crate::core::subtitle::{Cue, non_cjk_ratio};
use crate::services::llm::{ChatClient, prompts};
use crate::services::memory_pressure_high;
use crate::Result;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use regex::Regex;
use serde_json::{Value, json};
use std::sync::OnceLock;
use std::time::Duration;

fn leading_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?:\d+[.)、]\s*|[-•*]\s+)").unwrap())
}

/// Per-cue translation progress callback: (done, total).
pub type ProgressFn = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Batched subtitle translator.
pub struct SubtitleTranslator {
    client: ChatClient,
    config: SubtitleConfig,
    target_language: String,
    configured_max_workers: usize,
}

impl SubtitleTranslator {
    /// Create a translator.
    pub fn new(
        client: ChatClient,
        config: SubtitleConfig,
        target_language: String,
        configured_max_workers: usize,
    ) -> Self {
        Self {
            client,
            config,
            target_language,
            configured_max_workers: configured_max_workers.max(1),
        }
    }

    /// Translate all cues, preserving count and order.
    ///
    /// The returned vector always has the same length as the input.
    pub async fn translate_cues(
        &self,
        cues: &[Cue],
        progress: Option<ProgressFn>,
    ) -> Result<Vec<Cue>> {
        if cues.is_empty() {
            return Ok(Vec::new());
        }
        let batch_size = self.config.batch_size.max(1);
        let batch_count = cues.len().div_ceil(batch_size);
        let mut workers = self.configured_max_workers.min(batch_count).max(1);
        if memory_pressure_high() {
            workers = (workers / 2).max(1);
            info!("High memory usage, translation workers halved to {}", workers);
        }
        info!(
            "Translating {} cues in {} batches of {} with {} workers",
            cues.len(),
            batch_count,
            batch_size,
            workers
        );

        let sources: Vec<String> = cues.iter().map(|c| c.text.clone()).collect();
        let batches: Vec<(usize, Vec<String>)> = sources
            .chunks(batch_size)
            .enumerate()
            .map(|(i, chunk)| (i * batch_size, chunk.to_vec()))
            .collect();

        let done = std::sync::atomic::AtomicUsize::new(0);
        let total = cues.len();
        let results: Vec<(usize, Vec<String>)> = stream::iter(batches)
            .map(|(start, texts)| {
                let done = &done;
                let progress = &progress;
                async move {
                    let translated = self.translate_batch(&texts, false).await;
                    let completed =
                        done.fetch_add(texts.len(), std::sync::atomic::Ordering::SeqCst)
                            + texts.len();
                    if let Some(cb) = progress {
                        cb(completed, total);
                    }
                    (start, translated)
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut translated = sources.clone();
        for (start, batch) in results {
            for (i, text) in batch.into_iter().enumerate() {
                if start + i < translated.len() {
                    translated[start + i] = text;
                }
            }
        }

        // Repair pass 1: smaller sub-batches for cues that look
        // untranslated.
        let suspects = find_untranslated(&sources, &translated);
        if !suspects.is_empty() {
            info!("Repair pass 1: {} cues look untranslated", suspects.len());
            let sub_batch = (batch_size / 2).max(1);
            for chunk in suspects.chunks(sub_batch) {
                let texts: Vec<String> =
                    chunk.iter().map(|&i| sources[i].clone()).collect();
                let repaired = self.translate_batch(&texts, false).await;
                for (&index, text) in chunk.iter().zip(repaired) {
                    if !text.trim().is_empty() {
                        translated[index] = text;
                    }
                }
            }
        }

        // Repair pass 2: strict mode for whatever survived pass 1.
        let stubborn = find_untranslated(&sources, &translated);
        if !stubborn.is_empty() {
            info!("Repair pass 2 (strict): {} cues still untranslated", stubborn.len());
            for chunk in stubborn.chunks(1) {
                let texts: Vec<String> =
                    chunk.iter().map(|&i| sources[i].clone()).collect();
                let repaired = self.translate_batch(&texts, true).await;
                for (&index, text) in chunk.iter().zip(repaired) {
                    if !text.trim().is_empty() {
                        translated[index] = text;
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(cues.len());
        for (cue, text) in cues.iter().zip(translated) {
            let sanitized = sanitize_text(&text);
            let final_text = if sanitized.is_empty() {
                cue.text.clone()
            } else {
                sanitized
            };
            out.push(Cue::new(cue.start_s, cue.end_s, final_text));
        }
        Ok(out)
    }

    /// Translate one batch, padding/truncating the reply to the request
    /// length. The final fallback is the source text.
    async fn translate_batch(&self, texts: &[String], strict: bool) -> Vec<String> {
        let payload = json!({ "texts": texts }).to_string();
        let (system, user) = if strict {
            prompts::translate_subtitle_strict(&payload, &self.target_language)
        } else {
            prompts::translate_subtitle_batch(&payload, &self.target_language)
        };

        let mut attempt = 0u32;
        loop {
            match self.client.chat_json(&system, &user, 4096).await {
                Ok(value) => {
                    if let Some(mut translations) = parse_translations(&value) {
                        // Right-pad and truncate to the batch length.
                        translations.resize(texts.len(), String::new());
                        return translations;
                    }
                    warn!("Translation reply had no usable translations array");
                }
                Err(e) => warn!("Batch translation failed: {}", e),
            }
            if attempt >= self.config.max_retries {
                debug!("Batch exhausted retries, falling back to source text");
                return texts.to_vec();
            }
            attempt += 1;
            tokio::time::sleep(Duration::from_secs_f64(self.config.retry_delay_s.max(0.0)))
                .await;
        }
    }
}

fn parse_translations(value: &Value) -> Option<Vec<String>> {
    let items = value["translations"]
        .as_array()
        .or_else(|| value.as_array())?;
    Some(
        items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
    )
}

/// Indices of cues that look untranslated: empty, identical to the
/// source, or mostly non-CJK text.
fn find_untranslated(sources: &[String], translated: &[String]) -> Vec<usize> {
    sources
        .iter()
        .zip(translated)
        .enumerate()
        .filter(|(_, (source, text))| {
            let text = text.trim();
            text.is_empty() || text == source.trim() || non_cjk_ratio(text) > 0.8
        })
        .map(|(i, _)| i)
        .collect()
}

/// Sanitize a translated cue: clean each line and collapse identical
/// consecutive lines.
fn sanitize_text(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let line = sanitize_line(raw);
        if line.is_empty() {
            continue;
        }
        if lines.last().map(|l| l == &line).unwrap_or(false) {
            debug!("Dropping duplicated translation line");
            continue;
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// Clean one translated line: numbering, bullets, wrapping quotes,
/// trailing punctuation, carriage returns.
fn sanitize_line(text: &str) -> String {
    let mut line = text.replace('\r', "");
    line = leading_number_re().replace(&line, "").into_owned();
    let line = line.trim();
    let line = line
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| line.strip_prefix('“').and_then(|s| s.strip_suffix('”')))
        .or_else(|| line.strip_prefix('「').and_then(|s| s.strip_suffix('」')))
        .or_else(|| line.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(line);
    line.trim()
        .trim_end_matches(['，', ',', '。', '.'])
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn cues(texts: &[&str]) -> Vec<Cue> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Cue::new(i as f64, i as f64 + 1.0, *t))
            .collect()
    }

    fn translator(uri: String, batch_size: usize, max_retries: u32) -> SubtitleTranslator {
        let client = ChatClient::new(uri, "k".into(), "m".into(), 0.3, 0, 0).unwrap();
        SubtitleTranslator::new(
            client,
            SubtitleConfig {
                batch_size,
                max_retries,
                retry_delay_s: 0.0,
                ..Default::default()
            },
            "简体中文".into(),
            2,
        )
    }

    #[test]
    fn test_sanitize_line() {
        assert_eq!(sanitize_line("1. 你好。"), "你好");
        assert_eq!(sanitize_line("- 列表项，"), "列表项");
        assert_eq!(sanitize_line("\"quoted\""), "quoted");
        assert_eq!(sanitize_line("「引用」"), "引用");
        assert_eq!(sanitize_line("正常内容"), "正常内容");
        assert_eq!(sanitize_line("line\r"), "line");
    }

    #[test]
    fn test_sanitize_text_dedupes_consecutive_lines() {
        assert_eq!(sanitize_text("同一行\n同一行\n不同行"), "同一行\n不同行");
        assert_eq!(sanitize_text("\r\n  \n内容。"), "内容");
    }

    #[test]
    fn test_find_untranslated_flags() {
        let sources = vec![
            "hello world".to_string(),
            "good morning".to_string(),
            "see you".to_string(),
        ];
        let translated = vec![
            "hello world".to_string(),   // identical
            "早上好".to_string(),         // fine
            "mostly english text".to_string(), // non-CJK share > 0.8
        ];
        assert_eq!(find_untranslated(&sources, &translated), vec![0, 2]);
    }

    #[tokio::test]
    async fn test_translate_preserves_count_and_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(move |req: &Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                let user = body["messages"][1]["content"].as_str().unwrap();
                // Echo back as many translations as texts we received.
                let start = user.find("{\"texts\"").unwrap();
                let payload: Value = serde_json::from_str(
                    &user[start..user.rfind('}').map(|i| i + 1).unwrap()]
                        .split("\n\n")
                        .next()
                        .unwrap(),
                )
                .unwrap();
                let n = payload["texts"].as_array().unwrap().len();
                let translations: Vec<String> =
                    (0..n).map(|i| format!("译文{}", i)).collect();
                ResponseTemplate::new(200).set_body_json(json!({
                    "choices": [{"message": {"content": json!({"translations": translations}).to_string()}}]
                }))
            })
            .mount(&server)
            .await;

        let t = translator(server.uri(), 2, 0);
        let input = cues(&["one", "two", "three"]);
        let out = t.translate_cues(&input, None).await.unwrap();
        assert_eq!(out.len(), 3);
        // Timing is untouched.
        assert_eq!(out[1].start_s, 1.0);
        assert!(out.iter().all(|c| c.text.starts_with("译文")));
    }

    #[tokio::test]
    async fn test_count_mismatch_pads_then_repairs() {
        let server = MockServer::start().await;
        // The full batch comes back one entry short; the repair pass
        // re-requests the missing cues in single-item sub-batches.
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(move |req: &Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                let user = body["messages"][1]["content"].as_str().unwrap();
                let content = if user.contains("\"texts\":[\"a\",\"b\",\"c\"]") {
                    "{\"translations\":[\"只有一条\"]}".to_string()
                } else {
                    "{\"translations\":[\"修补\"]}".to_string()
                };
                ResponseTemplate::new(200).set_body_json(json!({
                    "choices": [{"message": {"content": content}}]
                }))
            })
            .mount(&server)
            .await;
        let t = translator(server.uri(), 3, 0);
        let input = cues(&["a", "b", "c"]);
        let out = t.translate_cues(&input, None).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].text, "只有一条");
        // The short entries were padded empty, flagged and repaired.
        assert_eq!(out[1].text, "修补");
        assert_eq!(out[2].text, "修补");
    }

    #[tokio::test]
    async fn test_total_failure_falls_back_to_source() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let t = translator(server.uri(), 3, 1);
        let input = cues(&["keep me", "and me"]);
        let out = t.translate_cues(&input, None).await.unwrap();
        assert_eq!(out[0].text, "keep me");
        assert_eq!(out[1].text, "and me");
    }
}
