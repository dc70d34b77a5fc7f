//! Subtitle quality control.
//!
//! Gates whether the translated SRT may be burned into the video. Two
//! stages: a rule score over the cue list (repetition, variety, content
//! density, average length) and a lenient LLM judge over a head/middle/
//! tail sample. A QC failure never stops the pipeline; the caller skips
//! burn-in and uploads the clean video, keeping the SRT for manual use.

use crate::config::QcConfig;
use crate::core::subtitle::Cue;
use crate::core::subtitle::srt::format_timestamp;
use crate::services::llm::{ChatClient, prompts};
use log::{info, warn};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\s.,，。．…\-—_·•]+$").unwrap())
}

fn non_content_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[^\w\u{4e00}-\u{9fff}\u{3040}-\u{30ff}\u{ac00}-\u{d7af}]+").unwrap()
    })
}

/// QC verdict.
#[derive(Debug, Clone)]
pub struct QcResult {
    /// Overall gate decision.
    pub passed: bool,
    /// Final score (judge score when present, rule score otherwise).
    pub score: f64,
    /// Short reason string.
    pub reason: String,
    /// Deterministic rule score.
    pub rule_score: f64,
    /// Judge score, when the judge ran.
    pub ai_score: Option<f64>,
}

impl QcResult {
    fn skipped(rule_score: f64, why: &str) -> Self {
        Self {
            passed: true,
            score: rule_score,
            reason: format!("qc_skipped:{}", why),
            rule_score,
            ai_score: None,
        }
    }
}

/// Rule + LLM joint quality gate.
pub struct SubtitleQc {
    client: Option<ChatClient>,
    config: QcConfig,
}

impl SubtitleQc {
    /// Create a gate; `client = None` disables the judge stage, in which
    /// case the rule score alone never blocks burn-in.
    pub fn new(client: Option<ChatClient>, config: QcConfig) -> Self {
        Self { client, config }
    }

    /// Run the full gate over the cue list.
    pub async fn check(&self, cues: &[Cue]) -> QcResult {
        let (rule_score, rule_reason) = rule_check(cues);
        info!("QC rule score {:.2} ({})", rule_score, rule_reason);

        let Some(client) = &self.client else {
            return QcResult::skipped(rule_score, "provider_disabled");
        };
        let sample = sample_items(cues, self.config.sample_items, self.config.sample_chars);
        if sample.is_empty() {
            return QcResult::skipped(rule_score, "empty_sample");
        }

        let (system, user) = prompts::qc_judge(&sample);
        let value = match client.chat_json(&system, &user, 400).await {
            Ok(v) => v,
            Err(e) => {
                // Judge unavailability must not block uploads.
                warn!("QC judge call failed, letting subtitles through: {}", e);
                return QcResult::skipped(rule_score, "ai_error");
            }
        };
        let ai_passed = value["passed"].as_bool();
        let ai_score = value["score"].as_f64();
        let passed = match (ai_passed, ai_score) {
            (Some(p), _) => p,
            (None, Some(s)) => s >= self.config.threshold,
            (None, None) => true,
        };
        let score = ai_score.unwrap_or(rule_score);
        let reason = if passed {
            "ok".to_string()
        } else {
            value["reason"]
                .as_str()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or("ai_fail")
                .to_string()
        };
        QcResult {
            passed,
            score,
            reason,
            rule_score,
            ai_score,
        }
    }
}

fn normalize_line(text: &str) -> String {
    let lower = text.trim().to_lowercase();
    non_content_re().replace_all(&lower, "").into_owned()
}

fn is_low_content(text: &str) -> bool {
    let t = text.trim();
    if t.is_empty() || placeholder_re().is_match(t) {
        return true;
    }
    normalize_line(t).chars().count() < 2
}

/// Deterministic score in [0, 1] with a compound reason string.
pub fn rule_check(cues: &[Cue]) -> (f64, String) {
    let texts: Vec<&str> = cues
        .iter()
        .map(|c| c.text.trim())
        .filter(|t| !t.is_empty())
        .collect();
    if texts.is_empty() {
        return (0.0, "empty_subtitle".into());
    }

    let total = texts.len();
    let low_content = texts.iter().filter(|t| is_low_content(t)).count();
    let low_content_ratio = low_content as f64 / total as f64;

    let normalized: Vec<String> = texts
        .iter()
        .map(|t| normalize_line(t))
        .filter(|t| !t.is_empty())
        .collect();
    if normalized.is_empty() {
        return (0.0, "low_content".into());
    }

    let mut freq: HashMap<&str, usize> = HashMap::new();
    for t in &normalized {
        *freq.entry(t.as_str()).or_insert(0) += 1;
    }
    let n = normalized.len();
    let top_ratio = *freq.values().max().unwrap_or(&0) as f64 / n as f64;
    let unique_ratio = freq.len() as f64 / n as f64;
    let avg_len =
        normalized.iter().map(|t| t.chars().count()).sum::<usize>() as f64 / n as f64;

    let mut score = 1.0f64;
    let mut reasons: Vec<&str> = Vec::new();

    if (n >= 15 && top_ratio >= 0.5) || (n >= 8 && top_ratio >= 0.7) {
        score -= 0.4;
        reasons.push("high_repetition");
    }
    if unique_ratio < 0.2 && n >= 20 {
        score -= 0.25;
        if !reasons.contains(&"high_repetition") {
            reasons.push("low_variety");
        }
    }
    if unique_ratio < 0.25 && n >= 10 {
        score -= 0.15;
        if !reasons.contains(&"high_repetition") && !reasons.contains(&"low_variety") {
            reasons.push("low_variety");
        }
    }
    if low_content_ratio >= 0.6 {
        score -= 0.3;
        reasons.push("mostly_low_content");
    }
    if avg_len < 2.0 && n >= 15 {
        score -= 0.15;
        reasons.push("too_short");
    }

    let reason = if reasons.is_empty() {
        "ok".to_string()
    } else {
        reasons.join(",")
    };
    (score.clamp(0.0, 1.0), reason)
}

/// Head/middle/tail sample of the cue list for the judge prompt.
///
/// Roughly 30% head, 30% tail, the rest spread over the middle; the
/// character budget cuts the sample off early when cues are long.
pub fn sample_items(cues: &[Cue], max_items: usize, max_chars: usize) -> String {
    if cues.is_empty() {
        return String::new();
    }
    let n = cues.len();
    let max_items = max_items.clamp(1, n);

    let head = ((max_items as f64 * 0.3).ceil() as usize).max(1);
    let tail = ((max_items as f64 * 0.3).ceil() as usize).max(1);
    let (head, tail, mid) = if head + tail > max_items {
        let head = max_items / 2;
        (head, max_items - head, 0)
    } else {
        (head, tail, max_items - head - tail)
    };

    let head_zone_end = (n as f64 * 0.35).max(1.0) as usize;
    let tail_zone_start = n.saturating_sub((n as f64 * 0.35).max(1.0) as usize);
    let mut indices: Vec<usize> = Vec::new();
    indices.extend(pick_segment(0, head_zone_end.min(n), head));
    if mid > 0 && tail_zone_start > indices.len() {
        indices.extend(pick_segment(indices.len(), tail_zone_start, mid));
    }
    indices.extend(pick_segment(tail_zone_start, n, tail));
    indices.sort_unstable();
    indices.dedup();

    let mut lines: Vec<String> = Vec::new();
    let mut total_chars = 0usize;
    for i in indices {
        let cue = &cues[i];
        let line = format!(
            "{}. {} --> {}\n{}\n",
            i + 1,
            format_timestamp(cue.start_s),
            format_timestamp(cue.end_s),
            cue.text.trim()
        );
        if total_chars + line.chars().count() > max_chars {
            break;
        }
        total_chars += line.chars().count();
        lines.push(line);
    }
    lines.join("\n").trim().to_string()
}

fn pick_segment(start: usize, end: usize, k: usize) -> Vec<usize> {
    if k == 0 || end <= start {
        return Vec::new();
    }
    let length = end - start;
    if k >= length {
        return (start..end).collect();
    }
    let step = length as f64 / k as f64;
    let mut out: Vec<usize> = Vec::new();
    for i in 0..k {
        let idx = (start + (i as f64 * step) as usize).min(end - 1);
        if out.last() != Some(&idx) {
            out.push(idx);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cue_list(texts: Vec<String>) -> Vec<Cue> {
        texts
            .into_iter()
            .enumerate()
            .map(|(i, t)| Cue::new(i as f64 * 2.0, i as f64 * 2.0 + 1.5, t))
            .collect()
    }

    #[test]
    fn test_rule_check_healthy_subtitles() {
        let cues = cue_list((0..30).map(|i| format!("这是正常的第{}句字幕内容", i)).collect());
        let (score, reason) = rule_check(&cues);
        assert_eq!(score, 1.0);
        assert_eq!(reason, "ok");
    }

    #[test]
    fn test_rule_check_high_repetition() {
        let mut texts: Vec<String> = vec!["谢谢观看".to_string(); 12];
        texts.extend((0..8).map(|i| format!("不同内容{}", i)));
        let (score, reason) = rule_check(&cue_list(texts));
        assert!(score < 1.0);
        assert!(reason.contains("high_repetition"));
    }

    #[test]
    fn test_rule_check_empty() {
        let (score, reason) = rule_check(&[]);
        assert_eq!(score, 0.0);
        assert_eq!(reason, "empty_subtitle");
    }

    #[test]
    fn test_rule_check_placeholder_flood() {
        let cues = cue_list((0..20).map(|_| "...".to_string()).collect());
        let (score, _) = rule_check(&cues);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_sample_covers_head_and_tail() {
        let cues = cue_list((0..200).map(|i| format!("字幕内容第{}条", i)).collect());
        let sample = sample_items(&cues, 30, 12_000);
        // Head zone is sampled from the first cue.
        assert!(sample.starts_with("1. "));
        // The tail zone (last 35% of the list) is represented.
        assert!(sample.contains("131. "));
    }

    #[test]
    fn test_sample_respects_char_budget() {
        let cues = cue_list((0..50).map(|i| format!("很长的字幕{}", "内容".repeat(40 + i))).collect());
        let sample = sample_items(&cues, 50, 500);
        assert!(sample.chars().count() <= 600);
    }

    #[tokio::test]
    async fn test_judge_verdict_wins() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content":
                    "{\"passed\": false, \"score\": 0.1, \"reason\": \"placeholder flood\"}"}}]
            })))
            .mount(&server)
            .await;
        let client = ChatClient::new(server.uri(), "k".into(), "m".into(), 0.3, 0, 0).unwrap();
        let qc = SubtitleQc::new(Some(client), QcConfig::default());
        let cues = cue_list((0..30).map(|i| format!("正常字幕内容第{}句", i)).collect());
        let result = qc.check(&cues).await;
        assert!(!result.passed);
        assert_eq!(result.reason, "placeholder flood");
        assert_eq!(result.ai_score, Some(0.1));
    }

    #[tokio::test]
    async fn test_judge_failure_does_not_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let client = ChatClient::new(server.uri(), "k".into(), "m".into(), 0.3, 0, 0).unwrap();
        let qc = SubtitleQc::new(Some(client), QcConfig::default());
        let cues = cue_list((0..10).map(|i| format!("字幕{}", i)).collect());
        let result = qc.check(&cues).await;
        assert!(result.passed);
        assert!(result.reason.starts_with("qc_skipped"));
    }

    #[tokio::test]
    async fn test_no_client_skips_judge() {
        let qc = SubtitleQc::new(None, QcConfig::default());
        let result = qc.check(&cue_list(vec!["内容".into()])).await;
        assert!(result.passed);
        assert_eq!(result.reason, "qc_skipped:provider_disabled");
    }

    #[test]
    fn test_score_threshold_fallback() {
        // With no explicit passed flag, score vs threshold decides.
        // (Covered through check() in integration; here we sanity-check
        // the threshold default.)
        assert!((QcConfig::default().threshold - 0.35).abs() < 1e-9);
    }
}
