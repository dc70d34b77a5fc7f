//! Metadata enhancement: translation, tag generation and category
//! classification over the chat adapter.
//!
//! Translation pre-cleans promotional noise before prompting and
//! defensively re-cleans the reply; classification runs a deterministic
//! keyword router before (and as a fallback after) the model call, so a
//! dead or misbehaving LLM still yields sensible categories for the
//! common content families.

use super::{ChatClient, prompts};
use crate::core::subtitle::char_count;
use crate::{Result, error::RetubeError};
use log::{debug, info, warn};
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::sync::OnceLock;

/// Platform cap for titles, in characters.
pub const TITLE_MAX_CHARS: usize = 50;
/// Platform cap for descriptions, in characters.
pub const DESCRIPTION_MAX_CHARS: usize = 1000;

const URL_PATTERNS: &[&str] = &[
    r"(?i)https?://[^\s\u{4e00}-\u{9fff}]+",
    r"(?i)www\.[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}",
    r"(?i)ftp://[^\s\u{4e00}-\u{9fff}]+",
];

const CTA_PATTERNS: &[&str] = &[
    r"订阅[我们的]*[频道]*",
    r"关注[我们]*",
    r"点赞[这个]*[视频]*",
    r"分享[给]*[朋友们]*",
    r"评论[区]*[见]*",
    r"更多[内容]*请访问",
    r"详情见[链接]*",
    r"链接在[描述]*[中]*",
    r"访问[我们的]*[网站]*",
    r"查看[完整]*[版本]*",
    r"下载[链接]*",
    r"购买[链接]*",
    r"(?i)subscribe\s+to\s+[our\s]*channel",
    r"(?i)follow\s+[us\s]*",
    r"(?i)like\s+[this\s]*video",
    r"(?i)share\s+[with\s]*[friends\s]*",
    r"(?i)check\s+out\s+[our\s]*[website\s]*",
    r"(?i)visit\s+[our\s]*[site\s]*",
    r"(?i)download\s+[link\s]*",
    r"(?i)buy\s+[link\s]*",
    r"(?i)more\s+info\s+at",
    r"(?i)see\s+[full\s]*[version\s]*",
];

fn noise_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let mut patterns: Vec<Regex> = Vec::new();
        for p in URL_PATTERNS {
            patterns.push(Regex::new(p).unwrap());
        }
        patterns.push(
            Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap(),
        );
        patterns.push(Regex::new(r"@[A-Za-z0-9_]+").unwrap());
        patterns.push(Regex::new(r"#[A-Za-z0-9_]+").unwrap());
        for p in CTA_PATTERNS {
            patterns.push(Regex::new(p).unwrap());
        }
        patterns
    })
}

fn annotation_note_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Translator-inserted notes like （注：…） or (removed …).
    RE.get_or_init(|| {
        Regex::new(r"(?i)[（(【][^（）()【】]*(?:注：|已移除|联系方式|社交媒体|链接|推广|广告|removed|filtered)[^（）()【】]*[）)】]")
            .unwrap()
    })
}

/// Strip URLs, emails, social handles and common CTA phrases, keeping
/// newlines but collapsing runs of spaces.
pub fn pre_clean(text: &str) -> String {
    let mut cleaned = text.to_string();
    for pattern in noise_patterns() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }
    normalize_whitespace_keep_newlines(&cleaned)
}

fn normalize_whitespace_keep_newlines(text: &str) -> String {
    static SPACES: OnceLock<Regex> = OnceLock::new();
    static TRAIL: OnceLock<Regex> = OnceLock::new();
    static BLANKS: OnceLock<Regex> = OnceLock::new();
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = SPACES
        .get_or_init(|| Regex::new(r"[ \t\x0c\x0b]+").unwrap())
        .replace_all(&text, " ");
    let text = TRAIL
        .get_or_init(|| Regex::new(r"[ \t]+\n").unwrap())
        .replace_all(&text, "\n");
    let text = BLANKS
        .get_or_init(|| Regex::new(r"\n{3,}").unwrap())
        .replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Truncate to `max` characters (not bytes).
pub fn truncate_chars(text: &str, max: usize) -> String {
    if char_count(text) <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

/// Truncate a description to the platform cap with a `...` marker.
pub fn cap_description(text: &str) -> String {
    if char_count(text) <= DESCRIPTION_MAX_CHARS {
        return text.to_string();
    }
    let mut capped: String = text.chars().take(DESCRIPTION_MAX_CHARS - 3).collect();
    capped.push_str("...");
    capped
}

// ============================================================================
// Category catalog
// ============================================================================

/// One selectable category after flattening the two-level tree.
#[derive(Debug, Clone)]
pub struct FlatCategory {
    /// External category id, stringly typed on the wire.
    pub id: String,
    /// Category display name.
    pub name: String,
    /// Parent group name.
    pub parent_name: String,
    /// Optional description from the catalog file.
    pub description: String,
}

/// Two-level category tree loaded from `acfunid/id_mapping.json`.
#[derive(Debug, Clone, Default)]
pub struct CategoryCatalog {
    categories: Vec<FlatCategory>,
}

impl CategoryCatalog {
    /// Load and flatten the catalog file.
    ///
    /// Accepts both `name` and `category` as the group key, and nested
    /// `sub` partitions one level down, matching the file as shipped.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RetubeError::config(format!("category catalog unreadable: {}", e)))?;
        let json: Value = serde_json::from_str(&content)?;
        Ok(Self::from_value(&json))
    }

    /// Flatten a parsed catalog document.
    pub fn from_value(json: &Value) -> Self {
        let mut categories = Vec::new();
        if let Some(groups) = json.as_array() {
            for group in groups {
                let parent = group["name"]
                    .as_str()
                    .or_else(|| group["category"].as_str())
                    .unwrap_or("");
                if let Some(partitions) = group["partitions"].as_array() {
                    for partition in partitions {
                        push_category(&mut categories, partition, parent);
                        if let Some(subs) = partition["sub"].as_array() {
                            for sub in subs {
                                push_category(&mut categories, sub, parent);
                            }
                        }
                    }
                }
            }
        }
        Self { categories }
    }

    /// All flattened categories.
    pub fn categories(&self) -> &[FlatCategory] {
        &self.categories
    }

    /// Whether an id exists in the catalog.
    pub fn contains(&self, id: &str) -> bool {
        self.categories.iter().any(|c| c.id == id)
    }

    /// First category whose name contains the given fragment.
    pub fn find_by_name_fragment(&self, fragment: &str) -> Option<&FlatCategory> {
        self.categories.iter().find(|c| c.name.contains(fragment))
    }

    /// Compact listing for the classification prompt.
    pub fn prompt_listing(&self) -> String {
        self.categories
            .iter()
            .map(|c| {
                if c.description.is_empty() {
                    format!("{} | {} ({})", c.id, c.name, c.parent_name)
                } else {
                    format!("{} | {} ({}) - {}", c.id, c.name, c.parent_name, c.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn push_category(out: &mut Vec<FlatCategory>, node: &Value, parent: &str) {
    let id = match node["id"].as_str() {
        Some(s) => s.to_string(),
        None => match node["id"].as_i64() {
            Some(n) => n.to_string(),
            None => return,
        },
    };
    let name = node["name"].as_str().unwrap_or("").to_string();
    if name.is_empty() {
        return;
    }
    out.push(FlatCategory {
        id,
        name,
        parent_name: parent.to_string(),
        description: node["description"].as_str().unwrap_or("").to_string(),
    });
}

/// Fixed keyword families for the deterministic category router, paired
/// with category-name fragments in preference order.
const RULE_FAMILIES: &[(&[&str], &[&str])] = &[
    (
        &[" mv", "官方mv", "official video", "music", "歌曲", "演唱", "单曲", "专辑", "mv"],
        &["综合音乐", "原创·翻唱", "演奏·乐器"],
    ),
    (&["舞蹈", "dance", "编舞", "翻跳"], &["综合舞蹈", "宅舞"]),
    (
        &["预告", "花絮", "trailer", "behind the scenes"],
        &["预告·花絮"],
    ),
    (
        &["game", "游戏", "实况", "攻略", "电竞"],
        &["主机单机", "电子竞技", "网络游戏"],
    ),
    (
        &["科技", "数码", "评测", "开箱", "测评"],
        &["数码家电", "科技制造"],
    ),
    (
        &["vlog", "生活", "美食", "旅行", "宠物"],
        &["生活日常", "美食", "旅行"],
    ),
];

/// Keyword-based classification over the flattened catalog.
pub fn rule_based_category(title: &str, description: &str, catalog: &CategoryCatalog) -> Option<String> {
    let text = format!("{}\n{}", title, description).to_lowercase();
    for (keywords, name_fragments) in RULE_FAMILIES {
        if keywords.iter().any(|k| text.contains(k)) {
            for fragment in *name_fragments {
                if let Some(category) = catalog.find_by_name_fragment(fragment) {
                    return Some(category.id.clone());
                }
            }
        }
    }
    None
}

// ============================================================================
// Enhancer
// ============================================================================

/// High-level metadata operations over the chat adapter.
pub struct Enhancer {
    client: ChatClient,
    target_language: String,
}

impl Enhancer {
    /// Create an enhancer for the given target language.
    pub fn new(client: ChatClient, target_language: String) -> Self {
        Self {
            client,
            target_language,
        }
    }

    /// Translate a title or description.
    ///
    /// Returns `None` on total failure so callers can fall back to the
    /// original text; an empty-or-unchanged first reply triggers one
    /// strict-prompt retry before giving up.
    pub async fn translate(&self, text: &str, is_title: bool) -> Option<String> {
        if text.trim().is_empty() {
            return Some(text.to_string());
        }
        let cleaned_source = pre_clean(text);
        let (system, user) = prompts::translate(&cleaned_source, &self.target_language, is_title);
        let mut translated = match self.client.chat_json(&system, &user, 4096).await {
            Ok(value) => value["translation"].as_str().unwrap_or("").trim().to_string(),
            Err(e) => {
                warn!("Translation request failed: {}", e);
                String::new()
            }
        };
        translated = post_clean(&translated);

        if translated.is_empty() || translated == cleaned_source.trim() {
            info!("First translation empty or unchanged, retrying in strict mode");
            let (system, user) = prompts::translate_strict(&cleaned_source);
            match self.client.chat_json(&system, &user, 2048).await {
                Ok(value) => {
                    if let Some(strict) = value["translation"].as_str() {
                        let strict = post_clean(strict);
                        if !strict.is_empty() {
                            translated = strict;
                        }
                    }
                }
                Err(e) => warn!("Strict-mode retry failed: {}", e),
            }
        }
        if translated.is_empty() {
            return None;
        }
        Some(if is_title {
            truncate_chars(&translated, TITLE_MAX_CHARS)
        } else {
            cap_description(&translated)
        })
    }

    /// Generate exactly six tags, each at most 20 characters.
    ///
    /// Short results are padded with empty strings, long results
    /// truncated; a failed call yields an empty list.
    pub async fn generate_tags(&self, title: &str, description: &str) -> Vec<String> {
        let short_desc = truncate_chars(description, 200);
        let (system, user) = prompts::generate_tags(title, &short_desc);
        let value = match self.client.chat_json(&system, &user, 300).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Tag generation failed: {}", e);
                return Vec::new();
            }
        };
        let raw_tags: Vec<String> = match &value {
            Value::Object(map) => map
                .get("tags")
                .and_then(Value::as_array)
                .map(collect_strings)
                .unwrap_or_default(),
            Value::Array(items) => collect_strings_from(items),
            _ => Vec::new(),
        };
        if raw_tags.is_empty() {
            warn!("No tags found in model reply");
            return Vec::new();
        }
        let mut tags: Vec<String> = raw_tags
            .into_iter()
            .map(|t| truncate_chars(t.trim(), 20))
            .collect();
        tags.truncate(6);
        while tags.len() < 6 {
            tags.push(String::new());
        }
        debug!("Generated tags: {:?}", tags);
        tags
    }

    /// Recommend a category id from the catalog.
    ///
    /// `fixed_id` short-circuits everything. The keyword router runs
    /// first; the model result is validated against the catalog and falls
    /// back to the router, then to `None`.
    pub async fn recommend_category(
        &self,
        title: &str,
        description: &str,
        catalog: &CategoryCatalog,
        fixed_id: Option<&str>,
    ) -> Option<String> {
        if let Some(fixed) = fixed_id.map(str::trim).filter(|s| !s.is_empty()) {
            info!("Fixed category id configured: {}", fixed);
            return Some(fixed.to_string());
        }
        if catalog.categories().is_empty() {
            warn!("Category catalog is empty, skipping classification");
            return None;
        }
        if let Some(id) = rule_based_category(title, description, catalog) {
            info!("Rule router matched category {}", id);
            return Some(id);
        }

        let (system, user) =
            prompts::classify_category(title, description, &catalog.prompt_listing());
        match self.client.chat_json(&system, &user, 500).await {
            Ok(value) => {
                let id = value["id"]
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| value["id"].as_i64().map(|n| n.to_string()));
                if let Some(id) = id {
                    if catalog.contains(&id) {
                        debug!(
                            "Model recommended category {} ({})",
                            id,
                            value["reason"].as_str().unwrap_or("")
                        );
                        return Some(id);
                    }
                    warn!("Model returned unknown category id '{}'", id);
                }
            }
            Err(e) => warn!("Category classification failed: {}", e),
        }
        rule_based_category(title, description, catalog)
    }
}

/// Defensive cleanup of a translated string: translator prefixes,
/// annotation notes, then the same noise patterns as the input side.
fn post_clean(text: &str) -> String {
    let mut cleaned = text.trim().to_string();
    for prefix in ["翻译：", "译文：", "这是翻译：", "以下是译文：", "以下是我的翻译："] {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            cleaned = rest.trim().to_string();
        }
    }
    cleaned = annotation_note_re().replace_all(&cleaned, "").into_owned();
    for pattern in noise_patterns() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }
    normalize_whitespace_keep_newlines(&cleaned)
}

fn collect_strings(items: &Vec<Value>) -> Vec<String> {
    collect_strings_from(items)
}

fn collect_strings_from(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn catalog() -> CategoryCatalog {
        CategoryCatalog::from_value(&json!([
            {
                "name": "音乐舞蹈",
                "partitions": [
                    {"id": "201", "name": "综合音乐", "description": "音乐内容"},
                    {"id": "202", "name": "综合舞蹈"}
                ]
            },
            {
                "category": "游戏",
                "partitions": [
                    {"id": "63", "name": "主机单机", "sub": [
                        {"id": "64", "name": "电子竞技"}
                    ]}
                ]
            }
        ]))
    }

    async fn enhancer_with_reply(reply: serde_json::Value) -> (MockServer, Enhancer) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": reply.to_string()}}]
            })))
            .mount(&server)
            .await;
        let client =
            ChatClient::new(server.uri(), "k".into(), "m".into(), 0.3, 0, 0).unwrap();
        (server, Enhancer::new(client, "zh-CN".into()))
    }

    #[test]
    fn test_pre_clean_strips_noise() {
        let input = "Great video https://example.com/x check out our website @someone #tag contact me@mail.com";
        let cleaned = pre_clean(input);
        assert!(!cleaned.contains("http"));
        assert!(!cleaned.contains('@'));
        assert!(!cleaned.contains('#'));
        assert!(cleaned.contains("Great video"));
    }

    #[test]
    fn test_catalog_flatten_and_lookup() {
        let c = catalog();
        assert_eq!(c.categories().len(), 4);
        assert!(c.contains("64"));
        assert_eq!(c.find_by_name_fragment("综合音乐").unwrap().id, "201");
        let listing = c.prompt_listing();
        assert!(listing.contains("201 | 综合音乐 (音乐舞蹈) - 音乐内容"));
        assert!(listing.contains("63 | 主机单机 (游戏)"));
    }

    #[test]
    fn test_rule_router_families() {
        let c = catalog();
        assert_eq!(
            rule_based_category("Official Video - new single", "", &c),
            Some("201".to_string())
        );
        assert_eq!(rule_based_category("电竞决赛实况", "", &c), Some("63".to_string()));
        assert_eq!(rule_based_category("平淡无奇的内容", "没有关键词", &c), None);
    }

    #[tokio::test]
    async fn test_translate_caps_title_length() {
        let long: String = "很".repeat(80);
        let (_server, enhancer) =
            enhancer_with_reply(json!({"translation": long.clone()})).await;
        let result = enhancer.translate("A long title", true).await.unwrap();
        assert_eq!(char_count(&result), TITLE_MAX_CHARS);
    }

    #[tokio::test]
    async fn test_translate_description_cap_with_marker() {
        let long: String = "述".repeat(1500);
        let (_server, enhancer) =
            enhancer_with_reply(json!({"translation": long.clone()})).await;
        let result = enhancer.translate("desc", false).await.unwrap();
        assert_eq!(char_count(&result), DESCRIPTION_MAX_CHARS);
        assert!(result.ends_with("..."));
    }

    #[tokio::test]
    async fn test_generate_tags_pads_to_six() {
        let (_server, enhancer) =
            enhancer_with_reply(json!({"tags": ["音乐", "现场"]})).await;
        let tags = enhancer.generate_tags("t", "d").await;
        assert_eq!(tags.len(), 6);
        assert_eq!(tags[0], "音乐");
        assert_eq!(tags[2], "");
    }

    #[tokio::test]
    async fn test_generate_tags_accepts_bare_array() {
        let (_server, enhancer) =
            enhancer_with_reply(json!(["a", "b", "c", "d", "e", "f", "g"])).await;
        let tags = enhancer.generate_tags("t", "d").await;
        assert_eq!(tags.len(), 6);
        assert_eq!(tags[5], "f");
    }

    #[tokio::test]
    async fn test_recommend_category_validates_model_id() {
        // Model returns an id outside the catalog; with no rule match the
        // result is None.
        let (_server, enhancer) =
            enhancer_with_reply(json!({"id": "9999", "reason": "bogus"})).await;
        let result = enhancer
            .recommend_category("平淡标题", "没有关键词", &catalog(), None)
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_recommend_category_fixed_short_circuit() {
        let (_server, enhancer) = enhancer_with_reply(json!({})).await;
        let result = enhancer
            .recommend_category("t", "d", &catalog(), Some("42"))
            .await;
        assert_eq!(result, Some("42".to_string()));
    }

    #[test]
    fn test_post_clean_removes_prefix_and_notes() {
        assert_eq!(post_clean("译文：你好世界"), "你好世界");
        assert_eq!(post_clean("内容很好（注：链接已移除）继续"), "内容很好继续");
    }
}
