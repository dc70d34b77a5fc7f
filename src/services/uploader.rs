//! Chunked-upload protocol client for the sink platform.
//!
//! The upload is a three-party dance: a token service hands out
//! `(taskId, uploadToken, partSize)`, fragments go to the upload host
//! sequentially with per-fragment retries, and a member-API sequence
//! (`complete`, `uploadFinish`, `createVideo`, `createDouga`) turns the
//! uploaded blob into a published post. Covers ride the same fragment
//! endpoint with a single part after 16:10 normalization.
//!
//! Endpoints are injectable so the protocol is testable against a mock
//! server; defaults point at the production hosts.

use crate::config::UploaderConfig;
use crate::core::cover::{self, CoverMode};
use crate::core::subtitle::char_count;
use crate::services::llm::enhancer::{DESCRIPTION_MAX_CHARS, TITLE_MAX_CHARS, truncate_chars};
use crate::{Result, error::RetubeError};
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ORIGIN: &str = "https://member.acfun.cn";
const FRAGMENT_RETRIES: u32 = 3;

/// Endpoint set; injectable for tests.
#[derive(Debug, Clone)]
pub struct UploaderEndpoints {
    pub login: String,
    pub token: String,
    pub fragment: String,
    pub complete: String,
    pub finish: String,
    pub create_video: String,
    pub create_douga: String,
    pub qiniu_token: String,
    pub cover_url: String,
}

impl Default for UploaderEndpoints {
    fn default() -> Self {
        Self {
            login: "https://id.app.acfun.cn/rest/web/login/signin".into(),
            token: "https://member.acfun.cn/video/api/getKSCloudToken".into(),
            fragment: "https://upload.kuaishouzt.com/api/upload/fragment".into(),
            complete: "https://upload.kuaishouzt.com/api/upload/complete".into(),
            finish: "https://member.acfun.cn/video/api/uploadFinish".into(),
            create_video: "https://member.acfun.cn/video/api/createVideo".into(),
            create_douga: "https://member.acfun.cn/video/api/createDouga".into(),
            qiniu_token: "https://member.acfun.cn/common/api/getQiniuToken".into(),
            cover_url: "https://member.acfun.cn/common/api/getUrlAfterUpload".into(),
        }
    }
}

impl UploaderEndpoints {
    /// All endpoints rooted at one base URL (mock servers).
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            login: format!("{}/rest/web/login/signin", base),
            token: format!("{}/video/api/getKSCloudToken", base),
            fragment: format!("{}/api/upload/fragment", base),
            complete: format!("{}/api/upload/complete", base),
            finish: format!("{}/video/api/uploadFinish", base),
            create_video: format!("{}/video/api/createVideo", base),
            create_douga: format!("{}/video/api/createDouga", base),
            qiniu_token: format!("{}/common/api/getQiniuToken", base),
            cover_url: format!("{}/common/api/getUrlAfterUpload", base),
        }
    }
}

/// Metadata accompanying a publish.
#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    pub title: String,
    pub description: String,
    /// At most six tags; padded/truncated by the caller.
    pub tags: Vec<String>,
    pub category_id: String,
    /// Source URL; presence marks the post as a repost.
    pub original_url: Option<String>,
    pub original_uploader: Option<String>,
    pub original_upload_date: Option<String>,
}

/// Structured result stored on the task row after a publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Post id assigned by the platform.
    pub ac_number: i64,
    pub title: String,
    pub cover_url: String,
}

/// Progress callback with a short status line.
pub type UploadProgressFn = Arc<dyn Fn(String) + Send + Sync>;

/// Client of the chunked-upload API.
pub struct ChunkedUploader {
    client: Client,
    config: UploaderConfig,
    endpoints: UploaderEndpoints,
    cookies_path: Option<std::path::PathBuf>,
}

impl ChunkedUploader {
    /// Create a client with production endpoints.
    pub fn new(config: UploaderConfig, cookies_path: Option<std::path::PathBuf>) -> Result<Self> {
        Self::with_endpoints(config, cookies_path, UploaderEndpoints::default())
    }

    /// Create a client with explicit endpoints.
    pub fn with_endpoints(
        config: UploaderConfig,
        cookies_path: Option<std::path::PathBuf>,
        endpoints: UploaderEndpoints,
    ) -> Result<Self> {
        let jar = Arc::new(reqwest::cookie::Jar::default());
        if let Some(path) = cookies_path.as_deref() {
            if let Err(e) = load_cookie_jar(&jar, path, &endpoints) {
                warn!("Cookie jar {:?} not loaded: {}", path, e);
            }
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .cookie_provider(jar)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RetubeError::upload("client", e.to_string()))?;
        Ok(Self {
            client,
            config,
            endpoints,
            cookies_path,
        })
    }

    /// Log in: a valid cookie jar alone suffices; otherwise credentials
    /// drive the form login.
    pub async fn login(&self) -> Result<()> {
        if let Some(path) = self.cookies_path.as_deref() {
            if sniff_cookie_jar(path) {
                info!("Using cookie jar {:?} for upload session", path);
                return Ok(());
            }
        }
        if self.config.username.trim().is_empty() || self.config.password.trim().is_empty() {
            return Err(RetubeError::upload(
                "login",
                "no valid cookie jar and no credentials configured",
            ));
        }
        let response = self
            .client
            .post(&self.endpoints.login)
            .form(&[
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
                ("key", ""),
                ("captcha", ""),
            ])
            .send()
            .await
            .map_err(|e| RetubeError::upload("login", e.to_string()))?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| RetubeError::upload("login", format!("bad response: {}", e)))?;
        if value["result"].as_i64() == Some(0) {
            info!("Upload session established for {}", self.config.username);
            Ok(())
        } else {
            Err(RetubeError::upload(
                "login",
                format!(
                    "sign-in rejected: {}",
                    value["error_msg"].as_str().unwrap_or("unknown error")
                ),
            ))
        }
    }

    /// `getKSCloudToken` step.
    async fn get_token(&self, filename: &str, filesize: u64) -> Result<(i64, String, u64)> {
        let response = self
            .client
            .post(&self.endpoints.token)
            .header("Origin", ORIGIN)
            .header("Referer", format!("{}/", ORIGIN))
            .form(&[("fileName", filename), ("size", &filesize.to_string())])
            .send()
            .await
            .map_err(|e| RetubeError::upload("get_token", e.to_string()))?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| RetubeError::upload("get_token", format!("bad response: {}", e)))?;
        let task_id = value["taskId"]
            .as_i64()
            .ok_or_else(|| RetubeError::upload("get_token", "missing taskId"))?;
        let token = value["token"]
            .as_str()
            .ok_or_else(|| RetubeError::upload("get_token", "missing token"))?
            .to_string();
        let part_size = value["uploadConfig"]["partSize"]
            .as_u64()
            .ok_or_else(|| RetubeError::upload("get_token", "missing partSize"))?;
        Ok((task_id, token, part_size))
    }

    /// One fragment POST with independent retries.
    async fn upload_fragment(&self, chunk: Vec<u8>, fragment_id: u64, token: &str) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            let result = self
                .client
                .post(&self.endpoints.fragment)
                .query(&[
                    ("fragment_id", fragment_id.to_string()),
                    ("upload_token", token.to_string()),
                ])
                .header("Origin", ORIGIN)
                .header("Referer", format!("{}/", ORIGIN))
                .header("Content-Type", "application/octet-stream")
                .body(chunk.clone())
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    let value: Value = response.json().await.unwrap_or(Value::Null);
                    if value["result"].as_i64().unwrap_or(1) == 1 {
                        debug!("Fragment {} uploaded", fragment_id + 1);
                        return Ok(());
                    }
                    warn!(
                        "Fragment {} rejected: {}, attempt {}",
                        fragment_id + 1,
                        value,
                        attempt + 1
                    );
                }
                Ok(response) => {
                    warn!(
                        "Fragment {} got HTTP {}, attempt {}",
                        fragment_id + 1,
                        response.status(),
                        attempt + 1
                    );
                }
                Err(e) => {
                    warn!("Fragment {} error: {}, attempt {}", fragment_id + 1, e, attempt + 1);
                }
            }
            attempt += 1;
            if attempt >= FRAGMENT_RETRIES {
                return Err(RetubeError::upload(
                    format!("fragment {}", fragment_id),
                    "max retries reached",
                ));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn complete(&self, fragment_count: u64, token: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoints.complete)
            .query(&[
                ("fragment_count", fragment_count.to_string()),
                ("upload_token", token.to_string()),
            ])
            .header("Origin", ORIGIN)
            .header("Referer", format!("{}/", ORIGIN))
            .send()
            .await
            .map_err(|e| RetubeError::upload("complete", e.to_string()))?;
        let value: Value = response.json().await.unwrap_or(Value::Null);
        if value["result"].as_i64().unwrap_or(0) == 1 {
            Ok(())
        } else {
            Err(RetubeError::upload("complete", format!("rejected: {}", value)))
        }
    }

    async fn upload_finish(&self, task_id: i64) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoints.finish)
            .form(&[("taskId", task_id.to_string())])
            .header("Origin", ORIGIN)
            .header("Referer", format!("{}/", ORIGIN))
            .send()
            .await
            .map_err(|e| RetubeError::upload("upload_finish", e.to_string()))?;
        let value: Value = response.json().await.unwrap_or(Value::Null);
        if value["result"].as_i64() == Some(0) {
            Ok(())
        } else {
            Err(RetubeError::upload("upload_finish", format!("rejected: {}", value)))
        }
    }

    async fn create_video(&self, video_key: i64, filename: &str) -> Result<i64> {
        let response = self
            .client
            .post(&self.endpoints.create_video)
            .form(&[
                ("videoKey", video_key.to_string()),
                ("fileName", filename.to_string()),
                ("vodType", "ksCloud".to_string()),
            ])
            .header("origin", ORIGIN)
            .header("referer", format!("{}/upload-video", ORIGIN))
            .send()
            .await
            .map_err(|e| RetubeError::upload("create_video", e.to_string()))?;
        let value: Value = response.json().await.unwrap_or(Value::Null);
        value["videoId"]
            .as_i64()
            .ok_or_else(|| RetubeError::upload("create_video", format!("rejected: {}", value)))
    }

    /// Upload the whole media file in sequential fragments.
    ///
    /// Invariant: `fragment_count = ceil(size / part_size)` and the byte
    /// total transmitted equals the file size exactly.
    async fn upload_media(
        &self,
        path: &Path,
        progress: Option<&UploadProgressFn>,
    ) -> Result<(i64, String, u64)> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video.mp4".to_string());
        let data = tokio::fs::read(path).await?;
        let filesize = data.len() as u64;
        let (task_id, token, part_size) = self.get_token(&filename, filesize).await?;
        let fragment_count = filesize.div_ceil(part_size);
        info!(
            "Uploading {} ({} bytes) in {} fragments of {}",
            filename, filesize, fragment_count, part_size
        );

        let mut sent: u64 = 0;
        for fragment_id in 0..fragment_count {
            let start = (fragment_id * part_size) as usize;
            let end = ((fragment_id + 1) * part_size).min(filesize) as usize;
            let chunk = data[start..end].to_vec();
            sent += chunk.len() as u64;
            self.upload_fragment(chunk, fragment_id, &token).await?;
            if let Some(cb) = progress {
                cb(format!("上传分块 {}/{}", fragment_id + 1, fragment_count));
            }
        }
        debug_assert_eq!(sent, filesize);
        self.complete(fragment_count, &token).await?;
        self.upload_finish(task_id).await?;
        Ok((task_id, filename, fragment_count))
    }

    /// Cover flow: 16:10 normalization, qiniu token, single-fragment
    /// upload, URL retrieval.
    pub async fn upload_cover(&self, cover: &Path) -> Result<String> {
        let mode = CoverMode::parse(&self.config.cover_mode);
        let temp = tempfile::TempDir::new()?;
        let processed = temp.path().join("cover.jpg");
        cover::process_cover(cover, &processed, mode)?;

        let filename = "cover.jpg";
        let response = self
            .client
            .post(&self.endpoints.qiniu_token)
            .form(&[("fileName", filename)])
            .header("Origin", ORIGIN)
            .header("Referer", format!("{}/", ORIGIN))
            .send()
            .await
            .map_err(|e| RetubeError::upload("get_qiniu_token", e.to_string()))?;
        let value: Value = response.json().await.unwrap_or(Value::Null);
        let token = value["info"]["token"]
            .as_str()
            .ok_or_else(|| RetubeError::upload("get_qiniu_token", "missing token"))?
            .to_string();

        let data = tokio::fs::read(&processed).await?;
        self.upload_fragment(data, 0, &token).await?;
        self.complete(1, &token).await?;

        let response = self
            .client
            .post(&self.endpoints.cover_url)
            .form(&[("bizFlag", "web-douga-cover"), ("token", token.as_str())])
            .header("Origin", ORIGIN)
            .header("Referer", format!("{}/", ORIGIN))
            .send()
            .await
            .map_err(|e| RetubeError::upload("get_url_after_upload", e.to_string()))?;
        let value: Value = response.json().await.unwrap_or(Value::Null);
        let url = value["url"]
            .as_str()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| RetubeError::upload("get_url_after_upload", "no cover URL returned"))?;
        Ok(url.to_string())
    }

    /// Full publish: login, media fragments, cover, `createDouga`.
    pub async fn upload_video(
        &self,
        video: &Path,
        cover: &Path,
        request: &PublishRequest,
        progress: Option<UploadProgressFn>,
    ) -> Result<UploadResponse> {
        self.login().await?;
        if !video.exists() {
            return Err(RetubeError::FileNotFound(video.display().to_string()));
        }
        if !cover.exists() {
            return Err(RetubeError::FileNotFound(cover.display().to_string()));
        }

        let title = truncate_chars(request.title.trim(), TITLE_MAX_CHARS);
        let mut tags = request.tags.clone();
        tags.truncate(6);
        let description = compose_description(
            &request.description,
            request.original_url.as_deref(),
            request.original_uploader.as_deref(),
            request.original_upload_date.as_deref(),
        );

        let (task_id, filename, _fragments) =
            self.upload_media(video, progress.as_ref()).await?;
        if let Some(cb) = &progress {
            cb("上传封面".into());
        }
        let cover_url = self.upload_cover(cover).await?;
        let video_id = self.create_video(task_id, &filename).await?;

        let is_repost = request.original_url.is_some();
        let creation_type = if is_repost { 1 } else { 3 };
        let mut form: Vec<(String, String)> = vec![
            ("title".into(), title.clone()),
            ("description".into(), description),
            ("tagNames".into(), serde_json::to_string(&tags)?),
            ("creationType".into(), creation_type.to_string()),
            ("channelId".into(), request.category_id.clone()),
            ("coverUrl".into(), cover_url.clone()),
            (
                "videoInfos".into(),
                json!([{"videoId": video_id, "title": title}]).to_string(),
            ),
            ("isJoinUpCollege".into(), "0".into()),
        ];
        if is_repost {
            form.push((
                "originalLinkUrl".into(),
                request.original_url.clone().unwrap_or_default(),
            ));
            form.push(("originalDeclare".into(), "0".into()));
        } else {
            form.push(("originalDeclare".into(), "1".into()));
        }

        if let Some(cb) = &progress {
            cb("发布稿件".into());
        }
        let response = self
            .client
            .post(&self.endpoints.create_douga)
            .form(&form)
            .header("origin", ORIGIN)
            .header("referer", format!("{}/upload-video", ORIGIN))
            .send()
            .await
            .map_err(|e| RetubeError::upload("create_douga", e.to_string()))?;
        let value: Value = response.json().await.unwrap_or(Value::Null);
        if value["result"].as_i64() == Some(0) {
            if let Some(ac_number) = value["dougaId"].as_i64() {
                info!("Published, post id {}", ac_number);
                return Ok(UploadResponse {
                    ac_number,
                    title,
                    cover_url,
                });
            }
        }
        Err(RetubeError::upload(
            "create_douga",
            format!(
                "publish rejected: {}",
                value["error_msg"].as_str().unwrap_or("unknown error")
            ),
        ))
    }
}

/// Compose the upload description, injecting the provenance block for
/// reposts and keeping the total within the platform cap.
///
/// When truncation is needed, the user description is cut before the
/// block header, never inside it.
pub fn compose_description(
    description: &str,
    original_url: Option<&str>,
    original_uploader: Option<&str>,
    original_upload_date: Option<&str>,
) -> String {
    let is_repost =
        original_url.is_some() || original_uploader.is_some() || original_upload_date.is_some();
    if !is_repost {
        let description = description.trim();
        if char_count(description) > DESCRIPTION_MAX_CHARS {
            let mut capped: String =
                description.chars().take(DESCRIPTION_MAX_CHARS - 3).collect();
            capped.push_str("...");
            return capped;
        }
        return description.to_string();
    }

    let mut provenance = String::from("本视频转载自YouTube");
    if let Some(date) = original_upload_date.filter(|s| !s.is_empty()) {
        provenance.push_str(&format!("，原始上传时间：{}", date));
    }
    if let Some(uploader) = original_uploader.filter(|s| !s.is_empty()) {
        provenance.push_str(&format!("，UP主：{}", uploader));
    }
    let header = format!("{}\n\n---原简介---\n", provenance);
    let header_len = char_count(&header);
    let full = format!("{}{}", header, description.trim());
    if char_count(&full) <= DESCRIPTION_MAX_CHARS {
        return full;
    }
    let available = DESCRIPTION_MAX_CHARS.saturating_sub(header_len + 3);
    if available > 0 {
        let truncated: String = description.trim().chars().take(available).collect();
        format!("{}{}...", header, truncated)
    } else {
        // The provenance block alone is near the cap; keep its head.
        let mut capped: String = full.chars().take(DESCRIPTION_MAX_CHARS - 3).collect();
        capped.push_str("...");
        capped
    }
}

/// Best-effort sniff of a Netscape-format cookie jar.
///
/// Not a live probe; a file counts as valid when it has the format header
/// or at least one 7-field tab-separated cookie line.
pub fn sniff_cookie_jar(path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    if content.contains("# Netscape HTTP Cookie File") {
        return true;
    }
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .any(|l| l.split('\t').count() >= 7)
}

/// Load a Netscape cookie file into a reqwest jar, scoped to the member
/// API host.
fn load_cookie_jar(
    jar: &reqwest::cookie::Jar,
    path: &Path,
    endpoints: &UploaderEndpoints,
) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    let base: reqwest::Url = endpoints
        .create_douga
        .parse()
        .map_err(|e| RetubeError::upload("cookies", format!("bad endpoint URL: {}", e)))?;
    let mut loaded = 0;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            continue;
        }
        let (domain, name, value) = (fields[0], fields[5], fields[6]);
        jar.add_cookie_str(
            &format!("{}={}; Domain={}; Path=/", name, value, domain.trim_start_matches('.')),
            &base,
        );
        loaded += 1;
    }
    debug!("Loaded {} cookies from {:?}", loaded, path);
    Ok(())
}
