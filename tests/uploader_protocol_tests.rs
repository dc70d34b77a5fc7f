//! Chunked-upload protocol scenarios against a mock server.

use retube::config::UploaderConfig;
use retube::services::uploader::{
    ChunkedUploader, PublishRequest, UploaderEndpoints, compose_description,
};
use serde_json::json;
use std::sync::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const PART_SIZE: u64 = 4096;

async fn mount_protocol(server: &MockServer, flaky_fragments: Vec<u64>) {
    Mock::given(method("POST"))
        .and(path("/rest/web/login/signin"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 0})))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/video/api/getKSCloudToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": 0,
            "taskId": 31337,
            "token": "upload-token",
            "uploadConfig": {"partSize": PART_SIZE}
        })))
        .mount(server)
        .await;

    // Fragments listed in `flaky_fragments` fail with HTTP 500 on their
    // first attempt and succeed afterwards.
    let failed_once: Mutex<Vec<u64>> = Mutex::new(Vec::new());
    Mock::given(method("POST"))
        .and(path("/api/upload/fragment"))
        .respond_with(move |req: &Request| {
            let fragment_id: u64 = req
                .url
                .query_pairs()
                .find(|(k, _)| k == "fragment_id")
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(0);
            let mut seen = failed_once.lock().unwrap();
            if flaky_fragments.contains(&fragment_id) && !seen.contains(&fragment_id) {
                seen.push(fragment_id);
                ResponseTemplate::new(500)
            } else {
                ResponseTemplate::new(200).set_body_json(json!({"result": 1}))
            }
        })
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/upload/complete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 1})))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/video/api/uploadFinish"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 0})))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/video/api/createVideo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": 0, "videoId": 555000
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/common/api/getQiniuToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": 0, "info": {"token": "cover-token"}
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/common/api/getUrlAfterUpload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": 0, "url": "https://imgs.example/c.jpg"
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/video/api/createDouga"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": 0, "dougaId": 424242
        })))
        .mount(server)
        .await;
}

fn fixture_files(dir: &tempfile::TempDir, video_bytes: usize) -> (std::path::PathBuf, std::path::PathBuf) {
    let video = dir.path().join("video.mp4");
    std::fs::write(&video, vec![0xabu8; video_bytes]).unwrap();
    let cover = dir.path().join("cover.png");
    image::RgbaImage::from_pixel(640, 360, image::Rgba([1, 2, 3, 255]))
        .save(&cover)
        .unwrap();
    (video, cover)
}

fn uploader(server_uri: &str) -> ChunkedUploader {
    ChunkedUploader::with_endpoints(
        UploaderConfig {
            username: "user".into(),
            password: "pass".into(),
            ..Default::default()
        },
        None,
        UploaderEndpoints::with_base(server_uri),
    )
    .unwrap()
}

fn publish_request() -> PublishRequest {
    PublishRequest {
        title: "测试标题".into(),
        description: "测试描述".into(),
        tags: vec!["一".into(), "二".into(), "三".into(), "四".into(), "五".into(), "六".into()],
        category_id: "63".into(),
        original_url: Some("https://www.youtube.com/watch?v=abc".into()),
        original_uploader: Some("Channel".into()),
        original_upload_date: Some("20260215".into()),
    }
}

#[tokio::test]
async fn fragment_retry_scenario_completes_with_single_publish() {
    let server = MockServer::start().await;
    // Fragments 2 and 5 fail once each (HTTP 500) before succeeding.
    mount_protocol(&server, vec![2, 5]).await;

    let dir = tempfile::TempDir::new().unwrap();
    // 6.5 parts: 7 video fragments.
    let (video, cover) = fixture_files(&dir, (PART_SIZE * 6 + PART_SIZE / 2) as usize);

    let response = uploader(&server.uri())
        .upload_video(&video, &cover, &publish_request(), None)
        .await
        .unwrap();
    assert_eq!(response.ac_number, 424242);

    let requests = server.received_requests().await.unwrap();
    let fragment_posts = requests
        .iter()
        .filter(|r| r.url.path() == "/api/upload/fragment")
        .count();
    // 7 video fragments + 2 retries + 1 cover fragment.
    assert_eq!(fragment_posts, 10);

    // Exactly one createVideo and one createDouga despite the retries.
    assert_eq!(
        requests.iter().filter(|r| r.url.path() == "/video/api/createVideo").count(),
        1
    );
    assert_eq!(
        requests.iter().filter(|r| r.url.path() == "/video/api/createDouga").count(),
        1
    );
}

#[tokio::test]
async fn transmitted_bytes_equal_file_size_exactly() {
    let server = MockServer::start().await;
    mount_protocol(&server, vec![]).await;

    let dir = tempfile::TempDir::new().unwrap();
    let size = (PART_SIZE * 2 + 123) as usize;
    let (video, cover) = fixture_files(&dir, size);

    uploader(&server.uri())
        .upload_video(&video, &cover, &publish_request(), None)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let video_bytes: usize = requests
        .iter()
        .filter(|r| {
            r.url.path() == "/api/upload/fragment"
                && r.url
                    .query_pairs()
                    .any(|(k, v)| k == "upload_token" && v == "upload-token")
        })
        .map(|r| r.body.len())
        .sum();
    assert_eq!(video_bytes, size);

    // fragment_count = ceil(size / part_size) = 3.
    let complete = requests
        .iter()
        .find(|r| {
            r.url.path() == "/api/upload/complete"
                && r.url
                    .query_pairs()
                    .any(|(k, v)| k == "upload_token" && v == "upload-token")
        })
        .unwrap();
    let count = complete
        .url
        .query_pairs()
        .find(|(k, _)| k == "fragment_count")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    assert_eq!(count, "3");
}

#[tokio::test]
async fn publish_payload_respects_platform_caps() {
    let server = MockServer::start().await;
    mount_protocol(&server, vec![]).await;

    let dir = tempfile::TempDir::new().unwrap();
    let (video, cover) = fixture_files(&dir, 1000);

    let mut request = publish_request();
    request.title = "标".repeat(80);
    request.description = "述".repeat(2000);
    request.tags = (0..9).map(|i| format!("标签{}", i)).collect();

    uploader(&server.uri())
        .upload_video(&video, &cover, &request, None)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let douga = requests
        .iter()
        .find(|r| r.url.path() == "/video/api/createDouga")
        .unwrap();
    let body = String::from_utf8_lossy(&douga.body);
    let form: Vec<(String, String)> = url::form_urlencoded::parse(body.as_bytes())
        .into_owned()
        .collect();
    let field = |name: &str| {
        form.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap()
    };

    assert_eq!(field("title").chars().count(), 50);
    assert!(field("description").chars().count() <= 1000);
    // The provenance header survives truncation intact.
    assert!(field("description").contains("---原简介---"));
    let tags: Vec<String> = serde_json::from_str(&field("tagNames")).unwrap();
    assert_eq!(tags.len(), 6);
    assert!(tags.iter().all(|t| t.chars().count() <= 20));
    assert_eq!(field("creationType"), "1");
    assert_eq!(field("originalDeclare"), "0");
    assert_eq!(field("channelId"), "63");
}

#[test]
fn description_composition_matches_cap_rules() {
    // Original post: plain cap with marker.
    let capped = compose_description(&"长".repeat(1200), None, None, None);
    assert_eq!(capped.chars().count(), 1000);
    assert!(capped.ends_with("..."));

    // Repost: block present, user text truncated before the header.
    let composed = compose_description(
        &"内".repeat(1200),
        Some("https://x"),
        Some("Someone"),
        Some("20260101"),
    );
    assert!(composed.chars().count() <= 1000);
    let header_pos = composed.find("---原简介---").unwrap();
    assert!(header_pos < composed.len());
}
