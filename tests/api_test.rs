use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use rust_upload_pipeline::config::UploadConfig;
use rust_upload_pipeline::events::{EventBus, UploadEvent};
use rust_upload_pipeline::services::image_tool::ImageTool;
use rust_upload_pipeline::services::pipeline::ProcessingPipeline;
use rust_upload_pipeline::services::probe::NoOpProbe;
use rust_upload_pipeline::services::versions::VersionGenerator;
use rust_upload_pipeline::{AppState, create_app};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "---------------------------123456789012345678901234567";

/// Stands in for `convert`: copies the first argument to the last.
struct CopyTool;

#[async_trait]
impl ImageTool for CopyTool {
    async fn convert(&self, args: &[String], _timeout: Option<Duration>) -> anyhow::Result<()> {
        let (src, dst) = (&args[0], &args[args.len() - 1]);
        tokio::fs::copy(src, dst).await?;
        Ok(())
    }
}

fn setup(config: UploadConfig) -> (TempDir, Router, EventBus) {
    let dir = tempfile::tempdir().unwrap();
    let tmp = dir.path().join("tmp");
    std::fs::create_dir_all(&tmp).unwrap();
    let config = Arc::new(
        config
            .with_upload_dir(dir.path().join("files"))
            .with_tmp_dir(tmp),
    );

    let generator = VersionGenerator::new(Arc::new(CopyTool), Arc::new(NoOpProbe), false);
    let pipeline = Arc::new(ProcessingPipeline::new(
        config,
        Arc::new(NoOpProbe),
        generator,
    ));
    let events = EventBus::default();
    let app = create_app(AppState::new(pipeline, events.clone()));
    (dir, app, events)
}

fn multipart(parts: &[(&str, Option<&str>, &str)]) -> String {
    let mut body = String::new();
    for (name, file_name, content) in parts {
        body.push_str(&format!("--{}\r\n", BOUNDARY));
        match file_name {
            Some(file_name) => body.push_str(&format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                name, file_name
            )),
            None => body.push_str(&format!(
                "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                name
            )),
        }
        body.push_str(content);
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{}--\r\n", BOUNDARY));
    body
}

fn upload_request(body: String, accept: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/files")
        .header(header::HOST, "uploads.test")
        .header(header::ACCEPT, accept)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_upload_flow() {
    let (dir, app, _) = setup(UploadConfig::default());

    let body = multipart(&[
        ("files[]", Some("photo.png"), "not really a png"),
        ("files[]", Some("notes.txt"), "Hello, this is a test file content!"),
    ]);
    let response = app
        .clone()
        .oneshot(upload_request(body, "application/json, text/javascript"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/json"
    );
    let json = json_body(response).await;
    let files = json["files"].as_array().unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0]["name"], "photo.png");
    assert_eq!(files[0]["url"], "http://uploads.test/files/photo.png");
    assert_eq!(
        files[0]["thumbnail_url"],
        "http://uploads.test/files/thumbnail/photo.png"
    );
    assert_eq!(files[0]["delete_url"], "http://uploads.test/files/photo.png");
    assert_eq!(files[0]["delete_type"], "DELETE");
    assert_eq!(files[1]["name"], "notes.txt");
    assert!(files[1].get("thumbnail_url").is_none());
    assert!(files[1].get("metadata").is_none());

    assert!(dir.path().join("files/photo.png").exists());
    assert!(dir.path().join("files/thumbnail/photo.png").exists());
    assert!(dir.path().join("files/notes.txt").exists());
    assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);

    // Listing shows both originals, not the version directory.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/files")
                .header(header::HOST, "uploads.test")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    let json = json_body(response).await;
    let names: Vec<_> = json["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["notes.txt", "photo.png"]);
}

#[tokio::test]
async fn test_rejected_file_reports_error() {
    let config = UploadConfig {
        accept_file_types: regex::Regex::new(r"\.png$").unwrap(),
        ..UploadConfig::default()
    };
    let (dir, app, _) = setup(config);

    let body = multipart(&[("files[]", Some("script.sh"), "echo hi")]);
    let response = app
        .oneshot(upload_request(body, "application/json"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["files"][0]["error"], "Filetype not allowed");
    assert_eq!(json["files"][0]["url"], "http://uploads.test/files/script.sh");
    assert_eq!(json["files"][0]["delete_url"], "http://uploads.test/files/script.sh");
    assert_eq!(json["files"][0]["delete_type"], "DELETE");
    assert!(!dir.path().join("files/script.sh").exists());
}

#[tokio::test]
async fn test_redirect_carries_result() {
    let (_dir, app, _) = setup(UploadConfig::default().without_image_versions());

    let body = multipart(&[
        ("redirect", None, "http://app.test/done?%s"),
        ("files[]", Some("a.txt"), "abc"),
    ]);
    let response = app
        .oneshot(upload_request(body, "text/html"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with("http://app.test/done?%7B%22files%22%3A%5B%7B"));
    assert!(location.contains("a.txt"));
}

#[tokio::test]
async fn test_delete_file_and_versions() {
    let (dir, app, events) = setup(UploadConfig::default());
    let mut rx = events.subscribe();
    let files = dir.path().join("files");
    std::fs::create_dir_all(files.join("thumbnail")).unwrap();
    std::fs::write(files.join("a.png"), b"x").unwrap();
    std::fs::write(files.join("thumbnail/a.png"), b"x").unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/files/a.png")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["success"], true);
    assert!(!files.join("a.png").exists());
    assert!(!files.join("thumbnail/a.png").exists());
    assert_eq!(rx.try_recv().unwrap(), UploadEvent::Delete("a.png".to_string()));

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/files/a.png")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_health_check() {
    let (_dir, app, _) = setup(UploadConfig::default());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ok");
}
