use super::*;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;
use tower::ServiceExt;


/// Find `-o TEMPLATE` and write `video` to the template with `mp4` as extension
#[cfg(unix)]
const WRITE_OUTPUT: &str = r#"
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
echo "[download] writing output"
printf 'video' > "$(printf '%s' "$out" | sed 's/%(ext)s$/mp4/')"
"#;

/// Configuration rooted in `dir`, running `script` through `/bin/sh` as the tool
fn test_config(dir: &Path, script: &str) -> Config {
    let mut config = Config::default();
    config.tool.program = "/bin/sh".into();
    config.tool.default_args = vec!["-c".into(), script.into(), "fake-tool".into()];
    config.storage.logs_dir = dir.join("logs");
    config.storage.holding_dir = dir.join("holding");
    config.tasks.retry.initial_delay = Duration::ZERO;
    config.tasks.completion_grace = Duration::from_secs(60);
    config.tasks.shutdown_grace = Duration::from_secs(60);
    config.api.bind_address = "127.0.0.1:0".parse().unwrap();
    config
}

async fn create_test_box(config: Config) -> Arc<DownloadBox> {
    Arc::new(DownloadBox::new(config).await.unwrap())
}

fn router(download_box: &Arc<DownloadBox>) -> Router {
    create_router(download_box.clone(), download_box.config.clone())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_api_server_spawns() {
    let dir = tempdir().unwrap();
    let download_box = create_test_box(test_config(dir.path(), "true")).await;

    let api_handle = tokio::spawn({
        let download_box = download_box.clone();
        let config = download_box.config.clone();
        async move { start_api_server(download_box, config).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!api_handle.is_finished(), "server should still be running");
    api_handle.abort();
}

#[tokio::test]
async fn test_cors_enabled() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path(), "true");
    config.api.cors_enabled = true;
    config.api.cors_origins = vec!["*".to_string()];
    let download_box = create_test_box(config).await;

    let request = Request::builder()
        .uri("/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = router(&download_box).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers().contains_key("access-control-allow-origin"),
        "CORS header should be present when CORS is enabled"
    );
}

#[tokio::test]
async fn test_cors_disabled() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path(), "true");
    config.api.cors_enabled = false;
    let download_box = create_test_box(config).await;

    let request = Request::builder()
        .uri("/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = router(&download_box).oneshot(request).await.unwrap();

    assert!(!response.headers().contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn test_authentication_with_api_key() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path(), "true");
    config.api.api_key = Some("test-secret-key".to_string());
    let download_box = create_test_box(config).await;
    let app = router(&download_box);

    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "unauthorized");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("X-Api-Key", "test-secret-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/info")
                .header("Authorization", "Bearer test-secret-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("X-Api-Key", "wrong-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_swagger_ui_follows_config() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path(), "true");
    config.api.swagger_ui = true;
    let download_box = create_test_box(config).await;
    let response = router(&download_box)
        .oneshot(get("/api-docs/openapi.json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path(), "true");
    config.api.swagger_ui = false;
    let download_box = create_test_box(config).await;
    let response = router(&download_box)
        .oneshot(get("/api-docs/openapi.json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
