//! HTTPサービス
//!
//! 起動時にモデルを1度だけ読み込み、全リクエストで共有します。

pub mod error;
pub mod predict;
pub mod upload;

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::Multipart,
    http::StatusCode,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::ml::InferenceEngine;
use crate::model::{AppConfig, ServerSettings};
use crate::ServeBackend;
use error::AppError;

/// ハンドラ間で共有する状態
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Mutex<InferenceEngine<ServeBackend>>>,
    pub settings: Arc<ServerSettings>,
}

impl AppState {
    pub fn new(engine: InferenceEngine<ServeBackend>, settings: ServerSettings) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            settings: Arc::new(settings),
        }
    }

    /// 推論用にエンジンを複製する
    ///
    /// ロックは複製の間だけ保持し、推論自体は並行に実行できる。
    pub fn engine_snapshot(&self) -> anyhow::Result<InferenceEngine<ServeBackend>> {
        let engine = self
            .engine
            .lock()
            .map_err(|_| anyhow::anyhow!("推論エンジンのロックが破損しています"))?;
        Ok(engine.clone())
    }
}

/// マルチパートの `file` フィールドを読み込む
pub(crate) async fn read_file_field(multipart: &mut Multipart) -> Result<Bytes, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::new(StatusCode::BAD_REQUEST, e.into()))?
    {
        if field.name() == Some("file") {
            return field
                .bytes()
                .await
                .map_err(|e| AppError::new(StatusCode::BAD_REQUEST, e.into()));
        }
    }
    Err(AppError::missing_field("file"))
}

/// ルーター構築（CORSは全許可）
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(predict::root))
        .route("/send/:emoji", post(predict::send_emoji))
        .route("/upload/:emoji", post(upload::upload_emoji))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// モデルを読み込んでサーバーを起動
pub async fn serve(config: AppConfig) -> Result<()> {
    let model_path = config.model_path.clone();
    let engine = tokio::task::spawn_blocking(move || {
        InferenceEngine::<ServeBackend>::load(&model_path, Default::default())
    })
    .await?
    .with_context(|| format!("モデルの読み込みに失敗しました: {}", config.model_path.display()))?;

    let bind_address = config.server.bind_address.clone();
    let state = AppState::new(engine, config.server);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("{} で待ち受けできません", bind_address))?;
    tracing::info!("サーバーを起動しました: http://{}", bind_address);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::training::tests::temp_dir;
    use crate::ml::ModelConfig;
    use crate::model::ModelMetadata;
    use axum::body::Body;
    use axum::http::{header, Request};
    use serde_json::{json, Value};
    use std::io::Cursor;
    use std::path::Path;
    use tower::ServiceExt;

    const BOUNDARY: &str = "emoji-test-boundary";

    fn state_with(classes: &[&str], settings: ServerSettings) -> AppState {
        let device = Default::default();
        let classes: Vec<String> = classes.iter().map(|s| s.to_string()).collect();
        let model = ModelConfig::new(classes.len()).try_init::<ServeBackend>(&device).unwrap();
        let metadata = ModelMetadata::new(classes, 64, 512, 0);
        let engine = InferenceEngine::from_model(model, &metadata, device);
        AppState::new(engine, settings)
    }

    fn test_state(dataset_dir: &Path) -> AppState {
        state_with(
            &crate::model::DEFAULT_EMOJI_CATEGORIES,
            ServerSettings {
                dataset_dir: dataset_dir.to_path_buf(),
                ..Default::default()
            },
        )
    }

    fn png_bytes() -> Vec<u8> {
        let image = image::RgbaImage::from_pixel(256, 256, image::Rgba([255, 255, 255, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn multipart_request(uri: &str, field: &str, bytes: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"drawing.png\"\r\nContent-Type: image/png\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn files_in(dir: &Path) -> Vec<std::path::PathBuf> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_root() {
        let dir = temp_dir("emoji_server_root");
        let state = test_state(&dir);
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();

        let (status, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "Hello": "World" }));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_upload_every_known_category() {
        let dir = temp_dir("emoji_server_upload");
        let state = test_state(&dir);
        let bytes = png_bytes();

        for category in state.settings.emoji_categories.clone() {
            let request = multipart_request(&format!("/upload/{}", category), "file", &bytes);
            let (status, body) = send(&state, request).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!({ "file_size": bytes.len() }));

            let files = files_in(&dir.join(&category));
            assert_eq!(files.len(), 1);
            assert_eq!(std::fs::read(&files[0]).unwrap(), bytes);
            assert_eq!(files[0].extension().unwrap(), "png");
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_upload_unknown_category_writes_nothing() {
        let dir = temp_dir("emoji_server_unknown");
        let state = test_state(&dir);

        let request = multipart_request("/upload/unicorn", "file", &png_bytes());
        let (status, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "error": "Emoji not found" }));
        assert!(files_in(&dir).is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_send_confident_prediction() {
        let dir = temp_dir("emoji_server_send");
        // 1クラスのモデルは常に確率1.0を返す
        let state = state_with(
            &["smile"],
            ServerSettings {
                dataset_dir: dir.clone(),
                ..Default::default()
            },
        );

        // パスパラメータは推論に影響しない
        let request = multipart_request("/send/anything", "file", &png_bytes());
        let (status, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "I think, it's a smile");

        let probabilities = body["probabilities"].as_object().unwrap();
        assert_eq!(probabilities.len(), 1);
        let sum: f64 = probabilities.values().map(|v| v.as_f64().unwrap()).sum();
        assert!((sum - 1.0).abs() < 1e-4);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_send_below_threshold() {
        let dir = temp_dir("emoji_server_unsure");
        // 確率は1.0を超えないので必ずしきい値未満になる
        let state = state_with(
            &crate::model::DEFAULT_EMOJI_CATEGORIES,
            ServerSettings {
                dataset_dir: dir.clone(),
                confidence_threshold: 1.1,
                ..Default::default()
            },
        );

        let request = multipart_request("/send/smile", "file", &png_bytes());
        let (status, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "message": "I don't know what it is" }));
        assert!(body.get("probabilities").is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_concurrent_sends() {
        let dir = temp_dir("emoji_server_concurrent");
        let state = state_with(
            &["smile"],
            ServerSettings {
                dataset_dir: dir.clone(),
                ..Default::default()
            },
        );
        let bytes = png_bytes();

        let (a, b) = tokio::join!(
            send(&state, multipart_request("/send/a", "file", &bytes)),
            send(&state, multipart_request("/send/b", "file", &bytes)),
        );
        for (status, body) in [a, b] {
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["message"], "I think, it's a smile");
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_send_without_file_field() {
        let dir = temp_dir("emoji_server_nofile");
        let state = test_state(&dir);

        let request = multipart_request("/send/smile", "image", &png_bytes());
        let (status, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].as_str().unwrap().contains("file"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_send_undecodable_image() {
        let dir = temp_dir("emoji_server_garbage");
        let state = test_state(&dir);

        let request = multipart_request("/send/smile", "file", b"definitely not a png");
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        std::fs::remove_dir_all(&dir).ok();
    }
}
