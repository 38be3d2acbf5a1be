//! HTTPハンドラのエラー型

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// ハンドラから返すエラー
///
/// 既定では500、必須フィールド欠落などは422として返します。
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    pub fn new(status: StatusCode, error: anyhow::Error) -> Self {
        Self { status, error }
    }

    /// 必須のマルチパートフィールドが無い
    pub fn missing_field(name: &str) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            anyhow::anyhow!("multipart field '{}' is required", name),
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("リクエスト処理エラー: {:#}", self.error);
        } else {
            tracing::warn!("不正なリクエスト: {:#}", self.error);
        }
        (self.status, Json(json!({ "detail": format!("{:#}", self.error) }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.into())
    }
}
