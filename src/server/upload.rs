//! データセット収集エンドポイント
//!
//! 許可リストにある絵文字カテゴリの画像を `<dataset_dir>/<emoji>/<ランダム16進>.png` に保存します。

use axum::{
    extract::{Multipart, Path, State},
    Json,
};
use serde::Serialize;

use crate::server::error::AppError;
use crate::server::{read_file_field, AppState};

pub const NOT_FOUND_MESSAGE: &str = "Emoji not found";

/// `/upload/{emoji}` のレスポンス
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum UploadResponse {
    Saved { file_size: usize },
    Rejected { error: String },
}

/// 衝突しない前提のランダムなファイル名（32桁の16進）
pub fn random_file_name() -> String {
    format!("{:032x}.png", rand::random::<u128>())
}

/// POST /upload/{emoji}
pub async fn upload_emoji(
    State(state): State<AppState>,
    Path(emoji): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    if !state.settings.is_known_category(&emoji) {
        tracing::info!("未登録の絵文字カテゴリ: {}", emoji);
        return Ok(Json(UploadResponse::Rejected {
            error: NOT_FOUND_MESSAGE.to_string(),
        }));
    }

    let bytes = read_file_field(&mut multipart).await?;

    let class_dir = state.settings.dataset_dir.join(&emoji);
    tokio::fs::create_dir_all(&class_dir).await?;
    let path = class_dir.join(random_file_name());
    tokio::fs::write(&path, &bytes).await?;

    tracing::info!("保存しました: {} ({} バイト)", path.display(), bytes.len());
    Ok(Json(UploadResponse::Saved {
        file_size: bytes.len(),
    }))
}
