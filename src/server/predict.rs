//! 推論エンドポイント

use std::collections::BTreeMap;

use axum::{
    extract::{Multipart, Path, State},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::ml::Prediction;
use crate::model::{InferenceConfig, Verdict};
use crate::server::error::AppError;
use crate::server::{read_file_field, AppState};

pub const UNKNOWN_MESSAGE: &str = "I don't know what it is";

/// `/send/{emoji}` のレスポンス
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PredictResponse {
    Known {
        message: String,
        probabilities: BTreeMap<String, f32>,
    },
    Unknown {
        message: String,
    },
}

impl PredictResponse {
    /// 確信度しきい値を適用してレスポンスを作成
    pub fn from_prediction(prediction: &Prediction, config: &InferenceConfig, threshold: f32) -> Self {
        match config.verdict(prediction, threshold) {
            Verdict::Known { label, .. } => PredictResponse::Known {
                message: format!("I think, it's a {}", label),
                probabilities: config
                    .class_names
                    .iter()
                    .cloned()
                    .zip(prediction.probabilities.iter().copied())
                    .collect(),
            },
            Verdict::Unknown => PredictResponse::Unknown {
                message: UNKNOWN_MESSAGE.to_string(),
            },
        }
    }
}

/// GET /
pub async fn root() -> Json<Value> {
    Json(json!({ "Hello": "World" }))
}

/// POST /send/{emoji}
///
/// `emoji` は受け取るだけで推論には使用しません。
pub async fn send_emoji(
    State(state): State<AppState>,
    Path(emoji): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, AppError> {
    tracing::debug!(emoji = %emoji, "推論リクエスト");
    let bytes = read_file_field(&mut multipart).await?;

    let threshold = state.settings.confidence_threshold;
    let response = tokio::task::spawn_blocking(move || -> anyhow::Result<PredictResponse> {
        let engine = state.engine_snapshot()?;
        let prediction = engine.classify_bytes(&bytes)?;
        tracing::info!(
            "予測: {} ({:.3})",
            prediction.label,
            prediction.top_probability()
        );
        Ok(PredictResponse::from_prediction(&prediction, engine.config(), threshold))
    })
    .await??;

    Ok(Json(response))
}
