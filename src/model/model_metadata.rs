//! モデルメタデータの定義
//!
//! tar.gz形式でモデルの重みと一緒に保存され、読み込み時にネットワーク構成と
//! クラス名の対応を復元するために使用します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::ModelConfig;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// クラス名（クラスID順）
    /// 例: ["cat", "heart", "smile", ...]
    pub class_names: Vec<String>,

    /// 分類クラス数
    pub num_classes: usize,

    /// モデル入力サイズ（正方形、グレースケール）
    pub image_size: usize,

    /// 全結合層の隠れ次元
    pub hidden_size: usize,

    /// 学習エポック数（未学習なら0）
    #[serde(default)]
    pub num_epochs: usize,

    /// 保存時刻（RFC 3339形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(class_names: Vec<String>, image_size: usize, hidden_size: usize, num_epochs: usize) -> Self {
        Self {
            num_classes: class_names.len(),
            class_names,
            image_size,
            hidden_size,
            num_epochs,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// メタデータに対応するモデル設定
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new(self.num_classes)
            .with_image_size(self.image_size)
            .with_hidden_size(self.hidden_size)
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self =
            serde_json::from_str(json).context("Failed to deserialize metadata from JSON")?;
        if metadata.class_names.len() != metadata.num_classes {
            anyhow::bail!(
                "メタデータが不正です: class_names {} 個, num_classes {}",
                metadata.class_names.len(),
                metadata.num_classes
            );
        }
        Ok(metadata)
    }
}
