//! アプリケーション設定管理モジュール
//!
//! 分類器のハイパーパラメータ、モデルパス、HTTPサーバー設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ml::{AugmentationConfig, IMAGE_SIZE};
use crate::model::inference_config::DEFAULT_CONFIDENCE_THRESHOLD;

/// 収集対象の絵文字カテゴリ（既定値）
pub const DEFAULT_EMOJI_CATEGORIES: [&str; 12] = [
    "smile", "sad", "laugh", "angry", "heart", "star",
    "sun", "moon", "cloud", "fire", "thumbs_up", "ghost",
];

/// 分類器設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmojiClassifierConfig {
    /// モデル入力サイズ（正方形）
    pub image_size: usize,
    /// 分類クラス数
    pub num_classes: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// エポック数
    pub epochs: usize,
    /// 学習率（Adam）
    pub learning_rate: f64,
    /// シャッフル用シード
    pub seed: u64,
    /// 学習データの拡張設定
    pub augmentation: AugmentationConfig,
    /// 学習データディレクトリ
    pub train_path: PathBuf,
    /// 検証データディレクトリ
    pub validation_path: PathBuf,
    /// テストデータディレクトリ
    pub test_path: PathBuf,
}

impl Default for EmojiClassifierConfig {
    fn default() -> Self {
        Self {
            image_size: IMAGE_SIZE,
            num_classes: 12,
            batch_size: 32,
            epochs: 10,
            learning_rate: 1e-3,
            seed: 42,
            augmentation: AugmentationConfig::default(),
            train_path: PathBuf::from("dataset/train"),
            validation_path: PathBuf::from("dataset/validation"),
            test_path: PathBuf::from("dataset/test"),
        }
    }
}

/// HTTPサーバー設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// 待ち受けアドレス
    pub bind_address: String,
    /// アップロード画像の保存先（`<dataset_dir>/<emoji>/*.png`）
    pub dataset_dir: PathBuf,
    /// ラベルを返す最小確率
    pub confidence_threshold: f32,
    /// アップロードを受け付ける絵文字カテゴリ
    pub emoji_categories: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_string(),
            dataset_dir: PathBuf::from("dataset"),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            emoji_categories: DEFAULT_EMOJI_CATEGORIES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ServerSettings {
    /// 許可リストに含まれるカテゴリか
    pub fn is_known_category(&self, emoji: &str) -> bool {
        self.emoji_categories.iter().any(|c| c == emoji)
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// 分類器設定
    pub classifier: EmojiClassifierConfig,
    /// 保存済みモデルのパス
    pub model_path: PathBuf,
    /// HTTPサーバー設定
    pub server: ServerSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            classifier: EmojiClassifierConfig::default(),
            model_path: PathBuf::from("models/emoji_classifier.tar.gz"),
            server: ServerSettings::default(),
        }
    }
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない・読めない場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します ({})", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => {
                tracing::info!("設定ファイルを読み込みました: {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!(
                    "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// モデルパスを設定
    pub fn set_model_path<P: AsRef<Path>>(&mut self, path: P) {
        self.model_path = path.as_ref().to_path_buf();
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        let c = &self.classifier;
        tracing::info!("=== アプリケーション設定 ===");
        tracing::info!("モデルパス: {}", self.model_path.display());
        tracing::info!("入力サイズ: {}x{}, クラス数: {}", c.image_size, c.image_size, c.num_classes);
        tracing::info!("エポック数: {}, バッチサイズ: {}, 学習率: {}", c.epochs, c.batch_size, c.learning_rate);
        tracing::info!(
            "データ: train={} validation={} test={}",
            c.train_path.display(),
            c.validation_path.display(),
            c.test_path.display()
        );
        tracing::info!("待ち受け: {}", self.server.bind_address);
        tracing::info!("収集先: {}", self.server.dataset_dir.display());
        tracing::info!("確信度しきい値: {}", self.server.confidence_threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.classifier.num_classes, 12);
        assert_eq!(config.classifier.image_size, 64);
        assert_eq!(config.classifier.batch_size, 32);
        assert_eq!(config.classifier.epochs, 10);
        assert_eq!(config.server.confidence_threshold, 0.2);
        assert_eq!(config.server.emoji_categories.len(), config.classifier.num_classes);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"classifier": {"epochs": 3}, "server": {"emoji_categories": ["smile"]}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.classifier.epochs, 3);
        assert_eq!(config.classifier.batch_size, 32);
        assert!(config.server.is_known_category("smile"));
        assert!(!config.server.is_known_category("heart"));
    }

    #[test]
    fn test_save_then_load() {
        let path = std::env::temp_dir().join(format!("emoji_config_{:016x}.json", rand::random::<u64>()));
        let mut config = AppConfig::default();
        config.set_model_path("models/other.tar.gz");
        config.server.confidence_threshold = 0.35;
        config.save(&path).unwrap();

        let loaded = AppConfig::load_or_default(&path);
        assert_eq!(loaded, config);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_broken_file_falls_back_to_default() {
        let path = std::env::temp_dir().join(format!("emoji_config_{:016x}.json", rand::random::<u64>()));
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(AppConfig::load_or_default(&path), AppConfig::default());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = AppConfig::load_or_default("/nonexistent/config.json");
        assert_eq!(config, AppConfig::default());
    }
}
