//! モデルメタデータを使用した推論設定
//!
//! クラスIDとラベルの対応、および確信度しきい値による判定を提供します。

use crate::ml::Prediction;
use crate::model::model_metadata::ModelMetadata;

/// ラベルを返すのに必要な最小確率
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.2;

/// 確信度しきい値を適用した判定結果
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// しきい値以上: 最大確率のラベル
    Known { label: String, probability: f32 },
    /// しきい値未満
    Unknown,
}

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// 全クラスラベル（クラスID順）
    pub class_names: Vec<String>,

    /// モデル入力解像度
    pub image_size: usize,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_names: metadata.class_names.clone(),
            image_size: metadata.image_size,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラスインデックスからラベルを取得
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.class_names.get(index).map(String::as_str)
    }

    /// 最大確率がしきい値以上ならラベル、未満なら `Unknown`
    pub fn verdict(&self, prediction: &Prediction, threshold: f32) -> Verdict {
        let probability = prediction.top_probability();
        if probability < threshold {
            return Verdict::Unknown;
        }
        match self.class_index_to_label(prediction.class_index) {
            Some(label) => Verdict::Known {
                label: label.to_string(),
                probability,
            },
            None => Verdict::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> InferenceConfig {
        InferenceConfig {
            class_names: vec!["cat".into(), "heart".into(), "smile".into()],
            image_size: 64,
        }
    }

    #[test]
    fn test_label_lookup() {
        let config = config();
        assert_eq!(config.class_index_to_label(2), Some("smile"));
        assert_eq!(config.class_index_to_label(3), None);
        assert_eq!(config.num_classes(), 3);
    }

    #[test]
    fn test_verdict_threshold() {
        let config = config();

        let low = Prediction::from_probabilities(vec![0.19, 0.19, 0.18], &config.class_names);
        assert_eq!(config.verdict(&low, DEFAULT_CONFIDENCE_THRESHOLD), Verdict::Unknown);

        let exact = Prediction::from_probabilities(vec![0.2, 0.1, 0.1], &config.class_names);
        assert_eq!(
            config.verdict(&exact, DEFAULT_CONFIDENCE_THRESHOLD),
            Verdict::Known { label: "cat".into(), probability: 0.2 }
        );

        let high = Prediction::from_probabilities(vec![0.1, 0.1, 0.8], &config.class_names);
        match config.verdict(&high, DEFAULT_CONFIDENCE_THRESHOLD) {
            Verdict::Known { label, .. } => assert_eq!(label, "smile"),
            Verdict::Unknown => panic!("expected a label"),
        }
    }
}
