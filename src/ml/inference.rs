//! モデル推論機能

use anyhow::Result;
use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use image::DynamicImage;

use crate::ml::classifier::Prediction;
use crate::ml::ml_model::{decode_grayscale, grayscale_to_input, image_to_input, load_grayscale, EmojiCnn};
use crate::model::{load_model, print_metadata_info, InferenceConfig, ModelMetadata};

/// 推論エンジン
///
/// 保存済みモデルを1度だけ読み込み、リクエストごとに画像を分類します。
#[derive(Clone)]
pub struct InferenceEngine<B: Backend> {
    model: EmojiCnn<B>,
    config: InferenceConfig,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let (model, metadata) = load_model::<B>(model_path.as_ref(), &device)?;
        print_metadata_info(&metadata);
        Ok(Self::from_model(model, &metadata, device))
    }

    /// 構築済みモデルから推論エンジンを作成
    pub fn from_model(model: EmojiCnn<B>, metadata: &ModelMetadata, device: B::Device) -> Self {
        Self {
            model,
            config: InferenceConfig::from_metadata(metadata),
            device,
        }
    }

    fn classify_input(&self, input: Vec<f32>) -> Result<Prediction> {
        let size = self.config.image_size;

        // Tensorに変換 [1, 1, size, size]
        let tensor = Tensor::<B, 1>::from_floats(input.as_slice(), &self.device).reshape([1, 1, size, size]);

        let probabilities: Vec<f32> = self
            .model
            .predict_proba(tensor)
            .into_data()
            .iter::<f32>()
            .collect();

        if probabilities.len() != self.config.num_classes() {
            anyhow::bail!(
                "推論結果のクラス数が不正です: {} (期待: {})",
                probabilities.len(),
                self.config.num_classes()
            );
        }

        Ok(Prediction::from_probabilities(probabilities, &self.config.class_names))
    }

    /// アップロードされた画像バイト列を分類
    pub fn classify_bytes(&self, bytes: &[u8]) -> Result<Prediction> {
        let image = decode_grayscale(bytes, self.config.image_size)?;
        self.classify_input(grayscale_to_input(&image))
    }

    /// デコード済み画像を分類
    pub fn classify_image(&self, image: &DynamicImage) -> Result<Prediction> {
        self.classify_input(image_to_input(image, self.config.image_size))
    }

    /// 画像ファイルを分類
    pub fn classify_path<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let image = load_grayscale(image_path.as_ref(), self.config.image_size)?;
        self.classify_input(grayscale_to_input(&image))
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::training::tests::temp_dir;
    use crate::ml::ModelConfig;
    use crate::model::save_model;
    use burn::backend::NdArray;
    use std::io::Cursor;

    type B = NdArray;

    fn engine(classes: &[&str]) -> InferenceEngine<B> {
        let device = Default::default();
        let model = ModelConfig::new(classes.len()).try_init::<B>(&device).unwrap();
        let metadata = ModelMetadata::new(classes.iter().map(|s| s.to_string()).collect(), 64, 512, 0);
        InferenceEngine::from_model(model, &metadata, device)
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbImage::from_pixel(width, height, image::Rgb([255, 255, 255]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_classify_bytes_any_size() {
        let engine = engine(&["cat", "heart", "smile", "sun"]);
        for (w, h) in [(256, 256), (64, 64), (100, 40)] {
            let prediction = engine.classify_bytes(&png_bytes(w, h)).unwrap();
            assert_eq!(prediction.probabilities.len(), 4);
            let sum: f32 = prediction.probabilities.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_classify_bytes_rejects_garbage() {
        let engine = engine(&["cat", "heart"]);
        assert!(engine.classify_bytes(b"\x00\x01garbage").is_err());
    }

    #[test]
    fn test_load_matches_saved_model() {
        let dir = temp_dir("emoji_inference");
        let path = dir.join("model.tar.gz");
        let device = Default::default();
        let model = ModelConfig::new(2).try_init::<B>(&device).unwrap();
        let metadata = ModelMetadata::new(vec!["cat".into(), "heart".into()], 64, 512, 5);
        save_model(&path, &model, &metadata, None).unwrap();

        let original = InferenceEngine::from_model(model, &metadata, device);
        let loaded = InferenceEngine::<B>::load(&path, Default::default()).unwrap();
        assert_eq!(loaded.config().class_names, vec!["cat", "heart"]);

        let bytes = png_bytes(256, 256);
        let a = original.classify_bytes(&bytes).unwrap();
        let b = loaded.classify_bytes(&bytes).unwrap();
        assert_eq!(a.label, b.label);
        for (x, y) in a.probabilities.iter().zip(b.probabilities.iter()) {
            assert!((x - y).abs() < 1e-6);
        }

        std::fs::remove_dir_all(&dir).ok();
    }
}
