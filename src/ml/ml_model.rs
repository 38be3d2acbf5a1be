//! 機械学習モデルの共通定義
//!
//! 手描き絵文字分類用のCNNモデルと、学習・推論で共有する画像前処理を提供します。

use anyhow::{Context, Result};
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use image::{imageops::FilterType, DynamicImage, GrayImage};
use std::path::Path;

/// 入力画像サイズ（正方形、グレースケール1チャネル）
pub const IMAGE_SIZE: usize = 64;

/// 最終畳み込みブロックの出力チャネル数
const FINAL_CHANNELS: usize = 128;

/// 4つの {Conv 3x3 + MaxPool 2x2} ブロック通過後の特徴マップサイズ
///
/// 1x1未満になる場合は `None`。
pub fn feature_map_size(image_size: usize) -> Option<usize> {
    let mut size = image_size;
    for _ in 0..4 {
        // Conv 3x3 (no padding): size - 2, Pool 2x2 (stride 2): 切り捨て
        size = size.checked_sub(2)? / 2;
    }
    (size > 0).then_some(size)
}

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 64)]
    pub image_size: usize,
    /// 全結合層の隠れ次元
    #[config(default = 512)]
    pub hidden_size: usize,
}

impl ModelConfig {
    /// モデルを初期化
    ///
    /// 入力サイズが小さすぎる場合（46未満）はエラーを返します。
    pub fn try_init<B: Backend>(&self, device: &B::Device) -> Result<EmojiCnn<B>> {
        let fm = feature_map_size(self.image_size).with_context(|| {
            format!("入力サイズが小さすぎます: {} (最小46x46が必要)", self.image_size)
        })?;
        if self.num_classes == 0 {
            anyhow::bail!("クラス数が0です");
        }

        let d = FINAL_CHANNELS * fm * fm;
        tracing::debug!(
            input = self.image_size,
            feature_map = fm,
            flatten = d,
            hidden = self.hidden_size,
            classes = self.num_classes,
            "EmojiCnnを初期化します"
        );

        let block = |channels: [usize; 2]| {
            Conv2dConfig::new(channels, [3, 3])
                .with_stride([1, 1])
                .init::<B>(device)
        };
        let pool = || MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();

        Ok(EmojiCnn {
            conv1: block([1, 32]),
            pool1: pool(),
            conv2: block([32, 64]),
            pool2: pool(),
            conv3: block([64, 128]),
            pool3: pool(),
            conv4: block([128, FINAL_CHANNELS]),
            pool4: pool(),
            fc1: LinearConfig::new(d, self.hidden_size).init(device),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// 手描き絵文字分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (no padding) + ReLU + MaxPool 2x2} x 4ブロック (1 -> 32 -> 64 -> 128 -> 128)
/// - Flatten
/// - FC: d -> hidden + ReLU
/// - FC: hidden -> num_classes
/// - Softmax (確率出力時)
///
/// 64x64入力の場合、特徴マップは 128 x 2 x 2 (d = 512) になります。
#[derive(Module, Debug)]
pub struct EmojiCnn<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,
    conv3: Conv2d<B>,
    pool3: MaxPool2d,
    conv4: Conv2d<B>,
    pool4: MaxPool2d,

    fc1: Linear<B>,
    fc2: Linear<B>,

    activation: Relu,
}

impl<B: Backend> EmojiCnn<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 1, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.pool1.forward(self.activation.forward(self.conv1.forward(images)));
        let x = self.pool2.forward(self.activation.forward(self.conv2.forward(x)));
        let x = self.pool3.forward(self.activation.forward(self.conv3.forward(x)));
        let x = self.pool4.forward(self.activation.forward(self.conv4.forward(x)));

        // Flatten
        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.activation.forward(self.fc1.forward(x));
        self.fc2.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// デコード済み画像をグレースケール化して `size` x `size` にリサイズ
fn to_model_grayscale(image: &DynamicImage, size: usize) -> GrayImage {
    let gray = image.to_luma8();
    if gray.width() == size as u32 && gray.height() == size as u32 {
        return gray;
    }
    image::imageops::resize(&gray, size as u32, size as u32, FilterType::Nearest)
}

/// 画像ファイルを読み込んでモデル入力用のグレースケール画像にする
pub fn load_grayscale(path: &Path, size: usize) -> Result<GrayImage> {
    let image = image::open(path)
        .with_context(|| format!("画像の読み込みに失敗しました: {}", path.display()))?;
    Ok(to_model_grayscale(&image, size))
}

/// アップロードされたバイト列をデコードしてモデル入力用のグレースケール画像にする
pub fn decode_grayscale(bytes: &[u8], size: usize) -> Result<GrayImage> {
    let image = image::load_from_memory(bytes).context("画像のデコードに失敗しました")?;
    Ok(to_model_grayscale(&image, size))
}

/// デコード済み画像からモデル入力を作る
pub fn image_to_input(image: &DynamicImage, size: usize) -> Vec<f32> {
    grayscale_to_input(&to_model_grayscale(image, size))
}

/// グレースケール画像を [0, 1] に正規化して (H, W) の順で平坦化
pub fn grayscale_to_input(image: &GrayImage) -> Vec<f32> {
    image.as_raw().iter().map(|&p| p as f32 / 255.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::Luma;

    type B = NdArray;

    #[test]
    fn test_feature_map_size() {
        assert_eq!(feature_map_size(64), Some(2));
        assert_eq!(feature_map_size(256), Some(14));
        assert_eq!(feature_map_size(46), Some(1));
        assert_eq!(feature_map_size(45), None);
        assert_eq!(feature_map_size(0), None);
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = ModelConfig::new(12).try_init::<B>(&device).unwrap();
        let images = Tensor::<B, 4>::zeros([3, 1, IMAGE_SIZE, IMAGE_SIZE], &device);

        assert_eq!(model.forward(images).dims(), [3, 12]);
    }

    #[test]
    fn test_predict_proba_sums_to_one() {
        let device = Default::default();
        let model = ModelConfig::new(5).try_init::<B>(&device).unwrap();
        let images = Tensor::<B, 4>::ones([2, 1, IMAGE_SIZE, IMAGE_SIZE], &device);

        let probs: Vec<f32> = model.predict_proba(images).into_data().iter::<f32>().collect();
        assert_eq!(probs.len(), 10);
        for row in probs.chunks(5) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4, "sum = {}", sum);
        }
    }

    #[test]
    fn test_too_small_input_is_rejected() {
        let device = Default::default();
        let result = ModelConfig::new(12).with_image_size(32).try_init::<B>(&device);
        assert!(result.is_err());
    }

    #[test]
    fn test_grayscale_resize_and_normalize() {
        let rgb = image::RgbImage::from_pixel(256, 256, image::Rgb([255, 255, 255]));
        let input = image_to_input(&DynamicImage::ImageRgb8(rgb), IMAGE_SIZE);

        assert_eq!(input.len(), IMAGE_SIZE * IMAGE_SIZE);
        assert!(input.iter().all(|&v| (v - 1.0).abs() < 1e-6));

        let black = GrayImage::from_pixel(4, 4, Luma([0]));
        assert!(grayscale_to_input(&black).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_decode_grayscale_rejects_garbage() {
        assert!(decode_grayscale(b"not an image", IMAGE_SIZE).is_err());
    }
}
