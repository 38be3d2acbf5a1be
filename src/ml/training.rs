//! ディレクトリベースのデータセットとバッチャー
//!
//! `<root>/<class_name>/*.png` 形式のディレクトリツリーを読み込み、
//! 学習・検証・テスト用のデータローダーを構築します。

use anyhow::{Context, Result};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    optim::{adaptor::OptimizerAdaptor, Adam, Optimizer},
    tensor::{backend::{AutodiffBackend, Backend}, Int, Tensor},
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};

use crate::ml::augment::{augment, AugmentationConfig};
use crate::ml::ml_model::{grayscale_to_input, load_grayscale, EmojiCnn};

/// 学習に使うオプティマイザ
pub type EmojiOptimizer<B> = OptimizerAdaptor<Adam, EmojiCnn<B>, B>;

/// Adamの状態（パラメータIDごとのモーメント推定値）
pub type OptimizerState<B> = <EmojiOptimizer<B> as Optimizer<EmojiCnn<B>, B>>::Record;

/// 画像として扱う拡張子
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}

/// 画像フォルダデータセット（パスのリストのみ保持）
///
/// サブディレクトリ名を辞書順に並べたものがクラス名となり、その順番がクラスIDになります。
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    root: PathBuf,
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    class_names: Vec<String>,
}

impl ImageFolderDataset {
    /// ディレクトリから画像を読み込む
    pub fn from_directory(root: &Path) -> Result<Self> {
        let mut class_names = Vec::new();
        for entry in std::fs::read_dir(root)
            .with_context(|| format!("データセットディレクトリを開けません: {}", root.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| anyhow::anyhow!("Invalid directory name: {}", path.display()))?
                    .to_string();
                class_names.push(name);
            }
        }
        class_names.sort();

        if class_names.is_empty() {
            anyhow::bail!("クラスディレクトリが見つかりません: {}", root.display());
        }

        let mut samples = Vec::new();
        for (class_id, class_name) in class_names.iter().enumerate() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(root.join(class_name))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| is_image_file(path))
                .collect();
            files.sort();

            if files.is_empty() {
                tracing::warn!("クラス '{}' に画像がありません ({})", class_name, root.display());
            }
            samples.extend(files.into_iter().map(|path| (path, class_id)));
        }

        tracing::info!(
            "{} 枚の画像を {} クラスから読み込みました: {}",
            samples.len(),
            class_names.len(),
            root.display()
        );

        Ok(Self {
            root: root.to_path_buf(),
            samples,
            class_names,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラスごとのサンプル数
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for (_, id) in &self.samples {
            counts[*id] += 1;
        }
        counts
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let (path, label) = self.samples.get(index)?;
        Some(ImageItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// バッチャー
///
/// 画像を読み込み、必要なら拡張してテンソル化し、ラベルをone-hot化します。
#[derive(Clone)]
pub struct EmojiBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    num_classes: usize,
    augmentation: AugmentationConfig,
    _backend: PhantomData<B>,
}

impl<B: Backend> EmojiBatcher<B> {
    pub fn new(device: B::Device, image_size: usize, num_classes: usize) -> Self {
        Self {
            device,
            image_size,
            num_classes,
            augmentation: AugmentationConfig::none(),
            _backend: PhantomData,
        }
    }

    pub fn with_augmentation(mut self, augmentation: AugmentationConfig) -> Self {
        self.augmentation = augmentation;
        self
    }

    fn load_input(&self, item: &ImageItem) -> Vec<f32> {
        let pixels = self.image_size * self.image_size;
        match load_grayscale(&item.path, self.image_size) {
            Ok(image) => {
                let image = if self.augmentation.is_identity() {
                    image
                } else {
                    augment(&image, &self.augmentation, &mut rand::thread_rng())
                };
                grayscale_to_input(&image)
            }
            Err(e) => {
                tracing::warn!("画像読み込み失敗 {}: {:#}", item.path.display(), e);
                // 白画像で埋める
                vec![1.0f32; pixels]
            }
        }
    }
}

impl<B: Backend> Batcher<B, ImageItem, EmojiBatch<B>> for EmojiBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, _device: &B::Device) -> EmojiBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * size * size);
        let mut targets_vec = Vec::with_capacity(batch_size);
        let mut one_hot = vec![0.0f32; batch_size * self.num_classes];
        let mut paths = Vec::with_capacity(batch_size);

        for (row, item) in items.into_iter().enumerate() {
            all_pixels.extend(self.load_input(&item));
            targets_vec.push(item.label as i64);
            if item.label < self.num_classes {
                one_hot[row * self.num_classes + item.label] = 1.0;
            }
            paths.push(item.path);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 1, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);
        let labels = Tensor::<B, 1>::from_floats(one_hot.as_slice(), &self.device)
            .reshape([batch_size, self.num_classes]);

        EmojiBatch {
            images,
            targets,
            labels,
            paths,
        }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct EmojiBatch<B: Backend> {
    /// [batch_size, 1, size, size]
    pub images: Tensor<B, 4>,
    /// クラスID [batch_size]
    pub targets: Tensor<B, 1, Int>,
    /// one-hotラベル [batch_size, num_classes]
    pub labels: Tensor<B, 2>,
    pub paths: Vec<PathBuf>,
}

/// データローダーを構築
///
/// `shuffle_seed` を指定するとエポックごとにシャッフルします。
pub fn build_dataloader<B: Backend>(
    batcher: EmojiBatcher<B>,
    dataset: ImageFolderDataset,
    batch_size: usize,
    shuffle_seed: Option<u64>,
) -> Arc<dyn DataLoader<B, EmojiBatch<B>>> {
    let builder = DataLoaderBuilder::new(batcher).batch_size(batch_size.max(1));
    match shuffle_seed {
        Some(seed) => builder.shuffle(seed).build(dataset),
        None => builder.build(dataset),
    }
}

/// TrainStep実装 (学習時の順伝播 + 逆伝播)
impl<B: AutodiffBackend> TrainStep<EmojiBatch<B>, ClassificationOutput<B>> for EmojiCnn<B> {
    fn step(&self, batch: EmojiBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);
        let grads = item.loss.backward();
        TrainOutput::new(self, grads, item)
    }
}

/// ValidStep実装 (検証時の順伝播のみ)
impl<B: Backend> ValidStep<EmojiBatch<B>, ClassificationOutput<B>> for EmojiCnn<B> {
    fn step(&self, batch: EmojiBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}
