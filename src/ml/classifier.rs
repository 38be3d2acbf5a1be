//! 絵文字分類器: 学習・評価・保存・読み込み・予測
//!
//! 構築時に学習・検証・テストの3つのデータセットを走査し、
//! burnの `Learner` で学習、テストデータで評価します。

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use burn::{
    module::{AutodiffModule, Module},
    optim::{AdamConfig, Optimizer},
    record::{BinBytesRecorder, BinFileRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::AutodiffBackend, ElementConversion, Tensor},
    train::{
        metric::{AccuracyMetric, LossMetric},
        LearnerBuilder, LearnerSummary, LearningStrategy, MetricSummary,
    },
};
use image::DynamicImage;
use rand::Rng;

use crate::ml::ml_model::{image_to_input, EmojiCnn, ModelConfig};
use crate::ml::training::{build_dataloader, EmojiBatcher, EmojiOptimizer, ImageFolderDataset, OptimizerState};
use crate::model::{
    encode_optimizer_state, load_metadata, load_model, load_optimizer_state, save_model,
    EmojiClassifierConfig, ModelMetadata,
};

/// Learnerが記録するメトリクス名
const LOSS_METRIC: &str = "Loss";
const ACCURACY_METRIC: &str = "Accuracy";

/// 予測結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// クラスごとの確率（クラスID順）
    pub probabilities: Vec<f32>,
    /// 最大確率のクラスID
    pub class_index: usize,
    /// 最大確率のクラス名
    pub label: String,
}

impl Prediction {
    /// 確率ベクトルから予測結果を作成
    pub fn from_probabilities(probabilities: Vec<f32>, class_names: &[String]) -> Self {
        let class_index = argmax(&probabilities);
        let label = class_names
            .get(class_index)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_index));
        Self {
            probabilities,
            class_index,
            label,
        }
    }

    /// 最大確率
    pub fn top_probability(&self) -> f32 {
        self.probabilities.get(self.class_index).copied().unwrap_or(0.0)
    }
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// 1パス分の評価結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// 平均交差エントロピー損失
    pub loss: f64,
    /// 正解率 [0, 1]
    pub accuracy: f64,
    /// 評価したサンプル数
    pub samples: usize,
}

/// 1エポック分の学習・検証メトリクス（Learnerの記録から取得）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    /// 1始まりのエポック番号
    pub epoch: usize,
    pub train_loss: f64,
    /// 正解率 [0, 1]
    pub train_accuracy: f64,
    pub valid_loss: f64,
    /// 正解率 [0, 1]
    pub valid_accuracy: f64,
}

/// 学習履歴
#[derive(Debug, Clone)]
pub struct TrainingHistory {
    /// エポックごとのメトリクス
    pub epochs: Vec<EpochMetrics>,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub train_samples: usize,
    pub validation_samples: usize,
    /// 学習後の検証データでの評価
    pub validation: Evaluation,
}

/// 誤分類されたテストサンプル
#[derive(Debug, Clone)]
pub struct Misclassification {
    /// モデル入力（[0, 1] に正規化したグレースケール画素、H x W）
    pub input: Vec<f32>,
    pub path: PathBuf,
    /// 予測クラスID
    pub predicted: usize,
    /// 正解クラスID
    pub actual: usize,
}

/// 絵文字分類器
pub struct EmojiClassifier<B: AutodiffBackend> {
    config: EmojiClassifierConfig,
    device: B::Device,
    model: EmojiCnn<B>,
    class_names: Vec<String>,
    epochs_trained: usize,
    /// 直近の学習または読み込んだモデルのAdam状態
    optimizer_state: Option<OptimizerState<B>>,
    train_set: ImageFolderDataset,
    validation_set: ImageFolderDataset,
    test_set: ImageFolderDataset,
}

impl<B: AutodiffBackend> EmojiClassifier<B> {
    /// 分類器を構築
    ///
    /// 3つのデータセットディレクトリをこの時点で走査します。
    pub fn new(config: EmojiClassifierConfig, device: B::Device) -> Result<Self> {
        let train_set = ImageFolderDataset::from_directory(&config.train_path)
            .context("学習データの読み込みに失敗しました")?;
        let validation_set = ImageFolderDataset::from_directory(&config.validation_path)
            .context("検証データの読み込みに失敗しました")?;
        let test_set = ImageFolderDataset::from_directory(&config.test_path)
            .context("テストデータの読み込みに失敗しました")?;

        if train_set.num_classes() != config.num_classes {
            anyhow::bail!(
                "クラス数が一致しません: 設定 {} / 学習データ {} ({})",
                config.num_classes,
                train_set.num_classes(),
                train_set.class_names().join(", ")
            );
        }
        for (name, set) in [("検証", &validation_set), ("テスト", &test_set)] {
            if set.class_names() != train_set.class_names() {
                anyhow::bail!(
                    "{}データのクラスが学習データと一致しません: [{}] != [{}]",
                    name,
                    set.class_names().join(", "),
                    train_set.class_names().join(", ")
                );
            }
        }

        let model = Self::model_config(&config).try_init::<B>(&device)?;
        let class_names = train_set.class_names().to_vec();

        Ok(Self {
            config,
            device,
            model,
            class_names,
            epochs_trained: 0,
            optimizer_state: None,
            train_set,
            validation_set,
            test_set,
        })
    }

    fn model_config(config: &EmojiClassifierConfig) -> ModelConfig {
        ModelConfig::new(config.num_classes).with_image_size(config.image_size)
    }

    pub fn config(&self) -> &EmojiClassifierConfig {
        &self.config
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn model(&self) -> &EmojiCnn<B> {
        &self.model
    }

    /// 次の学習で引き継ぐオプティマイザ状態
    pub fn optimizer_state(&self) -> Option<&OptimizerState<B>> {
        self.optimizer_state.as_ref()
    }

    pub fn test_len(&self) -> usize {
        use burn::data::dataset::Dataset;
        self.test_set.len()
    }

    fn batcher<BB: burn::tensor::backend::Backend<Device = B::Device>>(&self) -> EmojiBatcher<BB> {
        EmojiBatcher::<BB>::new(self.device.clone(), self.config.image_size, self.config.num_classes)
    }

    /// 学習を実行
    ///
    /// `epochs` / `batch_size` が `None` の場合は設定値を使用します。
    /// 各エポックで検証データによる評価を行い、オプティマイザ状態は前回の学習
    /// （または読み込んだモデル）から引き継ぎます。
    pub fn train(&mut self, epochs: Option<usize>, batch_size: Option<usize>) -> Result<TrainingHistory> {
        use burn::data::dataset::Dataset;

        let epochs = epochs.filter(|&e| e > 0).unwrap_or(self.config.epochs);
        let batch_size = batch_size.filter(|&b| b > 0).unwrap_or(self.config.batch_size);
        let learning_rate = self.config.learning_rate;

        if self.train_set.is_empty() {
            anyhow::bail!("学習データが見つかりません: {}", self.train_set.root().display());
        }

        tracing::info!("学習データ: {} 枚", self.train_set.len());
        tracing::info!("検証データ: {} 枚", self.validation_set.len());
        tracing::info!("エポック数: {}, バッチサイズ: {}, 学習率: {}", epochs, batch_size, learning_rate);

        let batcher_train = self.batcher::<B>().with_augmentation(self.config.augmentation);
        let batcher_valid = self.batcher::<B::InnerBackend>();

        let dataloader_train = build_dataloader(
            batcher_train,
            self.train_set.clone(),
            batch_size,
            Some(self.config.seed),
        );
        let dataloader_valid = build_dataloader(batcher_valid, self.validation_set.clone(), batch_size, None);

        let mut optimizer: EmojiOptimizer<B> = AdamConfig::new().init();
        if let Some(state) = self.optimizer_state.take() {
            tracing::info!("保存済みのオプティマイザ状態から学習を再開します");
            optimizer = optimizer.load_record(state);
        }

        let suffix: u32 = rand::thread_rng().gen();
        let artifact_dir = std::env::temp_dir().join(format!("emoji_classifier_training_{:08x}", suffix));
        std::fs::create_dir_all(&artifact_dir)?;

        let learner = LearnerBuilder::new(&artifact_dir)
            .metric_train_numeric(AccuracyMetric::new())
            .metric_valid_numeric(AccuracyMetric::new())
            .metric_train_numeric(LossMetric::new())
            .metric_valid_numeric(LossMetric::new())
            .with_file_checkpointer(BinFileRecorder::<FullPrecisionSettings>::default())
            .with_application_logger(None)
            .learning_strategy(LearningStrategy::SingleDevice(self.device.clone()))
            .num_epochs(epochs)
            .summary()
            .build(self.model.clone(), optimizer, learning_rate);

        let trained = learner.fit(dataloader_train, dataloader_valid);

        // 一時ディレクトリは結果に関わらず削除する
        let collected = self.collect_training_artifacts(&artifact_dir, trained.model, epochs);
        std::fs::remove_dir_all(&artifact_dir).ok();
        let history = collected?;
        self.epochs_trained += epochs;

        let validation = self.evaluate_dataset(&self.validation_set, batch_size)?;
        tracing::info!(
            "学習完了: 検証 loss={:.4} accuracy={:.2}%",
            validation.loss,
            validation.accuracy * 100.0
        );

        Ok(TrainingHistory {
            epochs: history,
            batch_size,
            learning_rate,
            train_samples: self.train_set.len(),
            validation_samples: self.validation_set.len(),
            validation,
        })
    }

    /// 学習結果をLearnerの成果物ディレクトリから回収する
    ///
    /// - 学習済みの重みを自動微分バックエンドのモデルへ戻す
    /// - 最終エポックのチェックポイントからAdam状態を読み込む
    /// - エポックごとのメトリクスを読み込む
    fn collect_training_artifacts(
        &mut self,
        artifact_dir: &Path,
        trained: EmojiCnn<B::InnerBackend>,
        epochs: usize,
    ) -> Result<Vec<EpochMetrics>> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let bytes = Recorder::<B::InnerBackend>::record(&recorder, trained.into_record(), ())
            .map_err(|e| anyhow::anyhow!("学習済み重みの書き出しエラー: {:?}", e))?;
        let record = Recorder::<B>::load(&recorder, bytes, &self.device)
            .map_err(|e| anyhow::anyhow!("学習済み重みの読み込みエラー: {:?}", e))?;
        self.model = self.model.clone().load_record(record);

        let checkpoint = artifact_dir.join("checkpoint").join(format!("optim-{}", epochs));
        let file_recorder = BinFileRecorder::<FullPrecisionSettings>::default();
        match Recorder::<B>::load(&file_recorder, checkpoint.clone(), &self.device) {
            Ok(state) => self.optimizer_state = Some(state),
            Err(e) => tracing::warn!(
                "オプティマイザ状態を読み込めませんでした ({}): {:?}",
                checkpoint.display(),
                e
            ),
        }

        let summary = LearnerSummary::new(artifact_dir, &[LOSS_METRIC, ACCURACY_METRIC])
            .map_err(|e| anyhow::anyhow!("学習履歴を読み込めません: {}", e))?;
        Ok(epoch_metrics(&summary))
    }

    /// テストデータで1パス評価（損失・正解率）
    pub fn evaluate(&self) -> Result<Evaluation> {
        self.evaluate_dataset(&self.test_set, self.config.batch_size)
    }

    fn evaluate_dataset(&self, dataset: &ImageFolderDataset, batch_size: usize) -> Result<Evaluation> {
        let model = self.model.valid();
        let loader = build_dataloader(self.batcher::<B::InnerBackend>(), dataset.clone(), batch_size, None);

        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        let mut samples = 0usize;

        for batch in loader.iter() {
            let n = batch.paths.len();
            let output = model.forward_classification(batch.images, batch.targets);
            let loss: f64 = output.loss.into_scalar().elem();
            let predicted = indices(output.output.argmax(1));
            let actual = indices(output.targets);

            loss_sum += loss * n as f64;
            correct += predicted.iter().zip(actual.iter()).filter(|(p, a)| p == a).count();
            samples += n;
        }

        if samples == 0 {
            anyhow::bail!("評価データがありません: {}", dataset.root().display());
        }

        Ok(Evaluation {
            loss: loss_sum / samples as f64,
            accuracy: correct as f64 / samples as f64,
            samples,
        })
    }

    /// テストデータの全サンプルを分類し、誤分類されたものを集める
    pub fn evaluate_another(&self) -> Result<Vec<Misclassification>> {
        let model = self.model.valid();
        let loader = build_dataloader(
            self.batcher::<B::InnerBackend>(),
            self.test_set.clone(),
            self.config.batch_size,
            None,
        );
        let pixels = self.config.image_size * self.config.image_size;
        let mut incorrects = Vec::new();

        for batch in loader.iter() {
            let predicted = indices(model.forward(batch.images.clone()).argmax(1));
            let actual = indices(batch.labels.argmax(1));

            let wrong: Vec<usize> = (0..predicted.len()).filter(|&i| predicted[i] != actual[i]).collect();
            if wrong.is_empty() {
                continue;
            }

            let inputs: Vec<f32> = batch.images.into_data().iter::<f32>().collect();
            for i in wrong {
                incorrects.push(Misclassification {
                    input: inputs[i * pixels..(i + 1) * pixels].to_vec(),
                    path: batch.paths[i].clone(),
                    predicted: predicted[i],
                    actual: actual[i],
                });
            }
        }

        Ok(incorrects)
    }

    /// モデル（構成・重み・オプティマイザ状態）を保存
    pub fn save(&self, path: &Path) -> Result<()> {
        let config = Self::model_config(&self.config);
        let metadata = ModelMetadata::new(
            self.class_names.clone(),
            config.image_size,
            config.hidden_size,
            self.epochs_trained,
        );
        let optimizer_binary = self
            .optimizer_state
            .as_ref()
            .map(encode_optimizer_state::<B>)
            .transpose()?;
        save_model(path, &self.model, &metadata, optimizer_binary.as_deref())
    }

    /// 保存済みモデルで現在のモデルとオプティマイザ状態を置き換える
    pub fn load(&mut self, path: &Path) -> Result<()> {
        // 重みをデコードする前に構成を確認する
        let metadata = load_metadata(path)
            .with_context(|| format!("モデルの読み込みに失敗しました: {}", path.display()))?;
        if metadata.image_size != self.config.image_size || metadata.num_classes != self.config.num_classes {
            anyhow::bail!(
                "モデル構成が設定と一致しません: モデル {}x{} / {} クラス, 設定 {}x{} / {} クラス",
                metadata.image_size,
                metadata.image_size,
                metadata.num_classes,
                self.config.image_size,
                self.config.image_size,
                self.config.num_classes
            );
        }
        if metadata.class_names != self.class_names {
            tracing::warn!(
                "モデルのクラス名がデータセットと異なります: [{}] / [{}]",
                metadata.class_names.join(", "),
                self.class_names.join(", ")
            );
        }

        let (model, metadata) = load_model::<B>(path, &self.device)
            .with_context(|| format!("モデルの読み込みに失敗しました: {}", path.display()))?;
        let optimizer_state = load_optimizer_state::<B>(path, &self.device)?;
        if optimizer_state.is_none() {
            tracing::info!("オプティマイザ状態が保存されていません。次の学習は初期状態から始めます");
        }

        self.model = model;
        self.optimizer_state = optimizer_state;
        self.class_names = metadata.class_names;
        self.epochs_trained = metadata.num_epochs;
        Ok(())
    }

    /// 画像1枚を分類
    pub fn predict(&self, image: &DynamicImage) -> Result<Prediction> {
        self.predict_input(&image_to_input(image, self.config.image_size))
    }

    /// 前処理済みの入力（H x W、[0, 1]）を分類
    pub fn predict_input(&self, input: &[f32]) -> Result<Prediction> {
        let size = self.config.image_size;
        if input.len() != size * size {
            anyhow::bail!("入力サイズが不正です: {} (期待: {})", input.len(), size * size);
        }
        let model = self.model.valid();
        let tensor = Tensor::<B::InnerBackend, 1>::from_floats(input, &self.device).reshape([1, 1, size, size]);
        let probabilities: Vec<f32> = model.predict_proba(tensor).into_data().iter::<f32>().collect();
        Ok(Prediction::from_probabilities(probabilities, &self.class_names))
    }
}

/// Learnerの記録をエポックごとの行に組み替える（正解率は % から [0, 1] へ）
fn epoch_metrics(summary: &LearnerSummary) -> Vec<EpochMetrics> {
    fn value(metrics: &[MetricSummary], name: &str, epoch: usize) -> f64 {
        metrics
            .iter()
            .find(|m| m.name == name)
            .and_then(|m| m.entries.iter().find(|e| e.step == epoch))
            .map(|e| e.value)
            .unwrap_or(f64::NAN)
    }

    let train = &summary.metrics.train;
    let valid = &summary.metrics.valid;
    (1..=summary.epochs)
        .map(|epoch| EpochMetrics {
            epoch,
            train_loss: value(train, LOSS_METRIC, epoch),
            train_accuracy: value(train, ACCURACY_METRIC, epoch) / 100.0,
            valid_loss: value(valid, LOSS_METRIC, epoch),
            valid_accuracy: value(valid, ACCURACY_METRIC, epoch) / 100.0,
        })
        .collect()
}

/// [batch] または [batch, 1] のIntテンソルをインデックス列に変換
fn indices<B: burn::tensor::backend::Backend, const D: usize>(
    tensor: Tensor<B, D, burn::tensor::Int>,
) -> Vec<usize> {
    tensor.into_data().iter::<i64>().map(|v| v as usize).collect()
}
