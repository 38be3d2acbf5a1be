//! 絵文字分類器 CLI
//!
//! - `train`      : 学習 → テスト評価 → 保存
//! - `load-train` : 保存済みモデルから追加学習
//! - `evaluate`   : 保存済みモデルで誤分類を集計
//! - `test`       : 画像1枚を分類
//! - `serve`      : HTTPサーバーを起動

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use emoji_classifier_lib::ml::{EmojiClassifier, InferenceEngine};
use emoji_classifier_lib::model::AppConfig;
use emoji_classifier_lib::{server, ServeBackend, TrainBackend};

#[derive(Parser, Debug)]
#[command(
    name = "emoji_classifier",
    version,
    about = "Train, evaluate and serve a hand-drawn emoji classifier."
)]
struct Cli {
    /// 設定ファイル（JSON）
    #[arg(long, env = "EMOJI_CONFIG", default_value_os_t = AppConfig::default_path(), global = true)]
    config: PathBuf,

    /// 保存済みモデルのパス（設定ファイルの値を上書き）
    #[arg(long, env = "MODEL_NAME", global = true)]
    model_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 学習してテストデータで評価し、モデルを保存
    Train(TrainArgs),
    /// 保存済みモデルを読み込んでから学習
    LoadTrain(TrainArgs),
    /// 保存済みモデルでテストデータの誤分類を集計
    Evaluate,
    /// 画像1枚を分類
    Test {
        #[arg(long, default_value = "var/test.png")]
        image: PathBuf,
    },
    /// HTTPサーバーを起動
    Serve {
        #[arg(long, env = "BIND_ADDRESS")]
        bind: Option<String>,
    },
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// エポック数
    #[arg(long, default_value_t = 20)]
    epochs: usize,

    /// バッチサイズ（省略時は設定値）
    #[arg(long)]
    batch_size: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("emoji_classifier=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load_or_default(&cli.config);
    if let Some(path) = &cli.model_path {
        config.set_model_path(path);
    }

    match cli.command {
        Commands::Train(args) => run_train(&config, args, false),
        Commands::LoadTrain(args) => run_train(&config, args, true),
        Commands::Evaluate => run_evaluate(&config),
        Commands::Test { image } => run_test(&config, image),
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            config.display();
            tokio::runtime::Runtime::new()?.block_on(server::serve(config))
        }
    }
}

fn build_classifier(config: &AppConfig) -> Result<EmojiClassifier<TrainBackend>> {
    EmojiClassifier::<TrainBackend>::new(config.classifier.clone(), Default::default())
}

fn run_train(config: &AppConfig, args: TrainArgs, load_first: bool) -> Result<()> {
    let mut classifier = build_classifier(config)?;
    if load_first {
        classifier.load(&config.model_path)?;
    }

    let history = classifier.train(Some(args.epochs), args.batch_size)?;
    let total = history.epochs.len();
    for m in &history.epochs {
        println!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
            m.epoch, total, m.train_loss, m.train_accuracy, m.valid_loss, m.valid_accuracy
        );
    }

    let evaluation = classifier.evaluate()?;
    println!("Test accuracy: {:.2}%", evaluation.accuracy * 100.0);
    println!("Test loss: {}", evaluation.loss);

    classifier.save(&config.model_path)?;
    println!("Model saved: {}", config.model_path.display());
    Ok(())
}

fn run_evaluate(config: &AppConfig) -> Result<()> {
    let mut classifier = build_classifier(config)?;
    classifier.load(&config.model_path)?;

    let incorrects = classifier.evaluate_another()?;
    let total = classifier.test_len();
    let corrects = total - incorrects.len();

    for m in &incorrects {
        tracing::debug!(
            "誤分類: {} 予測={} 正解={}",
            m.path.display(),
            classifier.class_names()[m.predicted],
            classifier.class_names()[m.actual]
        );
    }

    println!("Corrects: {}", corrects);
    println!("Incorrects: {}", incorrects.len());
    println!("Total: {}", total);
    if total > 0 {
        println!("Accuracy: {:.2}", corrects as f64 / total as f64);
    }
    Ok(())
}

fn run_test(config: &AppConfig, image_path: PathBuf) -> Result<()> {
    let engine = InferenceEngine::<ServeBackend>::load(&config.model_path, Default::default())?;
    let prediction = engine.classify_path(&image_path)?;

    for (name, p) in engine.config().class_names.iter().zip(prediction.probabilities.iter()) {
        println!("{:>12}: {:.4}", name, p);
    }
    println!("Prediction: {} ({:.4})", prediction.label, prediction.top_probability());
    Ok(())
}
