//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、入力サイズなど）
//! - model.bin       - モデルの重み（バイナリ）
//! - optim.bin       - オプティマイザ（Adam）の状態（学習済みの場合のみ）

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::ml::{EmojiCnn, OptimizerState};
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";
const OPTIMIZER_ENTRY: &str = "optim.bin";

type ArchiveRecorder = BinBytesRecorder<FullPrecisionSettings>;

fn append_entry<W: std::io::Write>(tar_builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar_builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// `output_path` にそのまま書き込みます（親ディレクトリは必要なら作成）。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
    optimizer_binary: Option<&[u8]>,
) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let tar_gz_file = File::create(output_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", output_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    append_entry(&mut tar_builder, METADATA_ENTRY, metadata.to_json_string()?.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;
    if let Some(optimizer_binary) = optimizer_binary {
        append_entry(&mut tar_builder, OPTIMIZER_ENTRY, optimizer_binary)?;
    }

    // tarアーカイブとgzipストリームを完成させる
    tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?
        .finish()
        .context("Failed to finalize gzip stream")?;

    Ok(())
}

/// アーカイブ内の指定エントリを探して読み込む
fn find_entry(tar_gz_path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(name) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            return Ok(Some(buffer));
        }
    }

    Ok(None)
}

/// Tar.gzからモデルメタデータだけを読み込む（重みはデコードしない）
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let bytes = find_entry(tar_gz_path, METADATA_ENTRY)?
        .ok_or_else(|| anyhow::anyhow!("{} not found in tar.gz archive", METADATA_ENTRY))?;
    let json = String::from_utf8(bytes).context("metadata.json is not valid UTF-8")?;
    ModelMetadata::from_json_string(&json)
}

/// Tar.gzからオプティマイザ状態のバイナリを読み込む（無ければ `None`）
pub fn load_optimizer_binary(tar_gz_path: &Path) -> Result<Option<Vec<u8>>> {
    find_entry(tar_gz_path, OPTIMIZER_ENTRY)
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// モデル（構成・重み）とメタデータを保存
///
/// `optimizer_binary` は [`encode_optimizer_state`] の出力です。
pub fn save_model<B: Backend>(
    output_path: &Path,
    model: &EmojiCnn<B>,
    metadata: &ModelMetadata,
    optimizer_binary: Option<&[u8]>,
) -> Result<()> {
    let recorder = ArchiveRecorder::default();
    let model_binary = recorder
        .record(model.clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みの書き出しエラー: {:?}", e))?;

    save_model_with_metadata(output_path, metadata, &model_binary, optimizer_binary)?;
    tracing::info!(
        "モデルを保存しました: {} ({} パラメータ, {} バイト, オプティマイザ状態: {})",
        output_path.display(),
        model.num_params(),
        model_binary.len(),
        optimizer_binary.map_or("なし".to_string(), |b| format!("{} バイト", b.len()))
    );
    Ok(())
}

/// オプティマイザ状態をアーカイブ用のバイト列に変換
pub fn encode_optimizer_state<B: AutodiffBackend>(state: &OptimizerState<B>) -> Result<Vec<u8>> {
    let recorder = ArchiveRecorder::default();
    Recorder::<B>::record(&recorder, state.clone(), ())
        .map_err(|e| anyhow::anyhow!("オプティマイザ状態の書き出しエラー: {:?}", e))
}

/// アーカイブ用のバイト列からオプティマイザ状態を復元
pub fn decode_optimizer_state<B: AutodiffBackend>(bytes: Vec<u8>, device: &B::Device) -> Result<OptimizerState<B>> {
    let recorder = ArchiveRecorder::default();
    Recorder::<B>::load(&recorder, bytes, device)
        .map_err(|e| anyhow::anyhow!("オプティマイザ状態の読み込みエラー: {:?}", e))
}

/// 保存済みアーカイブのオプティマイザ状態を読み込む（無ければ `None`）
pub fn load_optimizer_state<B: AutodiffBackend>(
    tar_gz_path: &Path,
    device: &B::Device,
) -> Result<Option<OptimizerState<B>>> {
    load_optimizer_binary(tar_gz_path)?
        .map(|bytes| decode_optimizer_state::<B>(bytes, device))
        .transpose()
}

/// 保存済みモデルを読み込む
///
/// メタデータから構成を復元し、重みを読み込んだモデルを返します。
pub fn load_model<B: Backend>(tar_gz_path: &Path, device: &B::Device) -> Result<(EmojiCnn<B>, ModelMetadata)> {
    let (metadata, model_binary) = load_model_with_metadata(tar_gz_path)?;
    let model = metadata.model_config().try_init::<B>(device)?;

    let recorder = ArchiveRecorder::default();
    let record = recorder
        .load(model_binary, device)
        .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

    Ok((model.load_record(record), metadata))
}

/// メタデータをログに出力
pub fn print_metadata_info(metadata: &ModelMetadata) {
    tracing::info!("=== モデルメタデータ ===");
    tracing::info!("クラス ({}): {}", metadata.num_classes, metadata.class_names.join(", "));
    tracing::info!("モデル入力サイズ: {}x{}", metadata.image_size, metadata.image_size);
    tracing::info!("隠れ次元: {}", metadata.hidden_size);
    tracing::info!("学習エポック数: {}", metadata.num_epochs);
    tracing::info!("保存日時: {}", metadata.trained_at);
}
