//! モデルスナップショットの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（カテゴリ順序、バックボーン構成など）
//! - model.bin       - モデルの重み（BinBytesRecorder, f32）

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::error::{ClassifierError, Result};
use crate::ml::IssueClassifier;
use crate::model::model_metadata::ModelMetadata;

pub const METADATA_ENTRY: &str = "metadata.json";
pub const MODEL_ENTRY: &str = "model.bin";

/// 拡張子を `.tar.gz` に揃える（既に `.gz` ならそのまま）
pub fn bundle_path(path: &Path) -> PathBuf {
    if path.extension().and_then(|s| s.to_str()) == Some("gz") {
        path.to_path_buf()
    } else {
        path.with_extension("tar.gz")
    }
}

/// 名前付きエントリを tar.gz として書き出す
pub fn write_bundle(path: &Path, entries: &[(&str, &[u8])]) -> Result<PathBuf> {
    let tar_gz_path = bundle_path(path);

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(&tar_gz_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    for (name, bytes) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_path(name)?;
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar_builder.append(&header, *bytes)?;
    }

    tar_builder.into_inner()?.finish()?;
    Ok(tar_gz_path)
}

/// tar.gz の全エントリを読み込む
pub fn read_bundle(path: &Path) -> Result<HashMap<String, Vec<u8>>> {
    let file = File::open(path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let mut entries = HashMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        let mut buffer = Vec::new();
        entry.read_to_end(&mut buffer)?;
        entries.insert(name, buffer);
    }

    Ok(entries)
}

/// メタデータと共にモデルをスナップショットとして保存
///
/// 戻り値は実際に書き込んだパス。
pub fn save_snapshot<B: Backend>(
    output_path: &Path,
    metadata: &ModelMetadata,
    model: &IssueClassifier<B>,
) -> Result<PathBuf> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary = recorder
        .record(model.clone().into_record(), ())
        .map_err(ClassifierError::record)?;
    let json = metadata.to_json_string()?;

    let path = write_bundle(
        output_path,
        &[(METADATA_ENTRY, json.as_bytes()), (MODEL_ENTRY, &model_binary)],
    )?;

    tracing::info!(
        "スナップショットを保存しました: {} ({:.2} MB)",
        path.display(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );
    Ok(path)
}

/// スナップショットからメタデータとモデルバイナリを読み込む
///
/// パスは保存時と同じ規則で `.tar.gz` に揃えてから開く。
pub fn load_snapshot_parts(path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let path = bundle_path(path);
    if !path.exists() {
        return Err(ClassifierError::SnapshotNotFound(path));
    }

    let mut entries = read_bundle(&path)?;
    let metadata = entries
        .remove(METADATA_ENTRY)
        .ok_or_else(|| ClassifierError::SnapshotFormat(format!("{METADATA_ENTRY} not found")))?;
    let binary = entries
        .remove(MODEL_ENTRY)
        .ok_or_else(|| ClassifierError::SnapshotFormat(format!("{MODEL_ENTRY} not found")))?;

    let metadata = std::str::from_utf8(&metadata)
        .map_err(|e| ClassifierError::SnapshotFormat(e.to_string()))?;
    Ok((ModelMetadata::from_json_string(metadata)?, binary))
}

/// スナップショットからモデルを復元
///
/// モデル構成はメタデータから再構築し、重みを `device` 上に読み込みます。
pub fn load_snapshot<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(ModelMetadata, IssueClassifier<B>)> {
    let (metadata, binary) = load_snapshot_parts(path)?;

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(binary, device)
        .map_err(ClassifierError::record)?;
    let model = metadata.model_config().init::<B>(device).load_record(record);

    tracing::info!(
        "スナップショットを読み込みました: {} ({} クラス, 学習日時 {})",
        path.display(),
        metadata.class_labels.len(),
        metadata.trained_at
    );
    Ok((metadata, model))
}

/// メタデータをログに出力
pub fn log_metadata_info(metadata: &ModelMetadata) {
    tracing::info!("カテゴリ: {}", metadata.class_labels.join(", "));
    tracing::info!("モデル入力サイズ: {}x{}", metadata.image_size, metadata.image_size);
    tracing::info!(
        "バックボーン: blocks={:?}, base_width={}",
        metadata.blocks,
        metadata.base_width
    );
    tracing::info!("学習エポック数: {} (追加学習: {})", metadata.num_epochs, metadata.fine_tuned);
    tracing::info!("学習日時: {}", metadata.trained_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::CategoryRegistry;
    use crate::ml::{images_to_tensor, ModelConfig};
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> ModelConfig {
        ModelConfig::default()
            .with_image_size(32)
            .with_blocks(vec![1, 1])
            .with_base_width(4)
    }

    #[test]
    fn test_bundle_path() {
        assert_eq!(bundle_path(Path::new("model/x.tar.gz")), PathBuf::from("model/x.tar.gz"));
        assert_eq!(bundle_path(Path::new("model/x")), PathBuf::from("model/x.tar.gz"));
    }

    #[test]
    fn test_save_load_gives_same_predictions() {
        let device = NdArrayDevice::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device);
        let labels = CategoryRegistry::default().labels().to_vec();
        let metadata = ModelMetadata::new(labels, &config, 1, false);

        let path = save_snapshot(&dir.path().join("snapshot.tar.gz"), &metadata, &model).unwrap();
        let (loaded_metadata, loaded) = load_snapshot::<TestBackend>(&path, &device).unwrap();
        assert_eq!(loaded_metadata, metadata);

        let inputs: Vec<Vec<f32>> = (0..3)
            .map(|i| (0..3 * 32 * 32).map(|j| ((i * 7 + j) % 13) as f32 / 13.0 - 0.5).collect())
            .collect();
        let images = images_to_tensor::<TestBackend>(&inputs, 32, &device);

        let before = model.forward(images.clone()).into_data().to_vec::<f32>().unwrap();
        let after = loaded.forward(images).into_data().to_vec::<f32>().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_save_and_load_through_same_non_gz_path() {
        let device = NdArrayDevice::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device);
        let labels = CategoryRegistry::default().labels().to_vec();
        let metadata = ModelMetadata::new(labels, &config, 1, false);

        let requested = dir.path().join("model/issue_reporting_model.pth");
        let written = save_snapshot(&requested, &metadata, &model).unwrap();
        assert!(written.to_string_lossy().ends_with("issue_reporting_model.tar.gz"));

        let (loaded, _) = load_snapshot::<TestBackend>(&requested, &device).unwrap();
        assert_eq!(loaded, metadata);
    }

    #[test]
    fn test_missing_snapshot() {
        let device = NdArrayDevice::Cpu;
        let path = Path::new("/nonexistent/snapshot.tar.gz");
        let result = load_snapshot::<TestBackend>(path, &device);
        assert!(matches!(result, Err(ClassifierError::SnapshotNotFound(_))));
    }

    #[test]
    fn test_bundle_without_model_entry() {
        let dir = tempfile::tempdir().unwrap();
        let entries: [(&str, &[u8]); 1] = [(METADATA_ENTRY, b"{}")];
        let path = write_bundle(&dir.path().join("broken.tar.gz"), &entries).unwrap();
        assert!(matches!(
            load_snapshot_parts(&path),
            Err(ClassifierError::SnapshotFormat(_))
        ));
    }
}
