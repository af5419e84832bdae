//! 推論専用ランタイム向けのエクスポート
//!
//! 学習コードの型に依存しない形式でモデルを書き出します（tar.gz）:
//! - graph.json   - 入出力名・固定形状、前処理定数、層構成
//! - weights.mpk  - 名前付き MessagePack の重み（自己記述形式）
//!
//! 出力形状はダミー入力 [1, 3, size, size] の順伝播で確定させます。

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::{backend::Backend, Distribution, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};
use crate::ml::preprocess::{CHANNELS, MEAN, STD};
use crate::ml::IssueClassifier;
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage::{bundle_path, read_bundle, write_bundle};

pub const GRAPH_ENTRY: &str = "graph.json";
pub const WEIGHTS_ENTRY: &str = "weights.mpk";
pub const INPUT_NAME: &str = "input";
pub const OUTPUT_NAME: &str = "output";

/// 名前付きテンソルの仕様
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
}

/// 層のパラメータ形状
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub weight_shape: Vec<usize>,
}

/// 前処理定数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessSpec {
    pub image_size: usize,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

/// エクスポートされた計算グラフの記述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphManifest {
    pub architecture: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub class_labels: Vec<String>,
    pub preprocess: PreprocessSpec,
    pub blocks: Vec<usize>,
    pub base_width: usize,
    pub layers: Vec<LayerSpec>,
    pub exported_at: String,
}

/// モデルをエクスポート
///
/// 戻り値は実際に書き込んだパス。
pub fn export_model<B: Backend>(
    model: &IssueClassifier<B>,
    metadata: &ModelMetadata,
    output_path: &Path,
    device: &B::Device,
) -> Result<PathBuf> {
    let size = metadata.image_size;
    let input_shape = [1, CHANNELS, size, size];

    // 形状トレース
    let dummy = Tensor::<B, 4>::random(input_shape, Distribution::Normal(0.0, 1.0), device);
    let output_shape = model.forward(dummy).dims();

    let manifest = GraphManifest {
        architecture: "resnet-bottleneck".to_string(),
        inputs: vec![TensorSpec {
            name: INPUT_NAME.to_string(),
            shape: input_shape.to_vec(),
            dtype: "f32".to_string(),
        }],
        outputs: vec![TensorSpec {
            name: OUTPUT_NAME.to_string(),
            shape: output_shape.to_vec(),
            dtype: "f32".to_string(),
        }],
        class_labels: metadata.class_labels.clone(),
        preprocess: PreprocessSpec {
            image_size: size,
            mean: MEAN,
            std: STD,
        },
        blocks: metadata.blocks.clone(),
        base_width: metadata.base_width,
        layers: model
            .layer_shapes()
            .into_iter()
            .map(|(name, weight_shape)| LayerSpec { name, weight_shape })
            .collect(),
        exported_at: chrono::Local::now().to_rfc3339(),
    };

    let weights = NamedMpkBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.clone().into_record(), ())
        .map_err(ClassifierError::record)?;
    let graph = serde_json::to_string_pretty(&manifest)?;

    let path = write_bundle(
        output_path,
        &[(GRAPH_ENTRY, graph.as_bytes()), (WEIGHTS_ENTRY, &weights)],
    )?;

    tracing::info!(
        "モデルをエクスポートしました: {} (入力 {:?} -> 出力 {:?})",
        path.display(),
        input_shape,
        output_shape
    );
    Ok(path)
}

/// エクスポートからグラフ記述を読み込む
pub fn load_graph_manifest(path: &Path) -> Result<GraphManifest> {
    let mut entries = read_bundle(&bundle_path(path))?;
    let graph = entries
        .remove(GRAPH_ENTRY)
        .ok_or_else(|| ClassifierError::SnapshotFormat(format!("{GRAPH_ENTRY} not found")))?;
    if !entries.contains_key(WEIGHTS_ENTRY) {
        return Err(ClassifierError::SnapshotFormat(format!("{WEIGHTS_ENTRY} not found")));
    }
    Ok(serde_json::from_slice(&graph)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::CategoryRegistry;
    use crate::ml::ModelConfig;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_export_manifest() {
        let device = NdArrayDevice::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig::default()
            .with_image_size(32)
            .with_blocks(vec![1, 1])
            .with_base_width(4);
        let model = config.init::<TestBackend>(&device);
        let labels = CategoryRegistry::default().labels().to_vec();
        let metadata = ModelMetadata::new(labels, &config, 1, false);

        let path = export_model(&model, &metadata, &dir.path().join("export"), &device).unwrap();
        assert!(path.to_string_lossy().ends_with("export.tar.gz"));

        let manifest = load_graph_manifest(&dir.path().join("export")).unwrap();
        assert_eq!(manifest.inputs[0].name, "input");
        assert_eq!(manifest.inputs[0].shape, vec![1, 3, 32, 32]);
        assert_eq!(manifest.outputs[0].name, "output");
        assert_eq!(manifest.outputs[0].shape, vec![1, 6]);
        assert_eq!(manifest.class_labels.len(), 6);
        assert_eq!(manifest.layers.last().unwrap().weight_shape, vec![32, 6]);
    }
}
