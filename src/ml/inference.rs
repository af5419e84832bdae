//! モデル推論機能

use std::path::Path;

use burn::tensor::backend::Backend;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::categories::CategoryRegistry;
use crate::error::Result;
use crate::ml::model::images_to_tensor;
use crate::ml::preprocess::Preprocessor;
use crate::ml::IssueClassifier;
use crate::model::{load_snapshot, log_metadata_info, ModelMetadata};

/// 予測結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub filename: String,
    pub predicted_category: String,
}

/// 推論エンジン
///
/// 評価モードのモデルをスナップショットから読み込んで保持します。
pub struct InferenceEngine<B: Backend> {
    model: IssueClassifier<B>,
    device: B::Device,
    registry: CategoryRegistry,
    preprocessor: Preprocessor,
    metadata: ModelMetadata,
}

impl<B: Backend> InferenceEngine<B> {
    /// スナップショットを読み込んで推論エンジンを初期化
    ///
    /// スナップショットが無い場合、またはカテゴリ順序が一致しない場合はエラー。
    pub fn load<P: AsRef<Path>>(snapshot_path: P, device: B::Device) -> Result<Self> {
        let (metadata, model) = load_snapshot::<B>(snapshot_path.as_ref(), &device)?;

        let registry = CategoryRegistry::default();
        registry.ensure_matches(&metadata.class_labels)?;
        log_metadata_info(&metadata);

        Ok(Self::new(model, device, registry, metadata))
    }

    /// 読み込み済みのモデルから初期化
    pub fn new(
        model: IssueClassifier<B>,
        device: B::Device,
        registry: CategoryRegistry,
        metadata: ModelMetadata,
    ) -> Self {
        let preprocessor = Preprocessor::new(metadata.image_size);
        Self {
            model,
            device,
            registry,
            preprocessor,
            metadata,
        }
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn registry(&self) -> &CategoryRegistry {
        &self.registry
    }

    /// 前処理済みデータ (C*H*W) を分類してカテゴリ名を返す
    fn classify_data(&self, data: Vec<f32>) -> Result<String> {
        let tensor = images_to_tensor::<B>(&[data], self.preprocessor.image_size(), &self.device);

        let class_idx = self.model.classify(tensor).first().copied().unwrap_or_default();
        Ok(self.registry.index_to_label(class_idx)?.to_string())
    }

    /// デコード済み画像を分類
    pub fn classify(&self, image: &DynamicImage) -> Result<String> {
        self.classify_data(self.preprocessor.process(image))
    }

    /// 単一画像ファイルを分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<String> {
        self.classify_data(self.preprocessor.load(image_path.as_ref())?)
    }

    /// 複数画像をバッチ分類
    pub fn classify_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<String>> {
        if image_paths.is_empty() {
            return Ok(Vec::new());
        }

        let images = image_paths
            .iter()
            .map(|path| self.preprocessor.load(path.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let tensor = images_to_tensor::<B>(&images, self.preprocessor.image_size(), &self.device);

        self.model
            .classify(tensor)
            .into_iter()
            .map(|idx| self.registry.index_to_label(idx).map(str::to_string))
            .collect()
    }

    /// アップロードされたバイト列を分類
    ///
    /// デコードできない場合は `ClassifierError::Image`。
    pub fn predict_bytes(&self, filename: &str, bytes: &[u8]) -> Result<Prediction> {
        let data = self.preprocessor.decode(bytes)?;
        let predicted_category = self.classify_data(data)?;

        tracing::info!("予測: {} -> {}", filename, predicted_category);
        Ok(Prediction {
            filename: filename.to_string(),
            predicted_category,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClassifierError;
    use crate::ml::ModelConfig;
    use crate::model::save_snapshot;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    type TestBackend = NdArray<f32>;

    fn tiny_engine(dir: &Path) -> InferenceEngine<TestBackend> {
        let device = NdArrayDevice::Cpu;
        let config = ModelConfig::default()
            .with_image_size(32)
            .with_blocks(vec![1, 1])
            .with_base_width(4);
        let model = config.init::<TestBackend>(&device);
        let labels = CategoryRegistry::default().labels().to_vec();
        let metadata = ModelMetadata::new(labels, &config, 1, false);
        let path = save_snapshot(&dir.join("snapshot.tar.gz"), &metadata, &model).unwrap();
        InferenceEngine::load(&path, device).unwrap()
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        RgbImage::from_pixel(width, height, Rgb([120, 80, 40]))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_predict_bytes_returns_registry_label() {
        let dir = tempfile::tempdir().unwrap();
        let engine = tiny_engine(dir.path());

        let prediction = engine.predict_bytes("road.png", &png_bytes(64, 48)).unwrap();
        assert_eq!(prediction.filename, "road.png");
        assert!(engine.registry().labels().contains(&prediction.predicted_category));
    }

    #[test]
    fn test_prediction_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let engine = tiny_engine(dir.path());
        let bytes = png_bytes(20, 90);

        let first = engine.predict_bytes("a.png", &bytes).unwrap();
        let second = engine.predict_bytes("a.png", &bytes).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_undecodable_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = tiny_engine(dir.path());
        let result = engine.predict_bytes("notes.txt", b"hello");
        assert!(matches!(result, Err(ClassifierError::Image(_))));
    }

    #[test]
    fn test_classify_batch_matches_single() {
        let dir = tempfile::tempdir().unwrap();
        let engine = tiny_engine(dir.path());
        let path = dir.path().join("sample.png");
        RgbImage::from_pixel(32, 32, Rgb([0, 100, 200])).save(&path).unwrap();

        let single = engine.classify_image(&path).unwrap();
        let batch = engine.classify_batch(&[&path, &path]).unwrap();
        assert_eq!(batch, vec![single.clone(), single]);
        let empty: [&Path; 0] = [];
        assert!(engine.classify_batch(&empty).unwrap().is_empty());
    }

    #[test]
    fn test_load_with_path_given_to_save() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        let config = ModelConfig::default()
            .with_image_size(32)
            .with_blocks(vec![1, 1])
            .with_base_width(4);
        let model = config.init::<TestBackend>(&device);
        let labels = CategoryRegistry::default().labels().to_vec();
        let metadata = ModelMetadata::new(labels, &config, 1, false);

        let path = dir.path().join("model/issue_reporting_model.pth");
        save_snapshot(&path, &metadata, &model).unwrap();

        let engine = InferenceEngine::<TestBackend>::load(&path, device).unwrap();
        assert_eq!(engine.metadata(), &metadata);
    }

    #[test]
    fn test_missing_snapshot_fails() {
        let result =
            InferenceEngine::<TestBackend>::load("/nonexistent/model.tar.gz", NdArrayDevice::Cpu);
        assert!(matches!(result, Err(ClassifierError::SnapshotNotFound(_))));
    }
}
