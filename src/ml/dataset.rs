//! マニフェストCSVからの学習データセット
//!
//! マニフェストは `image_name,category` のヘッダー付きCSVで、画像パスは
//! 画像ルートディレクトリからの相対パス。データセット自体はパスとラベルのみを
//! 保持し、画像の読み込みと前処理はバッチャーで行います。

use std::path::{Path, PathBuf};

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Int, Tensor},
};
use burn_dataset::Dataset;
use csv::ReaderBuilder;

use crate::categories::CategoryRegistry;
use crate::error::{ClassifierError, Result};
use crate::ml::model::images_to_tensor;
use crate::ml::preprocess::Preprocessor;

/// マニフェストの1行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// 画像ルートからの相対パス
    pub image_name: String,
    /// カテゴリラベル
    pub category: String,
}

/// マニフェストCSVを読み込む
///
/// 1列目を画像パス、2列目をラベルとして扱います。
pub fn load_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    if !path.exists() {
        return Err(ClassifierError::ManifestNotFound(path.to_path_buf()));
    }

    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut entries = Vec::new();

    for (row, result) in reader.records().enumerate() {
        let record = result?;

        let image_name = record.get(0).filter(|s| !s.is_empty()).ok_or_else(|| {
            ClassifierError::ManifestFormat {
                row,
                reason: "missing image path".to_string(),
            }
        })?;
        let category = record.get(1).filter(|s| !s.is_empty()).ok_or_else(|| {
            ClassifierError::ManifestFormat {
                row,
                reason: "missing category".to_string(),
            }
        })?;

        entries.push(ManifestEntry {
            image_name: image_name.to_string(),
            category: category.trim().to_string(),
        });
    }

    Ok(entries)
}

/// 画像を読み込んで前処理し、ラベルをクラスIDに解決
fn load_sample(
    preprocessor: &Preprocessor,
    registry: &CategoryRegistry,
    path: &Path,
    label: &str,
) -> Result<(Vec<f32>, usize)> {
    let class_id = registry.label_to_index(label)?;
    let data = preprocessor.load(path)?;
    Ok((data, class_id))
}

/// 課題報告画像データセット
#[derive(Debug, Clone)]
pub struct IssueDataset {
    entries: Vec<ManifestEntry>,
    root: PathBuf,
    registry: CategoryRegistry,
    preprocessor: Preprocessor,
}

impl IssueDataset {
    pub fn new(
        entries: Vec<ManifestEntry>,
        root: impl Into<PathBuf>,
        registry: CategoryRegistry,
        preprocessor: Preprocessor,
    ) -> Self {
        Self {
            entries,
            root: root.into(),
            registry,
            preprocessor,
        }
    }

    /// マニフェストから構築（マニフェストが無い場合はエラー）
    pub fn from_manifest(
        manifest_path: &Path,
        root: impl Into<PathBuf>,
        registry: CategoryRegistry,
        preprocessor: Preprocessor,
    ) -> Result<Self> {
        let entries = load_manifest(manifest_path)?;
        let dataset = Self::new(entries, root, registry, preprocessor);

        tracing::info!(
            "マニフェストを読み込みました: {} ({} 件)",
            manifest_path.display(),
            dataset.entries.len()
        );
        for label in dataset.registry.labels() {
            let count = dataset.entries.iter().filter(|e| &e.category == label).count();
            tracing::debug!("  カテゴリ '{}': {} 枚", label, count);
        }

        Ok(dataset)
    }

    pub fn registry(&self) -> &CategoryRegistry {
        &self.registry
    }

    pub fn preprocessor(&self) -> Preprocessor {
        self.preprocessor
    }

    /// 画像の絶対パス
    pub fn image_path(&self, entry: &ManifestEntry) -> PathBuf {
        self.root.join(&entry.image_name)
    }

    /// `index` 行目の (前処理済み画像, クラスID)
    ///
    /// 範囲外・画像の欠損/破損・未知ラベルはエラー。
    pub fn item(&self, index: usize) -> Result<(Vec<f32>, usize)> {
        let entry = self
            .entries
            .get(index)
            .ok_or(ClassifierError::IndexOutOfRange {
                index,
                len: self.entries.len(),
            })?;
        load_sample(
            &self.preprocessor,
            &self.registry,
            &self.image_path(entry),
            &entry.category,
        )
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct IssueItem {
    pub path: PathBuf,
    pub label: String,
}

impl Dataset<IssueItem> for IssueDataset {
    fn get(&self, index: usize) -> Option<IssueItem> {
        let entry = self.entries.get(index)?;
        Some(IssueItem {
            path: self.image_path(entry),
            label: entry.category.clone(),
        })
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct IssueBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> IssueBatch<B> {
    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// バッチャー
///
/// 読み込めない画像や未知ラベルのアイテムは警告を出してスキップします。
/// 全アイテムがスキップされた場合は `None`。
#[derive(Clone)]
pub struct IssueBatcher<B: Backend> {
    device: B::Device,
    preprocessor: Preprocessor,
    registry: CategoryRegistry,
}

impl<B: Backend> IssueBatcher<B> {
    pub fn new(device: B::Device, preprocessor: Preprocessor, registry: CategoryRegistry) -> Self {
        Self {
            device,
            preprocessor,
            registry,
        }
    }
}

impl<B: Backend> Batcher<B, IssueItem, Option<IssueBatch<B>>> for IssueBatcher<B> {
    fn batch(&self, items: Vec<IssueItem>, _device: &B::Device) -> Option<IssueBatch<B>> {
        let mut images = Vec::with_capacity(items.len());
        let mut targets = Vec::with_capacity(items.len());

        for item in items {
            match load_sample(&self.preprocessor, &self.registry, &item.path, &item.label) {
                Ok((data, class_id)) => {
                    images.push(data);
                    targets.push(class_id as i64);
                }
                Err(e) => {
                    tracing::warn!("サンプルをスキップします {}: {}", item.path.display(), e);
                }
            }
        }

        if images.is_empty() {
            return None;
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = images_to_tensor::<B>(&images, self.preprocessor.image_size(), &self.device);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);

        Some(IssueBatch { images, targets })
    }
}
