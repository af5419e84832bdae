//! モデル学習
//!
//! 1. エポック学習（シャッフル、バッチサイズ32）
//! 2. 1サンプル毎の追加学習（シャッフル無し、バッチサイズ1）
//! 3. スナップショット保存とエクスポート

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    module::AutodiffModule,
    optim::{adaptor::OptimizerAdaptor, Adam, AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use burn_dataset::Dataset;

use crate::categories::CategoryRegistry;
use crate::error::ClassifierError;
use crate::ml::dataset::{IssueBatch, IssueBatcher, IssueDataset};
use crate::ml::model::is_torchvision_checkpoint;
use crate::ml::{IssueClassifier, ModelConfig};
use crate::model::config::TrainingSettings;
use crate::model::{export_model, load_snapshot, save_snapshot, ModelMetadata};

/// モデルの初期化方法
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// ランダム初期化
    Fresh,
    /// ImageNet 事前学習済みバックボーン
    ///
    /// `.pth`/`.pt` は torchvision の state dict、それ以外は Burn レコードとして読み込む。
    Pretrained(PathBuf),
    /// 既存スナップショットから再開
    Snapshot(PathBuf),
}

impl ModelSource {
    /// 設定値から初期化方法を決定
    pub fn from_paths(resume: Option<&Path>, pretrained: Option<&Path>) -> Self {
        match (resume, pretrained) {
            (Some(path), _) => Self::Snapshot(path.to_path_buf()),
            (None, Some(path)) => Self::Pretrained(path.to_path_buf()),
            (None, None) => Self::Fresh,
        }
    }

    /// モデルを構築して `device` に配置
    pub fn build<B: AutodiffBackend>(
        &self,
        config: &ModelConfig,
        device: &B::Device,
    ) -> Result<IssueClassifier<B>> {
        let model = match self {
            ModelSource::Fresh => {
                tracing::warn!("事前学習済み重みが指定されていません。ランダム初期化で学習します");
                config.init::<B>(device)
            }
            ModelSource::Pretrained(path) if is_torchvision_checkpoint(path) => config
                .init_torchvision::<B>(path, device)
                .with_context(|| format!("torchvision 重みの読み込みに失敗: {}", path.display()))?,
            ModelSource::Pretrained(path) => config
                .init_pretrained::<B>(path, device)
                .with_context(|| format!("事前学習済み重みの読み込みに失敗: {}", path.display()))?,
            ModelSource::Snapshot(path) => {
                let (metadata, model) = load_snapshot::<B>(path, device).with_context(|| {
                    format!("スナップショットの読み込みに失敗: {}", path.display())
                })?;
                CategoryRegistry::default().ensure_matches(&metadata.class_labels)?;
                if metadata.blocks != config.blocks
                    || metadata.base_width != config.base_width
                    || metadata.image_size != config.image_size
                {
                    anyhow::bail!(
                        "スナップショットのモデル構成が設定と一致しません: \
                         blocks={:?}, base_width={}, image_size={}",
                        metadata.blocks,
                        metadata.base_width,
                        metadata.image_size
                    );
                }
                model
            }
        };
        Ok(model)
    }
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// エポック毎の平均損失
    pub epoch_losses: Vec<f64>,
    /// 追加学習の各ステップ
    pub fine_tune_steps: Vec<FineTuneStep>,
    /// スナップショットの保存先
    pub snapshot_path: PathBuf,
    /// エクスポートの保存先
    pub export_path: PathBuf,
}

/// 追加学習の1ステップ
#[derive(Debug, Clone, PartialEq)]
pub struct FineTuneStep {
    /// このステップで学習したクラスインデックス（バッチ内の順）
    pub targets: Vec<usize>,
    pub loss: f64,
}

/// 学習コンテキスト
///
/// 学習中のモデル・オプティマイザ・デバイスを単一の所有者として保持します。
pub struct TrainingContext<B: AutodiffBackend> {
    model: IssueClassifier<B>,
    optim: OptimizerAdaptor<Adam, IssueClassifier<B>, B>,
    device: B::Device,
    learning_rate: f64,
}

impl<B: AutodiffBackend> TrainingContext<B> {
    pub fn new(model: IssueClassifier<B>, device: B::Device, learning_rate: f64) -> Self {
        Self {
            model,
            optim: AdamConfig::new().init(),
            device,
            learning_rate,
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn into_model(self) -> IssueClassifier<B> {
        self.model
    }

    /// 1ステップ学習（順伝播 -> 損失 -> 逆伝播 -> パラメータ更新）
    ///
    /// 勾配は `backward()` 毎に新しく計算されるため累積はしない。
    /// 戻り値はこのバッチの損失。
    pub fn step(&mut self, batch: IssueBatch<B>) -> f64 {
        let output = self.model.forward_classification(batch.images, batch.targets);
        let loss_value: f64 = output.loss.clone().into_scalar().elem();

        let grads = output.loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self.optim.step(self.learning_rate, self.model.clone(), grads);

        loss_value
    }

    /// 1エポック分のバッチを学習し、平均損失を返す
    ///
    /// 使用可能なバッチが1つも無い場合は `None`。
    pub fn run_epoch<I>(&mut self, batches: I) -> Option<f64>
    where
        I: Iterator<Item = Option<IssueBatch<B>>>,
    {
        let mut loss_sum = 0.0f64;
        let mut num_batches = 0usize;

        for batch in batches {
            let Some(batch) = batch else {
                tracing::warn!("有効なサンプルが無いバッチをスキップしました");
                continue;
            };
            let loss = self.step(batch);
            tracing::debug!("batch {}: loss={:.4}", num_batches + 1, loss);
            loss_sum += loss;
            num_batches += 1;
        }

        (num_batches > 0).then(|| loss_sum / num_batches as f64)
    }

    /// エポック学習
    pub fn fit(&mut self, dataset: &IssueDataset, settings: &TrainingSettings) -> Result<Vec<f64>> {
        let batcher = IssueBatcher::<B>::new(
            self.device.clone(),
            dataset.preprocessor(),
            dataset.registry().clone(),
        );
        let loader = DataLoaderBuilder::new(batcher)
            .batch_size(settings.batch_size)
            .shuffle(settings.seed)
            .num_workers(settings.num_workers)
            .build(dataset.clone());

        tracing::info!(
            "学習を開始します: {} 枚, エポック数 {}, バッチサイズ {}, 学習率 {}",
            dataset.len(),
            settings.num_epochs,
            settings.batch_size,
            self.learning_rate
        );

        let mut losses = Vec::with_capacity(settings.num_epochs);
        for epoch in 1..=settings.num_epochs {
            let loss = self
                .run_epoch(loader.iter())
                .with_context(|| format!("Epoch {epoch}: 有効な学習サンプルがありません"))?;
            tracing::info!("Epoch {}/{}, Loss: {:.6}", epoch, settings.num_epochs, loss);
            losses.push(loss);
        }

        Ok(losses)
    }

    /// 1サンプル毎の追加学習
    ///
    /// 全サンプルをマニフェスト順に1回ずつ学習します。読み込めないサンプルはスキップ。
    pub fn fine_tune_per_sample(
        &mut self,
        dataset: &IssueDataset,
        settings: &TrainingSettings,
    ) -> Vec<FineTuneStep> {
        let batcher = IssueBatcher::<B>::new(
            self.device.clone(),
            dataset.preprocessor(),
            dataset.registry().clone(),
        );
        // シャッフル無し・ワーカー無しで順序を保つ
        let loader = DataLoaderBuilder::new(batcher)
            .batch_size(settings.fine_tune_batch_size)
            .build(dataset.clone());

        tracing::info!("1サンプル毎の追加学習を開始します: {} 枚", dataset.len());

        let mut steps = Vec::with_capacity(dataset.len());
        for batch in loader.iter().flatten() {
            let targets = batch
                .targets
                .to_data()
                .iter::<i64>()
                .map(|target| target as usize)
                .collect();
            let loss = self.step(batch);
            steps.push(FineTuneStep { targets, loss });
            if settings.log_interval > 0 && steps.len() % settings.log_interval == 0 {
                tracing::info!("追加学習 {} ステップ目, Loss: {:.6}", steps.len(), loss);
            }
        }

        steps
    }
}

/// 学習ジョブ
pub struct TrainJob {
    pub manifest_path: PathBuf,
    pub image_root: PathBuf,
    pub model_config: ModelConfig,
    pub source: ModelSource,
    pub settings: TrainingSettings,
    pub snapshot_path: PathBuf,
    pub export_path: PathBuf,
}

impl TrainJob {
    /// 学習を実行
    ///
    /// マニフェストが無い場合は学習を開始せずにエラー。
    pub fn run<B: AutodiffBackend>(&self, device: B::Device) -> Result<TrainingReport> {
        let registry = CategoryRegistry::default();
        let dataset = IssueDataset::from_manifest(
            &self.manifest_path,
            &self.image_root,
            registry.clone(),
            self.model_config.preprocessor(),
        )
        .context("学習データの読み込みに失敗しました")?;

        if dataset.is_empty() {
            return Err(ClassifierError::EmptyDataset(self.manifest_path.clone()).into());
        }

        tracing::info!("使用デバイス: {:?}", device);
        let model = self.source.build::<B>(&self.model_config, &device)?;
        let mut context = TrainingContext::new(model, device, self.settings.learning_rate);

        let epoch_losses = context.fit(&dataset, &self.settings)?;

        let fine_tune_steps = if self.settings.fine_tune_per_sample {
            context.fine_tune_per_sample(&dataset, &self.settings)
        } else {
            Vec::new()
        };

        let metadata = ModelMetadata::new(
            registry.labels().to_vec(),
            &self.model_config,
            self.settings.num_epochs,
            self.settings.fine_tune_per_sample,
        );

        // 評価モードで保存・エクスポート
        let device = context.device().clone();
        let model = context.into_model().valid();

        let snapshot_path = save_snapshot(&self.snapshot_path, &metadata, &model)
            .context("スナップショットの保存に失敗しました")?;
        let export_path = export_model(&model, &metadata, &self.export_path, &device)
            .context("モデルのエクスポートに失敗しました")?;

        tracing::info!("学習完了: {} に保存しました", snapshot_path.display());

        Ok(TrainingReport {
            epoch_losses,
            fine_tune_steps,
            snapshot_path,
            export_path,
        })
    }
}
