//! 課題報告画像分類 CLI
//!
//! - `train`  マニフェストから学習し、スナップショットとエクスポートを保存
//! - `serve`  スナップショットを読み込んで HTTP 推論サーバーを起動
//! - `config` 現在の設定を表示・保存

#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use burn_ndarray::NdArrayDevice;
use burn_wgpu::WgpuDevice;
use clap::{Parser, Subcommand};

use issue_classifier_lib::ml::device::{resolve_device, ComputeDevice};
use issue_classifier_lib::ml::{
    CpuBackend, InferenceEngine, ModelSource, TrainBackend, TrainJob, WgpuBackend,
};
use issue_classifier_lib::model::{AppConfig, DeviceType};
use issue_classifier_lib::server;

#[derive(Parser, Debug)]
#[command(name = "issue_classifier", version, about = "Issue report photo classifier")]
struct Cli {
    /// 設定ファイル
    #[arg(long, global = true, env = "ISSUE_CLASSIFIER_CONFIG")]
    config: Option<PathBuf>,

    /// 計算デバイス（auto | wgpu | cpu）
    #[arg(long, global = true)]
    device: Option<DeviceType>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// モデルを学習
    Train {
        /// マニフェストCSV
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// 画像のルートディレクトリ
        #[arg(long)]
        image_root: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        learning_rate: Option<f64>,
        /// 事前学習済みバックボーン（torchvision `.pth` または Burnレコード）
        #[arg(long)]
        pretrained: Option<PathBuf>,
        /// 既存スナップショットから学習を再開
        #[arg(long)]
        resume: Option<PathBuf>,
        /// スナップショットの保存先
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// エクスポート先
        #[arg(long)]
        export: Option<PathBuf>,
        /// 1サンプル毎の追加学習を行わない
        #[arg(long)]
        no_fine_tune: bool,
    },
    /// 推論サーバーを起動
    Serve {
        /// スナップショット
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// 待ち受けアドレス
        #[arg(long)]
        bind: Option<String>,
    },
    /// 設定を表示（`--save` で書き出し）
    Config {
        #[arg(long)]
        save: bool,
    },
}

fn load_config(cli: &Cli) -> AppConfig {
    let path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default_from(path);
    if let Some(device) = cli.device {
        config.device_type = device;
    }
    config
}

fn train(config: AppConfig, resume: Option<PathBuf>) -> Result<()> {
    let settings = &config.training;
    let job = TrainJob {
        manifest_path: PathBuf::from(&settings.manifest_path),
        image_root: PathBuf::from(&settings.image_root),
        model_config: config.model.model_config(),
        source: ModelSource::from_paths(
            resume.as_deref(),
            config.model.pretrained_path.as_deref().map(std::path::Path::new),
        ),
        settings: settings.clone(),
        snapshot_path: PathBuf::from(&config.model.snapshot_path),
        export_path: PathBuf::from(&config.model.export_path),
    };

    let report = match resolve_device(config.device_type) {
        ComputeDevice::Wgpu => job.run::<TrainBackend<WgpuBackend>>(WgpuDevice::default()),
        ComputeDevice::Cpu => job.run::<TrainBackend<CpuBackend>>(NdArrayDevice::Cpu),
    }?;

    if let Some(loss) = report.epoch_losses.last() {
        tracing::info!("最終エポックの平均損失: {:.6}", loss);
    }
    tracing::info!("スナップショット: {}", report.snapshot_path.display());
    tracing::info!("エクスポート: {}", report.export_path.display());
    Ok(())
}

fn serve_with<B: Backend>(config: &AppConfig, device: B::Device) -> Result<()> {
    let engine = InferenceEngine::<B>::load(&config.model.snapshot_path, device)
        .context("推論エンジンの初期化に失敗しました")?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(server::serve(engine, &config.server))
}

fn main() -> Result<()> {
    issue_classifier_lib::init_tracing();

    let cli = Cli::parse();
    let mut config = load_config(&cli);

    match cli.command {
        Command::Train {
            manifest,
            image_root,
            epochs,
            batch_size,
            learning_rate,
            pretrained,
            resume,
            snapshot,
            export,
            no_fine_tune,
        } => {
            if let Some(path) = manifest {
                config.training.manifest_path = path.to_string_lossy().to_string();
            }
            if let Some(path) = image_root {
                config.training.image_root = path.to_string_lossy().to_string();
            }
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            if let Some(lr) = learning_rate {
                config.training.learning_rate = lr;
            }
            if let Some(path) = pretrained {
                config.model.pretrained_path = Some(path.to_string_lossy().to_string());
            }
            if let Some(path) = snapshot {
                config.model.snapshot_path = path.to_string_lossy().to_string();
            }
            if let Some(path) = export {
                config.model.export_path = path.to_string_lossy().to_string();
            }
            if no_fine_tune {
                config.training.fine_tune_per_sample = false;
            }
            config.log_summary();
            train(config, resume)
        }
        Command::Serve { snapshot, bind } => {
            if let Some(path) = snapshot {
                config.model.snapshot_path = path.to_string_lossy().to_string();
            }
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            config.log_summary();
            match resolve_device(config.device_type) {
                ComputeDevice::Wgpu => serve_with::<WgpuBackend>(&config, WgpuDevice::default()),
                ComputeDevice::Cpu => serve_with::<CpuBackend>(&config, NdArrayDevice::Cpu),
            }
        }
        Command::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                let path = cli.config.unwrap_or_else(AppConfig::default_path);
                config
                    .save(&path)
                    .with_context(|| format!("設定の保存に失敗しました: {}", path.display()))?;
                tracing::info!("設定を保存しました: {}", path.display());
            }
            Ok(())
        }
    }
}
