//! アプリケーション設定管理モジュール
//!
//! 計算デバイスやモデル・学習・サーバー設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::categories::NUM_CLASSES;
use crate::error::{ClassifierError, Result};
use crate::ml::preprocess::IMAGE_SIZE;
use crate::ml::resnet::RESNET50_BLOCKS;
use crate::ml::ModelConfig;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// 起動時に GPU を検出し、無ければ CPU
    #[default]
    Auto,
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Auto => write!(f, "Auto (GPU if available)"),
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = ClassifierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DeviceType::Auto),
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            other => Err(ClassifierError::Config(format!("unknown device type: {other}"))),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSettings {
    /// 学習済みスナップショットのパス
    pub snapshot_path: String,
    /// 事前学習済みバックボーン（ImageNet 1000クラス）
    /// torchvision の `.pth` または Burn レコード
    /// 未指定の場合はランダム初期化
    #[serde(default)]
    pub pretrained_path: Option<String>,
    /// エクスポート先
    pub export_path: String,
    /// 入力画像サイズ
    pub image_size: usize,
    /// バックボーンのステージ毎のブロック数
    pub blocks: Vec<usize>,
    /// バックボーンの基本幅
    pub base_width: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            snapshot_path: "model/issue_reporting_model.tar.gz".to_string(),
            pretrained_path: None,
            export_path: "model/export/issue_reporting_model.tar.gz".to_string(),
            image_size: IMAGE_SIZE,
            blocks: RESNET50_BLOCKS.to_vec(),
            base_width: 64,
        }
    }
}

impl ModelSettings {
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new(NUM_CLASSES)
            .with_image_size(self.image_size)
            .with_blocks(self.blocks.clone())
            .with_base_width(self.base_width)
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingSettings {
    /// マニフェストCSVのパス
    pub manifest_path: String,
    /// 画像のルートディレクトリ
    pub image_root: String,
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 1サンプル毎の追加学習のバッチサイズ
    pub fine_tune_batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// エポック学習後に1サンプル毎の追加学習を行うか
    pub fine_tune_per_sample: bool,
    /// 追加学習のログ間隔（サンプル数）
    pub log_interval: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            manifest_path: "model/training/train.csv".to_string(),
            image_root: "model/training".to_string(),
            num_epochs: 5,
            batch_size: 32,
            fine_tune_batch_size: 1,
            num_workers: 1,
            learning_rate: 1e-3,
            seed: 42,
            fine_tune_per_sample: true,
            log_interval: 100,
        }
    }
}

/// サーバー設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    /// 待ち受けアドレス
    pub bind_addr: String,
    /// アップロードの最大サイズ（MB）
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

fn default_max_upload_mb() -> usize {
    16
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// サーバー設定
    #[serde(default)]
    pub server: ServerSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(
                "設定ファイルが存在しません。デフォルト設定を使用します: {}",
                path.display()
            );
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                tracing::info!("設定ファイルを読み込みました: {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!(
                    "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn log_summary(&self) {
        tracing::info!("計算デバイス: {}", self.device_type);
        tracing::info!("スナップショット: {}", self.model.snapshot_path);
        tracing::info!(
            "バックボーン: blocks={:?}, base_width={}, 入力 {}x{}",
            self.model.blocks,
            self.model.base_width,
            self.model.image_size,
            self.model.image_size
        );
        tracing::info!(
            "学習: エポック数 {}, バッチサイズ {}, 学習率 {}, シード {}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.seed
        );
        tracing::info!(
            "サーバー: {} (最大アップロード {} MB)",
            self.server.bind_addr,
            self.server.max_upload_mb
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Auto);
        assert_eq!(config.training.num_epochs, 5);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.training.fine_tune_batch_size, 1);
        assert!((config.training.learning_rate - 0.001).abs() < f64::EPSILON);
        assert!(config.model.model_config().is_resnet50());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_server_section_uses_default() {
        let mut value = serde_json::to_value(AppConfig::default()).unwrap();
        value.as_object_mut().unwrap().remove("server");
        let config: AppConfig = serde_json::from_value(value).unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8000");
    }

    #[test]
    fn test_load_or_default_from_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(AppConfig::load_or_default_from(&path), AppConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.device_type = DeviceType::Cpu;
        config.training.num_epochs = 2;
        config.save(&path).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_device_type_display_and_parse() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
        assert_eq!("cpu".parse::<DeviceType>().unwrap(), DeviceType::Cpu);
        assert_eq!("GPU".parse::<DeviceType>().unwrap(), DeviceType::Wgpu);
        assert_eq!("auto".parse::<DeviceType>().unwrap(), DeviceType::Auto);
        assert!("tpu".parse::<DeviceType>().is_err());
    }
}
