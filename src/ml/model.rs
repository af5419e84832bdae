//! 分類モデルの共通定義
//!
//! ResNet バックボーンの最終層をカテゴリ数に差し替えた分類器と、
//! その設定を提供します。

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::loss::CrossEntropyLossConfig,
    record::{DefaultFileRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, ElementConversion, Int, Tensor},
    train::ClassificationOutput,
};

use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

use crate::categories::NUM_CLASSES;
use crate::error::ClassifierError;
use crate::ml::preprocess::{Preprocessor, CHANNELS, IMAGE_SIZE};
use crate::ml::resnet::{BackboneConfig, ResNet, IMAGENET_CLASSES, RESNET50_BLOCKS};

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
    /// ステージ毎のブロック数（ResNet-50）
    #[config(default = "vec![3, 4, 6, 3]")]
    pub blocks: Vec<usize>,
    /// 最初のステージの幅
    #[config(default = 64)]
    pub base_width: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::new(NUM_CLASSES)
    }
}

impl ModelConfig {
    pub fn backbone(&self) -> BackboneConfig {
        BackboneConfig::new(self.blocks.clone()).with_base_width(self.base_width)
    }

    pub fn preprocessor(&self) -> Preprocessor {
        Preprocessor::new(self.image_size)
    }

    /// ResNet-50 標準構成か
    pub fn is_resnet50(&self) -> bool {
        self.blocks == RESNET50_BLOCKS && self.base_width == 64 && self.image_size == IMAGE_SIZE
    }

    /// モデルをランダム初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> IssueClassifier<B> {
        IssueClassifier {
            backbone: self.backbone().init(self.num_classes, device),
        }
    }

    /// 事前学習済みバックボーン（1000クラス）を読み込み、最終層を差し替えて初期化
    ///
    /// `weights_path` は Burn のファイルレコーダー形式（拡張子なしで指定）。
    pub fn init_pretrained<B: Backend>(
        &self,
        weights_path: &Path,
        device: &B::Device,
    ) -> crate::error::Result<IssueClassifier<B>> {
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        let backbone = self
            .backbone()
            .init::<B>(IMAGENET_CLASSES, device)
            .load_file(weights_path.to_path_buf(), &recorder, device)
            .map_err(ClassifierError::record)?;

        tracing::info!(
            "事前学習済みバックボーンを読み込みました: {} (最終層 {} -> {})",
            weights_path.display(),
            backbone.feature_width(),
            self.num_classes
        );

        Ok(IssueClassifier {
            backbone: backbone.replace_head(self.num_classes, device),
        })
    }

    /// torchvision の ImageNet 重み（例: `resnet50-0676ba61.pth`）から初期化
    ///
    /// キー名を変換して 1000 クラスのバックボーンに読み込み、最終層を差し替えます。
    pub fn init_torchvision<B: Backend>(
        &self,
        weights_path: &Path,
        device: &B::Device,
    ) -> crate::error::Result<IssueClassifier<B>> {
        if !weights_path.exists() {
            return Err(ClassifierError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("weights not found: {}", weights_path.display()),
            )));
        }

        let args = TORCHVISION_KEY_REMAP.iter().fold(
            LoadArgs::new(weights_path.to_path_buf()),
            |args, (pattern, replacement)| args.with_key_remap(pattern, replacement),
        );
        let record = PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(args, device)
            .map_err(ClassifierError::record)?;

        let backbone = self
            .backbone()
            .init::<B>(IMAGENET_CLASSES, device)
            .load_record(record);

        tracing::info!(
            "torchvision の事前学習済み重みを読み込みました: {} (最終層 {} -> {})",
            weights_path.display(),
            backbone.feature_width(),
            self.num_classes
        );

        Ok(IssueClassifier {
            backbone: backbone.replace_head(self.num_classes, device),
        })
    }
}

/// torchvision の state_dict キーをこのバックボーンのレコード名に変換する規則
///
/// BatchNorm の weight/bias と Linear の転置はレコーダー側で変換される。
pub const TORCHVISION_KEY_REMAP: [(&str, &str); 6] = [
    (r"^layer1\.([0-9]+)\.", "stages.0.blocks.$1."),
    (r"^layer2\.([0-9]+)\.", "stages.1.blocks.$1."),
    (r"^layer3\.([0-9]+)\.", "stages.2.blocks.$1."),
    (r"^layer4\.([0-9]+)\.", "stages.3.blocks.$1."),
    (r"\.downsample\.0\.", ".downsample.conv."),
    (r"\.downsample\.1\.", ".downsample.bn."),
];

/// torchvision の重みファイル（`.pth` / `.pt`）か
pub fn is_torchvision_checkpoint(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("pth") | Some("pt")
    )
}

/// 課題報告画像の分類モデル
///
/// # アーキテクチャ
/// - ResNet バックボーン（既定は ResNet-50）
/// - FC: 特徴次元 (2048) -> カテゴリ数 (6)
///
/// 学習モードは Autodiff バックエンド上のモデル、評価モードは `valid()` で得られる
/// 内部バックエンド上のモデル（勾配追跡なし、BatchNorm は移動統計を使用）。
#[derive(Module, Debug)]
pub struct IssueClassifier<B: Backend> {
    backbone: ResNet<B>,
}

impl<B: Backend> IssueClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.backbone.forward(images)
    }

    /// 予測を実行
    ///
    /// # 戻り値
    /// - (予測クラスID [batch_size, 1], ロジット)
    pub fn predict(&self, images: Tensor<B, 4>) -> (Tensor<B, 2, Int>, Tensor<B, 2>) {
        let output = self.forward(images);
        let predictions = output.clone().argmax(1);
        (predictions, output)
    }

    /// 予測クラスIDをホスト側の値として取得
    pub fn classify(&self, images: Tensor<B, 4>) -> Vec<usize> {
        let (predictions, _) = self.predict(images);
        predictions
            .into_data()
            .iter::<B::IntElem>()
            .map(|i| i.elem::<i64>() as usize)
            .collect()
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    /// - `targets`: ターゲットラベル [batch_size]
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    pub fn num_classes(&self) -> usize {
        self.backbone.num_outputs()
    }

    pub fn feature_width(&self) -> usize {
        self.backbone.feature_width()
    }

    /// 層名とパラメータ形状
    pub fn layer_shapes(&self) -> Vec<(String, Vec<usize>)> {
        self.backbone.layer_shapes()
    }
}

/// 前処理済みデータ（各要素 C*H*W）をバッチテンソルに変換
///
/// テンソルは `device` 上に作成されます。
pub fn images_to_tensor<B: Backend>(
    images: &[Vec<f32>],
    image_size: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let batch_size = images.len();
    let flat: Vec<f32> = images.iter().flatten().copied().collect();
    Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([
        batch_size,
        CHANNELS,
        image_size,
        image_size,
    ])
}
