//! ResNet バックボーン（Bottleneck ブロック構成）
//!
//! torchvision の ResNet-50 と同じ構造:
//! - Stem: Conv 7x7 (stride 2) + BN + ReLU + MaxPool 3x3 (stride 2)
//! - 4ステージの Bottleneck (1x1 -> 3x3 -> 1x1, 拡張率4)
//! - Global Average Pooling
//! - FC: 特徴次元 -> クラス数

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// Bottleneck の拡張率
pub const EXPANSION: usize = 4;

/// ResNet-50 のステージ毎のブロック数
pub const RESNET50_BLOCKS: [usize; 4] = [3, 4, 6, 3];

/// ImageNet の事前学習済み重みのクラス数
pub const IMAGENET_CLASSES: usize = 1000;

/// バックボーン構成
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// ステージ毎のブロック数
    pub blocks: Vec<usize>,
    /// 最初のステージの幅（ResNet-50 は 64）
    #[config(default = 64)]
    pub base_width: usize,
}

impl BackboneConfig {
    /// ResNet-50
    pub fn resnet50() -> Self {
        Self::new(RESNET50_BLOCKS.to_vec())
    }

    /// 最終層直前の特徴次元（ResNet-50 は 2048）
    pub fn feature_width(&self) -> usize {
        let stages = self.blocks.len().max(1);
        self.base_width * (1 << (stages - 1)) * EXPANSION
    }

    /// 出力幅 `num_classes` のネットワークを初期化
    pub fn init<B: Backend>(&self, num_classes: usize, device: &B::Device) -> ResNet<B> {
        let stem_width = self.base_width;
        let mut in_channels = stem_width;
        let mut stages = Vec::with_capacity(self.blocks.len());

        for (stage, &num_blocks) in self.blocks.iter().enumerate() {
            let width = self.base_width << stage;
            let stride = if stage == 0 { 1 } else { 2 };
            let mut blocks = Vec::with_capacity(num_blocks);
            for i in 0..num_blocks {
                let block_stride = if i == 0 { stride } else { 1 };
                blocks.push(bottleneck(in_channels, width, block_stride, device));
                in_channels = width * EXPANSION;
            }
            stages.push(Stage { blocks });
        }

        ResNet {
            conv1: Conv2dConfig::new([3, stem_width], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(stem_width).init(device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            stages,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(in_channels, num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

fn bottleneck<B: Backend>(
    in_channels: usize,
    width: usize,
    stride: usize,
    device: &B::Device,
) -> Bottleneck<B> {
    let out_channels = width * EXPANSION;
    let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
        conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
            .with_stride([stride, stride])
            .with_bias(false)
            .init(device),
        bn: BatchNormConfig::new(out_channels).init(device),
    });

    Bottleneck {
        conv1: Conv2dConfig::new([in_channels, width], [1, 1])
            .with_bias(false)
            .init(device),
        bn1: BatchNormConfig::new(width).init(device),
        // stride は 3x3 畳み込みに置く (ResNet v1.5)
        conv2: Conv2dConfig::new([width, width], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device),
        bn2: BatchNormConfig::new(width).init(device),
        conv3: Conv2dConfig::new([width, out_channels], [1, 1])
            .with_bias(false)
            .init(device),
        bn3: BatchNormConfig::new(out_channels).init(device),
        downsample,
        activation: Relu::new(),
    }
}

/// ショートカット経路の射影
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> Downsample<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// Bottleneck ブロック
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>, // 1x1: in -> width
    bn1: BatchNorm<B>,
    conv2: Conv2d<B>, // 3x3: width -> width
    bn2: BatchNorm<B>,
    conv3: Conv2d<B>, // 1x1: width -> width * 4
    bn3: BatchNorm<B>,
    downsample: Option<Downsample<B>>,
    activation: Relu,
}

impl<B: Backend> Bottleneck<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = self.activation.forward(self.bn1.forward(self.conv1.forward(x)));
        let out = self.activation.forward(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));

        self.activation.forward(out + identity)
    }
}

/// ステージ（同一解像度の Bottleneck 列）
#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    blocks: Vec<Bottleneck<B>>,
}

impl<B: Backend> Stage<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }
}

/// ResNet 本体
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    maxpool: MaxPool2d,
    stages: Vec<Stage<B>>,
    avgpool: AdaptiveAvgPool2d,
    fc: Linear<B>,
    activation: Relu,
}

impl<B: Backend> ResNet<B> {
    /// 特徴抽出
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, H, W]
    ///
    /// # 戻り値
    /// - 特徴ベクトル [batch_size, feature_width]
    pub fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(images);
        let x = self.activation.forward(self.bn1.forward(x));
        let x = self.maxpool.forward(x);

        let x = self.stages.iter().fold(x, |x, stage| stage.forward(x));

        // [B, C, 1, 1] -> [B, C]
        self.avgpool.forward(x).flatten(1, 3)
    }

    /// 順伝播
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.fc.forward(self.forward_features(images))
    }

    /// 最終層の入力次元
    pub fn feature_width(&self) -> usize {
        self.fc.weight.dims()[0]
    }

    /// 最終層の出力次元
    pub fn num_outputs(&self) -> usize {
        self.fc.weight.dims()[1]
    }

    /// 最終全結合層を `num_classes` 出力の新しい層に差し替える
    ///
    /// 入力次元はバックボーンの特徴次元のまま。
    pub fn replace_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.fc = LinearConfig::new(self.feature_width(), num_classes).init(device);
        self
    }

    /// 層名とパラメータ形状の一覧（エクスポート用）
    pub fn layer_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let mut layers = vec![("conv1".to_string(), self.conv1.weight.dims().to_vec())];
        for (s, stage) in self.stages.iter().enumerate() {
            for (b, block) in stage.blocks.iter().enumerate() {
                let prefix = format!("stages.{s}.blocks.{b}");
                layers.push((format!("{prefix}.conv1"), block.conv1.weight.dims().to_vec()));
                layers.push((format!("{prefix}.conv2"), block.conv2.weight.dims().to_vec()));
                layers.push((format!("{prefix}.conv3"), block.conv3.weight.dims().to_vec()));
                if let Some(downsample) = &block.downsample {
                    layers.push((
                        format!("{prefix}.downsample.conv"),
                        downsample.conv.weight.dims().to_vec(),
                    ));
                }
            }
        }
        layers.push(("fc".to_string(), self.fc.weight.dims().to_vec()));
        layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_resnet50_feature_width() {
        assert_eq!(BackboneConfig::resnet50().feature_width(), 2048);
        assert_eq!(BackboneConfig::new(vec![1, 1, 1, 1]).with_base_width(4).feature_width(), 128);
    }

    #[test]
    fn test_forward_shape() {
        let device = NdArrayDevice::Cpu;
        let config = BackboneConfig::new(vec![1, 1, 1, 1]).with_base_width(4);
        let net = config.init::<TestBackend>(6, &device);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
        assert_eq!(net.forward(images).dims(), [2, 6]);
        assert_eq!(net.feature_width(), config.feature_width());
    }

    #[test]
    fn test_replace_head_keeps_feature_width() {
        let device = NdArrayDevice::Cpu;
        let config = BackboneConfig::new(vec![1, 1]).with_base_width(4);
        let net = config.init::<TestBackend>(IMAGENET_CLASSES, &device);
        assert_eq!(net.num_outputs(), IMAGENET_CLASSES);

        let width = net.feature_width();
        let net = net.replace_head(6, &device);
        assert_eq!(net.feature_width(), width);
        assert_eq!(net.num_outputs(), 6);
    }

    #[test]
    fn test_layer_shapes_include_head() {
        let device = NdArrayDevice::Cpu;
        let net = BackboneConfig::new(vec![1, 1])
            .with_base_width(4)
            .init::<TestBackend>(6, &device);
        let layers = net.layer_shapes();
        assert_eq!(layers.first().unwrap().0, "conv1");
        assert_eq!(layers.last().unwrap(), &("fc".to_string(), vec![32, 6]));
        assert!(layers.iter().any(|(name, _)| name.ends_with("downsample.conv")));
    }
}
