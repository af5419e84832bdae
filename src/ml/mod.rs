pub mod dataset;
pub mod device;
pub mod inference;
pub mod model;
pub mod preprocess;
pub mod resnet;
pub mod training;

pub use dataset::{
    load_manifest, IssueBatch, IssueBatcher, IssueDataset, IssueItem, ManifestEntry,
};
pub use inference::{InferenceEngine, Prediction};
pub use model::{images_to_tensor, IssueClassifier, ModelConfig};
pub use preprocess::{Preprocessor, IMAGE_SIZE};
pub use training::{FineTuneStep, ModelSource, TrainJob, TrainingContext, TrainingReport};

/// GPU バックエンド
pub type WgpuBackend = burn_wgpu::Wgpu;
/// CPU バックエンド
pub type CpuBackend = burn_ndarray::NdArray<f32>;
/// 学習用（自動微分）バックエンド
pub type TrainBackend<B> = burn_autodiff::Autodiff<B>;
