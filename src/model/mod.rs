pub mod config;
pub mod export;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, DeviceType, ModelSettings, ServerSettings, TrainingSettings};
pub use export::{export_model, load_graph_manifest, GraphManifest};
pub use model_metadata::ModelMetadata;
pub use model_storage::{load_snapshot, load_snapshot_parts, log_metadata_info, save_snapshot};
