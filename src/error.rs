//! ライブラリ共通のエラー型

use std::path::PathBuf;

/// 分類器ライブラリのエラー
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Burn レコーダーのエラー（型が Display を持たないため文字列化して保持）
    #[error("record error: {0}")]
    Record(String),

    #[error("unknown category label: {0:?}")]
    UnknownLabel(String),

    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid manifest row {row}: {reason}")]
    ManifestFormat { row: usize, reason: String },

    #[error("manifest not found: {}", .0.display())]
    ManifestNotFound(PathBuf),

    #[error("model snapshot not found: {} (train the model first)", .0.display())]
    SnapshotNotFound(PathBuf),

    #[error("invalid snapshot: {0}")]
    SnapshotFormat(String),

    #[error("category labels differ: snapshot {snapshot:?}, registry {registry:?}")]
    LabelMismatch {
        snapshot: Vec<String>,
        registry: Vec<String>,
    },

    #[error("dataset is empty: {}", .0.display())]
    EmptyDataset(PathBuf),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ClassifierError>;

impl ClassifierError {
    /// Burn の `RecorderError` などをラップ
    pub fn record(err: impl std::fmt::Debug) -> Self {
        Self::Record(format!("{err:?}"))
    }

    /// 入力データ起因のエラーか（HTTP では 400 に対応）
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Image(_) | Self::UnknownLabel(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(ClassifierError::UnknownLabel("Fire".into()).is_client_error());
        assert!(!ClassifierError::SnapshotNotFound(PathBuf::from("x.tar.gz")).is_client_error());
    }

    #[test]
    fn test_snapshot_not_found_message() {
        let err = ClassifierError::SnapshotNotFound(PathBuf::from("model/snapshot.tar.gz"));
        assert!(err.to_string().contains("model/snapshot.tar.gz"));
    }
}
