//! スナップショットメタデータの定義
//!
//! tar.gz形式のスナップショットに `metadata.json` として保存され、
//! 推論側はここからモデル構成とカテゴリ順序を復元します。

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ml::ModelConfig;

/// スナップショットメタデータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// カテゴリラベル（位置がクラスID）
    /// 例: ["Roads", "Water", "Electricity", "Waste", "Safety", "Other"]
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（正方形、通常224）
    pub image_size: usize,

    /// バックボーンのステージ毎のブロック数（ResNet-50 は [3, 4, 6, 3]）
    pub blocks: Vec<usize>,

    /// バックボーンの基本幅
    pub base_width: usize,

    /// 学習エポック数
    pub num_epochs: usize,

    /// 1サンプル毎の追加学習を実施したか
    #[serde(default)]
    pub fine_tuned: bool,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_labels: Vec<String>,
        model_config: &ModelConfig,
        num_epochs: usize,
        fine_tuned: bool,
    ) -> Self {
        Self {
            class_labels,
            image_size: model_config.image_size,
            blocks: model_config.blocks.clone(),
            base_width: model_config.base_width,
            num_epochs,
            fine_tuned,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// メタデータからモデル設定を復元
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new(self.class_labels.len())
            .with_image_size(self.image_size)
            .with_blocks(self.blocks.clone())
            .with_base_width(self.base_width)
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::CategoryRegistry;

    #[test]
    fn test_model_config_restored() {
        let config = ModelConfig::default().with_blocks(vec![1, 1]).with_base_width(8);
        let labels = CategoryRegistry::default().labels().to_vec();
        let metadata = ModelMetadata::new(labels, &config, 5, true);

        let restored = metadata.model_config();
        assert_eq!(restored.num_classes, 6);
        assert_eq!(restored.blocks, vec![1, 1]);
        assert_eq!(restored.base_width, 8);
        assert_eq!(restored.image_size, 224);
    }

    #[test]
    fn test_json_without_fine_tuned_field() {
        let json = r#"{
            "class_labels": ["Roads", "Water"],
            "image_size": 224,
            "blocks": [3, 4, 6, 3],
            "base_width": 64,
            "num_epochs": 5,
            "trained_at": "2024-01-01T00:00:00+00:00"
        }"#;
        let metadata = ModelMetadata::from_json_string(json).unwrap();
        assert!(!metadata.fine_tuned);
        assert_eq!(metadata.class_labels.len(), 2);
    }
}
