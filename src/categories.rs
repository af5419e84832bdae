//! 分類カテゴリの定義
//!
//! クラスインデックスはこのリスト内の位置。学習と推論で同一である必要があり、
//! スナップショットのメタデータにも保存されます。

use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};

/// クラス数
pub const NUM_CLASSES: usize = 6;

/// カテゴリ名の定義（順序がクラスIDになる）
pub const CATEGORIES: [&str; NUM_CLASSES] =
    ["Roads", "Water", "Electricity", "Waste", "Safety", "Other"];

/// カテゴリレジストリ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRegistry {
    labels: Vec<String>,
}

impl Default for CategoryRegistry {
    fn default() -> Self {
        Self {
            labels: CATEGORIES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CategoryRegistry {
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// ラベルからクラスインデックスを取得
    pub fn label_to_index(&self, label: &str) -> Result<usize> {
        self.labels
            .iter()
            .position(|l| l == label)
            .ok_or_else(|| ClassifierError::UnknownLabel(label.to_string()))
    }

    /// クラスインデックスからラベルを取得
    pub fn index_to_label(&self, index: usize) -> Result<&str> {
        self.labels
            .get(index)
            .map(String::as_str)
            .ok_or(ClassifierError::IndexOutOfRange {
                index,
                len: self.labels.len(),
            })
    }

    /// スナップショットに記録されたラベル列と一致するか検証
    pub fn ensure_matches(&self, snapshot_labels: &[String]) -> Result<()> {
        if self.labels != snapshot_labels {
            return Err(ClassifierError::LabelMismatch {
                snapshot: snapshot_labels.to_vec(),
                registry: self.labels.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_index() {
        let registry = CategoryRegistry::default();
        for i in 0..registry.len() {
            let label = registry.index_to_label(i).unwrap();
            assert_eq!(registry.label_to_index(label).unwrap(), i);
        }
    }

    #[test]
    fn test_round_trip_label() {
        let registry = CategoryRegistry::default();
        for label in CATEGORIES {
            let idx = registry.label_to_index(label).unwrap();
            assert_eq!(registry.index_to_label(idx).unwrap(), label);
        }
    }

    #[test]
    fn test_order_is_fixed() {
        let registry = CategoryRegistry::default();
        assert_eq!(registry.len(), NUM_CLASSES);
        assert_eq!(registry.index_to_label(0).unwrap(), "Roads");
        assert_eq!(registry.index_to_label(5).unwrap(), "Other");
    }

    #[test]
    fn test_unknown_label() {
        let registry = CategoryRegistry::default();
        assert!(matches!(
            registry.label_to_index("roads"),
            Err(ClassifierError::UnknownLabel(_))
        ));
        assert!(registry.index_to_label(NUM_CLASSES).is_err());
    }

    #[test]
    fn test_ensure_matches() {
        let registry = CategoryRegistry::default();
        assert!(registry.ensure_matches(registry.labels()).is_ok());

        let mut reordered = registry.labels().to_vec();
        reordered.swap(0, 1);
        assert!(matches!(
            registry.ensure_matches(&reordered),
            Err(ClassifierError::LabelMismatch { .. })
        ));
    }
}
