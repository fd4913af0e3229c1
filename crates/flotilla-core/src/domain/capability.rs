//! Capability - worker の能力宣言と task_type → 必要能力の対応表

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use super::task::TaskType;

/// 能力の集合（順序付きで表示・比較が安定する）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, capability: impl Into<String>) {
        self.0.insert(capability.into());
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.0.contains(capability)
    }

    /// self ⊇ required
    pub fn covers(&self, required: &CapabilitySet) -> bool {
        required.0.is_subset(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// CapabilityMap は task_type から必要能力を引く
///
/// 未登録の task_type は空集合（＝オンラインの worker なら誰でも可）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityMap {
    by_type: HashMap<String, CapabilitySet>,
}

impl CapabilityMap {
    pub fn empty() -> Self {
        Self {
            by_type: HashMap::new(),
        }
    }

    /// 既定の対応表
    pub fn standard() -> Self {
        let mut map = Self::empty();
        map.insert("code_fix", ["code_analysis", "debugging"]);
        map.insert("bug_triage", ["code_analysis", "debugging"]);
        map.insert("code_review", ["code_analysis"]);
        map.insert("test_run", ["testing"]);
        map.insert("deployment", ["deployment"]);
        map.insert("endpoint_check", ["http_check"]);
        map.insert("log_analysis", ["log_analysis"]);
        map.insert("content_generation", ["content_generation"]);
        map.insert("billing_sync", ["billing"]);
        map
    }

    pub fn insert<I, S>(&mut self, task_type: impl Into<String>, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.by_type
            .insert(task_type.into(), capabilities.into_iter().collect());
    }

    /// 別の表で上書きする（設定ファイル由来の override）
    pub fn merge(&mut self, other: CapabilityMap) {
        self.by_type.extend(other.by_type);
    }

    pub fn requirements(&self, task_type: &TaskType) -> CapabilitySet {
        self.by_type
            .get(task_type.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

impl Default for CapabilityMap {
    fn default() -> Self {
        Self::standard()
    }
}
