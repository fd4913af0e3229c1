//! Task - governance task のレコード

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::capability::CapabilitySet;
use super::ids::{TaskId, WorkerId};
use super::stage::Stage;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// タスクの実行状態（ライフサイクル段階 `Stage` とは別軸）
///
/// - Pending -> Assigned -> Running -> Completed
/// - Assigned/Running -> Pending（stuck 回収・worker 失敗後の再投入）
/// - * -> Failed（試行上限・ループ内の例外）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 新規タスクの投入内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: i32,
    /// 明示的な必要能力。空なら task_type の対応表から導出する。
    #[serde(default)]
    pub required_capabilities: CapabilitySet,
    /// 先に completed になっている必要があるタスク
    #[serde(default)]
    pub prerequisites: Vec<TaskId>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: TaskType::new(task_type),
            priority: 0,
            required_capabilities: CapabilitySet::new(),
            prerequisites: Vec::new(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = caps.into_iter().collect();
        self
    }

    pub fn after(mut self, prerequisite: TaskId) -> Self {
        self.prerequisites.push(prerequisite);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub stage: Stage,
    pub priority: i32,
    pub required_capabilities: CapabilitySet,
    pub prerequisites: Vec<TaskId>,
    pub payload: serde_json::Value,
    pub assigned_worker: Option<WorkerId>,
    /// claim された回数
    pub attempts: u32,
    pub endpoint_verified: bool,
    /// 最新の evidence（全履歴は遷移ログにある）
    pub evidence: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// pending / stage=discovered で作成
    pub fn new(id: TaskId, spec: TaskSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_type: spec.task_type,
            status: TaskStatus::Pending,
            stage: Stage::Discovered,
            priority: spec.priority,
            required_capabilities: spec.required_capabilities,
            prerequisites: spec.prerequisites,
            payload: spec.payload,
            assigned_worker: None,
            attempts: 0,
            endpoint_verified: false,
            evidence: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 再ルーティング待ちに戻す
    pub fn reset_to_pending(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.assigned_worker = None;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.assigned_worker = None;
        self.last_error = Some(reason.into());
        self.updated_at = now;
    }
}
