//! Worker - 能力を宣言する実行エージェント

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capability::CapabilitySet;
use super::ids::{TaskId, WorkerId};

/// Worker の状態
///
/// Idle と Busy がオンライン。Busy でもルーティング候補にはなる（負荷でスコアが下がる）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl WorkerStatus {
    pub fn is_online(self) -> bool {
        !matches!(self, WorkerStatus::Offline)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub capabilities: CapabilitySet,
    pub status: WorkerStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub current_task: Option<TaskId>,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    /// 登録直後はハートビート済み・Idle とする
    pub fn new(
        id: WorkerId,
        name: impl Into<String>,
        capabilities: CapabilitySet,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            capabilities,
            status: WorkerStatus::Idle,
            last_heartbeat: Some(now),
            current_task: None,
            registered_at: now,
        }
    }
}

/// 直近ウィンドウでの実績（ルーティングのスコア計算用）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub completed: u32,
    pub failed: u32,
    /// assigned / running の assignment 数
    pub active: u32,
}

impl WorkerStats {
    /// completed / (completed + failed)。履歴なしは `default_rate`。
    pub fn success_rate(&self, default_rate: f64) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            default_rate
        } else {
            f64::from(self.completed) / f64::from(finished)
        }
    }
}
