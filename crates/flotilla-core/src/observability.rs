//! Observability - 集計ビュー・ループのテレメトリ・リトライ記録
//!
//! ここにある記録はすべて「観測用」で、制御フローには影響しません。

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetCounts {
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub workers_idle: usize,
    pub workers_busy: usize,
    pub workers_offline: usize,
}

/// autonomy loop の永続化されるステータス（単一の可変レコード）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopStatus {
    pub running: bool,
    pub is_leader: bool,
    pub iterations: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    /// 直近イテレーションで処理したタスク数
    pub tasks_processed: usize,
    /// 直近イテレーションで割り当てたタスク数
    pub tasks_assigned: usize,
    pub stuck_released: usize,
    pub workers_marked_offline: usize,
    pub last_duration_ms: u64,
    pub total_assigned: u64,
    pub total_stuck_released: u64,
    pub last_error: Option<String>,
}

/// リトライ 1 回分の記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEvent {
    pub function: String,
    pub service: String,
    /// 失敗した試行番号（0 始まり）
    pub attempt: u32,
    pub delay: Duration,
    pub error: String,
}

pub trait RetryObserver: Send + Sync {
    fn on_retry(&self, event: &RetryEvent);
}

/// 既定: tracing に流すだけ
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRetryObserver;

impl RetryObserver for TracingRetryObserver {
    fn on_retry(&self, event: &RetryEvent) {
        tracing::warn!(
            function = %event.function,
            service = %event.service,
            attempt = event.attempt,
            delay_ms = event.delay.as_millis() as u64,
            error = %event.error,
            "retrying after transient failure"
        );
    }
}

/// 記録を溜めておく observer（診断・テスト用）
#[derive(Debug, Default)]
pub struct RecordingRetryObserver {
    events: Mutex<Vec<RetryEvent>>,
}

impl RecordingRetryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RetryEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl RetryObserver for RecordingRetryObserver {
    fn on_retry(&self, event: &RetryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
