//! FleetStore port - タスク・worker・assignment の正本（source of truth）
//!
//! 任意のトランザクショナルなストアがこの trait を実装できます。
//! 必要なのは「条件付き更新 + 影響行数のフィードバック」だけです。
//!
//! # 設計原則
//! - 条件付き書き込みは影響行数（0 or 1）を返す。0 は競合であってエラーではない
//! - `claim_task` は assignment 作成 / task→assigned / worker→busy を一つの単位で行う
//! - 時刻は呼び出し側が渡す（store は Clock を持たない）

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::domain::{
    AssignmentId, AssignmentOutcome, FleetResult, Task, TaskAssignment, TaskId,
    TransitionLogEntry, Worker, WorkerId, WorkerStats,
};
use crate::observability::{FleetCounts, LoopStatus};
use crate::ports::liveness::LivenessRecord;

#[async_trait]
pub trait FleetStore: Send + Sync {
    // ---- tasks ----

    async fn insert_task(&self, task: Task) -> FleetResult<()>;

    async fn get_task(&self, task_id: TaskId) -> FleetResult<Option<Task>>;

    /// pending かつ前提タスクがすべて completed のものを、priority 降順・作成順で最大 `limit` 件
    async fn fetch_pending(&self, limit: usize) -> FleetResult<Vec<Task>>;

    /// ループ内で失敗したタスクを failed にする
    async fn mark_task_failed(
        &self,
        task_id: TaskId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> FleetResult<u64>;

    /// `stage = entry.from_stage` の場合だけ stage を進め、ログを追記する
    async fn apply_stage_transition(&self, entry: TransitionLogEntry) -> FleetResult<u64>;

    async fn set_endpoint_verified(
        &self,
        task_id: TaskId,
        verified: bool,
        now: DateTime<Utc>,
    ) -> FleetResult<u64>;

    async fn transition_log(&self, task_id: TaskId) -> FleetResult<Vec<TransitionLogEntry>>;

    // ---- workers ----

    async fn insert_worker(&self, worker: Worker) -> FleetResult<()>;

    async fn get_worker(&self, worker_id: WorkerId) -> FleetResult<Option<Worker>>;

    async fn list_workers(&self) -> FleetResult<Vec<Worker>>;

    /// last_heartbeat を更新する。offline だった worker は idle に戻る。
    async fn touch_worker(&self, worker_id: WorkerId, at: DateTime<Utc>) -> FleetResult<u64>;

    /// last_heartbeat が `cutoff` より古いオンライン worker を offline にする
    async fn mark_stale_workers_offline(&self, cutoff: DateTime<Utc>) -> FleetResult<Vec<WorkerId>>;

    /// `since` 以降に終わった assignment の成功/失敗数と、現在の負荷
    async fn worker_stats(&self, worker_id: WorkerId, since: DateTime<Utc>)
    -> FleetResult<WorkerStats>;

    // ---- assignments ----

    async fn insert_assignment(&self, assignment: TaskAssignment) -> FleetResult<()>;

    async fn get_assignment(&self, assignment_id: AssignmentId)
    -> FleetResult<Option<TaskAssignment>>;

    async fn active_assignments_for(&self, worker_id: WorkerId) -> FleetResult<Vec<TaskAssignment>>;

    /// 条件付き claim（`WHERE status = 'pending'`）。影響行数を返す。
    async fn claim_task(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> FleetResult<u64>;

    /// stuck 条件に当てはまる active な assignment
    async fn fetch_stuck(
        &self,
        now: DateTime<Utc>,
        assigned_timeout: Duration,
        running_timeout: Duration,
    ) -> FleetResult<Vec<TaskAssignment>>;

    /// assigned → running
    async fn start_assignment(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> FleetResult<u64>;

    async fn record_progress(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> FleetResult<u64>;

    /// worker からの完了報告を反映し worker を解放する
    async fn finish_assignment(
        &self,
        assignment_id: AssignmentId,
        outcome: &AssignmentOutcome,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> FleetResult<u64>;

    /// stuck 回収: assignment→failed / task→pending（上限超過なら failed）/ worker 解放。
    /// active でなければ何もしない（冪等）。
    async fn release_assignment(
        &self,
        assignment_id: AssignmentId,
        reason: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> FleetResult<u64>;

    // ---- leases（liveness の DB フォールバック用） ----

    async fn put_lease(&self, lease: LivenessRecord) -> FleetResult<()>;

    /// キーがない、または期限切れなら書き込む
    async fn put_lease_if_absent(&self, lease: LivenessRecord) -> FleetResult<u64>;

    /// 現在の holder のときだけ期限を延ばす
    async fn renew_lease(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> FleetResult<u64>;

    async fn get_lease(&self, key: &str) -> FleetResult<Option<LivenessRecord>>;

    async fn delete_lease(&self, key: &str, holder: &str) -> FleetResult<u64>;

    // ---- loop telemetry ----

    async fn save_loop_status(&self, status: &LoopStatus) -> FleetResult<()>;

    async fn load_loop_status(&self) -> FleetResult<Option<LoopStatus>>;

    async fn counts(&self) -> FleetResult<FleetCounts>;
}
