//! InMemoryFleetStore - 開発・テスト用の正本
//!
//! 全テーブルを 1 つの Mutex の下に置くので、各メソッドは 1 トランザクションとして振る舞う。
//! 条件付き更新は SQL の `UPDATE ... WHERE` と同じく影響行数を返す。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    AssignmentId, AssignmentOutcome, AssignmentStatus, FleetError, FleetResult, Stage, Task,
    TaskAssignment, TaskId, TaskStatus, TransitionLogEntry, Worker, WorkerId, WorkerStats,
    WorkerStatus,
};
use crate::observability::{FleetCounts, LoopStatus};
use crate::ports::{FleetStore, LivenessRecord};

#[derive(Default)]
struct InMemoryStoreState {
    tasks: HashMap<TaskId, Task>,
    workers: HashMap<WorkerId, Worker>,
    assignments: HashMap<AssignmentId, TaskAssignment>,
    transitions: Vec<TransitionLogEntry>,
    leases: HashMap<String, LivenessRecord>,
    loop_status: Option<LoopStatus>,
}

impl InMemoryStoreState {
    fn prerequisites_met(&self, task: &Task) -> bool {
        task.prerequisites.iter().all(|id| {
            self.tasks
                .get(id)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
    }

    fn active_count(&self, worker_id: WorkerId) -> usize {
        self.assignments
            .values()
            .filter(|a| a.worker_id == worker_id && a.status.is_active())
            .count()
    }

    /// assignment 終了後に worker を解放する
    fn free_worker(&mut self, worker_id: WorkerId, task_id: TaskId) {
        let remaining = self.active_count(worker_id);
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            if worker.current_task == Some(task_id) {
                worker.current_task = None;
            }
            if remaining == 0 && worker.status == WorkerStatus::Busy {
                worker.status = WorkerStatus::Idle;
            }
        }
    }

    /// assignment を終わらせ、task を次の状態へ送る
    fn close_assignment(
        &mut self,
        assignment_id: AssignmentId,
        status: AssignmentStatus,
        reason: Option<String>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> u64 {
        let Some(assignment) = self.assignments.get_mut(&assignment_id) else {
            return 0;
        };
        if !assignment.status.is_active() {
            return 0;
        }
        assignment.finish(status, reason.clone(), now);
        let task_id = assignment.task_id;
        let worker_id = assignment.worker_id;

        if let Some(task) = self.tasks.get_mut(&task_id)
            && task.assigned_worker == Some(worker_id)
            && matches!(task.status, TaskStatus::Assigned | TaskStatus::Running)
        {
            match status {
                // 作業完了の報告だけでは task は完了にしない。Completed は complete 段階への遷移でのみ付く
                AssignmentStatus::Completed => task.updated_at = now,
                _ => {
                    let reason = reason.unwrap_or_else(|| "assignment failed".to_string());
                    if task.attempts >= max_attempts {
                        task.mark_failed(
                            format!("{reason} (attempts exhausted: {}/{max_attempts})", task.attempts),
                            now,
                        );
                    } else {
                        task.last_error = Some(reason);
                        task.reset_to_pending(now);
                    }
                }
            }
        }

        self.free_worker(worker_id, task_id);
        1
    }

    fn counts(&self) -> FleetCounts {
        let mut counts = FleetCounts::default();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Assigned => counts.assigned += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        for worker in self.workers.values() {
            match worker.status {
                WorkerStatus::Idle => counts.workers_idle += 1,
                WorkerStatus::Busy => counts.workers_busy += 1,
                WorkerStatus::Offline => counts.workers_offline += 1,
            }
        }
        counts
    }
}

/// In-memory FleetStore implementation.
#[derive(Clone, Default)]
pub struct InMemoryFleetStore {
    state: Arc<Mutex<InMemoryStoreState>>,
}

impl InMemoryFleetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FleetStore for InMemoryFleetStore {
    async fn insert_task(&self, task: Task) -> FleetResult<()> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(FleetError::Store(format!("duplicate task id {}", task.id)));
        }
        state.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> FleetResult<Option<Task>> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&task_id).cloned())
    }

    async fn fetch_pending(&self, limit: usize) -> FleetResult<Vec<Task>> {
        let state = self.state.lock().await;
        let mut pending: Vec<&Task> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && state.prerequisites_met(t))
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(pending.into_iter().take(limit).cloned().collect())
    }

    async fn mark_task_failed(
        &self,
        task_id: TaskId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> FleetResult<u64> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(0);
        };
        if task.status.is_terminal() {
            return Ok(0);
        }
        let worker = task.assigned_worker;
        task.mark_failed(reason, now);

        // 宙に浮いた assignment を残さない
        let open: Vec<AssignmentId> = state
            .assignments
            .values()
            .filter(|a| a.task_id == task_id && a.status.is_active())
            .map(|a| a.id)
            .collect();
        for id in open {
            if let Some(a) = state.assignments.get_mut(&id) {
                a.finish(AssignmentStatus::Failed, Some(reason.to_string()), now);
            }
        }
        if let Some(worker_id) = worker {
            state.free_worker(worker_id, task_id);
        }
        Ok(1)
    }

    async fn apply_stage_transition(&self, entry: TransitionLogEntry) -> FleetResult<u64> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&entry.task_id) else {
            return Err(FleetError::TaskNotFound(entry.task_id));
        };
        if task.stage != entry.from_stage {
            return Ok(0);
        }
        task.stage = entry.to_stage;
        if entry.evidence.is_some() {
            task.evidence = entry.evidence.clone();
        }
        let completed = entry.to_stage == Stage::Complete;
        if completed {
            task.status = TaskStatus::Completed;
        }
        task.updated_at = entry.at;
        let (task_id, at) = (entry.task_id, entry.at);
        state.transitions.push(entry);

        // 検証済みの完了。まだ開いている assignment は成功として閉じる
        if completed {
            let open: Vec<(AssignmentId, WorkerId)> = state
                .assignments
                .values()
                .filter(|a| a.task_id == task_id && a.status.is_active())
                .map(|a| (a.id, a.worker_id))
                .collect();
            for (id, worker_id) in open {
                if let Some(a) = state.assignments.get_mut(&id) {
                    a.finish(AssignmentStatus::Completed, None, at);
                }
                state.free_worker(worker_id, task_id);
            }
        }
        Ok(1)
    }

    async fn set_endpoint_verified(
        &self,
        task_id: TaskId,
        verified: bool,
        now: DateTime<Utc>,
    ) -> FleetResult<u64> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(0);
        };
        task.endpoint_verified = verified;
        task.updated_at = now;
        Ok(1)
    }

    async fn transition_log(&self, task_id: TaskId) -> FleetResult<Vec<TransitionLogEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .transitions
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn insert_worker(&self, worker: Worker) -> FleetResult<()> {
        let mut state = self.state.lock().await;
        if state.workers.contains_key(&worker.id) {
            return Err(FleetError::Store(format!("duplicate worker id {}", worker.id)));
        }
        state.workers.insert(worker.id, worker);
        Ok(())
    }

    async fn get_worker(&self, worker_id: WorkerId) -> FleetResult<Option<Worker>> {
        let state = self.state.lock().await;
        Ok(state.workers.get(&worker_id).cloned())
    }

    async fn list_workers(&self) -> FleetResult<Vec<Worker>> {
        let state = self.state.lock().await;
        let mut workers: Vec<Worker> = state.workers.values().cloned().collect();
        workers.sort_by_key(|w| w.id);
        Ok(workers)
    }

    async fn touch_worker(&self, worker_id: WorkerId, at: DateTime<Utc>) -> FleetResult<u64> {
        let mut state = self.state.lock().await;
        let active = state.active_count(worker_id);
        let Some(worker) = state.workers.get_mut(&worker_id) else {
            return Ok(0);
        };
        worker.last_heartbeat = Some(at);
        if worker.status == WorkerStatus::Offline {
            worker.status = if active > 0 {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Idle
            };
        }
        Ok(1)
    }

    async fn mark_stale_workers_offline(&self, cutoff: DateTime<Utc>) -> FleetResult<Vec<WorkerId>> {
        let mut state = self.state.lock().await;
        let mut marked = Vec::new();
        for worker in state.workers.values_mut() {
            let stale = worker.last_heartbeat.is_none_or(|hb| hb < cutoff);
            if worker.status.is_online() && stale {
                worker.status = WorkerStatus::Offline;
                marked.push(worker.id);
            }
        }
        marked.sort();
        Ok(marked)
    }

    async fn worker_stats(
        &self,
        worker_id: WorkerId,
        since: DateTime<Utc>,
    ) -> FleetResult<WorkerStats> {
        let state = self.state.lock().await;
        let mut stats = WorkerStats::default();
        for a in state.assignments.values().filter(|a| a.worker_id == worker_id) {
            if a.status.is_active() {
                stats.active += 1;
                continue;
            }
            if a.completed_at.is_some_and(|at| at >= since) {
                match a.status {
                    AssignmentStatus::Completed => stats.completed += 1,
                    AssignmentStatus::Failed => stats.failed += 1,
                    _ => {}
                }
            }
        }
        Ok(stats)
    }

    async fn insert_assignment(&self, assignment: TaskAssignment) -> FleetResult<()> {
        let mut state = self.state.lock().await;
        if state.assignments.contains_key(&assignment.id) {
            return Err(FleetError::Store(format!(
                "duplicate assignment id {}",
                assignment.id
            )));
        }
        state.assignments.insert(assignment.id, assignment);
        Ok(())
    }

    async fn get_assignment(
        &self,
        assignment_id: AssignmentId,
    ) -> FleetResult<Option<TaskAssignment>> {
        let state = self.state.lock().await;
        Ok(state.assignments.get(&assignment_id).cloned())
    }

    async fn active_assignments_for(&self, worker_id: WorkerId) -> FleetResult<Vec<TaskAssignment>> {
        let state = self.state.lock().await;
        let mut active: Vec<TaskAssignment> = state
            .assignments
            .values()
            .filter(|a| a.worker_id == worker_id && a.status.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|a| a.id);
        Ok(active)
    }

    async fn claim_task(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> FleetResult<u64> {
        let mut state = self.state.lock().await;

        match state.workers.get(&worker_id) {
            None => return Err(FleetError::WorkerNotFound(worker_id)),
            Some(worker) if !worker.status.is_online() => return Ok(0),
            Some(_) => {}
        }

        // UPDATE tasks SET status = 'assigned' ... WHERE id = ? AND status = 'pending'
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Err(FleetError::TaskNotFound(task_id));
        };
        if task.status != TaskStatus::Pending {
            return Ok(0);
        }
        let retry_count = task.attempts;
        task.status = TaskStatus::Assigned;
        task.assigned_worker = Some(worker_id);
        task.attempts += 1;
        task.updated_at = now;

        state.assignments.insert(
            assignment_id,
            TaskAssignment::new(assignment_id, task_id, worker_id, retry_count, now),
        );

        if let Some(worker) = state.workers.get_mut(&worker_id) {
            worker.status = WorkerStatus::Busy;
            worker.current_task = Some(task_id);
        }
        Ok(1)
    }

    async fn fetch_stuck(
        &self,
        now: DateTime<Utc>,
        assigned_timeout: Duration,
        running_timeout: Duration,
    ) -> FleetResult<Vec<TaskAssignment>> {
        let state = self.state.lock().await;
        let mut stuck: Vec<TaskAssignment> = state
            .assignments
            .values()
            .filter(|a| a.stuck_reason(now, assigned_timeout, running_timeout).is_some())
            .cloned()
            .collect();
        stuck.sort_by_key(|a| a.assigned_at);
        Ok(stuck)
    }

    async fn start_assignment(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> FleetResult<u64> {
        let mut state = self.state.lock().await;
        let Some(assignment) = state.assignments.get_mut(&assignment_id) else {
            return Err(FleetError::AssignmentNotFound(assignment_id));
        };
        if assignment.status != AssignmentStatus::Assigned {
            return Ok(0);
        }
        assignment.status = AssignmentStatus::Running;
        assignment.started_at = Some(now);
        assignment.last_progress_at = Some(now);
        let task_id = assignment.task_id;
        let worker_id = assignment.worker_id;

        if let Some(task) = state.tasks.get_mut(&task_id)
            && task.assigned_worker == Some(worker_id)
            && task.status == TaskStatus::Assigned
        {
            task.status = TaskStatus::Running;
            task.updated_at = now;
        }
        Ok(1)
    }

    async fn record_progress(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> FleetResult<u64> {
        let mut state = self.state.lock().await;
        let Some(assignment) = state.assignments.get_mut(&assignment_id) else {
            return Err(FleetError::AssignmentNotFound(assignment_id));
        };
        if assignment.status != AssignmentStatus::Running {
            return Ok(0);
        }
        assignment.last_progress_at = Some(now);
        Ok(1)
    }

    async fn finish_assignment(
        &self,
        assignment_id: AssignmentId,
        outcome: &AssignmentOutcome,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> FleetResult<u64> {
        let mut state = self.state.lock().await;
        if !state.assignments.contains_key(&assignment_id) {
            return Err(FleetError::AssignmentNotFound(assignment_id));
        }
        let (status, reason) = match outcome {
            AssignmentOutcome::Succeeded => (AssignmentStatus::Completed, None),
            AssignmentOutcome::Failed(reason) => (AssignmentStatus::Failed, Some(reason.clone())),
        };
        Ok(state.close_assignment(assignment_id, status, reason, max_attempts, now))
    }

    async fn release_assignment(
        &self,
        assignment_id: AssignmentId,
        reason: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> FleetResult<u64> {
        let mut state = self.state.lock().await;
        Ok(state.close_assignment(
            assignment_id,
            AssignmentStatus::Failed,
            Some(reason.to_string()),
            max_attempts,
            now,
        ))
    }

    async fn put_lease(&self, lease: LivenessRecord) -> FleetResult<()> {
        let mut state = self.state.lock().await;
        state.leases.insert(lease.key.clone(), lease);
        Ok(())
    }

    async fn put_lease_if_absent(&self, lease: LivenessRecord) -> FleetResult<u64> {
        let mut state = self.state.lock().await;
        let now = lease.written_at;
        if state
            .leases
            .get(&lease.key)
            .is_some_and(|existing| !existing.is_expired(now))
        {
            return Ok(0);
        }
        state.leases.insert(lease.key.clone(), lease);
        Ok(1)
    }

    async fn renew_lease(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> FleetResult<u64> {
        let mut state = self.state.lock().await;
        match state.leases.get_mut(key) {
            Some(lease) if lease.holder == holder && !lease.is_expired(now) => {
                lease.written_at = now;
                lease.expires_at = expires_at;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn get_lease(&self, key: &str) -> FleetResult<Option<LivenessRecord>> {
        let state = self.state.lock().await;
        Ok(state.leases.get(key).cloned())
    }

    async fn delete_lease(&self, key: &str, holder: &str) -> FleetResult<u64> {
        let mut state = self.state.lock().await;
        if state.leases.get(key).is_some_and(|l| l.holder == holder) {
            state.leases.remove(key);
            return Ok(1);
        }
        Ok(0)
    }

    async fn save_loop_status(&self, status: &LoopStatus) -> FleetResult<()> {
        let mut state = self.state.lock().await;
        state.loop_status = Some(status.clone());
        Ok(())
    }

    async fn load_loop_status(&self) -> FleetResult<Option<LoopStatus>> {
        let state = self.state.lock().await;
        Ok(state.loop_status.clone())
    }

    async fn counts(&self) -> FleetResult<FleetCounts> {
        let state = self.state.lock().await;
        Ok(state.counts())
    }
}
