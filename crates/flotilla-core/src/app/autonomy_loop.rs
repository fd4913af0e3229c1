//! AutonomyLoop - 割り当て・自己修復・掃除を一定周期で回す制御ループ
//!
//! # 1 イテレーション
//! 1. (require_leadership なら) リーダーキーを取る／延長する。取れなければ何もしない
//! 2. 前提を満たした pending タスクを最大 batch_size 件取り出し、Router に回す
//! 3. stuck な assignment を回収（assignment→failed / task→pending / worker→idle）
//! 4. ハートビートが途絶えた worker を offline にする
//! 5. テレメトリを LoopStatus に書く
//!
//! タスク単位の失敗はそのタスクを failed にして次へ進む。ループ自体は止まらない。
//!
//! # start / stop
//! - `start()` は 2 回目以降 false を返すだけ
//! - `stop()` は停止を通知し、実行中のイテレーションを最大 stop_grace だけ待つ。
//!   待ちきれなくても停止済みとして扱う（実行中の処理を強制終了はしない）

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::heartbeat::HeartbeatRegistry;
use super::router::TaskRouter;
use crate::config::AutonomyConfig;
use crate::domain::{FleetError, FleetResult, TaskAssignment, TaskId};
use crate::observability::LoopStatus;
use crate::ports::{Clock, FleetStore};
use crate::resilience::Resilience;

const DATABASE: &str = "database";

/// 1 イテレーション分の結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IterationReport {
    /// リーダーでなかったため何もしなかった
    pub skipped: bool,
    pub tasks_processed: usize,
    pub tasks_assigned: usize,
    pub tasks_failed: usize,
    pub stuck_released: usize,
    pub workers_marked_offline: usize,
    pub duration_ms: u64,
    pub last_error: Option<String>,
}

struct LoopInner {
    store: Arc<dyn FleetStore>,
    clock: Arc<dyn Clock>,
    router: Arc<TaskRouter>,
    heartbeat: Arc<HeartbeatRegistry>,
    resilience: Arc<Resilience>,
    config: AutonomyConfig,
    status: Mutex<LoopStatus>,
}

struct LoopHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct AutonomyLoop {
    inner: Arc<LoopInner>,
    handle: tokio::sync::Mutex<Option<LoopHandle>>,
}

impl AutonomyLoop {
    pub fn new(
        store: Arc<dyn FleetStore>,
        clock: Arc<dyn Clock>,
        router: Arc<TaskRouter>,
        heartbeat: Arc<HeartbeatRegistry>,
        resilience: Arc<Resilience>,
        config: AutonomyConfig,
    ) -> Self {
        Self {
            inner: Arc::new(LoopInner {
                store,
                clock,
                router,
                heartbeat,
                resilience,
                config,
                status: Mutex::new(LoopStatus::default()),
            }),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AutonomyConfig {
        &self.inner.config
    }

    /// バックグラウンドでループを開始する。すでに動いていれば false。
    pub async fn start(&self) -> bool {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.join.is_finished()) {
            return false;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        inner.status().running = true;

        let join = tokio::spawn(async move {
            let interval = inner.config.interval();
            tracing::info!(interval_secs = interval.as_secs(), "autonomy loop started");
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                inner.run_iteration().await;

                tokio::select! {
                    changed = stop_rx.changed() => {
                        // sender が消えた場合も止める
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            if inner.config.require_leadership {
                inner.heartbeat.release_leadership().await;
            }
            tracing::info!("autonomy loop exited");
        });

        *handle = Some(LoopHandle { stop_tx, join });
        true
    }

    /// 停止を通知して stop_grace まで待つ。何度呼んでもよい。
    pub async fn stop(&self) {
        let taken = self.handle.lock().await.take();
        if let Some(LoopHandle { stop_tx, mut join }) = taken {
            // receiver が先に落ちていても構わない
            let _ = stop_tx.send(true);
            let grace = self.inner.config.stop_grace();
            if tokio::time::timeout(grace, &mut join).await.is_err() {
                tracing::warn!(
                    grace_secs = grace.as_secs(),
                    "autonomy loop did not finish within grace period; detaching"
                );
            }
        }

        let snapshot = {
            let mut status = self.inner.status();
            status.running = false;
            status.is_leader = false;
            status.clone()
        };
        if let Err(e) = self.inner.store.save_loop_status(&snapshot).await {
            tracing::warn!(error = %e, "failed to persist loop status on stop");
        }
    }

    pub fn status(&self) -> LoopStatus {
        self.inner.status().clone()
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.join.is_finished())
    }

    /// 1 イテレーションだけ同期的に回す（CLI の `--iterations` とテスト用）
    pub async fn run_once(&self) -> IterationReport {
        self.inner.run_iteration().await
    }
}

impl LoopInner {
    fn status(&self) -> MutexGuard<'_, LoopStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run_iteration(&self) -> IterationReport {
        let started = Instant::now();
        let now = self.clock.now();
        let mut report = IterationReport::default();

        let is_leader = if self.config.require_leadership {
            self.heartbeat.claim_leadership().await
        } else {
            true
        };

        if is_leader {
            self.assign_pending(&mut report).await;
            self.release_stuck(now, &mut report).await;
            self.sweep_workers(now, &mut report).await;
        } else {
            tracing::debug!(
                instance = self.heartbeat.instance_id(),
                "not the leader; skipping iteration"
            );
            report.skipped = true;
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.record(now, is_leader, &report).await;

        if !report.skipped {
            tracing::info!(
                processed = report.tasks_processed,
                assigned = report.tasks_assigned,
                failed = report.tasks_failed,
                stuck_released = report.stuck_released,
                workers_offline = report.workers_marked_offline,
                duration_ms = report.duration_ms,
                "autonomy iteration finished"
            );
        }
        report
    }

    async fn assign_pending(&self, report: &mut IterationReport) {
        let batch_size = self.config.batch_size;
        let store = &self.store;
        let pending = match self
            .resilience
            .call(DATABASE, "fetch_pending", || store.fetch_pending(batch_size))
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "fetch_pending failed");
                report.last_error = Some(e.to_string());
                return;
            }
        };

        for task in pending {
            report.tasks_processed += 1;
            match self.router.route(&task).await {
                Ok(true) => report.tasks_assigned += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "routing failed; marking task failed");
                    self.fail_task(task.id, &e).await;
                    report.tasks_failed += 1;
                    report.last_error = Some(format!("task {}: {e}", task.id));
                }
            }
        }
    }

    async fn fail_task(&self, task_id: TaskId, cause: &FleetError) {
        let reason = format!("routing error: {cause}");
        if let Err(e) = self
            .store
            .mark_task_failed(task_id, &reason, self.clock.now())
            .await
        {
            tracing::error!(task_id = %task_id, error = %e, "failed to mark task failed");
        }
    }

    async fn release_stuck(&self, now: DateTime<Utc>, report: &mut IterationReport) {
        let assigned_timeout = self.config.assigned_timeout();
        let running_timeout = self.config.running_timeout();
        let store = &self.store;
        let stuck = match self
            .resilience
            .call(DATABASE, "fetch_stuck", || {
                store.fetch_stuck(now, assigned_timeout, running_timeout)
            })
            .await
        {
            Ok(stuck) => stuck,
            Err(e) => {
                tracing::error!(error = %e, "fetch_stuck failed");
                report.last_error = Some(e.to_string());
                return;
            }
        };

        for assignment in stuck {
            match self.release(&assignment, now).await {
                Ok(true) => report.stuck_released += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(assignment_id = %assignment.id, error = %e, "stuck release failed");
                    report.last_error = Some(format!("assignment {}: {e}", assignment.id));
                }
            }
        }
    }

    async fn release(
        &self,
        assignment: &TaskAssignment,
        now: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let reason = assignment
            .stuck_reason(
                now,
                self.config.assigned_timeout(),
                self.config.running_timeout(),
            )
            .map(|r| r.to_string())
            .unwrap_or_else(|| "stuck — no progress".to_string());

        let affected = self
            .store
            .release_assignment(assignment.id, &reason, self.config.max_task_attempts, now)
            .await?;
        if affected > 0 {
            tracing::warn!(
                assignment_id = %assignment.id,
                task_id = %assignment.task_id,
                worker_id = %assignment.worker_id,
                reason = %reason,
                "released stuck assignment"
            );
        }
        Ok(affected > 0)
    }

    async fn sweep_workers(&self, now: DateTime<Utc>, report: &mut IterationReport) {
        let cutoff = now - self.config.worker_offline_after();
        match self.store.mark_stale_workers_offline(cutoff).await {
            Ok(marked) => {
                for worker_id in &marked {
                    tracing::warn!(worker_id = %worker_id, "worker heartbeat lost; marked offline");
                }
                report.workers_marked_offline = marked.len();
            }
            Err(e) => {
                tracing::error!(error = %e, "worker sweep failed");
                report.last_error = Some(e.to_string());
            }
        }
    }

    async fn record(&self, now: DateTime<Utc>, is_leader: bool, report: &IterationReport) {
        let snapshot = {
            let mut status = self.status();
            status.is_leader = is_leader;
            status.iterations += 1;
            status.last_run_at = Some(now);
            status.tasks_processed = report.tasks_processed;
            status.tasks_assigned = report.tasks_assigned;
            status.stuck_released = report.stuck_released;
            status.workers_marked_offline = report.workers_marked_offline;
            status.last_duration_ms = report.duration_ms;
            status.total_assigned += report.tasks_assigned as u64;
            status.total_stuck_released += report.stuck_released as u64;
            if report.last_error.is_some() {
                status.last_error = report.last_error.clone();
            }
            status.clone()
        };
        if let Err(e) = self.store.save_loop_status(&snapshot).await {
            tracing::warn!(error = %e, "failed to persist loop status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, HeartbeatConfig, RoutingConfig};
    use crate::domain::{
        CapabilitySet, Task, TaskId, TaskSpec, TaskStatus, Worker, WorkerId, WorkerStatus,
    };
    use crate::impls::{InMemoryFleetStore, InMemoryLivenessStore};
    use crate::observability::TracingRetryObserver;
    use crate::ports::{FixedClock, LivenessStore, UlidGenerator};
    use crate::resilience::{CircuitBreaker, RetryProfiles};
    use chrono::{Duration, TimeZone};

    struct Fixture {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryFleetStore>,
        liveness: Arc<InMemoryLivenessStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(FixedClock::new(
                Utc.with_ymd_and_hms(2026, 7, 1, 8, 0, 0).unwrap(),
            ));
            Self {
                liveness: Arc::new(InMemoryLivenessStore::new(clock.clone())),
                store: Arc::new(InMemoryFleetStore::new()),
                clock,
            }
        }

        fn autonomy(&self, instance: &str, config: AutonomyConfig) -> AutonomyLoop {
            let liveness: Arc<dyn LivenessStore> = self.liveness.clone();
            let heartbeat = Arc::new(HeartbeatRegistry::new(
                liveness,
                self.store.clone(),
                self.clock.clone(),
                HeartbeatConfig::default(),
                instance,
            ));
            let router = Arc::new(TaskRouter::new(
                self.store.clone(),
                self.clock.clone(),
                Arc::new(UlidGenerator::new(self.clock.clone())),
                RoutingConfig::default(),
            ));
            let breaker = Arc::new(CircuitBreaker::new(
                CircuitBreakerConfig::default(),
                self.clock.clone(),
            ));
            let resilience = Arc::new(Resilience::new(
                breaker,
                RetryProfiles::default(),
                Arc::new(TracingRetryObserver),
            ));
            AutonomyLoop::new(
                self.store.clone(),
                self.clock.clone(),
                router,
                heartbeat,
                resilience,
                config,
            )
        }

        async fn worker(&self, caps: &[&str]) -> WorkerId {
            let caps: CapabilitySet = caps.iter().copied().collect();
            let worker = Worker::new(WorkerId::generate(), "w", caps, self.clock.now());
            let id = worker.id;
            self.store.insert_worker(worker).await.unwrap();
            id
        }

        async fn task(&self, spec: TaskSpec) -> TaskId {
            let task = Task::new(TaskId::generate(), spec, self.clock.now());
            let id = task.id;
            self.store.insert_task(task).await.unwrap();
            id
        }
    }

    #[tokio::test]
    async fn iteration_assigns_pending_tasks() {
        let fx = Fixture::new();
        let autonomy = fx.autonomy("a", AutonomyConfig::default());
        fx.worker(&["testing"]).await;
        let runnable = fx.task(TaskSpec::new("test_run")).await;
        let unroutable = fx.task(TaskSpec::new("deployment")).await;

        let report = autonomy.run_once().await;
        assert!(!report.skipped);
        assert_eq!(report.tasks_processed, 2);
        assert_eq!(report.tasks_assigned, 1);

        let status = |id| {
            let store = fx.store.clone();
            async move { store.get_task(id).await.unwrap().unwrap().status }
        };
        assert_eq!(status(runnable).await, TaskStatus::Assigned);
        assert_eq!(status(unroutable).await, TaskStatus::Pending);

        let persisted = fx.store.load_loop_status().await.unwrap().unwrap();
        assert_eq!(persisted.iterations, 1);
        assert_eq!(persisted.tasks_assigned, 1);
        assert!(persisted.is_leader);
    }

    #[tokio::test]
    async fn prerequisites_gate_routing() {
        let fx = Fixture::new();
        let autonomy = fx.autonomy("a", AutonomyConfig::default());
        fx.worker(&[]).await;
        let first = fx.task(TaskSpec::new("haiku")).await;
        let second = fx.task(TaskSpec::new("haiku").after(first)).await;

        let report = autonomy.run_once().await;
        assert_eq!(report.tasks_processed, 1);
        let second_task = fx.store.get_task(second).await.unwrap().unwrap();
        assert_eq!(second_task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn stuck_assignment_is_released_within_one_iteration() {
        let fx = Fixture::new();
        let autonomy = fx.autonomy("a", AutonomyConfig::default());
        let worker_id = fx.worker(&[]).await;
        let task_id = fx.task(TaskSpec::new("haiku")).await;
        assert_eq!(autonomy.run_once().await.tasks_assigned, 1);

        // worker は生きているが手を付けない
        fx.clock.advance(Duration::minutes(15));
        fx.store.touch_worker(worker_id, fx.clock.now()).await.unwrap();

        let report = autonomy.run_once().await;
        assert_eq!(report.stuck_released, 1);

        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.last_error.unwrap().starts_with("stuck — no progress"));
        let worker = fx.store.get_worker(worker_id).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert_eq!(worker.current_task, None);
    }

    #[tokio::test]
    async fn silent_workers_go_offline() {
        let fx = Fixture::new();
        let autonomy = fx.autonomy("a", AutonomyConfig::default());
        let worker_id = fx.worker(&[]).await;

        fx.clock.advance(Duration::minutes(4));
        assert_eq!(autonomy.run_once().await.workers_marked_offline, 0);
        fx.clock.advance(Duration::minutes(2));
        assert_eq!(autonomy.run_once().await.workers_marked_offline, 1);

        let worker = fx.store.get_worker(worker_id).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Offline);
    }

    #[tokio::test]
    async fn non_leader_skips_iteration() {
        let fx = Fixture::new();
        let first = fx.autonomy("watchdog-a", AutonomyConfig::default());
        let second = fx.autonomy("watchdog-b", AutonomyConfig::default());
        fx.worker(&[]).await;
        fx.task(TaskSpec::new("haiku")).await;

        assert_eq!(first.run_once().await.tasks_assigned, 1);
        fx.task(TaskSpec::new("haiku")).await;
        let report = second.run_once().await;
        assert!(report.skipped);
        assert_eq!(report.tasks_processed, 0);
        assert!(!second.status().is_leader);
        assert!(first.status().is_leader);
    }

    #[tokio::test]
    async fn attempts_are_capped() {
        let fx = Fixture::new();
        let mut config = AutonomyConfig::default();
        config.max_task_attempts = 2;
        let autonomy = fx.autonomy("a", config);
        let worker_id = fx.worker(&[]).await;
        let task_id = fx.task(TaskSpec::new("haiku")).await;

        // assign → release → assign → release（上限）
        for _ in 0..3 {
            autonomy.run_once().await;
            fx.clock.advance(Duration::minutes(11));
            fx.store.touch_worker(worker_id, fx.clock.now()).await.unwrap();
        }
        autonomy.run_once().await;

        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 2);
        assert!(task.last_error.unwrap().contains("attempts exhausted"));
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let fx = Fixture::new();
        let autonomy = fx.autonomy("a", AutonomyConfig::default());

        assert!(autonomy.start().await);
        assert!(!autonomy.start().await);
        assert!(autonomy.status().running);

        // interval 30s を 2 回分進める
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        assert!(autonomy.status().iterations >= 2);

        autonomy.stop().await;
        autonomy.stop().await;
        assert!(!autonomy.is_running().await);
        let status = autonomy.status();
        assert!(!status.running);
        let persisted = fx.store.load_loop_status().await.unwrap().unwrap();
        assert!(!persisted.running);

        // 停止後はリーダーキーが解放されている
        let other = fx.autonomy("b", AutonomyConfig::default());
        assert!(!other.run_once().await.skipped);
    }
}
