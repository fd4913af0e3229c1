//! FleetBuilder - コントロールプレーンの構築とワイヤリング
//!
//! # 学習ポイント
//! - 状態を持つコンポーネント（breaker, heartbeat, router, loop）は 1 つの `Fleet` が所有する
//! - 起動時検証（Fail-fast 設計）: 設定の矛盾は build() で弾く
//! - liveness の実装は設定で構築時に選ぶ

use std::sync::Arc;

use crate::app::autonomy_loop::AutonomyLoop;
use crate::app::heartbeat::HeartbeatRegistry;
use crate::app::router::TaskRouter;
use crate::app::stage_validator::StageValidator;
use crate::config::{FleetConfig, LivenessBackend};
use crate::domain::{
    AssignmentId, AssignmentOutcome, CapabilitySet, FleetError, FleetResult, StageRules, Task,
    TaskId, TaskSpec, Worker, WorkerId,
};
use crate::impls::{
    DbLivenessStore, FailoverLivenessStore, InMemoryFleetStore, InMemoryLivenessStore,
};
use crate::observability::{FleetCounts, RetryObserver, TracingRetryObserver};
use crate::ports::{Clock, FleetStore, IdGenerator, LivenessStore, SystemClock, UlidGenerator};
use crate::resilience::{CircuitBreaker, Resilience};

/// FleetBuilder は Fleet を構築
///
/// # 使用例
/// ```ignore
/// let fleet = FleetBuilder::new(FleetConfig::load("fleet.toml")?)
///     .instance_id("watchdog-1")
///     .build()?;
/// fleet.autonomy().start().await;
/// ```
///
/// 差し替えなかった部品は既定実装（SystemClock, InMemoryFleetStore,
/// 設定どおりの LivenessStore, TracingRetryObserver）を使う。
pub struct FleetBuilder {
    config: FleetConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn FleetStore>>,
    liveness: Option<Arc<dyn LivenessStore>>,
    ids: Option<Arc<dyn IdGenerator>>,
    retry_observer: Option<Arc<dyn RetryObserver>>,
    stage_rules: StageRules,
    instance_id: Option<String>,
}

/// BuildError は構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[source] FleetError),
}

impl FleetBuilder {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            liveness: None,
            ids: None,
            retry_observer: None,
            stage_rules: StageRules::standard(),
            instance_id: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn store(mut self, store: Arc<dyn FleetStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 設定の `[liveness] backend` より優先される
    pub fn liveness(mut self, liveness: Arc<dyn LivenessStore>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn retry_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.retry_observer = Some(observer);
        self
    }

    pub fn stage_rules(mut self, rules: StageRules) -> Self {
        self.stage_rules = rules;
        self
    }

    /// リーダーキーの holder 名。省略時はランダム。
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn build(self) -> Result<Fleet, BuildError> {
        self.config.validate().map_err(BuildError::InvalidConfig)?;
        let config = self.config;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store: Arc<dyn FleetStore> = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryFleetStore::new()));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let liveness = match self.liveness {
            Some(liveness) => liveness,
            None => liveness_for(config.liveness.backend, &store, &clock),
        };
        let observer = self
            .retry_observer
            .unwrap_or_else(|| Arc::new(TracingRetryObserver));
        let instance_id = self
            .instance_id
            .unwrap_or_else(|| format!("flotilla-{}", ulid::Ulid::new()));

        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.clone(),
            clock.clone(),
        ));
        let resilience = Arc::new(Resilience::new(
            breaker.clone(),
            config.retry_profiles(),
            observer,
        ));
        let heartbeat = Arc::new(HeartbeatRegistry::new(
            liveness.clone(),
            store.clone(),
            clock.clone(),
            config.heartbeat.clone(),
            instance_id,
        ));
        let validator = Arc::new(StageValidator::new(
            store.clone(),
            clock.clone(),
            self.stage_rules,
        ));
        let router = Arc::new(TaskRouter::new(
            store.clone(),
            clock.clone(),
            ids.clone(),
            config.routing.clone(),
        ));
        let autonomy = Arc::new(AutonomyLoop::new(
            store.clone(),
            clock.clone(),
            router.clone(),
            heartbeat.clone(),
            resilience.clone(),
            config.autonomy.clone(),
        ));

        tracing::info!(
            instance = heartbeat.instance_id(),
            liveness = liveness.backend(),
            "fleet built"
        );

        Ok(Fleet {
            config,
            clock,
            ids,
            store,
            liveness,
            breaker,
            resilience,
            heartbeat,
            validator,
            router,
            autonomy,
        })
    }
}

fn liveness_for(
    backend: LivenessBackend,
    store: &Arc<dyn FleetStore>,
    clock: &Arc<dyn Clock>,
) -> Arc<dyn LivenessStore> {
    match backend {
        LivenessBackend::Memory => Arc::new(InMemoryLivenessStore::new(clock.clone())),
        LivenessBackend::Database => Arc::new(DbLivenessStore::new(store.clone(), clock.clone())),
        LivenessBackend::MemoryWithFallback => Arc::new(FailoverLivenessStore::new(
            Arc::new(InMemoryLivenessStore::new(clock.clone())),
            Arc::new(DbLivenessStore::new(store.clone(), clock.clone())),
        )),
    }
}

/// Fleet はコントロールプレーン全体のコンテキスト
///
/// 呼び出し側はこれを参照で回し、グローバルな状態は持たない。
pub struct Fleet {
    config: FleetConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    store: Arc<dyn FleetStore>,
    liveness: Arc<dyn LivenessStore>,
    breaker: Arc<CircuitBreaker>,
    resilience: Arc<Resilience>,
    heartbeat: Arc<HeartbeatRegistry>,
    validator: Arc<StageValidator>,
    router: Arc<TaskRouter>,
    autonomy: Arc<AutonomyLoop>,
}

impl Fleet {
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn FleetStore> {
        &self.store
    }

    pub fn liveness(&self) -> &Arc<dyn LivenessStore> {
        &self.liveness
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn resilience(&self) -> &Arc<Resilience> {
        &self.resilience
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatRegistry> {
        &self.heartbeat
    }

    pub fn validator(&self) -> &Arc<StageValidator> {
        &self.validator
    }

    pub fn router(&self) -> &Arc<TaskRouter> {
        &self.router
    }

    pub fn autonomy(&self) -> &Arc<AutonomyLoop> {
        &self.autonomy
    }

    // ---- tasks / workers ----

    pub async fn submit_task(&self, spec: TaskSpec) -> FleetResult<TaskId> {
        let task = Task::new(self.ids.generate_task_id(), spec, self.clock.now());
        let task_id = task.id;
        tracing::info!(task_id = %task_id, task_type = %task.task_type, priority = task.priority, "task submitted");
        self.store.insert_task(task).await?;
        Ok(task_id)
    }

    pub async fn task(&self, task_id: TaskId) -> FleetResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(FleetError::TaskNotFound(task_id))
    }

    /// 登録と同時に最初のハートビートを打つ
    pub async fn register_worker(
        &self,
        name: &str,
        capabilities: CapabilitySet,
    ) -> FleetResult<WorkerId> {
        let worker = Worker::new(
            self.ids.generate_worker_id(),
            name,
            capabilities,
            self.clock.now(),
        );
        let worker_id = worker.id;
        self.store.insert_worker(worker).await?;
        self.heartbeat.send_heartbeat(&worker_id.to_string()).await;
        tracing::info!(worker_id = %worker_id, name, "worker registered");
        Ok(worker_id)
    }

    pub async fn worker(&self, worker_id: WorkerId) -> FleetResult<Worker> {
        self.store
            .get_worker(worker_id)
            .await?
            .ok_or(FleetError::WorkerNotFound(worker_id))
    }

    pub async fn worker_heartbeat(&self, worker_id: WorkerId) -> FleetResult<bool> {
        self.heartbeat.send_worker_heartbeat(worker_id).await
    }

    // ---- worker からの報告 ----

    /// assigned → running。すでに始まっていれば false。
    pub async fn report_started(&self, assignment_id: AssignmentId) -> FleetResult<bool> {
        let started = self
            .store
            .start_assignment(assignment_id, self.clock.now())
            .await?;
        Ok(started == 1)
    }

    pub async fn report_progress(&self, assignment_id: AssignmentId) -> FleetResult<bool> {
        let touched = self
            .store
            .record_progress(assignment_id, self.clock.now())
            .await?;
        Ok(touched == 1)
    }

    /// 完了報告。回収済み（stuck 扱いされた）assignment への報告は false。
    pub async fn report_finished(
        &self,
        assignment_id: AssignmentId,
        outcome: AssignmentOutcome,
    ) -> FleetResult<bool> {
        let affected = self
            .store
            .finish_assignment(
                assignment_id,
                &outcome,
                self.config.autonomy.max_task_attempts,
                self.clock.now(),
            )
            .await?;
        match &outcome {
            AssignmentOutcome::Succeeded => {
                tracing::info!(assignment_id = %assignment_id, "assignment completed")
            }
            AssignmentOutcome::Failed(reason) => {
                tracing::warn!(assignment_id = %assignment_id, reason = %reason, "assignment failed")
            }
        }
        Ok(affected == 1)
    }

    pub async fn counts(&self) -> FleetResult<FleetCounts> {
        self.store.counts().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskStatus, WorkerStatus};
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    fn fleet() -> Fleet {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap(),
        ));
        FleetBuilder::new(FleetConfig::default())
            .clock(clock)
            .instance_id("test")
            .build()
            .unwrap()
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut config = FleetConfig::default();
        config.autonomy.batch_size = 0;
        let err = FleetBuilder::new(config).build().err().unwrap();
        assert!(matches!(err, BuildError::InvalidConfig(FleetError::Config(_))));
    }

    #[test]
    fn liveness_backend_follows_config() {
        for (backend, name) in [
            (LivenessBackend::Memory, "memory"),
            (LivenessBackend::Database, "database"),
            (LivenessBackend::MemoryWithFallback, "failover"),
        ] {
            let mut config = FleetConfig::default();
            config.liveness.backend = backend;
            let fleet = FleetBuilder::new(config).build().unwrap();
            assert_eq!(fleet.liveness().backend(), name);
        }
    }

    #[tokio::test]
    async fn worker_reports_drive_the_assignment() {
        let fleet = fleet();
        let worker_id = fleet
            .register_worker("tester", ["testing"].into_iter().collect())
            .await
            .unwrap();
        let task_id = fleet.submit_task(TaskSpec::new("test_run")).await.unwrap();

        let task = fleet.task(task_id).await.unwrap();
        let outcome = fleet.router().assign(&task, worker_id).await.unwrap();
        let crate::domain::ClaimOutcome::Claimed(assignment_id) = outcome else {
            panic!("expected claim");
        };

        assert!(fleet.report_started(assignment_id).await.unwrap());
        assert!(!fleet.report_started(assignment_id).await.unwrap());
        assert!(fleet.report_progress(assignment_id).await.unwrap());
        assert_eq!(fleet.task(task_id).await.unwrap().status, TaskStatus::Running);

        assert!(
            fleet
                .report_finished(assignment_id, AssignmentOutcome::Succeeded)
                .await
                .unwrap()
        );
        // 完了扱いは complete 段階に進んだときだけ
        assert_eq!(fleet.task(task_id).await.unwrap().status, TaskStatus::Running);
        let worker = fleet.worker(worker_id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);

        let counts = fleet.counts().await.unwrap();
        assert_eq!(counts.completed, 0);
        assert_eq!(counts.workers_idle, 1);
    }

    #[tokio::test]
    async fn failed_report_requeues_task() {
        let fleet = fleet();
        let worker_id = fleet
            .register_worker("flaky", CapabilitySet::new())
            .await
            .unwrap();
        let task_id = fleet.submit_task(TaskSpec::new("haiku")).await.unwrap();
        let task = fleet.task(task_id).await.unwrap();
        let crate::domain::ClaimOutcome::Claimed(assignment_id) =
            fleet.router().assign(&task, worker_id).await.unwrap()
        else {
            panic!("expected claim");
        };

        assert!(
            fleet
                .report_finished(assignment_id, AssignmentOutcome::Failed("segfault".into()))
                .await
                .unwrap()
        );
        let task = fleet.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.last_error.as_deref(), Some("segfault"));

        // 2 回目の報告は何もしない
        assert!(
            !fleet
                .report_finished(assignment_id, AssignmentOutcome::Succeeded)
                .await
                .unwrap()
        );
    }
}
