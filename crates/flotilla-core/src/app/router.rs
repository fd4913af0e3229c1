//! TaskRouter - 能力・実績・負荷でタスクの担当 worker を決める
//!
//! score = success_rate × 100 − current_load × 10
//!
//! - success_rate: 直近ウィンドウ（既定 24h）の completed / (completed + failed)。実績なしは 0.5
//! - current_load: assigned / running の assignment 数
//! - 同点は last_heartbeat が新しい方、それも同じなら worker id の小さい方

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RoutingConfig;
use crate::domain::{
    CapabilityMap, CapabilitySet, ClaimOutcome, FleetResult, Task, Worker, WorkerId,
};
use crate::ports::{Clock, FleetStore, IdGenerator};

/// 1 候補分の採点結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerScore {
    pub worker_id: WorkerId,
    pub success_rate: f64,
    pub load: u32,
    pub score: f64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl WorkerScore {
    pub fn compute(worker: &Worker, success_rate: f64, load: u32) -> Self {
        Self {
            worker_id: worker.id,
            success_rate,
            load,
            score: success_rate * 100.0 - f64::from(load) * 10.0,
            last_heartbeat: worker.last_heartbeat,
        }
    }

    /// 良い順に並べるための比較
    fn better_first(a: &Self, b: &Self) -> Ordering {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.last_heartbeat.cmp(&a.last_heartbeat))
            .then_with(|| a.worker_id.cmp(&b.worker_id))
    }
}

pub struct TaskRouter {
    store: Arc<dyn FleetStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    capabilities: CapabilityMap,
    config: RoutingConfig,
}

impl TaskRouter {
    pub fn new(
        store: Arc<dyn FleetStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            capabilities: config.capability_map(),
            store,
            clock,
            ids,
            config,
        }
    }

    /// タスクが明示した能力、なければ task_type の対応表
    pub fn requirements(&self, task: &Task) -> CapabilitySet {
        if task.required_capabilities.is_empty() {
            self.capabilities.requirements(&task.task_type)
        } else {
            task.required_capabilities.clone()
        }
    }

    /// オンラインで、要求能力をすべて持つ worker
    pub async fn find_capable(&self, requirements: &CapabilitySet) -> FleetResult<Vec<Worker>> {
        let workers = self.store.list_workers().await?;
        Ok(workers
            .into_iter()
            .filter(|w| w.status.is_online() && w.capabilities.covers(requirements))
            .collect())
    }

    pub async fn score(&self, worker: &Worker) -> FleetResult<WorkerScore> {
        let since = self.clock.now() - self.config.success_window();
        let stats = self.store.worker_stats(worker.id, since).await?;
        Ok(WorkerScore::compute(
            worker,
            stats.success_rate(self.config.default_success_rate),
            stats.active,
        ))
    }

    /// 候補を良い順に並べる
    pub async fn rank(&self, candidates: &[Worker]) -> FleetResult<Vec<WorkerScore>> {
        let mut scores = Vec::with_capacity(candidates.len());
        for worker in candidates {
            scores.push(self.score(worker).await?);
        }
        scores.sort_by(WorkerScore::better_first);
        Ok(scores)
    }

    /// 条件付き claim。pending でなくなっていれば Conflict。
    pub async fn assign(&self, task: &Task, worker_id: WorkerId) -> FleetResult<ClaimOutcome> {
        let assignment_id = self.ids.generate_assignment_id();
        let affected = self
            .store
            .claim_task(task.id, worker_id, assignment_id, self.clock.now())
            .await?;
        if affected == 0 {
            tracing::debug!(task_id = %task.id, worker_id = %worker_id, "claim conflict");
            return Ok(ClaimOutcome::Conflict);
        }
        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            worker_id = %worker_id,
            assignment_id = %assignment_id,
            "task assigned"
        );
        Ok(ClaimOutcome::Claimed(assignment_id))
    }

    /// 最良の候補に割り当てる。候補なし・競合は false。
    pub async fn route(&self, task: &Task) -> FleetResult<bool> {
        let requirements = self.requirements(task);
        let candidates = self.find_capable(&requirements).await?;
        if candidates.is_empty() {
            tracing::debug!(
                task_id = %task.id,
                required = ?requirements.iter().collect::<Vec<_>>(),
                "no capable worker online"
            );
            return Ok(false);
        }

        let ranked = self.rank(&candidates).await?;
        let Some(best) = ranked.first() else {
            return Ok(false);
        };
        tracing::debug!(
            task_id = %task.id,
            worker_id = %best.worker_id,
            score = best.score,
            candidates = ranked.len(),
            "routing decision"
        );
        Ok(self.assign(task, best.worker_id).await?.is_claimed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AssignmentId, AssignmentStatus, TaskAssignment, TaskId, TaskSpec, TaskStatus, WorkerStatus,
    };
    use crate::impls::InMemoryFleetStore;
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{Duration, TimeZone};

    struct Fixture {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryFleetStore>,
        router: TaskRouter,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(FixedClock::new(
                Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap(),
            ));
            let store = Arc::new(InMemoryFleetStore::new());
            let router = TaskRouter::new(
                store.clone(),
                clock.clone(),
                Arc::new(UlidGenerator::new(clock.clone())),
                RoutingConfig::default(),
            );
            Self { clock, store, router }
        }

        async fn worker(&self, name: &str, caps: &[&str]) -> Worker {
            let worker = Worker::new(
                WorkerId::generate(),
                name,
                caps.iter().copied().collect(),
                self.clock.now(),
            );
            self.store.insert_worker(worker.clone()).await.unwrap();
            worker
        }

        async fn task(&self, spec: TaskSpec) -> Task {
            let task = Task::new(TaskId::generate(), spec, self.clock.now());
            self.store.insert_task(task.clone()).await.unwrap();
            task
        }

        /// 過去の実績を assignment として積む
        async fn history(&self, worker: &Worker, completed: u32, failed: u32) {
            let outcomes = std::iter::repeat_n(AssignmentStatus::Completed, completed as usize)
                .chain(std::iter::repeat_n(AssignmentStatus::Failed, failed as usize));
            for status in outcomes {
                let mut a = TaskAssignment::new(
                    AssignmentId::generate(),
                    TaskId::generate(),
                    worker.id,
                    0,
                    self.clock.now() - Duration::hours(2),
                );
                a.finish(status, None, self.clock.now() - Duration::hours(1));
                self.store.insert_assignment(a).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn requirements_come_from_task_type_or_explicit_set() {
        let fx = Fixture::new();
        let by_type = fx.task(TaskSpec::new("code_fix")).await;
        let explicit = fx
            .task(TaskSpec::new("code_fix").with_capabilities(["gpu"]))
            .await;
        let unknown = fx.task(TaskSpec::new("haiku")).await;

        let caps = fx.router.requirements(&by_type);
        assert!(caps.contains("code_analysis") && caps.contains("debugging"));
        assert_eq!(fx.router.requirements(&explicit).len(), 1);
        assert!(fx.router.requirements(&unknown).is_empty());
    }

    #[tokio::test]
    async fn find_capable_requires_superset_and_online() {
        let fx = Fixture::new();
        let partial = fx.worker("partial", &["code_analysis"]).await;
        let full = fx.worker("full", &["code_analysis", "debugging", "testing"]).await;
        let offline = fx.worker("offline", &["code_analysis", "debugging"]).await;
        fx.store
            .mark_stale_workers_offline(fx.clock.now() + Duration::seconds(1))
            .await
            .unwrap();
        fx.store.touch_worker(partial.id, fx.clock.now()).await.unwrap();
        fx.store.touch_worker(full.id, fx.clock.now()).await.unwrap();

        let required: CapabilitySet = ["code_analysis", "debugging"].into_iter().collect();
        let capable = fx.router.find_capable(&required).await.unwrap();
        let ids: Vec<WorkerId> = capable.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![full.id]);
        assert!(!ids.contains(&offline.id));

        // 要求が空ならオンラインの全員
        let anyone = fx.router.find_capable(&CapabilitySet::new()).await.unwrap();
        assert_eq!(anyone.len(), 2);
    }

    #[tokio::test]
    async fn score_combines_history_and_load() {
        let fx = Fixture::new();
        let fresh = fx.worker("fresh", &[]).await;
        let veteran = fx.worker("veteran", &[]).await;
        fx.history(&veteran, 8, 2).await;
        let busy_task = fx.task(TaskSpec::new("haiku")).await;
        fx.router.assign(&busy_task, veteran.id).await.unwrap();

        let s = fx.router.score(&fresh).await.unwrap();
        assert!((s.score - 50.0).abs() < 1e-9);
        let s = fx.router.score(&veteran).await.unwrap();
        assert_eq!(s.load, 1);
        assert!((s.score - 70.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn history_outside_window_is_ignored() {
        let fx = Fixture::new();
        let worker = fx.worker("old-timer", &[]).await;
        fx.history(&worker, 0, 3).await;
        fx.clock.advance(Duration::days(2));
        let s = fx.router.score(&worker).await.unwrap();
        assert!((s.success_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn ties_prefer_most_recent_heartbeat() {
        let fx = Fixture::new();
        let early = fx.worker("early", &[]).await;
        fx.clock.advance(Duration::seconds(5));
        let late = fx.worker("late", &[]).await;

        let ranked = fx.router.rank(&[early.clone(), late.clone()]).await.unwrap();
        assert_eq!(ranked[0].worker_id, late.id);

        fx.clock.advance(Duration::seconds(5));
        fx.store.touch_worker(early.id, fx.clock.now()).await.unwrap();
        let early = fx.store.get_worker(early.id).await.unwrap().unwrap();
        let ranked = fx.router.rank(&[early.clone(), late]).await.unwrap();
        assert_eq!(ranked[0].worker_id, early.id);
    }

    #[tokio::test]
    async fn route_assigns_best_worker() {
        let fx = Fixture::new();
        let a = fx.worker("a", &["code_analysis"]).await;
        let b = fx.worker("b", &["code_analysis", "debugging"]).await;
        let task = fx.task(TaskSpec::new("code_fix")).await;

        assert!(fx.router.route(&task).await.unwrap());
        let stored = fx.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Assigned);
        assert_eq!(stored.assigned_worker, Some(b.id));
        let b = fx.store.get_worker(b.id).await.unwrap().unwrap();
        assert_eq!(b.status, WorkerStatus::Busy);
        assert_eq!(b.current_task, Some(task.id));
        let a = fx.store.get_worker(a.id).await.unwrap().unwrap();
        assert_eq!(a.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn route_without_candidates_leaves_task_pending() {
        let fx = Fixture::new();
        fx.worker("writer", &["content_generation"]).await;
        let task = fx.task(TaskSpec::new("deployment")).await;
        assert!(!fx.router.route(&task).await.unwrap());
        let stored = fx.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn second_assign_is_a_conflict() {
        let fx = Fixture::new();
        let w1 = fx.worker("w1", &[]).await;
        let w2 = fx.worker("w2", &[]).await;
        let task = fx.task(TaskSpec::new("haiku")).await;

        assert!(fx.router.assign(&task, w1.id).await.unwrap().is_claimed());
        assert_eq!(
            fx.router.assign(&task, w2.id).await.unwrap(),
            ClaimOutcome::Conflict
        );
    }
}
