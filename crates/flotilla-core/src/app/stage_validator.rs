//! StageValidator - ライフサイクル段階の遷移を検証して適用する
//!
//! # 検証順
//! 1. `complete` への遷移は stage = endpoint_verified かつ endpoint_verified フラグ = true が必須
//! 2. (現在の stage → 新しい stage) の辺が規則表にあること
//! 3. 辺が evidence を要求するなら空でない evidence があること
//!
//! 適用は「現在の stage が検証時と同じなら」の条件付き更新。
//! 間に別の遷移が入った場合は `StageChanged` を返す。

use std::sync::Arc;

use crate::domain::{
    FleetError, FleetResult, Stage, StageRules, StageTransitionRule, TaskId, TransitionLogEntry,
    ValidationError,
};
use crate::ports::{Clock, FleetStore};

pub struct StageValidator {
    store: Arc<dyn FleetStore>,
    clock: Arc<dyn Clock>,
    rules: StageRules,
}

fn non_empty(evidence: Option<&str>) -> Option<&str> {
    evidence.map(str::trim).filter(|e| !e.is_empty())
}

impl StageValidator {
    pub fn new(store: Arc<dyn FleetStore>, clock: Arc<dyn Clock>, rules: StageRules) -> Self {
        Self {
            store,
            clock,
            rules,
        }
    }

    pub fn rules(&self) -> &StageRules {
        &self.rules
    }

    /// 遷移できるかだけを判定する（書き込みなし）
    pub async fn validate(
        &self,
        task_id: TaskId,
        new_stage: Stage,
        evidence: Option<&str>,
    ) -> FleetResult<StageTransitionRule> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(FleetError::TaskNotFound(task_id))?;
        let current = task.stage;

        if new_stage == Stage::Complete
            && !(current == Stage::EndpointVerified && task.endpoint_verified)
        {
            return Err(ValidationError::EndpointNotVerified {
                stage: current,
                flag: task.endpoint_verified,
            }
            .into());
        }

        let Some(rule) = self.rules.rule(current, new_stage) else {
            return Err(ValidationError::IllegalTransition {
                from: current,
                to: new_stage,
                allowed: self.rules.allowed_from(current),
            }
            .into());
        };

        if rule.requires_evidence && non_empty(evidence).is_none() {
            return Err(ValidationError::MissingEvidence {
                from: current,
                to: new_stage,
            }
            .into());
        }
        Ok(*rule)
    }

    /// 検証して stage を進め、遷移ログに追記する
    pub async fn transition(
        &self,
        task_id: TaskId,
        new_stage: Stage,
        evidence: Option<&str>,
        verifier: &str,
    ) -> FleetResult<TransitionLogEntry> {
        let rule = self.validate(task_id, new_stage, evidence).await?;
        let entry = TransitionLogEntry {
            task_id,
            from_stage: rule.from_stage,
            to_stage: rule.to_stage,
            evidence: non_empty(evidence).map(str::to_string),
            verifier: verifier.to_string(),
            at: self.clock.now(),
        };

        let affected = self.store.apply_stage_transition(entry.clone()).await?;
        if affected == 0 {
            let actual = self
                .store
                .get_task(task_id)
                .await?
                .ok_or(FleetError::TaskNotFound(task_id))?
                .stage;
            return Err(ValidationError::StageChanged {
                expected: rule.from_stage,
                actual,
            }
            .into());
        }

        tracing::info!(
            task_id = %task_id,
            from = %entry.from_stage,
            to = %entry.to_stage,
            verifier,
            "stage transition"
        );
        Ok(entry)
    }

    /// endpoint の疎通確認が取れたことを記録する（stage = endpoint_verified のときだけ）
    pub async fn verify_endpoint(
        &self,
        task_id: TaskId,
        evidence: &str,
        verifier: &str,
    ) -> FleetResult<()> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(FleetError::TaskNotFound(task_id))?;
        if task.stage != Stage::EndpointVerified {
            return Err(ValidationError::EndpointNotVerified {
                stage: task.stage,
                flag: task.endpoint_verified,
            }
            .into());
        }
        let Some(evidence) = non_empty(Some(evidence)) else {
            return Err(ValidationError::MissingEvidence {
                from: Stage::EndpointVerified,
                to: Stage::Complete,
            }
            .into());
        };

        self.store
            .set_endpoint_verified(task_id, true, self.clock.now())
            .await?;
        tracing::info!(task_id = %task_id, evidence, verifier, "endpoint verified");
        Ok(())
    }

    pub async fn history(&self, task_id: TaskId) -> FleetResult<Vec<TransitionLogEntry>> {
        self.store.transition_log(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Task, TaskSpec, TaskStatus};
    use crate::impls::InMemoryFleetStore;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;

    async fn setup() -> (StageValidator, Arc<InMemoryFleetStore>, TaskId) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryFleetStore::new());
        let task = Task::new(TaskId::generate(), TaskSpec::new("code_fix"), clock.now());
        let task_id = task.id;
        store.insert_task(task).await.unwrap();
        let validator = StageValidator::new(store.clone(), clock, StageRules::standard());
        (validator, store, task_id)
    }

    /// 各段階に必要な evidence 付きで endpoint_verified まで進める
    async fn advance_to(validator: &StageValidator, task_id: TaskId, target: Stage) {
        let mut stage = Stage::Discovered;
        while stage != target {
            let next = stage.next().unwrap();
            validator
                .transition(task_id, next, Some("evidence"), "tester")
                .await
                .unwrap();
            stage = next;
        }
    }

    #[tokio::test]
    async fn full_chain_reaches_complete() {
        let (validator, store, task_id) = setup().await;
        advance_to(&validator, task_id, Stage::EndpointVerified).await;
        validator
            .verify_endpoint(task_id, "GET /health 200", "health-check")
            .await
            .unwrap();
        validator
            .transition(task_id, Stage::Complete, Some("deploy-42"), "health-check")
            .await
            .unwrap();

        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.stage, Stage::Complete);
        assert_eq!(task.status, TaskStatus::Completed);
        let history = validator.history(task_id).await.unwrap();
        assert_eq!(history.len(), 11);
        assert_eq!(history.last().unwrap().verifier, "health-check");
    }

    #[tokio::test]
    async fn complete_requires_endpoint_flag() {
        let (validator, _store, task_id) = setup().await;
        advance_to(&validator, task_id, Stage::EndpointVerified).await;

        let err = validator
            .transition(task_id, Stage::Complete, Some("deploy-42"), "agent")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FleetError::Validation(ValidationError::EndpointNotVerified {
                stage: Stage::EndpointVerified,
                flag: false
            })
        ));
    }

    #[tokio::test]
    async fn complete_is_unreachable_from_earlier_stages() {
        let (validator, _store, task_id) = setup().await;
        advance_to(&validator, task_id, Stage::Deployed).await;
        let err = validator
            .validate(task_id, Stage::Complete, Some("trust me"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FleetError::Validation(ValidationError::EndpointNotVerified { .. })
        ));
    }

    #[tokio::test]
    async fn skipping_stages_is_illegal() {
        let (validator, _store, task_id) = setup().await;
        let err = validator
            .transition(task_id, Stage::InProgress, None, "agent")
            .await
            .unwrap_err();
        match err {
            FleetError::Validation(ValidationError::IllegalTransition { from, to, allowed }) => {
                assert_eq!(from, Stage::Discovered);
                assert_eq!(to, Stage::InProgress);
                assert_eq!(allowed, vec![Stage::Decomposed]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[rstest]
    #[case::missing(None)]
    #[case::empty(Some(""))]
    #[case::whitespace(Some("   "))]
    #[tokio::test]
    async fn evidence_edges_reject_blank_evidence(#[case] evidence: Option<&str>) {
        let (validator, store, task_id) = setup().await;
        advance_to(&validator, task_id, Stage::InProgress).await;

        let err = validator
            .transition(task_id, Stage::PendingReview, evidence, "agent")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FleetError::Validation(ValidationError::MissingEvidence { .. })
        ));
        // 何も書かれていない
        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.stage, Stage::InProgress);
    }

    #[tokio::test]
    async fn rework_edge_needs_no_evidence() {
        let (validator, _store, task_id) = setup().await;
        advance_to(&validator, task_id, Stage::PendingReview).await;
        let entry = validator
            .transition(task_id, Stage::InProgress, None, "reviewer")
            .await
            .unwrap();
        assert_eq!(entry.from_stage, Stage::PendingReview);
        assert_eq!(entry.evidence, None);
    }

    #[tokio::test]
    async fn verify_endpoint_only_at_endpoint_verified() {
        let (validator, store, task_id) = setup().await;
        advance_to(&validator, task_id, Stage::PendingEndpoint).await;
        assert!(validator.verify_endpoint(task_id, "200 OK", "health-check").await.is_err());

        validator
            .transition(task_id, Stage::EndpointVerified, Some("check-run-7"), "health-check")
            .await
            .unwrap();
        assert!(validator.verify_endpoint(task_id, " ", "health-check").await.is_err());
        validator.verify_endpoint(task_id, "200 OK", "health-check").await.unwrap();
        assert!(store.get_task(task_id).await.unwrap().unwrap().endpoint_verified);
    }

    #[tokio::test]
    async fn unknown_task_is_reported() {
        let (validator, _store, _task_id) = setup().await;
        let err = validator
            .validate(TaskId::generate(), Stage::Decomposed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::TaskNotFound(_)));
    }
}
