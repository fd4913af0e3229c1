//! Assignment - 「誰が・何を・いつから」の結合レコード

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{AssignmentId, TaskId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Assigned,
    Running,
    Completed,
    Failed,
}

impl AssignmentStatus {
    /// worker の負荷として数える状態
    pub fn is_active(self) -> bool {
        matches!(self, AssignmentStatus::Assigned | AssignmentStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub id: AssignmentId,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub status: AssignmentStatus,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// 最後に進捗報告を受けた時刻
    pub last_progress_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// このタスクの何回目の claim か（0 始まり）
    pub retry_count: u32,
    pub failure_reason: Option<String>,
}

impl TaskAssignment {
    pub fn new(
        id: AssignmentId,
        task_id: TaskId,
        worker_id: WorkerId,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id,
            worker_id,
            status: AssignmentStatus::Assigned,
            assigned_at: now,
            started_at: None,
            last_progress_at: None,
            completed_at: None,
            retry_count,
            failure_reason: None,
        }
    }

    /// stuck 判定
    ///
    /// - assigned のまま `assigned_timeout` を超え、started_at がない
    /// - running で最後の進捗（なければ開始時刻）から `running_timeout` を超えた
    pub fn stuck_reason(
        &self,
        now: DateTime<Utc>,
        assigned_timeout: Duration,
        running_timeout: Duration,
    ) -> Option<StuckReason> {
        match self.status {
            AssignmentStatus::Assigned
                if self.started_at.is_none() && now - self.assigned_at > assigned_timeout =>
            {
                Some(StuckReason::NeverStarted {
                    assigned_for: now - self.assigned_at,
                })
            }
            AssignmentStatus::Running => {
                let last = self
                    .last_progress_at
                    .or(self.started_at)
                    .unwrap_or(self.assigned_at);
                (now - last > running_timeout).then(|| StuckReason::NoProgress {
                    silent_for: now - last,
                })
            }
            _ => None,
        }
    }

    pub fn finish(&mut self, status: AssignmentStatus, reason: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.failure_reason = reason;
        self.completed_at = Some(now);
    }
}

/// stuck と判定された理由（エラーではなく、ループが自動回収する状況）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckReason {
    NeverStarted { assigned_for: Duration },
    NoProgress { silent_for: Duration },
}

impl fmt::Display for StuckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StuckReason::NeverStarted { assigned_for } => write!(
                f,
                "stuck — no progress (assigned {}s ago, never started)",
                assigned_for.num_seconds()
            ),
            StuckReason::NoProgress { silent_for } => write!(
                f,
                "stuck — no progress (running, silent for {}s)",
                silent_for.num_seconds()
            ),
        }
    }
}

/// 条件付き claim の結果。競合は正常系。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(AssignmentId),
    Conflict,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }
}

/// worker からの完了報告
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum AssignmentOutcome {
    Succeeded,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn assignment() -> TaskAssignment {
        TaskAssignment::new(
            AssignmentId::generate(),
            TaskId::generate(),
            WorkerId::generate(),
            0,
            t0(),
        )
    }

    #[test]
    fn assigned_without_start_becomes_stuck_after_timeout() {
        let a = assignment();
        let ten = Duration::minutes(10);
        let thirty = Duration::minutes(30);

        assert_eq!(a.stuck_reason(t0() + Duration::minutes(9), ten, thirty), None);
        assert!(matches!(
            a.stuck_reason(t0() + Duration::minutes(15), ten, thirty),
            Some(StuckReason::NeverStarted { .. })
        ));
    }

    #[test]
    fn running_uses_last_progress() {
        let mut a = assignment();
        a.status = AssignmentStatus::Running;
        a.started_at = Some(t0());
        a.last_progress_at = Some(t0() + Duration::minutes(20));
        let ten = Duration::minutes(10);
        let thirty = Duration::minutes(30);

        // 開始から 40 分だが、最後の進捗からは 20 分
        assert_eq!(a.stuck_reason(t0() + Duration::minutes(40), ten, thirty), None);
        assert!(matches!(
            a.stuck_reason(t0() + Duration::minutes(51), ten, thirty),
            Some(StuckReason::NoProgress { .. })
        ));
    }

    #[test]
    fn finished_assignments_are_never_stuck() {
        let mut a = assignment();
        a.finish(AssignmentStatus::Completed, None, t0());
        let later = t0() + Duration::days(1);
        assert_eq!(a.stuck_reason(later, Duration::minutes(10), Duration::minutes(30)), None);
    }

    #[test]
    fn stuck_reason_mentions_no_progress() {
        let reason = StuckReason::NeverStarted {
            assigned_for: Duration::minutes(15),
        };
        assert!(reason.to_string().starts_with("stuck — no progress"));
    }
}
