//! Stage - タスクのライフサイクル段階と遷移ルール
//!
//! # ライフサイクル
//! discovered → decomposed → plan_submitted → plan_approved → in_progress
//! → pending_review → review_passed → pending_deploy → deployed
//! → pending_endpoint → endpoint_verified → complete
//!
//! 遷移グラフはコンパイル時の隣接表（`StageRules::standard()`）として持ちます。
//! 各辺は evidence（commit SHA, deployment ID など）が必須かどうかを持ちます。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::ids::TaskId;

/// タスクのライフサイクル段階（順序付き）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovered,
    Decomposed,
    PlanSubmitted,
    PlanApproved,
    InProgress,
    PendingReview,
    ReviewPassed,
    PendingDeploy,
    Deployed,
    PendingEndpoint,
    EndpointVerified,
    Complete,
}

impl Stage {
    /// 全段階（ライフサイクル順）
    pub const ALL: [Stage; 12] = [
        Stage::Discovered,
        Stage::Decomposed,
        Stage::PlanSubmitted,
        Stage::PlanApproved,
        Stage::InProgress,
        Stage::PendingReview,
        Stage::ReviewPassed,
        Stage::PendingDeploy,
        Stage::Deployed,
        Stage::PendingEndpoint,
        Stage::EndpointVerified,
        Stage::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Discovered => "discovered",
            Stage::Decomposed => "decomposed",
            Stage::PlanSubmitted => "plan_submitted",
            Stage::PlanApproved => "plan_approved",
            Stage::InProgress => "in_progress",
            Stage::PendingReview => "pending_review",
            Stage::ReviewPassed => "review_passed",
            Stage::PendingDeploy => "pending_deploy",
            Stage::Deployed => "deployed",
            Stage::PendingEndpoint => "pending_endpoint",
            Stage::EndpointVerified => "endpoint_verified",
            Stage::Complete => "complete",
        }
    }

    /// 次の段階（前進方向）。Complete は None。
    pub fn next(self) -> Option<Stage> {
        let idx = Stage::ALL.iter().position(|s| *s == self)?;
        Stage::ALL.get(idx + 1).copied()
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::Complete
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

/// 遷移グラフの 1 辺
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageTransitionRule {
    pub from_stage: Stage,
    pub to_stage: Stage,
    pub requires_evidence: bool,
}

impl StageTransitionRule {
    pub const fn new(from_stage: Stage, to_stage: Stage, requires_evidence: bool) -> Self {
        Self {
            from_stage,
            to_stage,
            requires_evidence,
        }
    }
}

/// 標準の遷移表
///
/// 前進チェーン + 2 本の差し戻し辺（review 差し戻し / 再デプロイ）。
const STANDARD_RULES: [StageTransitionRule; 13] = [
    StageTransitionRule::new(Stage::Discovered, Stage::Decomposed, false),
    StageTransitionRule::new(Stage::Decomposed, Stage::PlanSubmitted, false),
    StageTransitionRule::new(Stage::PlanSubmitted, Stage::PlanApproved, false),
    StageTransitionRule::new(Stage::PlanApproved, Stage::InProgress, false),
    StageTransitionRule::new(Stage::InProgress, Stage::PendingReview, true),
    StageTransitionRule::new(Stage::PendingReview, Stage::ReviewPassed, true),
    StageTransitionRule::new(Stage::ReviewPassed, Stage::PendingDeploy, false),
    StageTransitionRule::new(Stage::PendingDeploy, Stage::Deployed, true),
    StageTransitionRule::new(Stage::Deployed, Stage::PendingEndpoint, false),
    StageTransitionRule::new(Stage::PendingEndpoint, Stage::EndpointVerified, true),
    StageTransitionRule::new(Stage::EndpointVerified, Stage::Complete, true),
    // 差し戻し
    StageTransitionRule::new(Stage::PendingReview, Stage::InProgress, false),
    StageTransitionRule::new(Stage::PendingEndpoint, Stage::PendingDeploy, false),
];

/// StageRules は `stage → 許可される次段階` の隣接表
#[derive(Debug, Clone)]
pub struct StageRules {
    edges: HashMap<Stage, Vec<StageTransitionRule>>,
}

impl StageRules {
    /// 標準ライフサイクル
    pub fn standard() -> Self {
        Self::from_rules(STANDARD_RULES)
    }

    pub fn from_rules(rules: impl IntoIterator<Item = StageTransitionRule>) -> Self {
        let mut edges: HashMap<Stage, Vec<StageTransitionRule>> = HashMap::new();
        for rule in rules {
            let out = edges.entry(rule.from_stage).or_default();
            // 同じ辺の二重定義は後勝ち（override 用）
            out.retain(|r| r.to_stage != rule.to_stage);
            out.push(rule);
        }
        Self { edges }
    }

    /// `from → to` の辺を探す
    pub fn rule(&self, from: Stage, to: Stage) -> Option<&StageTransitionRule> {
        self.edges.get(&from)?.iter().find(|r| r.to_stage == to)
    }

    /// `from` から遷移可能な段階
    pub fn allowed_from(&self, from: Stage) -> Vec<Stage> {
        let mut allowed: Vec<Stage> = self
            .edges
            .get(&from)
            .map(|rules| rules.iter().map(|r| r.to_stage).collect())
            .unwrap_or_default();
        allowed.sort();
        allowed
    }

    pub fn rules(&self) -> impl Iterator<Item = &StageTransitionRule> {
        self.edges.values().flatten()
    }
}

impl Default for StageRules {
    fn default() -> Self {
        Self::standard()
    }
}

/// 遷移ログの 1 エントリ（追記のみ、変更しない）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionLogEntry {
    pub task_id: TaskId,
    pub from_stage: Stage,
    pub to_stage: Stage,
    pub evidence: Option<String>,
    pub verifier: String,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn stage_strings_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("shipped".parse::<Stage>().is_err());
    }

    #[test]
    fn forward_chain_is_complete() {
        let rules = StageRules::standard();
        for stage in Stage::ALL {
            if let Some(next) = stage.next() {
                assert!(
                    rules.rule(stage, next).is_some(),
                    "missing forward edge {stage} -> {next}"
                );
            }
        }
        assert!(rules.allowed_from(Stage::Complete).is_empty());
    }

    #[rstest]
    #[case(Stage::InProgress, Stage::PendingReview, true)]
    #[case(Stage::PendingReview, Stage::ReviewPassed, true)]
    #[case(Stage::PendingDeploy, Stage::Deployed, true)]
    #[case(Stage::PendingEndpoint, Stage::EndpointVerified, true)]
    #[case(Stage::EndpointVerified, Stage::Complete, true)]
    #[case(Stage::Discovered, Stage::Decomposed, false)]
    #[case(Stage::PendingReview, Stage::InProgress, false)]
    fn evidence_flags(#[case] from: Stage, #[case] to: Stage, #[case] requires: bool) {
        let rules = StageRules::standard();
        assert_eq!(rules.rule(from, to).unwrap().requires_evidence, requires);
    }

    #[test]
    fn skipping_stages_is_not_an_edge() {
        let rules = StageRules::standard();
        assert!(rules.rule(Stage::Discovered, Stage::Complete).is_none());
        assert!(rules.rule(Stage::Deployed, Stage::EndpointVerified).is_none());
    }

    #[test]
    fn later_rule_overrides_earlier() {
        let rules = StageRules::from_rules(
            STANDARD_RULES
                .into_iter()
                .chain([StageTransitionRule::new(Stage::Discovered, Stage::Decomposed, true)]),
        );
        assert!(rules.rule(Stage::Discovered, Stage::Decomposed).unwrap().requires_evidence);
        assert_eq!(rules.allowed_from(Stage::Discovered), vec![Stage::Decomposed]);
    }
}
