//! Errors - エラー型と分類
//!
//! # 分類
//! - Transient: 一時的なエラー（リトライ推奨、circuit breaker の失敗カウント対象）
//! - Permanent: 恒久的なエラー（リトライ無意味、呼び出し元にそのまま返す）
//! - Infrastructure: インフラエラー（store / liveness store の障害）
//!
//! claim の競合（affected rows = 0）と stuck 判定はエラーではありません。
//! それぞれ `ClaimOutcome::Conflict` / `StuckReason` という値で表現します。

use thiserror::Error;

use super::ids::{AssignmentId, TaskId, WorkerId};
use super::stage::Stage;

/// ErrorKind は実行エラーの運用分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Stage 遷移の検証エラー（Permanent、リトライしない）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("illegal stage transition {from} -> {to} (allowed from {from}: {allowed:?})")]
    IllegalTransition {
        from: Stage,
        to: Stage,
        allowed: Vec<Stage>,
    },

    #[error("transition {from} -> {to} requires non-empty evidence")]
    MissingEvidence { from: Stage, to: Stage },

    #[error(
        "task cannot be completed: stage is {stage} (must be endpoint_verified) and endpoint_verified flag is {flag}"
    )]
    EndpointNotVerified { stage: Stage, flag: bool },

    #[error("stage changed concurrently: expected {expected}, found {actual}")]
    StageChanged { expected: Stage, actual: Stage },
}

/// FleetError はコントロールプレーン全体のエラー
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("transient failure calling {service}: {message}")]
    Transient { service: String, message: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("circuit open for service {service}")]
    CircuitOpen { service: String },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("assignment not found: {0}")]
    AssignmentNotFound(AssignmentId),

    #[error("store error: {0}")]
    Store(String),

    #[error("liveness store error: {0}")]
    Liveness(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl FleetError {
    pub fn transient(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::Transient { .. } => ErrorKind::Transient,
            FleetError::Store(_) | FleetError::Liveness(_) => ErrorKind::Infrastructure,
            FleetError::Validation(_)
            | FleetError::CircuitOpen { .. }
            | FleetError::TaskNotFound(_)
            | FleetError::WorkerNotFound(_)
            | FleetError::AssignmentNotFound(_)
            | FleetError::Config(_) => ErrorKind::Permanent,
        }
    }

    /// retry layer がもう一度試すべきか
    ///
    /// Infrastructure も一時障害として扱う（DB 接続断など）。
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Infrastructure)
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
