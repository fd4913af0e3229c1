//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + Phantom type
//! Task / Worker / Assignment の ID はすべて ULID を内部に持つ `Id<T>` です。
//! `T` は実行時には使わないマーカー型で、コンパイル時にだけ効きます。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 生成順 = 並び順（assignment の履歴が自然に時系列になる）
//! - **分散生成可能**: 複数の watchdog / worker が調整なしで生成できる
//!
//! 文字列表現は `"{prefix}{ulid}"`（例: `task-01J...`）で、`FromStr` で往復できます。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "task-", "worker-"）
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// ```ignore
/// let task_id: TaskId = Id::from(Ulid::new());
/// let worker_id: WorkerId = Id::from(Ulid::new());
/// // task_id と worker_id は異なる型なので、混同できない
/// ```
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// ULID から Id を作成
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// 新しい ULID で Id を作成（時刻はシステム時刻）
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    /// 内部の ULID を取得
    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Id の文字列パース失敗
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {expected_prefix}id: {input}")]
pub struct ParseIdError {
    expected_prefix: &'static str,
    input: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    /// プレフィックス付き・なしの両方を受け付ける
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                expected_prefix: T::prefix(),
                input: s.to_string(),
            })
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Task のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Worker のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn prefix() -> &'static str {
        "worker-"
    }
}

/// Assignment のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Assignment {}

impl IdMarker for Assignment {
    fn prefix() -> &'static str {
        "assignment-"
    }
}

/// Identifier of a governance task.
pub type TaskId = Id<Task>;

/// Identifier of a capability-declaring worker.
pub type WorkerId = Id<Worker>;

/// Identifier of one task→worker assignment.
pub type AssignmentId = Id<Assignment>;
