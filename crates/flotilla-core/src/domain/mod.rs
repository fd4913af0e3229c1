//! Domain model (IDs, tasks, workers, assignments, lifecycle stages, errors).
//!
//! ここには副作用を持たない型と純粋な判定ロジックだけを置きます。
//! 永続化・時刻・liveness は ports 経由で扱います。

pub mod assignment;
pub mod capability;
pub mod errors;
pub mod ids;
pub mod stage;
pub mod task;
pub mod worker;

pub use assignment::{
    AssignmentOutcome, AssignmentStatus, ClaimOutcome, StuckReason, TaskAssignment,
};
pub use capability::{CapabilityMap, CapabilitySet};
pub use errors::{ErrorKind, FleetError, FleetResult, ValidationError};
pub use ids::{AssignmentId, TaskId, WorkerId};
pub use stage::{Stage, StageRules, StageTransitionRule, TransitionLogEntry};
pub use task::{Task, TaskSpec, TaskStatus, TaskType};
pub use worker::{Worker, WorkerStats, WorkerStatus};
