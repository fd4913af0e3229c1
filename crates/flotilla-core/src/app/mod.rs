//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **FleetBuilder / Fleet**: 構築とワイヤリング、worker からの報告の受け口
//! - **HeartbeatRegistry**: liveness トークンとリーダー選出
//! - **StageValidator**: ライフサイクル段階の遷移検証
//! - **TaskRouter**: 能力・実績・負荷による割り当て
//! - **AutonomyLoop**: 割り当て・stuck 回収・offline 判定の制御ループ

pub mod autonomy_loop;
pub mod builder;
pub mod heartbeat;
pub mod router;
pub mod stage_validator;

// 主要な型を再エクスポート
pub use self::autonomy_loop::{AutonomyLoop, IterationReport};
pub use self::builder::{BuildError, Fleet, FleetBuilder};
pub use self::heartbeat::{Health, HeartbeatCheck, HeartbeatPump, HeartbeatRegistry};
pub use self::router::{TaskRouter, WorkerScore};
pub use self::stage_validator::StageValidator;
