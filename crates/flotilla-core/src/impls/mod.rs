//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryFleetStore**: 開発・テスト用の正本
//! - **InMemoryLivenessStore**: プロセス内の TTL ストア
//! - **DbLivenessStore**: FleetStore のタイムスタンプによるフォールバック
//! - **FailoverLivenessStore**: 高速ストア → DB の自動切り替え
//!
//! 本番の DB / Redis 実装は別クレートに置く想定です。

pub mod db_liveness;
pub mod failover_liveness;
pub mod inmem_liveness;
pub mod inmem_store;

pub use self::db_liveness::DbLivenessStore;
pub use self::failover_liveness::FailoverLivenessStore;
pub use self::inmem_liveness::InMemoryLivenessStore;
pub use self::inmem_store::InMemoryFleetStore;
