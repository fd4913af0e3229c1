//! flotilla-core
//!
//! Core building blocks for the Flotilla fleet control plane.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, worker, assignment, stage, capability, errors）
//! - **ports**: 抽象化レイヤー（FleetStore, LivenessStore, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryFleetStore, InMemoryLivenessStore, DbLivenessStore, FailoverLivenessStore）
//! - **resilience**: circuit breaker + retry
//! - **app**: アプリケーションロジック（builder, heartbeat, stage_validator, router, autonomy_loop）
//! - **config**: TOML 設定
//! - **observability**: 集計ビュー・ループのテレメトリ・リトライ記録

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod resilience;

pub use app::{Fleet, FleetBuilder};
pub use config::FleetConfig;
pub use domain::{FleetError, FleetResult};
