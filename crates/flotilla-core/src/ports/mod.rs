//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。外部システム（トランザクショナルな DB,
//! TTL 付き KV ストア, 時刻）へのインターフェースを定義し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - FleetStore が source of truth（正本）
//! - LivenessStore は鮮度の速い通知経路で、落ちても FleetStore から再現できる

pub mod clock;
pub mod fleet_store;
pub mod id_generator;
pub mod liveness;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::fleet_store::FleetStore;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::liveness::{LivenessRecord, LivenessStore};
