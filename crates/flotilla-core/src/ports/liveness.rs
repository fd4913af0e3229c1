//! LivenessStore port - TTL 付きの liveness トークン
//!
//! # 実装
//! - InMemoryLivenessStore: 高速な TTL ストア（Redis 相当）
//! - DbLivenessStore: FleetStore のタイムスタンプ列で同じ経過時間セマンティクスを再現
//! - FailoverLivenessStore: 前者が落ちたら後者へ
//!
//! どれを使うかは構築時に設定で決める（実行時の `if store is None` 分岐はしない）。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::FleetResult;

/// 1 キー分の liveness 情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub key: String,
    pub holder: String,
    pub written_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LivenessRecord {
    pub fn new(key: impl Into<String>, holder: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            holder: holder.into(),
            written_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[async_trait]
pub trait LivenessStore: Send + Sync {
    /// 無条件に書き込む（heartbeat）
    async fn set(&self, key: &str, holder: &str, ttl: Duration) -> FleetResult<()>;

    /// キーがない（または期限切れ）ときだけ書き込む。書けたら true。
    async fn set_if_absent(&self, key: &str, holder: &str, ttl: Duration) -> FleetResult<bool>;

    /// holder が一致するときだけ TTL を延ばす
    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> FleetResult<bool>;

    /// 期限内のレコード。期限切れは None。
    async fn get(&self, key: &str) -> FleetResult<Option<LivenessRecord>>;

    /// holder が一致するときだけ消す
    async fn release(&self, key: &str, holder: &str) -> FleetResult<bool>;

    /// ログ用の実装名
    fn backend(&self) -> &'static str;
}
