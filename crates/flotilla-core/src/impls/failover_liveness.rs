//! FailoverLivenessStore - 高速ストア → DB フォールバック
//!
//! primary がインフラ障害を返したら fallback で同じ操作をやり直す。
//! 両方が同じ経過時間セマンティクスを持つので、呼び出し側から見た意味は変わらない。
//!
//! primary 復帰後も、障害中に fallback へ書かれた生きたキーは見え続ける:
//! - `get` は primary に無ければ fallback を見る
//! - `set_if_absent` は fallback に別 holder の生きたキーがあれば取らせない
//! - holder 本人の `set_if_absent` / `renew` でキーは primary へ戻る

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Duration;

use crate::domain::{ErrorKind, FleetError, FleetResult};
use crate::ports::{LivenessRecord, LivenessStore};

pub struct FailoverLivenessStore {
    primary: Arc<dyn LivenessStore>,
    fallback: Arc<dyn LivenessStore>,
    /// primary の連続失敗数（0 = 健全）
    primary_failures: AtomicU32,
}

impl FailoverLivenessStore {
    pub fn new(primary: Arc<dyn LivenessStore>, fallback: Arc<dyn LivenessStore>) -> Self {
        Self {
            primary,
            fallback,
            primary_failures: AtomicU32::new(0),
        }
    }

    /// primary が直近で失敗しているか
    pub fn is_degraded(&self) -> bool {
        self.primary_failures.load(Ordering::Relaxed) > 0
    }

    fn should_fall_back(&self, op: &str, err: &FleetError) -> bool {
        if err.kind() != ErrorKind::Infrastructure {
            return false;
        }
        let failures = self.primary_failures.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            op,
            primary = self.primary.backend(),
            fallback = self.fallback.backend(),
            failures,
            error = %err,
            "liveness primary unavailable, falling back"
        );
        true
    }

    /// fallback 側の生きたレコード。fallback の障害は「無し」として扱う
    async fn fallback_record(&self, key: &str) -> Option<LivenessRecord> {
        match self.fallback.get(key).await {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(key, error = %e, "liveness fallback lookup failed");
                None
            }
        }
    }

    fn primary_ok(&self) {
        if self.primary_failures.swap(0, Ordering::Relaxed) > 0 {
            tracing::info!(primary = self.primary.backend(), "liveness primary recovered");
        }
    }
}

#[async_trait]
impl LivenessStore for FailoverLivenessStore {
    async fn set(&self, key: &str, holder: &str, ttl: Duration) -> FleetResult<()> {
        match self.primary.set(key, holder, ttl).await {
            Ok(()) => {
                self.primary_ok();
                Ok(())
            }
            Err(e) if self.should_fall_back("set", &e) => self.fallback.set(key, holder, ttl).await,
            Err(e) => Err(e),
        }
    }

    async fn set_if_absent(&self, key: &str, holder: &str, ttl: Duration) -> FleetResult<bool> {
        if let Some(record) = self.fallback_record(key).await
            && record.holder != holder
        {
            return Ok(false);
        }
        match self.primary.set_if_absent(key, holder, ttl).await {
            Ok(v) => {
                self.primary_ok();
                Ok(v)
            }
            Err(e) if self.should_fall_back("set_if_absent", &e) => {
                self.fallback.set_if_absent(key, holder, ttl).await
            }
            Err(e) => Err(e),
        }
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> FleetResult<bool> {
        match self.primary.renew(key, holder, ttl).await {
            Ok(true) => {
                self.primary_ok();
                Ok(true)
            }
            Ok(false) => {
                self.primary_ok();
                // 障害中に fallback で持っていたキーなら primary へ戻す
                match self.fallback_record(key).await {
                    Some(record) if record.holder == holder => {
                        self.primary.set_if_absent(key, holder, ttl).await
                    }
                    _ => Ok(false),
                }
            }
            Err(e) if self.should_fall_back("renew", &e) => {
                self.fallback.renew(key, holder, ttl).await
            }
            Err(e) => Err(e),
        }
    }

    async fn get(&self, key: &str) -> FleetResult<Option<LivenessRecord>> {
        match self.primary.get(key).await {
            Ok(Some(record)) => {
                self.primary_ok();
                Ok(Some(record))
            }
            Ok(None) => {
                self.primary_ok();
                Ok(self.fallback_record(key).await)
            }
            Err(e) if self.should_fall_back("get", &e) => self.fallback.get(key).await,
            Err(e) => Err(e),
        }
    }

    async fn release(&self, key: &str, holder: &str) -> FleetResult<bool> {
        match self.primary.release(key, holder).await {
            Ok(released) => {
                self.primary_ok();
                let in_fallback = self.fallback.release(key, holder).await.unwrap_or(false);
                Ok(released || in_fallback)
            }
            Err(e) if self.should_fall_back("release", &e) => {
                self.fallback.release(key, holder).await
            }
            Err(e) => Err(e),
        }
    }

    fn backend(&self) -> &'static str {
        "failover"
    }
}
