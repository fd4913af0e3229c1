//! DbLivenessStore - FleetStore のタイムスタンプ列による liveness
//!
//! 高速な TTL ストアが使えないときのフォールバック。
//! written_at / expires_at を DB に持ち、経過時間の判定は InMemoryLivenessStore と同じ。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use crate::domain::FleetResult;
use crate::ports::{Clock, FleetStore, LivenessRecord, LivenessStore};

pub struct DbLivenessStore {
    store: Arc<dyn FleetStore>,
    clock: Arc<dyn Clock>,
}

impl DbLivenessStore {
    pub fn new(store: Arc<dyn FleetStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl LivenessStore for DbLivenessStore {
    async fn set(&self, key: &str, holder: &str, ttl: Duration) -> FleetResult<()> {
        let now = self.clock.now();
        self.store
            .put_lease(LivenessRecord::new(key, holder, now, ttl))
            .await
    }

    async fn set_if_absent(&self, key: &str, holder: &str, ttl: Duration) -> FleetResult<bool> {
        let now = self.clock.now();
        let rows = self
            .store
            .put_lease_if_absent(LivenessRecord::new(key, holder, now, ttl))
            .await?;
        Ok(rows == 1)
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> FleetResult<bool> {
        let now = self.clock.now();
        let rows = self.store.renew_lease(key, holder, now + ttl, now).await?;
        Ok(rows == 1)
    }

    async fn get(&self, key: &str) -> FleetResult<Option<LivenessRecord>> {
        let now = self.clock.now();
        Ok(self
            .store
            .get_lease(key)
            .await?
            .filter(|record| !record.is_expired(now)))
    }

    async fn release(&self, key: &str, holder: &str) -> FleetResult<bool> {
        Ok(self.store.delete_lease(key, holder).await? == 1)
    }

    fn backend(&self) -> &'static str {
        "database"
    }
}
