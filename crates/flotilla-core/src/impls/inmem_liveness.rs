//! InMemoryLivenessStore - プロセス内の TTL 付き KV（Redis 相当の高速経路）
//!
//! 期限切れのキーは読み出し時に存在しないものとして扱い、その場で消す。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::Mutex;

use crate::domain::FleetResult;
use crate::ports::{Clock, LivenessRecord, LivenessStore};

pub struct InMemoryLivenessStore {
    entries: Mutex<HashMap<String, LivenessRecord>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLivenessStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl LivenessStore for InMemoryLivenessStore {
    async fn set(&self, key: &str, holder: &str, ttl: Duration) -> FleetResult<()> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), LivenessRecord::new(key, holder, now, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, holder: &str, ttl: Duration) -> FleetResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|e| !e.is_expired(now)) {
            return Ok(false);
        }
        entries.insert(key.to_string(), LivenessRecord::new(key, holder, now, ttl));
        Ok(true)
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> FleetResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.holder == holder && !entry.is_expired(now) => {
                entry.written_at = now;
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> FleetResult<Option<LivenessRecord>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).cloned())
    }

    async fn release(&self, key: &str, holder: &str) -> FleetResult<bool> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|e| e.holder == holder) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
