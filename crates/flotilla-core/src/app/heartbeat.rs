//! HeartbeatRegistry - liveness トークンとリーダー選出
//!
//! # キー
//! - `heartbeat:<id>`: TTL = heartbeat_timeout + grace_period
//! - `leader:<role>`: TTL = 2 × heartbeat_interval、set-if-absent で取り合う
//!
//! # 判定
//! - age <= timeout: Alive
//! - timeout < age <= timeout + grace: Stale
//! - それより古い: Dead
//! - 記録なし: Unknown
//!
//! トークンは timeout + grace で期限切れになるので、liveness ストアだけを見る
//! `check_heartbeat` は Dead を返さない（期限切れは Unknown）。
//! worker については `check_worker_heartbeat` がトークンのないときに FleetStore の
//! `last_heartbeat` 列から同じ経過時間ルールで判定し、こちらは Dead まで見分ける。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::HeartbeatConfig;
use crate::domain::{FleetResult, WorkerId};
use crate::ports::{Clock, FleetStore, LivenessStore};

pub const LEADER_ROLE_AUTONOMY: &str = "autonomy-loop";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Alive,
    Stale,
    Dead,
    Unknown,
}

/// `check_heartbeat` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeartbeatCheck {
    pub alive: bool,
    /// 最後のハートビートからの経過秒数
    pub age_secs: Option<i64>,
    pub health: Health,
}

impl HeartbeatCheck {
    fn unknown() -> Self {
        Self {
            alive: false,
            age_secs: None,
            health: Health::Unknown,
        }
    }
}

pub struct HeartbeatRegistry {
    liveness: Arc<dyn LivenessStore>,
    store: Arc<dyn FleetStore>,
    clock: Arc<dyn Clock>,
    config: HeartbeatConfig,
    /// リーダーキーの holder として書き込む自インスタンス名
    instance_id: String,
}

impl HeartbeatRegistry {
    pub fn new(
        liveness: Arc<dyn LivenessStore>,
        store: Arc<dyn FleetStore>,
        clock: Arc<dyn Clock>,
        config: HeartbeatConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            liveness,
            store,
            clock,
            config,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    fn heartbeat_key(id: &str) -> String {
        format!("heartbeat:{id}")
    }

    fn leader_key(role: &str) -> String {
        format!("leader:{role}")
    }

    /// 経過時間から状態を分類する
    pub fn classify(&self, age: Duration) -> Health {
        if age <= self.config.timeout() {
            Health::Alive
        } else if age <= self.config.token_ttl() {
            Health::Stale
        } else {
            Health::Dead
        }
    }

    fn check_from(&self, last_seen: DateTime<Utc>) -> HeartbeatCheck {
        let age = (self.clock.now() - last_seen).max(Duration::zero());
        let health = self.classify(age);
        HeartbeatCheck {
            alive: health == Health::Alive,
            age_secs: Some(age.num_seconds()),
            health,
        }
    }

    /// トークンを書き込む。ストアの障害は false で返す（呼び出し元を止めない）。
    pub async fn send_heartbeat(&self, id: &str) -> bool {
        let key = Self::heartbeat_key(id);
        match self.liveness.set(&key, id, self.config.token_ttl()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(id, backend = self.liveness.backend(), error = %e, "heartbeat write failed");
                false
            }
        }
    }

    /// worker のハートビート: トークン + FleetStore の last_heartbeat 列
    pub async fn send_worker_heartbeat(&self, worker_id: WorkerId) -> FleetResult<bool> {
        let token = self.send_heartbeat(&worker_id.to_string()).await;
        let touched = self.store.touch_worker(worker_id, self.clock.now()).await?;
        Ok(token && touched == 1)
    }

    /// トークンから判定する。Alive / Stale / Unknown のいずれか（Dead はトークンが消えた後なので出ない）
    pub async fn check_heartbeat(&self, id: &str) -> HeartbeatCheck {
        match self.liveness.get(&Self::heartbeat_key(id)).await {
            Ok(Some(record)) => self.check_from(record.written_at),
            Ok(None) => HeartbeatCheck::unknown(),
            Err(e) => {
                tracing::warn!(id, error = %e, "heartbeat read failed");
                HeartbeatCheck::unknown()
            }
        }
    }

    /// トークンが見えなければ FleetStore の列で判定する
    pub async fn check_worker_heartbeat(&self, worker_id: WorkerId) -> FleetResult<HeartbeatCheck> {
        let check = self.check_heartbeat(&worker_id.to_string()).await;
        if check.health != Health::Unknown {
            return Ok(check);
        }
        let worker = self.store.get_worker(worker_id).await?;
        Ok(worker
            .and_then(|w| w.last_heartbeat)
            .map(|at| self.check_from(at))
            .unwrap_or_else(HeartbeatCheck::unknown))
    }

    // ---- leader election ----

    /// 既定ロール（autonomy loop）のリーダーを取る
    pub async fn claim_leadership(&self) -> bool {
        self.claim_role(LEADER_ROLE_AUTONOMY).await
    }

    pub async fn renew_leadership(&self) -> bool {
        self.renew_role(LEADER_ROLE_AUTONOMY).await
    }

    pub async fn is_leader(&self) -> bool {
        self.is_role_leader(LEADER_ROLE_AUTONOMY).await
    }

    pub async fn release_leadership(&self) -> bool {
        let key = Self::leader_key(LEADER_ROLE_AUTONOMY);
        self.liveness
            .release(&key, &self.instance_id)
            .await
            .unwrap_or(false)
    }

    /// 空いていれば取る。すでに自分が持っていれば延長する。
    pub async fn claim_role(&self, role: &str) -> bool {
        let key = Self::leader_key(role);
        let ttl = self.config.leader_ttl();
        match self.liveness.set_if_absent(&key, &self.instance_id, ttl).await {
            Ok(true) => {
                tracing::info!(role, instance = %self.instance_id, "acquired leadership");
                true
            }
            Ok(false) => self.renew_role(role).await,
            Err(e) => {
                tracing::warn!(role, error = %e, "leader claim failed");
                false
            }
        }
    }

    /// 自分が holder のときだけ TTL を延ばす
    pub async fn renew_role(&self, role: &str) -> bool {
        let key = Self::leader_key(role);
        match self
            .liveness
            .renew(&key, &self.instance_id, self.config.leader_ttl())
            .await
        {
            Ok(renewed) => renewed,
            Err(e) => {
                tracing::warn!(role, error = %e, "leader renew failed");
                false
            }
        }
    }

    pub async fn is_role_leader(&self, role: &str) -> bool {
        match self.liveness.get(&Self::leader_key(role)).await {
            Ok(Some(record)) => record.holder == self.instance_id,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(role, error = %e, "leader lookup failed");
                false
            }
        }
    }

    /// `id` のハートビートを interval ごとに送り続けるタスクを起動する
    pub fn spawn_pump(self: &Arc<Self>, id: impl Into<String>) -> HeartbeatPump {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let registry = Arc::clone(self);
        let id = id.into();
        let interval = self.config.interval();

        let join = tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                registry.send_heartbeat(&id).await;

                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::debug!(id = %id, "heartbeat pump stopped");
        });

        HeartbeatPump { stop_tx, join }
    }
}

/// spawn_pump のハンドル
/// - `stop()` で止めて終了を待つ
/// - drop すると sender が消え、pump は次の待機で抜ける
pub struct HeartbeatPump {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl HeartbeatPump {
    pub async fn stop(self) {
        // receiver が先に落ちていても構わない
        let _ = self.stop_tx.send(true);
        let _ = self.join.await;
    }
}
