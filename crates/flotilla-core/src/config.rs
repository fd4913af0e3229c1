//! FleetConfig - TOML から読む設定
//!
//! すべてのセクションは省略可能で、省略時は既定値を使う。
//!
//! ```toml
//! [autonomy]
//! interval_secs = 30
//! batch_size = 10
//!
//! [heartbeat]
//! timeout_secs = 90
//!
//! [retry.github]
//! max_retries = 5
//!
//! [routing.capabilities]
//! code_fix = ["code_analysis", "debugging"]
//!
//! [liveness]
//! backend = "memory_with_fallback"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{CapabilityMap, FleetError, FleetResult};
use crate::resilience::{RetryConfig, RetryProfiles};

/// `Duration` を秒数（小数可）として読み書きする
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// `Option<Duration>` 版。キーがなければ None
pub(crate) mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub autonomy: AutonomyConfig,
    pub heartbeat: HeartbeatConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// 組み込みプロファイルへの上書き（service 名ごと、書いたキーだけ）
    pub retry: HashMap<String, RetryOverride>,
    pub routing: RoutingConfig,
    pub liveness: LivenessConfig,
}

impl FleetConfig {
    pub fn from_toml_str(s: &str) -> FleetResult<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| FleetError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> FleetResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FleetError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// 組み合わせとして矛盾する値を弾く
    pub fn validate(&self) -> FleetResult<()> {
        let a = &self.autonomy;
        if a.interval_secs == 0 {
            return Err(config_error("autonomy.interval_secs must be > 0"));
        }
        if a.batch_size == 0 {
            return Err(config_error("autonomy.batch_size must be > 0"));
        }
        if a.max_task_attempts == 0 {
            return Err(config_error("autonomy.max_task_attempts must be > 0"));
        }
        if a.assigned_timeout_secs == 0 || a.running_timeout_secs == 0 {
            return Err(config_error("autonomy stuck timeouts must be > 0"));
        }

        let h = &self.heartbeat;
        if h.interval_secs == 0 {
            return Err(config_error("heartbeat.interval_secs must be > 0"));
        }
        if h.timeout_secs <= h.interval_secs {
            return Err(config_error(format!(
                "heartbeat.timeout_secs ({}) must be greater than interval_secs ({})",
                h.timeout_secs, h.interval_secs
            )));
        }

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 || cb.success_threshold == 0 {
            return Err(config_error("circuit_breaker thresholds must be > 0"));
        }

        for (service, retry) in self.retry_profiles().iter() {
            if !(retry.exponential_base >= 1.0) {
                return Err(config_error(format!(
                    "retry.{service}.exponential_base must be >= 1.0"
                )));
            }
            if retry.base_delay > retry.max_delay {
                return Err(config_error(format!(
                    "retry.{service}.base_delay_secs must not exceed max_delay_secs"
                )));
            }
        }

        let r = &self.routing;
        if !(0.0..=1.0).contains(&r.default_success_rate) {
            return Err(config_error("routing.default_success_rate must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// 組み込みプロファイルに設定の上書きを重ねたもの
    ///
    /// 書かれていないキーは同名の組み込みプロファイル（なければ default）から取る。
    /// `[retry.default]` を先に当てるので、未知の service は上書き後の default を土台にする。
    pub fn retry_profiles(&self) -> RetryProfiles {
        let mut profiles = RetryProfiles::default();
        if let Some(default) = self.retry.get(RetryProfiles::DEFAULT) {
            let base = profiles.for_service(RetryProfiles::DEFAULT);
            profiles.insert(RetryProfiles::DEFAULT, default.apply(base));
        }
        for (service, overrides) in &self.retry {
            if service == RetryProfiles::DEFAULT {
                continue;
            }
            let base = profiles.for_service(service);
            profiles.insert(service.clone(), overrides.apply(base));
        }
        profiles
    }

    pub fn retry_for(&self, service: &str) -> RetryConfig {
        self.retry_profiles().for_service(service)
    }
}

/// `[retry.<service>]` の上書き
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryOverride {
    pub max_retries: Option<u32>,

    #[serde(
        rename = "base_delay_secs",
        with = "opt_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub base_delay: Option<Duration>,

    #[serde(
        rename = "max_delay_secs",
        with = "opt_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_delay: Option<Duration>,

    pub exponential_base: Option<f64>,
}

impl RetryOverride {
    pub fn apply(&self, base: RetryConfig) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            base_delay: self.base_delay.unwrap_or(base.base_delay),
            max_delay: self.max_delay.unwrap_or(base.max_delay),
            exponential_base: self.exponential_base.unwrap_or(base.exponential_base),
        }
    }
}

fn config_error(message: impl Into<String>) -> FleetError {
    FleetError::Config(message.into())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomyConfig {
    pub interval_secs: u64,
    /// 1 イテレーションで取り出す pending タスクの上限
    pub batch_size: usize,
    pub assigned_timeout_secs: u64,
    pub running_timeout_secs: u64,
    /// この秒数ハートビートのない worker を offline にする
    pub worker_offline_secs: u64,
    pub stop_grace_secs: u64,
    /// false なら単一インスタンス前提でリーダー選出を省く
    pub require_leadership: bool,
    pub max_task_attempts: u32,
}

impl AutonomyConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn assigned_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.assigned_timeout_secs))
    }

    pub fn running_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.running_timeout_secs))
    }

    pub fn worker_offline_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.worker_offline_secs))
    }
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            batch_size: 10,
            assigned_timeout_secs: 600,
            running_timeout_secs: 1800,
            worker_offline_secs: 300,
            stop_grace_secs: 10,
            require_leadership: true,
            max_task_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    /// 最後のハートビートからこれを超えると stale
    pub timeout_secs: u64,
    /// timeout を超えてからさらにこの秒数を過ぎると dead
    pub grace_period_secs: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.timeout_secs))
    }

    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.grace_period_secs))
    }

    /// ハートビートキーの TTL（timeout + grace）
    pub fn token_ttl(&self) -> chrono::Duration {
        self.timeout() + self.grace_period()
    }

    /// リーダーリースの TTL（interval の 2 倍）
    pub fn leader_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.interval_secs.saturating_mul(2)))
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 90,
            grace_period_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// CLOSED でこの回数連続して失敗したら OPEN
    pub failure_threshold: u32,

    /// OPEN から HALF_OPEN を試すまでの時間
    #[serde(rename = "reset_timeout_secs", with = "secs")]
    pub reset_timeout: Duration,

    /// HALF_OPEN でこの回数成功したら CLOSED
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// 成功率を数える直近ウィンドウ
    pub success_window_secs: u64,
    /// 実績のない worker の成功率
    pub default_success_rate: f64,
    /// task_type → 必要能力の上書き
    pub capabilities: CapabilityMap,
}

impl RoutingConfig {
    pub fn success_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.success_window_secs))
    }

    /// 既定の対応表に上書きを重ねたもの
    pub fn capability_map(&self) -> CapabilityMap {
        let mut map = CapabilityMap::standard();
        map.merge(self.capabilities.clone());
        map
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            success_window_secs: 86_400,
            default_success_rate: 0.5,
            capabilities: CapabilityMap::empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessBackend {
    #[default]
    Memory,
    Database,
    /// memory を primary に、落ちたら database
    MemoryWithFallback,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub backend: LivenessBackend,
}

/// 設定値はおよそ 100 年で頭打ち（chrono::Duration の範囲内に収める）
const MAX_SECS: i64 = 100 * 365 * 86_400;

fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(MAX_SECS).min(MAX_SECS)
}
