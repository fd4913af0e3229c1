//! Circuit breaker: service ごとの健全性を CLOSED → OPEN → HALF_OPEN → {CLOSED | OPEN} で管理する。
//!
//! - CLOSED: 連続失敗が `failure_threshold` に達したら OPEN
//! - OPEN: `reset_timeout` が過ぎるまで呼び出しを即座に拒否。過ぎたら HALF_OPEN で試行を許す
//! - HALF_OPEN: 連続 `success_threshold` 回成功で CLOSED、1 回でも失敗したら即 OPEN
//!
//! 状態は 1 プロセス内の全呼び出し元で service 名ごとに共有される。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CircuitBreakerConfig;
use crate::ports::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// service 1 つ分の状態
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    /// HALF_OPEN 中の連続成功数
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

impl Default for CircuitSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    circuits: Mutex<HashMap<String, CircuitSnapshot>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitSnapshot>> {
        // 中身は単純な数値なので poison されても使い続けてよい
        self.circuits.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 呼び出してよいか。OPEN で reset_timeout を過ぎていれば HALF_OPEN に移る。
    pub fn can_execute(&self, service: &str) -> bool {
        let now = self.clock.now();
        let reset_timeout = Duration::from_std(self.config.reset_timeout).unwrap_or(Duration::MAX);
        let mut circuits = self.lock();
        let circuit = circuits.entry(service.to_string()).or_default();
        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .last_failure_time
                    .map(|at| now - at)
                    .unwrap_or(Duration::MAX);
                if elapsed >= reset_timeout {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.success_count = 0;
                    tracing::info!(service, "circuit half-open, allowing trial call");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, service: &str) {
        let mut circuits = self.lock();
        let circuit = circuits.entry(service.to_string()).or_default();
        match circuit.state {
            CircuitState::Closed => circuit.failure_count = 0,
            CircuitState::HalfOpen => {
                circuit.success_count += 1;
                if circuit.success_count >= self.config.success_threshold {
                    circuit.state = CircuitState::Closed;
                    circuit.failure_count = 0;
                    circuit.success_count = 0;
                    tracing::info!(service, "circuit closed");
                }
            }
            // OPEN 中は呼び出していないはず。遅れて届いた成功は無視する
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, service: &str) {
        let now = self.clock.now();
        let mut circuits = self.lock();
        let circuit = circuits.entry(service.to_string()).or_default();
        circuit.last_failure_time = Some(now);
        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count += 1;
                if circuit.failure_count >= self.config.failure_threshold {
                    circuit.state = CircuitState::Open;
                    tracing::warn!(
                        service,
                        failures = circuit.failure_count,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.success_count = 0;
                circuit.failure_count += 1;
                tracing::warn!(service, "trial call failed, circuit re-opened");
            }
            CircuitState::Open => circuit.failure_count += 1,
        }
    }

    pub fn snapshot(&self, service: &str) -> CircuitSnapshot {
        self.lock().get(service).cloned().unwrap_or_default()
    }

    /// 状態を持っている全 service
    pub fn snapshots(&self) -> Vec<(String, CircuitSnapshot)> {
        let mut all: Vec<(String, CircuitSnapshot)> = self
            .lock()
            .iter()
            .map(|(name, snap)| (name.clone(), snap.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// 手動リセット（運用者向け）
    pub fn reset(&self, service: &str) {
        self.lock().remove(service);
    }
}
