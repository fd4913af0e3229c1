//! Retry: backoff の計算と、circuit breaker と組み合わせた呼び出しラッパー。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::circuit::CircuitBreaker;
use crate::domain::{FleetError, FleetResult};
use crate::observability::{RetryEvent, RetryObserver};

/// Retry configuration for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 初回の後に何回やり直すか
    pub max_retries: u32,

    #[serde(rename = "base_delay_secs", with = "crate::config::secs")]
    pub base_delay: Duration,

    #[serde(rename = "max_delay_secs", with = "crate::config::secs")]
    pub max_delay: Duration,

    pub exponential_base: f64,
}

impl RetryConfig {
    /// GitHub API: 3 retries / 2s base
    pub fn github() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
        }
    }

    /// DB: 3 retries / 0.5s base / 10s cap
    pub fn database() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-indexed).
    ///
    /// delay = min(base_delay * exponential_base^attempt, max_delay)
    ///
    /// Example with base_delay=2s, exponential_base=2.0, max_delay=30s:
    /// - attempt 0: 2s
    /// - attempt 1: 4s
    /// - attempt 2: 8s
    /// - attempt 4: 30s (capped)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
        }
    }
}

/// service 名 → RetryConfig
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetryProfiles {
    profiles: HashMap<String, RetryConfig>,
}

impl RetryProfiles {
    pub const DEFAULT: &'static str = "default";

    /// 未登録の service は "default" を使う
    pub fn for_service(&self, service: &str) -> RetryConfig {
        self.profiles
            .get(service)
            .or_else(|| self.profiles.get(Self::DEFAULT))
            .cloned()
            .unwrap_or_default()
    }

    pub fn insert(&mut self, service: impl Into<String>, config: RetryConfig) {
        self.profiles.insert(service.into(), config);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RetryConfig)> {
        self.profiles.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Default for RetryProfiles {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(Self::DEFAULT.to_string(), RetryConfig::default());
        profiles.insert("github".to_string(), RetryConfig::github());
        profiles.insert("database".to_string(), RetryConfig::database());
        Self { profiles }
    }
}

/// Resilience は外部呼び出しを retry + circuit breaker で包む
///
/// # フロー（1 回の試行ごと）
/// 1. `can_execute(service)` が false なら `CircuitOpen` で即失敗（呼び出さない）
/// 2. 呼び出す
/// 3. 成功 → `record_success`
/// 4. リトライ可能な失敗 → `record_failure`、残り回数があれば待ってやり直す
/// 5. 恒久的な失敗 → そのまま返す（breaker には数えない）
///
/// 待機は呼び出し元のタスクをブロックする。並行させたい場合は呼び出し元で spawn する。
pub struct Resilience {
    breaker: Arc<CircuitBreaker>,
    profiles: RetryProfiles,
    observer: Arc<dyn RetryObserver>,
}

impl Resilience {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        profiles: RetryProfiles,
        observer: Arc<dyn RetryObserver>,
    ) -> Self {
        Self {
            breaker,
            profiles,
            observer,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn profile(&self, service: &str) -> RetryConfig {
        self.profiles.for_service(service)
    }

    /// service の既定プロファイルで呼ぶ
    pub async fn call<T, F, Fut>(&self, service: &str, function: &str, op: F) -> FleetResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        let config = self.profiles.for_service(service);
        self.with_retry(service, &config, function, op).await
    }

    /// 明示した RetryConfig で呼ぶ
    pub async fn with_retry<T, F, Fut>(
        &self,
        service: &str,
        config: &RetryConfig,
        function: &str,
        mut op: F,
    ) -> FleetResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if !self.breaker.can_execute(service) {
                tracing::debug!(service, function, "circuit open, failing fast");
                return Err(FleetError::CircuitOpen {
                    service: service.to_string(),
                });
            }

            match op().await {
                Ok(value) => {
                    self.breaker.record_success(service);
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    self.breaker.record_failure(service);
                    if attempt >= config.max_retries {
                        tracing::error!(
                            service,
                            function,
                            attempts = attempt + 1,
                            error = %err,
                            "giving up after retries"
                        );
                        return Err(err);
                    }
                    let delay = config.delay_for(attempt);
                    self.observer.on_retry(&RetryEvent {
                        function: function.to_string(),
                        service: service.to_string(),
                        attempt,
                        delay,
                        error: err.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::domain::ValidationError;
    use crate::domain::Stage;
    use crate::observability::RecordingRetryObserver;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn resilience(observer: Arc<RecordingRetryObserver>) -> Resilience {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default(), clock));
        Resilience::new(breaker, RetryProfiles::default(), observer)
    }

    #[test]
    fn github_profile_backoff() {
        let config = RetryConfig::github();
        assert_eq!(config.delay_for(0), Duration::from_secs(2));
        assert_eq!(config.delay_for(1), Duration::from_secs(4));
        assert_eq!(config.delay_for(2), Duration::from_secs(8));
        assert_eq!(config.delay_for(10), Duration::from_secs(30));
    }

    #[rstest]
    #[case::github(RetryConfig::github())]
    #[case::database(RetryConfig::database())]
    #[case::default(RetryConfig::default())]
    fn backoff_is_monotonic_and_capped(#[case] config: RetryConfig) {
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let delay = config.delay_for(attempt);
            assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            assert!(delay <= config.max_delay);
            previous = delay;
        }
        assert_eq!(config.delay_for(u32::MAX), config.max_delay);
    }

    #[test]
    fn unknown_service_uses_default_profile() {
        let profiles = RetryProfiles::default();
        assert_eq!(profiles.for_service("stripe"), RetryConfig::default());
        assert_eq!(profiles.for_service("database"), RetryConfig::database());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_succeeds() {
        let observer = Arc::new(RecordingRetryObserver::new());
        let resilience = resilience(observer.clone());
        let calls = AtomicU32::new(0);

        let value = resilience
            .call("github", "fetch_pr", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FleetError::transient("github", "502 bad gateway"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let events = observer.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].function, "fetch_pr");
        assert_eq!(events[0].delay, Duration::from_secs(2));
        assert_eq!(events[1].delay, Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let observer = Arc::new(RecordingRetryObserver::new());
        let resilience = resilience(observer.clone());
        let calls = AtomicU32::new(0);

        let result: FleetResult<()> = resilience
            .call("database", "fetch_pending", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FleetError::Store("connection reset".into())) }
            })
            .await;

        assert!(matches!(result, Err(FleetError::Store(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(observer.events().len(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let observer = Arc::new(RecordingRetryObserver::new());
        let resilience = resilience(observer.clone());
        let calls = AtomicU32::new(0);

        let result: FleetResult<()> = resilience
            .call("github", "transition", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ValidationError::MissingEvidence {
                        from: Stage::InProgress,
                        to: Stage::PendingReview,
                    }
                    .into())
                }
            })
            .await;

        assert!(matches!(result, Err(FleetError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(observer.events().is_empty());
        assert_eq!(resilience.breaker().snapshot("github").failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast_without_calling() {
        let observer = Arc::new(RecordingRetryObserver::new());
        let resilience = resilience(observer);
        for _ in 0..5 {
            resilience.breaker().record_failure("github");
        }
        let calls = AtomicU32::new(0);

        let result: FleetResult<()> = resilience
            .call("github", "fetch_pr", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(FleetError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_when_circuit_opens_midway() {
        let observer = Arc::new(RecordingRetryObserver::new());
        let resilience = resilience(observer);
        // あと 1 回で閾値
        for _ in 0..4 {
            resilience.breaker().record_failure("github");
        }
        let calls = AtomicU32::new(0);

        let result: FleetResult<()> = resilience
            .call("github", "fetch_pr", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FleetError::transient("github", "timeout")) }
            })
            .await;

        assert!(matches!(result, Err(FleetError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
