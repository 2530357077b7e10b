/// 指数バックオフ+ジッター付き再試行ロジック。
///
/// 委譲サービスへのHTTP呼び出しに使う（Full Jitter戦略）。
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// 再試行戦略の設定。
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// 最大試行回数（初回を含む）
    pub max_attempts: usize,
    /// ベースとなる遅延時間（ミリ秒）
    pub base_delay_ms: u64,
    /// 最大遅延時間（ミリ秒）
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 10000,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// 指定された試行回数に対する遅延時間を計算する（Full Jitter戦略）。
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let shift = u32::try_from(attempt - 1).unwrap_or(u32::MAX);
        let factor = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
        let exponential_delay = self.base_delay_ms.saturating_mul(factor);
        let capped_delay = exponential_delay.min(self.max_delay_ms);
        let jittered_delay = if capped_delay > 0 {
            rand::rng().random_range(0..=capped_delay)
        } else {
            0
        };

        Duration::from_millis(jittered_delay)
    }

    #[must_use]
    pub const fn can_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

/// エラーが再試行可能かどうかを判定する。
///
/// ネットワークエラー、タイムアウト、5xx、429の場合に再試行可能。
#[must_use]
pub fn is_retryable_error(error: &reqwest::Error) -> bool {
    if error.is_timeout() || error.is_connect() {
        return true;
    }

    if let Some(status) = error.status() {
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return true;
        }
    }

    false
}

/// 一時的エラーの場合だけ、設定された回数まで操作を再実行する。
pub async fn with_backoff<T, F, Fut>(config: RetryConfig, operation: F) -> Result<T, reqwest::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, reqwest::Error>>,
{
    let mut attempt = 0;
    loop {
        let delay = config.delay_for_attempt(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if !is_retryable_error(&error) || !config.can_retry(attempt) {
                    return Err(error);
                }
                tracing::debug!(attempt, error = %error, "retrying transient http failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_for_attempt_zero_is_zero() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(0));
    }

    #[test]
    fn delay_for_attempt_increases_exponentially() {
        let config = RetryConfig::new(5, 100, 10000);

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(0));
        assert!(config.delay_for_attempt(1) <= Duration::from_millis(100));
        assert!(config.delay_for_attempt(2) <= Duration::from_millis(200));
        assert!(config.delay_for_attempt(3) <= Duration::from_millis(400));
    }

    #[test]
    fn delay_for_attempt_respects_max_delay() {
        let config = RetryConfig::new(10, 100, 500);
        assert!(config.delay_for_attempt(10) <= Duration::from_millis(500));
    }

    #[test]
    fn can_retry_respects_max_attempts() {
        let config = RetryConfig::new(3, 100, 1000);

        assert!(config.can_retry(0));
        assert!(config.can_retry(2));
        assert!(!config.can_retry(3));
        assert!(!config.can_retry(4));
    }

    #[test]
    fn full_jitter_provides_variation() {
        let config = RetryConfig::new(5, 100, 10000);
        let delays: Vec<Duration> = (0..10).map(|_| config.delay_for_attempt(3)).collect();
        let all_same = delays.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_same, "jitter should produce varying delays");
    }

    #[tokio::test]
    async fn with_backoff_gives_up_on_non_retryable_failures() {
        let config = RetryConfig::new(5, 1, 2);
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = std::sync::Arc::clone(&calls);

        let result: Result<(), reqwest::Error> = with_backoff(config, move || {
            let seen = std::sync::Arc::clone(&seen);
            async move {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                // A malformed URL yields a builder error, which is not
                // transient and must not be retried.
                reqwest::get("this is not a url").await.map(|_| ())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
