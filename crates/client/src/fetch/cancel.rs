//! Cancellation scope for a single fetch.
//!
//! Merges the caller's token with an internal deadline; whichever fires first
//! decides the error. The caller token is observed through a child token, so
//! dropping the scope deregisters it from the parent.

use std::future::Future;
use std::time::Duration;

use ripfetch_core::ClassifiedError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller cancelled.
    Cancelled,
    /// The internal deadline passed.
    TimedOut(Duration),
}

impl CancelReason {
    pub fn into_error(self, url: &str) -> ClassifiedError {
        match self {
            Self::Cancelled => ClassifiedError::cancelled("request cancelled by caller").with_url(url),
            Self::TimedOut(limit) => {
                ClassifiedError::timeout(format!("request exceeded {}ms", limit.as_millis())).with_url(url)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    token: Option<CancellationToken>,
    deadline: Option<(Instant, Duration)>,
}

impl CancelScope {
    pub fn new(caller: Option<&CancellationToken>, timeout: Option<Duration>) -> Self {
        Self {
            token: caller.map(CancellationToken::child_token),
            deadline: timeout.map(|limit| (Instant::now() + limit, limit)),
        }
    }

    /// Same caller token, fresh deadline starting now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self { token: self.token.clone(), deadline: Some((Instant::now() + timeout, timeout)) }
    }

    /// The reason the scope has already fired, if it has.
    pub fn fired_now(&self) -> Option<CancelReason> {
        if self.token.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Some(CancelReason::Cancelled);
        }
        match self.deadline {
            Some((at, limit)) if Instant::now() >= at => Some(CancelReason::TimedOut(limit)),
            _ => None,
        }
    }

    /// Resolves when the caller cancels or the deadline passes. Never resolves
    /// for an empty scope.
    pub async fn fired(&self) -> CancelReason {
        let cancelled = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some((at, limit)) => {
                    tokio::time::sleep_until(at).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => CancelReason::Cancelled,
            limit = expired => CancelReason::TimedOut(limit),
        }
    }

    /// Like [`run`](Self::run), but `fut` is polled first, so an outcome it
    /// reaches at the moment the scope fires still wins.
    pub async fn race<T, F>(&self, url: &str, fut: F) -> Result<T, ClassifiedError>
    where
        F: Future<Output = Result<T, ClassifiedError>>,
    {
        tokio::select! {
            biased;
            result = fut => result,
            reason = self.fired() => {
                tracing::debug!(%url, ?reason, "fetch aborted");
                Err(reason.into_error(url))
            }
        }
    }

    /// Run `fut` unless the scope fires first, in which case `fut` is dropped.
    pub async fn run<T, F>(&self, url: &str, fut: F) -> Result<T, ClassifiedError>
    where
        F: Future<Output = Result<T, ClassifiedError>>,
    {
        tokio::select! {
            biased;
            reason = self.fired() => {
                tracing::debug!(%url, ?reason, "fetch aborted");
                Err(reason.into_error(url))
            }
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripfetch_core::ErrorKind;

    #[tokio::test(start_paused = true)]
    async fn test_empty_scope_never_fires() {
        let scope = CancelScope::default();
        let result = scope.run("https://a.test/", async { Ok::<_, ClassifiedError>(5) }).await;
        assert_eq!(result.unwrap(), 5);
        assert_eq!(scope.fired_now(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_as_timeout() {
        let scope = CancelScope::new(None, Some(Duration::from_millis(50)));
        let err = scope
            .run("https://a.test/", std::future::pending::<Result<(), ClassifiedError>>())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkTimeout);
        assert_eq!(err.url(), Some("https://a.test/"));
        assert_eq!(scope.fired_now(), Some(CancelReason::TimedOut(Duration::from_millis(50))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancel_wins_over_later_deadline() {
        let caller = CancellationToken::new();
        let scope = CancelScope::new(Some(&caller), Some(Duration::from_secs(10)));

        let trigger = caller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });

        let err = scope.run("u", std::future::pending::<Result<(), ClassifiedError>>()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!err.retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_cancelled_token_skips_future() {
        let caller = CancellationToken::new();
        caller.cancel();
        let scope = CancelScope::new(Some(&caller), None);

        let mut polled = false;
        let err = scope
            .run("u", async {
                polled = true;
                Ok::<_, ClassifiedError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!polled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_lets_future_settle_at_deadline() {
        let scope = CancelScope::new(None, Some(Duration::from_millis(50)));
        let inner = scope.clone();
        let result = scope
            .race("u", async move {
                let err = inner
                    .run("u", std::future::pending::<Result<(), ClassifiedError>>())
                    .await
                    .unwrap_err();
                Ok::<_, ClassifiedError>(err.kind())
            })
            .await;
        assert_eq!(result.unwrap(), ErrorKind::NetworkTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_fires_while_future_waits() {
        let scope = CancelScope::new(None, Some(Duration::from_millis(50)));
        let err = scope
            .race("u", std::future::pending::<Result<(), ClassifiedError>>())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkTimeout);
    }

    #[tokio::test]
    async fn test_dropping_scope_does_not_cancel_caller() {
        let caller = CancellationToken::new();
        drop(CancelScope::new(Some(&caller), None));
        assert!(!caller.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_restarts_deadline() {
        let scope = CancelScope::new(None, Some(Duration::from_millis(10)));
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(scope.fired_now().is_some());

        let body = scope.with_timeout(Duration::from_millis(100));
        assert_eq!(body.fired_now(), None);
    }
}
