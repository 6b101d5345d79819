//! Streaming fetch pipeline.
//!
//! ### Pre-dispatch
//! - Canonicalize the URL (trim, default `https`, drop fragment)
//! - Enforce the [`FetchPolicy`] (allow/deny lists, private hosts)
//!
//! ### Dispatch
//! `scheduler → breaker(origin) → retry → transport`. The response head is
//! awaited under a cancellation scope built from the caller's token and the
//! request timeout. A timeout that fires after the breaker admitted the call
//! counts as a `NetworkTimeout` failure for the origin; a caller cancellation
//! never does.
//!
//! ### Body
//! Bytes are decoded incrementally into text chunks. Cancellation, the stream
//! deadline, a read failure or the size limit end the stream with a single
//! classified error; the body reader is released exactly once.

pub mod cancel;
pub mod decode;
pub mod policy;
pub mod url;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::Url;
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use ripfetch_core::{AppConfig, ClassifiedError};
use tokio_util::sync::CancellationToken;

pub use cancel::{CancelReason, CancelScope};
pub use decode::Utf8Decoder;
pub use policy::{FetchPolicy, PolicyError, is_private_or_reserved};
pub use self::url::{UrlError, canonicalize};

use crate::resilience::{BreakerConfig, CircuitBreaker, RequestScheduler, RetryPolicy, SchedulerConfig, classify, retry};
use crate::transport::{BodyStream, PoolConfig, Transport, TransportError, TransportPool, TransportRequest, TransportResponse};

/// Decoded body text, consumed once.
pub type BodyChunks = Pin<Box<dyn Stream<Item = Result<String, ClassifiedError>> + Send>>;

const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Limits applied by the fetch client itself.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfig {
    /// Deadline for the response head, retries included (default: 30s)
    pub request_timeout: Duration,

    /// Deadline for reading the body when the caller gave no timeout (default: 30s)
    pub stream_timeout: Duration,

    /// Maximum body bytes (default: 10MB)
    pub max_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            stream_timeout: config.stream_timeout(),
            max_bytes: config.max_bytes,
        }
    }
}

/// Who the request claims to be.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestIdentity {
    /// Overrides the pool's default User-Agent
    pub user_agent: Option<String>,
    pub accept: String,
    pub headers: Vec<(String, String)>,
}

impl Default for RequestIdentity {
    fn default() -> Self {
        Self { user_agent: None, accept: DEFAULT_ACCEPT.to_string(), headers: Vec::new() }
    }
}

impl RequestIdentity {
    pub fn with_user_agent(user_agent: impl Into<String>) -> Self {
        Self { user_agent: Some(user_agent.into()), ..Default::default() }
    }

    fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Some(ua) = &self.user_agent
            && let Ok(value) = HeaderValue::from_str(ua)
        {
            map.insert(USER_AGENT, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.accept) {
            map.insert(ACCEPT, value);
        }
        for (name, value) in &self.headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => tracing::warn!(header = %name, "skipping invalid request header"),
            }
        }
        map
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub cancel: Option<CancellationToken>,
    /// Overall deadline covering the head and the body
    pub timeout: Option<Duration>,
}

/// A response whose body has not been read yet.
pub struct FetchStream {
    /// The canonical URL that was requested
    pub url: Url,
    /// The final URL after redirects
    pub final_url: Url,
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: BodyChunks,
}

impl fmt::Debug for FetchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchStream")
            .field("url", &self.url.as_str())
            .field("final_url", &self.final_url.as_str())
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

impl FetchStream {
    /// Read the whole body. A failure discards everything read so far.
    pub async fn text(mut self) -> Result<String, ClassifiedError> {
        let mut out = String::new();
        while let Some(chunk) = self.body.next().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}

/// Resilient streaming fetch client.
pub struct FetchClient {
    transport: Arc<dyn Transport>,
    scheduler: RequestScheduler,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    policy: FetchPolicy,
    config: FetchConfig,
}

impl fmt::Debug for FetchClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchClient")
            .field("scheduler", &self.scheduler)
            .field("retry", &self.retry)
            .field("policy", &self.policy)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FetchClient {
    /// Build every component from `config` on top of `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: &AppConfig) -> Self {
        Self {
            transport,
            scheduler: RequestScheduler::new(SchedulerConfig::from(config)),
            breaker: Arc::new(CircuitBreaker::new(BreakerConfig::from(config))),
            retry: RetryPolicy::from(config),
            policy: FetchPolicy::from(config),
            config: FetchConfig::from(config),
        }
    }

    /// Build a client backed by a pooled reqwest transport.
    pub fn from_config(config: &AppConfig) -> Result<Self, TransportError> {
        let pool = TransportPool::new(PoolConfig::from(config))?;
        tracing::debug!(
            concurrency = config.concurrency,
            pool_connections = config.pool_connections,
            "fetch client ready"
        );
        Ok(Self::new(Arc::new(pool), config))
    }

    pub fn with_scheduler(mut self, scheduler: RequestScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_fetch_config(mut self, config: FetchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch `url` and return its head plus a lazily decoded body.
    pub async fn fetch_stream(
        &self, url: &str, identity: &RequestIdentity, options: FetchOptions,
    ) -> Result<FetchStream, ClassifiedError> {
        let url = canonicalize(url)?;
        self.policy.check(&url).map_err(|e| {
            tracing::debug!(%url, error = %e, "fetch blocked by policy");
            ClassifiedError::from(e).with_url(url.as_str())
        })?;

        let head_timeout = options.timeout.unwrap_or(self.config.request_timeout);
        let scope = CancelScope::new(options.cancel.as_ref(), Some(head_timeout));
        let target = url.as_str();
        let request = TransportRequest { url: url.clone(), headers: identity.header_map() };

        let transport = self.transport.as_ref();
        let request = &request;
        let policy = &self.retry;
        let breaker = &self.breaker;
        let in_flight = &scope;

        // The deadline is raced twice. Inside the breaker, so a timed-out
        // dispatch is recorded against the origin; outside the scheduler, so
        // time spent queued is bounded too without blaming the origin.
        let response = scope
            .race(
                target,
                self.scheduler.execute(move || async move {
                    if let Some(reason) = in_flight.fired_now() {
                        return Err(reason.into_error(target));
                    }
                    breaker
                        .execute(target, move || {
                            in_flight.run(target, retry(policy, move || attempt(transport, request), |_, _, _| {}))
                        })
                        .await
                }),
            )
            .await?;

        tracing::debug!("streaming {} -> {} ({})", url, response.final_url, response.status.as_u16());

        let content_type = response.content_type();
        let TransportResponse { status, final_url, body, .. } = response;

        let body_scope = match options.timeout {
            Some(_) => scope,
            None => scope.with_timeout(self.config.stream_timeout),
        };
        let body = decode_body(body, body_scope, url.to_string(), self.config.max_bytes);

        Ok(FetchStream { url, final_url, status, content_type, body })
    }
}

/// One transport round trip. Non-2xx statuses become HTTP errors.
async fn attempt(transport: &dyn Transport, request: &TransportRequest) -> Result<TransportResponse, ClassifiedError> {
    let url = request.url.as_str();
    let response = transport.perform(request.clone()).await.map_err(|e| classify(e, url))?;

    if !response.status.is_success() {
        let reason = response.status.canonical_reason().unwrap_or("");
        return Err(ClassifiedError::http(url, response.status.as_u16(), reason));
    }
    Ok(response)
}

fn release(reader: &mut Option<BodyStream>, url: &str, why: &str) {
    if reader.take().is_some() {
        tracing::debug!(%url, why, "body reader released");
    }
}

fn decode_body(body: BodyStream, scope: CancelScope, url: String, max_bytes: usize) -> BodyChunks {
    let mut reader = Some(body);

    let chunks = async_stream::stream! {
        let mut decoder = Utf8Decoder::default();
        let mut received = 0usize;

        while let Some(stream) = reader.as_mut() {
            let next = tokio::select! {
                biased;
                reason = scope.fired() => Err(reason.into_error(&url)),
                item = stream.next() => Ok(item),
            };

            match next {
                Ok(Some(Ok(bytes))) => {
                    received += bytes.len();
                    if received > max_bytes {
                        release(&mut reader, &url, "size limit");
                        let err = ClassifiedError::policy_blocked(format!("response body exceeds {max_bytes} bytes"));
                        yield Err(err.with_url(url.as_str()));
                        break;
                    }
                    let text = decoder.decode(&bytes);
                    if !text.is_empty() {
                        yield Ok(text);
                    }
                }
                Ok(Some(Err(e))) => {
                    release(&mut reader, &url, "read error");
                    yield Err(classify(e, &url));
                    break;
                }
                Ok(None) => {
                    release(&mut reader, &url, "end of body");
                    let rest = decoder.finish();
                    if !rest.is_empty() {
                        yield Ok(rest);
                    }
                }
                Err(err) => {
                    release(&mut reader, &url, "aborted");
                    yield Err(err);
                    break;
                }
            }
        }
    };

    Box::pin(chunks)
}
