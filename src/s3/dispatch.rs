//! Authenticated request dispatch with bounded, classified retries
//!
//! One dispatcher serves all operations of a transfer. Each call to `send`
//! re-invokes the caller's build closure on every attempt, so the URL,
//! headers and signature are freshly computed. A signature never goes stale
//! across a retry, and a credential refresh between attempts is picked up
//! automatically at signing time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{HeaderMap, Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, warn};

use crate::credentials::{CredentialSet, StorageCredentials};
use crate::s3::signer::Headers;
use crate::transfer::{Result, RetryKey, TransferError};

/// Error code the service uses for a lapsed temporary security token.
const EXPIRED_TOKEN: &str = "ExpiredToken";

/// A fully signed request ready for one send attempt.
pub struct SignedRequest {
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// Collected response handed back to the transfer client.
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Bounds applied per retry key.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum send attempts per key, first attempt included.
    pub max_attempts: u32,
    /// Maximum credential refreshes per logical request, counted separately
    /// from transient retries.
    pub max_token_refreshes: u32,
    /// Per-attempt timeout; a whole transfer has no deadline of its own.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            max_token_refreshes: 3,
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Pseudo-random jitter (0.0 - 1.0) without pulling in the rand crate.
/// Uses current time nanoseconds as entropy source.
fn rand_jitter() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Sends one HTTP request per logical operation, signing per attempt.
pub struct RequestDispatcher {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    credentials: Arc<StorageCredentials>,
    policy: RetryPolicy,
    retry_count: Mutex<HashMap<RetryKey, u32>>,
}

impl RequestDispatcher {
    /// Create a dispatcher with a tuned HTTP/1.1 connection pool:
    /// TCP_NODELAY, 10s connect timeout, 90s keepalive and idle timeout.
    pub fn new(
        credentials: Arc<StorageCredentials>,
        policy: RetryPolicy,
        insecure_tls: bool,
    ) -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if insecure_tls {
            warn!("INSECURE TLS MODE ENABLED: Certificate verification is disabled!");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .expect("Failed to build TLS connector")
        } else {
            TlsConnector::new().expect("Failed to build TLS connector")
        };

        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(64)
            .retry_canceled_requests(true)
            .set_host(true)
            .build(https);

        Self {
            client,
            credentials,
            policy,
            retry_count: Mutex::new(HashMap::new()),
        }
    }

    /// Attempts recorded so far for a key.
    pub fn attempts(&self, key: RetryKey) -> u32 {
        *self.retry_count.lock().unwrap().get(&key).unwrap_or(&0)
    }

    fn record_attempt(&self, key: RetryKey) -> u32 {
        let mut counts = self.retry_count.lock().unwrap();
        let count = counts.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    /// Send a request, re-signing on every attempt.
    ///
    /// `build` receives the credential snapshot for the attempt and must
    /// return the signed URL/headers/body triple. Classification:
    /// transport errors, timeouts, 5xx and 429 retry with backoff up to the
    /// attempt bound; a 400 whose body carries the expired-token error code
    /// triggers a generation-checked credential refresh and another attempt;
    /// every other status is returned as-is for the caller to interpret.
    pub async fn send<F>(
        &self,
        method: Method,
        retry_key: RetryKey,
        build: F,
    ) -> Result<HttpResponse>
    where
        F: Fn(&CredentialSet) -> SignedRequest + Send + Sync,
    {
        let mut refreshes = 0u32;
        loop {
            let attempt = self.record_attempt(retry_key);
            let (creds, generation) = self.credentials.snapshot().await;
            let signed = build(&creds);

            let mut req = Request::builder().method(method.clone()).uri(signed.url.as_str());
            for (name, value) in signed.headers.flatten() {
                req = req.header(name, value);
            }
            let request = req.body(Full::new(signed.body.clone()))?;

            let response = match tokio::time::timeout(
                self.policy.request_timeout,
                self.client.request(request),
            )
            .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    if attempt < self.policy.max_attempts {
                        debug!(key = %retry_key, attempt, error = %e, "request failed, retrying");
                        self.backoff(attempt).await;
                        continue;
                    }
                    warn!(key = %retry_key, attempts = attempt, error = %e, "retries exhausted");
                    return Err(TransferError::RetriesExhausted {
                        key: retry_key,
                        attempts: attempt,
                    });
                }
                Err(_) => {
                    if attempt < self.policy.max_attempts {
                        debug!(key = %retry_key, attempt, "request timed out, retrying");
                        self.backoff(attempt).await;
                        continue;
                    }
                    warn!(key = %retry_key, attempts = attempt, "retries exhausted after timeout");
                    return Err(TransferError::RetriesExhausted {
                        key: retry_key,
                        attempts: attempt,
                    });
                }
            };

            let (parts, body) = response.into_parts();
            let body_bytes = body
                .collect()
                .await
                .map_err(|e| TransferError::InvalidResponse(format!("Body error: {}", e)))?
                .to_bytes();

            let status = parts.status;
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                if attempt < self.policy.max_attempts {
                    debug!(key = %retry_key, attempt, %status, "transient server error, retrying");
                    self.backoff(attempt).await;
                    continue;
                }
                warn!(key = %retry_key, attempts = attempt, %status, "retries exhausted");
                return Err(TransferError::RetriesExhausted {
                    key: retry_key,
                    attempts: attempt,
                });
            }

            if status == StatusCode::BAD_REQUEST && is_expired_token(&body_bytes) {
                if refreshes < self.policy.max_token_refreshes {
                    refreshes += 1;
                    warn!(key = %retry_key, refreshes, "security token expired, refreshing");
                    self.credentials.refresh(generation).await?;
                    continue;
                }
                return Err(TransferError::CredentialsExpired);
            }

            return Ok(HttpResponse {
                status,
                headers: parts.headers,
                body: body_bytes,
            });
        }
    }

    async fn backoff(&self, attempt: u32) {
        let base_ms = 100u64 * (1 << attempt.min(6));
        let jitter = (base_ms as f64 * 0.2 * rand_jitter()) as u64;
        tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
    }
}

/// Whether an error body is the service's structured expired-token document.
///
/// Expected shape: `<Error><Code>ExpiredToken</Code>...</Error>`. Parsed by
/// element name; an empty, whitespace-only or malformed body is not treated
/// as expiry.
pub fn is_expired_token(body: &[u8]) -> bool {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return false;
    }
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut in_code = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"Code" => in_code = true,
            Ok(Event::Text(e)) if in_code => {
                return e.unescape().map(|t| t == EXPIRED_TOKEN).unwrap_or(false);
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"Code" => in_code = false,
            Ok(Event::Eof) => return false,
            Err(_) => return false,
            _ => {}
        }
    }
}
