use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::logger::SharedLog;
use crate::protocol::redacted;
use crate::token::TokenManager;
use crate::{Error, Result};

/// Whether a request may be replayed after the server might have seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Idempotency {
    Idempotent,
    /// Actuation: replayed only when the request provably never left.
    NonIdempotent,
}

/// Non-success response classes. Never surfaced to callers directly.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Failure {
    AuthExpired,
    RateLimited(Option<Duration>),
    TransientServerError(u16),
    Permanent { status: u16, message: String },
}

pub(crate) fn classify(status: StatusCode, headers: &HeaderMap, body: String) -> Failure {
    match status {
        StatusCode::UNAUTHORIZED => Failure::AuthExpired,
        StatusCode::TOO_MANY_REQUESTS => Failure::RateLimited(retry_after(headers)),
        s if s.is_server_error() => Failure::TransientServerError(s.as_u16()),
        s => Failure::Permanent {
            status: s.as_u16(),
            message: body,
        },
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub(crate) struct Transport {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    retry: RetryPolicy,
    log: Option<SharedLog>,
}

impl Transport {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        tokens: Arc<TokenManager>,
        retry: RetryPolicy,
        log: Option<SharedLog>,
    ) -> Self {
        Self {
            http,
            base_url,
            tokens,
            retry,
            log,
        }
    }

    /// Send an authenticated request and return the decoded JSON body
    /// (`Null` for an empty body).
    ///
    /// A 401 triggers exactly one token refresh and one replay. Rate limits
    /// and 5xx responses are retried with backoff until the attempt budget
    /// runs out, then surface as `ServiceUnavailable`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency: Idempotency,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt: u32 = 1;
        let mut auth_retried = false;

        loop {
            let authorization = self.tokens.ensure_valid_token().await?;
            let mut req = self
                .http
                .request(method.clone(), &url)
                .header(AUTHORIZATION, &authorization)
                .header("X-Request-Id", Uuid::new_v4().to_string());
            if let Some(b) = body {
                req = req.json(b);
            }
            if let Some(log) = &self.log {
                log.lock()
                    .expect("log lock poisoned")
                    .log_request(method.as_str(), path, body.map(redacted).as_ref());
            }

            trace!(%method, %url, attempt, "sending request");
            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    let replayable = match idempotency {
                        Idempotency::Idempotent => true,
                        Idempotency::NonIdempotent => e.is_connect(),
                    };
                    if replayable && attempt < self.retry.max_attempts {
                        let delay = self.retry.backoff(attempt);
                        debug!(error = %e, attempt, ?delay, "network error, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(e.into());
                }
            };

            let status = resp.status();
            if status.is_success() {
                let text = resp.text().await?;
                let value = if text.trim().is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(&text)?
                };
                if let Some(log) = &self.log {
                    log.lock()
                        .expect("log lock poisoned")
                        .log_response(path, status.as_u16(), &value);
                }
                return Ok(value);
            }

            let headers = resp.headers().clone();
            let text = resp.text().await.unwrap_or_default();
            if let Some(log) = &self.log {
                log.lock()
                    .expect("log lock poisoned")
                    .log_response(path, status.as_u16(), &Value::String(text.clone()));
            }

            let exhausted = Error::ServiceUnavailable {
                attempts: attempt,
                last_status: Some(status.as_u16()),
            };
            match classify(status, &headers, text) {
                Failure::AuthExpired => {
                    if auth_retried {
                        return Err(Error::Authentication {
                            reason: "access token rejected after refresh".into(),
                        });
                    }
                    debug!(%url, "access token expired, refreshing once");
                    auth_retried = true;
                    self.tokens.invalidate(&authorization);
                }
                Failure::RateLimited(after) => {
                    if attempt >= self.retry.max_attempts {
                        debug!(%url, attempt, "rate limited, retry budget exhausted");
                        return Err(exhausted);
                    }
                    let delay = self.retry.rate_limit_delay(attempt, after);
                    debug!(%url, attempt, ?delay, "rate limited, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Failure::TransientServerError(code) => {
                    // the command may already have been executed
                    if idempotency == Idempotency::NonIdempotent || attempt >= self.retry.max_attempts {
                        debug!(%url, attempt, code, "server error, not retrying");
                        return Err(exhausted);
                    }
                    let delay = self.retry.backoff(attempt);
                    debug!(%url, attempt, code, ?delay, "server error, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Failure::Permanent { status, message } => {
                    debug!(%url, status, "request rejected");
                    return Err(Error::Permanent { status, message });
                }
            }
        }
    }
}
