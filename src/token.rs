use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::StatusCode;
use secrecy::SecretString;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::flight::{Flight, is_running, spawn_shared};
use crate::logger::SharedLog;
use crate::protocol::{LOGIN_PATH, parse_grant, password_grant, redacted, refresh_grant};
use crate::{Error, Result};

pub(crate) struct Credentials {
    pub username: String,
    pub password: SecretString,
    pub brand: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct AccessToken {
    pub authorization: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
    revoked: bool,
}

impl AccessToken {
    fn is_usable(&self, now: DateTime<Utc>, margin: TimeDelta) -> bool {
        !self.revoked
            && now
                .checked_add_signed(margin)
                .is_some_and(|deadline| deadline < self.expires_at)
    }
}

enum TokenState {
    Unauthenticated,
    Valid(AccessToken),
    Refreshing { flight: Flight<AccessToken>, full_login: bool },
}

/// Owns the bearer token. Only one login or refresh runs at a time; every
/// caller that needs a token while one is running waits for that attempt.
pub(crate) struct TokenManager {
    http: reqwest::Client,
    base_url: String,
    credentials: Mutex<Credentials>,
    credentials_rejected: AtomicBool,
    state: Mutex<TokenState>,
    generation: AtomicU64,
    refresh_margin: TimeDelta,
    log: Option<SharedLog>,
}

impl TokenManager {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        credentials: Credentials,
        refresh_margin: TimeDelta,
        log: Option<SharedLog>,
    ) -> Self {
        Self {
            http,
            base_url,
            credentials: Mutex::new(credentials),
            credentials_rejected: AtomicBool::new(false),
            state: Mutex::new(TokenState::Unauthenticated),
            generation: AtomicU64::new(0),
            refresh_margin,
            log,
        }
    }

    pub fn username(&self) -> String {
        self.credentials
            .lock()
            .expect("credentials lock poisoned")
            .username
            .clone()
    }

    pub fn set_username(&self, username: String) {
        self.credentials.lock().expect("credentials lock poisoned").username = username;
        self.credentials_changed();
    }

    pub fn set_password(&self, password: SecretString) {
        self.credentials.lock().expect("credentials lock poisoned").password = password;
        self.credentials_changed();
    }

    fn credentials_changed(&self) {
        self.credentials_rejected.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().expect("token lock poisoned") = TokenState::Unauthenticated;
        debug!("credentials changed, next request will log in again");
    }

    /// Return an authorization header value, logging in or refreshing first
    /// if there is no usable token.
    pub async fn ensure_valid_token(self: &Arc<Self>) -> Result<String> {
        let flight = {
            let mut state = self.state.lock().expect("token lock poisoned");
            match &*state {
                TokenState::Valid(token) if token.is_usable(Utc::now(), self.refresh_margin) => {
                    return Ok(token.authorization.clone());
                }
                TokenState::Refreshing { flight, .. } if is_running(flight) => {
                    debug!("token acquisition in progress, waiting for it");
                    flight.clone()
                }
                TokenState::Refreshing { .. } => {
                    debug!("token acquisition ended without settling, starting over");
                    self.begin(&mut state, None)?
                }
                TokenState::Valid(token) => {
                    let refresh = token.refresh_token.clone();
                    self.begin(&mut state, refresh)?
                }
                TokenState::Unauthenticated => self.begin(&mut state, None)?,
            }
        };
        flight.await.map(|token| token.authorization)
    }

    /// Full login with the stored credentials, replacing any token and
    /// superseding any refresh in progress.
    pub async fn authenticate(self: &Arc<Self>) -> Result<()> {
        let flight = {
            let mut state = self.state.lock().expect("token lock poisoned");
            match &*state {
                TokenState::Refreshing {
                    flight,
                    full_login: true,
                } if is_running(flight) => flight.clone(),
                _ => self.begin(&mut state, None)?,
            }
        };
        flight.await.map(|_| ())
    }

    /// Mark `authorization` as rejected by the API. Only the token that was
    /// actually used is revoked, so a burst of 401s costs one refresh.
    pub fn invalidate(&self, authorization: &str) {
        let mut state = self.state.lock().expect("token lock poisoned");
        if let TokenState::Valid(token) = &mut *state
            && token.authorization == authorization
        {
            debug!("access token rejected, marking for refresh");
            token.revoked = true;
        }
    }

    fn begin(self: &Arc<Self>, state: &mut TokenState, refresh: Option<String>) -> Result<Flight<AccessToken>> {
        if self.credentials_rejected.load(Ordering::SeqCst) {
            debug!("credentials previously rejected, not retrying login");
            return Err(Error::InvalidCredentials);
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let full_login = refresh.is_none();
        let this = Arc::clone(self);
        let flight = spawn_shared(async move {
            let result = this.acquire(refresh).await;
            this.settle(generation, &result);
            result
        });
        *state = TokenState::Refreshing {
            flight: flight.clone(),
            full_login,
        };
        Ok(flight)
    }

    fn settle(&self, generation: u64, result: &Result<AccessToken>) {
        let mut state = self.state.lock().expect("token lock poisoned");
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("discarding superseded token result");
            return;
        }
        *state = match result {
            Ok(token) => TokenState::Valid(token.clone()),
            Err(_) => TokenState::Unauthenticated,
        };
    }

    async fn acquire(&self, refresh: Option<String>) -> Result<AccessToken> {
        if let Some(refresh_token) = refresh {
            match self.exchange(refresh_grant(&refresh_token), false).await {
                Ok(token) => return Ok(token),
                Err(e) => debug!(error = %e, "token refresh failed, falling back to full login"),
            }
        }
        let body = {
            let creds = self.credentials.lock().expect("credentials lock poisoned");
            password_grant(&creds.username, &creds.password, creds.brand.as_deref())
        };
        self.exchange(body, true).await
    }

    async fn exchange(&self, body: Value, full_login: bool) -> Result<AccessToken> {
        let url = format!("{}{}", self.base_url, LOGIN_PATH);
        debug!(url = %url, full_login, "requesting access token");
        if let Some(log) = &self.log {
            log.lock()
                .expect("log lock poisoned")
                .log_request("POST", LOGIN_PATH, Some(&redacted(&body)));
        }

        let resp = self
            .http
            .post(&url)
            .header("X-Request-Id", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if let Some(log) = &self.log {
            log.lock()
                .expect("log lock poisoned")
                .log_response(LOGIN_PATH, status.as_u16(), &Value::Null);
        }

        match status {
            s if s.is_success() => {
                let grant = parse_grant(&serde_json::from_str(&text)?)?;
                let lifetime = grant.lifetime_secs();
                debug!(lifetime, "received access token");
                let expires_at = Utc::now()
                    .checked_add_signed(TimeDelta::seconds(lifetime))
                    .ok_or_else(|| Error::Protocol(format!("token lifetime out of range: {lifetime}s")))?;
                Ok(AccessToken {
                    authorization: grant.authorization(),
                    refresh_token: grant.refresh_token,
                    expires_at,
                    revoked: false,
                })
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let reason = if text.trim().is_empty() {
                    format!("HTTP {status}")
                } else {
                    text
                };
                if full_login {
                    warn!("login rejected, credentials must be updated before retrying");
                    self.credentials_rejected.store(true, Ordering::SeqCst);
                }
                Err(Error::Authentication { reason })
            }
            s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
                Err(Error::ServiceUnavailable {
                    attempts: 1,
                    last_status: Some(s.as_u16()),
                })
            }
            s => Err(Error::Permanent {
                status: s.as_u16(),
                message: text,
            }),
        }
    }
}
