use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use reqwest::Method;
use tracing::debug;

use crate::config::SyncPolicy;
use crate::flight::Flights;
use crate::protocol::{ACCOUNTS_PATH, device_state_path, devices_path, parse_accounts, parse_devices, parse_states};
use crate::registry::{DiscoveredAccount, Registry};
use crate::transport::{Idempotency, Transport};
use crate::{Error, Result};

/// Keeps the registry in step with the cloud: full discovery on demand, and
/// per-account state refreshes that are debounced and single-flighted.
pub(crate) struct Synchronizer {
    transport: Arc<Transport>,
    registry: Arc<Registry>,
    policy: SyncPolicy,
    refreshes: Flights<String, ()>,
    discovery: Flights<(), ()>,
    last_discovery: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl Synchronizer {
    pub fn new(transport: Arc<Transport>, registry: Arc<Registry>, policy: SyncPolicy) -> Self {
        Self {
            transport,
            registry,
            policy,
            refreshes: Flights::new(),
            discovery: Flights::new(),
            last_discovery: Arc::new(Mutex::new(None)),
        }
    }

    /// Refresh every device of `account_id` with one request. Without
    /// `force`, a refresh inside the minimum interval is skipped.
    pub async fn update(&self, account_id: &str, force: bool) -> Result<()> {
        let last = self
            .registry
            .snapshot()
            .account(account_id)
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))?
            .last_state_update;

        if !force
            && let Some(last) = last
            && within_interval(last, Utc::now(), self.policy.min_refresh_interval)
        {
            debug!(account = %account_id, "ignoring update request within throttle window");
            return Ok(());
        }

        let key = account_id.to_string();
        let (flight, started) = self.refreshes.join_or_start(&key, || {
            refresh(
                Arc::clone(&self.transport),
                Arc::clone(&self.registry),
                key.clone(),
            )
        });
        if !started {
            debug!(account = %account_id, "joining in-flight refresh");
        }
        flight.await
    }

    /// Refresh every known account. Each one is debounced and
    /// single-flighted on its own; the first failure is reported after all
    /// of them have finished.
    pub async fn update_all(&self) -> Result<()> {
        let ids: Vec<String> = self.registry.snapshot().accounts.keys().cloned().collect();
        let results = join_all(ids.iter().map(|id| self.update(id, false))).await;
        results.into_iter().collect()
    }

    /// Fetch accounts and their devices and replace the registry graph.
    pub async fn discover(&self) -> Result<()> {
        let (flight, started) = self.discovery.join_or_start(&(), || {
            let last_discovery = Arc::clone(&self.last_discovery);
            let transport = Arc::clone(&self.transport);
            let registry = Arc::clone(&self.registry);
            async move {
                let started_at = Utc::now();
                discover(transport, registry).await?;
                *last_discovery.lock().expect("discovery lock poisoned") = Some(started_at);
                Ok(())
            }
        });
        if !started {
            debug!("joining in-flight discovery");
        }
        flight.await
    }

    /// Rediscover unless the last discovery is inside the minimum interval.
    pub async fn discover_if_stale(&self) -> Result<()> {
        let last = *self.last_discovery.lock().expect("discovery lock poisoned");
        if let Some(last) = last
            && within_interval(last, Utc::now(), self.policy.min_refresh_interval)
        {
            debug!("ignoring discovery request within throttle window");
            return Ok(());
        }
        self.discover().await
    }
}

fn within_interval(last: DateTime<Utc>, now: DateTime<Utc>, interval: Duration) -> bool {
    match now.signed_duration_since(last).to_std() {
        Ok(elapsed) => elapsed < interval,
        // clock went backwards; treat as fresh
        Err(_) => true,
    }
}

async fn refresh(transport: Arc<Transport>, registry: Arc<Registry>, account_id: String) -> Result<()> {
    debug!(account = %account_id, "refreshing device state");
    let body = transport
        .request(Method::GET, &device_state_path(&account_id), None, Idempotency::Idempotent)
        .await
        .map_err(|e| sync_error(&account_id, e))?;
    let records = parse_states(&body).map_err(|e| sync_error(&account_id, e))?;
    let last = registry.apply_state(&account_id, records, Utc::now())?;
    debug!(account = %account_id, last_state_update = %last, "device state refreshed");
    Ok(())
}

async fn discover(transport: Arc<Transport>, registry: Arc<Registry>) -> Result<()> {
    debug!("retrieving account information");
    let body = transport
        .request(Method::GET, ACCOUNTS_PATH, None, Idempotency::Idempotent)
        .await?;
    let accounts = parse_accounts(&body)?;
    if accounts.is_empty() {
        debug!("no accounts found");
    }

    let mut discovered = Vec::with_capacity(accounts.len());
    for record in accounts {
        let Some(id) = record.id.clone() else {
            debug!("skipping account without id");
            continue;
        };
        debug!(account = %id, name = ?record.name, "retrieving devices");
        let body = transport
            .request(Method::GET, &devices_path(&id), None, Idempotency::Idempotent)
            .await?;
        let devices = parse_devices(&body)?;
        if devices.is_empty() {
            debug!(account = %id, "no devices found");
        }
        discovered.push(DiscoveredAccount { record, devices });
    }

    registry.apply_discovery(discovered, Utc::now());
    Ok(())
}

/// Credential and retry-budget failures keep their own identity so hosts
/// can tell them apart; everything else is a generic refresh failure.
fn sync_error(account_id: &str, e: Error) -> Error {
    match e {
        Error::ServiceUnavailable { .. }
        | Error::Authentication { .. }
        | Error::InvalidCredentials
        | Error::AccountNotFound(_) => e,
        other => Error::Sync {
            account_id: account_id.to_string(),
            reason: other.to_string(),
        },
    }
}
