use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use indexmap::IndexMap;
use secrecy::SecretString;
use tracing::{debug, error};

use crate::command::CommandExecutor;
use crate::config::{CommandPolicy, RetryPolicy, SyncPolicy};
use crate::logger::{MessageLogMode, MessageLogger};
use crate::protocol::DEFAULT_BASE_URL;
use crate::registry::{EventCallback, Registry, Snapshot};
use crate::sync::Synchronizer;
use crate::token::{Credentials, TokenManager};
use crate::transport::Transport;
use crate::types::*;
use crate::{Error, Result};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

pub struct MyQClientBuilder {
    username: String,
    password: SecretString,
    brand: Option<String>,
    base_url: String,
    http: Option<reqwest::Client>,
    request_timeout: Duration,
    refresh_margin: Duration,
    retry: RetryPolicy,
    sync: SyncPolicy,
    command: CommandPolicy,
    event_callbacks: Vec<EventCallback>,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
}

impl MyQClientBuilder {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
            brand: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            http: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            retry: RetryPolicy::default(),
            sync: SyncPolicy::default(),
            command: CommandPolicy::default(),
            event_callbacks: Vec::new(),
            log_mode: None,
            log_path: None,
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }

    /// Use a caller-owned connection pool. `request_timeout` is then the
    /// caller's responsibility.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Treat tokens as expired this long before their stated expiry.
    pub fn token_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync = policy;
        self
    }

    pub fn command_policy(mut self, policy: CommandPolicy) -> Self {
        self.command = policy;
        self
    }

    pub fn on_event(mut self, f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.event_callbacks.push(Box::new(f));
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<MyQClient> {
        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .timeout(self.request_timeout)
                .build()?,
        };

        let log = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(Arc::new(Mutex::new(MessageLogger::new(mode, &path)?))),
            _ => None,
        };

        let margin = TimeDelta::from_std(self.refresh_margin)
            .map_err(|e| Error::Config(format!("token refresh margin: {e}")))?;
        let tokens = Arc::new(TokenManager::new(
            http.clone(),
            self.base_url.clone(),
            Credentials {
                username: self.username,
                password: self.password,
                brand: self.brand,
            },
            margin,
            log.clone(),
        ));
        let transport = Arc::new(Transport::new(
            http,
            self.base_url,
            Arc::clone(&tokens),
            self.retry,
            log,
        ));
        let registry = Arc::new(Registry::new(self.event_callbacks));
        let sync = Arc::new(Synchronizer::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            self.sync,
        ));
        let commands = Arc::new(CommandExecutor::new(
            transport,
            Arc::clone(&registry),
            Arc::clone(&sync),
            self.command,
        ));

        Ok(MyQClient {
            tokens,
            registry,
            sync,
            commands,
        })
    }
}

/// A session with the cloud API. Cheap to clone; clones share the same
/// token, cache and in-flight operations.
#[derive(Clone)]
pub struct MyQClient {
    tokens: Arc<TokenManager>,
    registry: Arc<Registry>,
    sync: Arc<Synchronizer>,
    commands: Arc<CommandExecutor>,
}

impl std::fmt::Debug for MyQClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MyQClient").finish_non_exhaustive()
    }
}

impl MyQClient {
    pub fn builder(username: impl Into<String>, password: impl Into<String>) -> MyQClientBuilder {
        MyQClientBuilder::new(username, password)
    }

    /// Authenticate, then discover accounts and devices and load their state.
    pub async fn login(builder: MyQClientBuilder) -> Result<Self> {
        let client = builder.build()?;
        debug!("performing initial authentication");
        if let Err(e) = client.authenticate().await {
            error!("authentication failed: {e}");
            return Err(e);
        }
        client.update_device_info().await?;
        Ok(client)
    }

    pub async fn authenticate(&self) -> Result<()> {
        self.tokens.authenticate().await
    }

    pub fn username(&self) -> String {
        self.tokens.username()
    }

    pub fn set_username(&self, username: impl Into<String>) {
        self.tokens.set_username(username.into());
    }

    /// The password can be replaced but never read back.
    pub fn set_password(&self, password: impl Into<String>) {
        self.tokens.set_password(SecretString::from(password.into()));
    }

    /// Re-read the account and device topology.
    pub async fn discover(&self) -> Result<()> {
        self.sync.discover().await
    }

    /// Re-read the topology, then refresh state for all accounts. Both steps
    /// are skipped inside the minimum refresh interval, so this is safe to
    /// call on every poll.
    pub async fn update_device_info(&self) -> Result<()> {
        self.sync.discover_if_stale().await?;
        self.sync.update_all().await
    }

    pub async fn update_account(&self, account_id: &str, force: bool) -> Result<()> {
        self.sync.update(account_id, force).await
    }

    /// Refresh the account that owns `device_id`.
    pub async fn update(&self, device_id: &str) -> Result<()> {
        let account_id = self.registry.device(device_id)?.account_id;
        self.sync.update(&account_id, false).await
    }

    pub async fn send_command(&self, device_id: &str, command: Command, wait: bool) -> Result<CommandOutcome> {
        self.commands.send_command(device_id, command, wait).await
    }

    pub async fn open(&self, device_id: &str) -> Result<CommandOutcome> {
        self.send_command(device_id, Command::Open, true).await
    }

    pub async fn close(&self, device_id: &str) -> Result<CommandOutcome> {
        self.send_command(device_id, Command::Close, true).await
    }

    pub async fn turn_on(&self, device_id: &str) -> Result<CommandOutcome> {
        self.send_command(device_id, Command::TurnOn, true).await
    }

    pub async fn turn_off(&self, device_id: &str) -> Result<CommandOutcome> {
        self.send_command(device_id, Command::TurnOff, true).await
    }

    /// Current cache contents. Never blocks on network activity.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.registry.snapshot()
    }

    pub fn accounts(&self) -> IndexMap<String, Account> {
        self.registry.snapshot().accounts.clone()
    }

    pub fn account(&self, account_id: &str) -> Result<Account> {
        self.registry
            .snapshot()
            .account(account_id)
            .cloned()
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))
    }

    /// Devices owned by one account, in discovery order.
    pub fn account_devices(&self, account_id: &str) -> IndexMap<String, Device> {
        self.registry.snapshot().account_devices(account_id)
    }

    pub fn devices(&self) -> IndexMap<String, Device> {
        self.registry.snapshot().devices.clone()
    }

    pub fn device(&self, device_id: &str) -> Result<Device> {
        self.registry.device(device_id)
    }

    pub fn covers(&self) -> IndexMap<String, Device> {
        self.registry.snapshot().by_kind(DeviceKind::Cover)
    }

    pub fn lamps(&self) -> IndexMap<String, Device> {
        self.registry.snapshot().by_kind(DeviceKind::Lamp)
    }

    pub fn gateways(&self) -> IndexMap<String, Device> {
        self.registry.snapshot().by_kind(DeviceKind::Gateway)
    }

    pub fn locks(&self) -> IndexMap<String, Device> {
        self.registry.snapshot().by_kind(DeviceKind::Lock)
    }

    pub fn last_state_update(&self) -> Option<DateTime<Utc>> {
        self.registry.snapshot().last_state_update()
    }
}
