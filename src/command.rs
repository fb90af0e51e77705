use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use reqwest::Method;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CommandPolicy;
use crate::flight::{Flight, Flights};
use crate::protocol::{action_body, actions_path};
use crate::registry::Registry;
use crate::sync::Synchronizer;
use crate::transport::{Idempotency, Transport};
use crate::types::{Command, CommandOutcome, Device, Transition};
use crate::{Error, Result};

/// Life of one actuation after the cloud accepted it.
#[derive(Debug)]
enum ActuationPhase {
    Sent,
    Confirming,
    Confirmed,
    TimedOut,
    Failed(Error),
}

pub(crate) struct CommandExecutor {
    transport: Arc<Transport>,
    registry: Arc<Registry>,
    sync: Arc<Synchronizer>,
    policy: CommandPolicy,
    confirmations: Flights<String, ()>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CommandExecutor {
    pub fn new(
        transport: Arc<Transport>,
        registry: Arc<Registry>,
        sync: Arc<Synchronizer>,
        policy: CommandPolicy,
    ) -> Self {
        Self {
            transport,
            registry,
            sync,
            policy,
            confirmations: Flights::new(),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Issue `command` to a device. With `wait`, returns once the cloud
    /// reports the target state, or fails with `ConfirmationTimeout`.
    pub async fn send_command(&self, device_id: &str, command: Command, wait: bool) -> Result<CommandOutcome> {
        let device = self.registry.device(device_id)?;
        validate(&device, command)?;

        let key = device_id.to_string();
        let gate = self.gate(device_id);
        let flight = {
            let _guard = gate.lock().await;
            match self.confirmations.get(&key) {
                Some(pending) if self.registry.device(device_id)?.pending_command() == Some(command) => {
                    debug!(device = %device_id, %command, "command already in progress, joining its confirmation");
                    pending
                }
                pending => {
                    if let Some(previous) = pending {
                        debug!(device = %device_id, %command, "waiting for previous command to settle");
                        let _ = previous.await;
                    }

                    let device = self.registry.device(device_id)?;
                    if device.current_state() == Some(command.target_state()) {
                        debug!(device = %device_id, state = command.target_state(), "device already in requested state");
                        return Ok(CommandOutcome::AlreadyInState);
                    }

                    let in_transit = command.intermediate_state() != command.target_state()
                        && device.reported_state() == Some(command.intermediate_state());
                    if in_transit {
                        debug!(device = %device_id, %command, "device already moving to requested state, not resending");
                    } else {
                        self.dispatch(&device, command).await?;
                    }
                    self.confirmations.start(
                        &key,
                        confirm(
                            Arc::clone(&self.sync),
                            Arc::clone(&self.registry),
                            device.id.clone(),
                            device.account_id.clone(),
                            command,
                            self.policy.clone(),
                        ),
                    )
                }
            }
        };
        finish(flight, wait).await
    }

    async fn dispatch(&self, device: &Device, command: Command) -> Result<()> {
        debug!(device = %device.id, %command, "sending command");
        let marker = device.vendor_marker().map(str::to_owned);
        self.transport
            .request(
                Method::PUT,
                &actions_path(&device.id),
                Some(&action_body(command)),
                Idempotency::NonIdempotent,
            )
            .await
            .map_err(|e| match e {
                Error::Permanent { status, message } => Error::CommandFailed {
                    device_id: device.id.clone(),
                    command,
                    reason: format!("HTTP {status}: {message}"),
                },
                other => other,
            })?;

        self.registry.begin_transition(
            &device.id,
            Transition {
                command,
                started_at: Utc::now(),
                vendor_marker: marker,
            },
        )
    }

    fn gate(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .lock()
            .expect("gate lock poisoned")
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }
}

fn validate(device: &Device, command: Command) -> Result<()> {
    let allowed = command.is_supported_by(device.capabilities())
        && match command {
            Command::Open => device.open_allowed(),
            Command::Close => device.close_allowed(),
            Command::TurnOn | Command::TurnOff => true,
        };
    if allowed {
        Ok(())
    } else {
        debug!(device = %device.id, %command, kind = ?device.kind, "command not allowed");
        Err(Error::CommandNotAllowed {
            device_id: device.id.clone(),
            command,
        })
    }
}

async fn finish(flight: Flight<()>, wait: bool) -> Result<CommandOutcome> {
    if !wait {
        return Ok(CommandOutcome::Pending);
    }
    flight.await.map(|()| CommandOutcome::Confirmed)
}

/// Poll the account with forced refreshes until the device reports the
/// command's target state or the timeout elapses.
async fn confirm(
    sync: Arc<Synchronizer>,
    registry: Arc<Registry>,
    device_id: String,
    account_id: String,
    command: Command,
    policy: CommandPolicy,
) -> Result<()> {
    let target = command.target_state();
    let deadline = Instant::now() + policy.confirm_timeout;
    let mut phase = ActuationPhase::Sent;

    loop {
        phase = match phase {
            ActuationPhase::Sent => {
                debug!(device = %device_id, state = target, "waiting for device to report state");
                ActuationPhase::Confirming
            }
            ActuationPhase::Confirming => {
                let now = Instant::now();
                if now >= deadline {
                    ActuationPhase::TimedOut
                } else {
                    tokio::time::sleep(policy.poll_interval.min(deadline - now)).await;
                    if let Err(e) = sync.update(&account_id, true).await {
                        debug!(device = %device_id, error = %e, "confirmation poll failed");
                    }
                    match registry.device(&device_id) {
                        Ok(d) if d.reported_state() == Some(target) => ActuationPhase::Confirmed,
                        Ok(_) => ActuationPhase::Confirming,
                        Err(e) => ActuationPhase::Failed(e),
                    }
                }
            }
            ActuationPhase::Confirmed => {
                debug!(device = %device_id, state = target, "command confirmed");
                let _ = registry.end_transition(&device_id, command);
                return Ok(());
            }
            ActuationPhase::TimedOut => {
                debug!(device = %device_id, state = target, "command not confirmed before timeout");
                let _ = registry.end_transition(&device_id, command);
                return Err(Error::ConfirmationTimeout {
                    device_id,
                    expected: target.to_string(),
                });
            }
            ActuationPhase::Failed(e) => {
                let _ = registry.end_transition(&device_id, command);
                return Err(e);
            }
        };
    }
}
