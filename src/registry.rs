use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use crate::diff::device_events;
use crate::protocol::{AccountRecord, DeviceRecord, DeviceStateRecord};
use crate::types::{Account, Command, Device, DeviceKind, Event, Transition};
use crate::{Error, Result};

pub(crate) type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

/// Immutable view of the account/device graph. Readers hold an `Arc` to a
/// snapshot; writers publish a new one, so no reader ever sees a
/// half-written device.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub accounts: IndexMap<String, Account>,
    pub devices: IndexMap<String, Device>,
}

impl Snapshot {
    pub fn device(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    pub fn account(&self, account_id: &str) -> Option<&Account> {
        self.accounts.get(account_id)
    }

    pub fn by_kind(&self, kind: DeviceKind) -> IndexMap<String, Device> {
        self.devices
            .iter()
            .filter(|(_, d)| d.kind == kind)
            .map(|(id, d)| (id.clone(), d.clone()))
            .collect()
    }

    pub fn account_devices(&self, account_id: &str) -> IndexMap<String, Device> {
        self.devices
            .iter()
            .filter(|(_, d)| d.account_id == account_id)
            .map(|(id, d)| (id.clone(), d.clone()))
            .collect()
    }

    /// Most recent successful refresh across all accounts.
    pub fn last_state_update(&self) -> Option<DateTime<Utc>> {
        self.accounts.values().filter_map(|a| a.last_state_update).max()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DiscoveredAccount {
    pub record: AccountRecord,
    pub devices: Vec<DeviceRecord>,
}

pub(crate) struct Registry {
    current: RwLock<Arc<Snapshot>>,
    callbacks: Vec<EventCallback>,
}

impl Registry {
    pub fn new(callbacks: Vec<EventCallback>) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            callbacks,
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().expect("registry lock poisoned").clone()
    }

    pub fn device(&self, device_id: &str) -> Result<Device> {
        self.snapshot()
            .device(device_id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))
    }

    /// Replace the graph with a full discovery result. Devices that persist
    /// keep their cached dynamic state and timestamps.
    pub fn apply_discovery(&self, discovery: Vec<DiscoveredAccount>, at: DateTime<Utc>) {
        let events = {
            let mut guard = self.current.write().expect("registry lock poisoned");
            let old = Arc::clone(&guard);
            let mut next = Snapshot::default();
            let mut events = Vec::new();

            for discovered in discovery {
                let Some(account_id) = discovered.record.id.clone() else {
                    debug!("skipping account without id");
                    continue;
                };
                if next.accounts.contains_key(&account_id) {
                    warn!(account = %account_id, "duplicate account in discovery, ignoring");
                    continue;
                }

                let mut device_ids = Vec::new();
                for record in discovered.devices {
                    let Some(device) = self.build_device(&old, &next, &account_id, record, at)
                    else {
                        continue;
                    };
                    if !old.devices.contains_key(&device.id) {
                        debug!(device = %device.id, kind = ?device.kind, "new device");
                        events.push(Event::DeviceDiscovered {
                            device_id: device.id.clone(),
                            kind: device.kind,
                        });
                    }
                    device_ids.push(device.id.clone());
                    next.devices.insert(device.id.clone(), device);
                }

                let members: HashSet<&String> = device_ids.iter().collect();
                for id in &device_ids {
                    let device = &mut next.devices[id.as_str()];
                    let orphaned = match &device.parent_id {
                        Some(parent) => {
                            device.kind == DeviceKind::Gateway
                                || parent == id
                                || !members.contains(parent)
                        }
                        None => false,
                    };
                    if orphaned {
                        warn!(
                            device = %id,
                            parent = ?device.parent_id,
                            "parent does not resolve within account, dropping link"
                        );
                        device.parent_id = None;
                    }
                }

                let name = discovered.record.name.unwrap_or_default();
                debug!(account = %account_id, devices = device_ids.len(), "discovered account");
                let last_state_update = old.account(&account_id).and_then(|a| a.last_state_update);
                next.accounts.insert(
                    account_id.clone(),
                    Account {
                        id: account_id,
                        name,
                        device_ids,
                        last_state_update,
                    },
                );
            }

            for id in old.devices.keys() {
                if !next.devices.contains_key(id) {
                    debug!(device = %id, "device no longer present");
                    events.push(Event::DeviceRemoved {
                        device_id: id.clone(),
                    });
                }
            }

            *guard = Arc::new(next);
            events
        };
        self.emit(&events);
    }

    fn build_device(
        &self,
        old: &Snapshot,
        next: &Snapshot,
        account_id: &str,
        record: DeviceRecord,
        at: DateTime<Utc>,
    ) -> Option<Device> {
        let Some(serial) = record.serial_number else {
            debug!(name = ?record.name, "skipping device without serial number");
            return None;
        };
        if next.devices.contains_key(&serial) {
            warn!(device = %serial, account = %account_id, "device id already claimed by another account, ignoring");
            return None;
        }

        let family = record.device_family.unwrap_or_default();
        let mut device = Device {
            id: serial.clone(),
            account_id: account_id.to_string(),
            parent_id: record.parent_device_id.filter(|p| !p.is_empty()),
            name: record.name.unwrap_or_default(),
            kind: DeviceKind::from_family(&family),
            family,
            device_type: record.device_type,
            platform: record.device_platform,
            state: record.state.unwrap_or_default(),
            state_update: Some(at),
            transition: None,
        };

        if let Some(prev) = old.devices.get(&serial)
            && prev.state_update.is_some()
        {
            trace!(device = %serial, "keeping cached state across rediscovery");
            device.state = prev.state.clone();
            device.state_update = prev.state_update;
            device.transition = prev.transition.clone();
        }
        Some(device)
    }

    /// Merge a batched state payload into `account_id`'s devices. Returns the
    /// account's new `last_state_update`.
    pub fn apply_state(
        &self,
        account_id: &str,
        records: Vec<DeviceStateRecord>,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let (last, events) = {
            let mut guard = self.current.write().expect("registry lock poisoned");
            if !guard.accounts.contains_key(account_id) {
                return Err(Error::AccountNotFound(account_id.to_string()));
            }
            let next = Arc::make_mut(&mut guard);
            let mut events = Vec::new();

            for record in records {
                let Some(serial) = record.serial_number else {
                    continue;
                };
                let Some(device) = next
                    .devices
                    .get_mut(&serial)
                    .filter(|d| d.account_id == account_id)
                else {
                    warn!(device = %serial, account = %account_id, "state for undiscovered device ignored");
                    continue;
                };

                let before = device.clone();
                for (key, value) in record.state {
                    device.state.insert(key, value);
                }

                let caught_up = match (&device.transition, device.vendor_marker()) {
                    (Some(t), Some(marker)) => t.vendor_marker.as_deref() != Some(marker),
                    _ => false,
                };
                if caught_up {
                    debug!(device = %serial, "cloud reported new state, dropping optimistic state");
                    device.transition = None;
                }

                device.state_update = device.state_update.max(Some(at));
                events.extend(device_events(&before, device));
            }

            // the batch covers every device of the account, listed or not
            for device in next.devices.values_mut().filter(|d| d.account_id == account_id) {
                device.state_update = device.state_update.max(Some(at));
            }
            let account = &mut next.accounts[account_id];
            account.last_state_update = account.last_state_update.max(Some(at));
            (account.last_state_update.unwrap_or(at), events)
        };
        self.emit(&events);
        Ok(last)
    }

    /// Record an optimistic transition after a command was accepted.
    pub fn begin_transition(&self, device_id: &str, transition: Transition) -> Result<()> {
        self.mutate_device(device_id, |device| {
            device.transition = Some(transition);
        })
    }

    /// Drop the optimistic state, but only if it still belongs to `command`.
    pub fn end_transition(&self, device_id: &str, command: Command) -> Result<()> {
        self.mutate_device(device_id, |device| {
            if device.pending_command() == Some(command) {
                device.transition = None;
            }
        })
    }

    fn mutate_device(&self, device_id: &str, f: impl FnOnce(&mut Device)) -> Result<()> {
        let events = {
            let mut guard = self.current.write().expect("registry lock poisoned");
            if !guard.devices.contains_key(device_id) {
                return Err(Error::DeviceNotFound(device_id.to_string()));
            }
            let next = Arc::make_mut(&mut guard);
            let device = &mut next.devices[device_id];
            let before = device.clone();
            f(device);
            device_events(&before, device)
        };
        self.emit(&events);
        Ok(())
    }

    fn emit(&self, events: &[Event]) {
        for event in events {
            for cb in &self.callbacks {
                cb(event);
            }
        }
    }
}
