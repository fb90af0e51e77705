use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub const FAMILY_GARAGEDOOR: &str = "garagedoor";
pub const FAMILY_LAMP: &str = "lamp";
pub const FAMILY_GATEWAY: &str = "gateway";
pub const FAMILY_LOCK: &str = "locks";

/// Device classification, derived from the vendor's `device_family`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cover,
    Lamp,
    Gateway,
    Lock,
    Other,
}

impl DeviceKind {
    pub fn from_family(family: &str) -> Self {
        match family {
            FAMILY_GARAGEDOOR => DeviceKind::Cover,
            FAMILY_LAMP => DeviceKind::Lamp,
            FAMILY_GATEWAY => DeviceKind::Gateway,
            FAMILY_LOCK => DeviceKind::Lock,
            _ => DeviceKind::Other,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            DeviceKind::Cover => Capabilities {
                open_close: true,
                turn_on_off: false,
            },
            DeviceKind::Lamp => Capabilities {
                open_close: false,
                turn_on_off: true,
            },
            _ => Capabilities::default(),
        }
    }

    /// Key inside the state payload that carries this kind's primary state.
    pub(crate) fn state_key(&self) -> Option<&'static str> {
        match self {
            DeviceKind::Cover => Some("door_state"),
            DeviceKind::Lamp => Some("lamp_state"),
            DeviceKind::Lock => Some("lock_state"),
            DeviceKind::Gateway | DeviceKind::Other => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub open_close: bool,
    pub turn_on_off: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Open,
    Close,
    TurnOn,
    TurnOff,
}

impl Command {
    pub fn as_action_str(&self) -> &'static str {
        match self {
            Command::Open => "open",
            Command::Close => "close",
            Command::TurnOn => "on",
            Command::TurnOff => "off",
        }
    }

    pub(crate) fn is_supported_by(&self, caps: Capabilities) -> bool {
        match self {
            Command::Open | Command::Close => caps.open_close,
            Command::TurnOn | Command::TurnOff => caps.turn_on_off,
        }
    }

    /// State the device reports once the command has taken effect.
    pub fn target_state(&self) -> &'static str {
        match self {
            Command::Open => DoorState::Open.as_str(),
            Command::Close => DoorState::Closed.as_str(),
            Command::TurnOn => LampState::On.as_str(),
            Command::TurnOff => LampState::Off.as_str(),
        }
    }

    /// Optimistic state shown while the cloud catches up. Lamps switch
    /// instantly, so they go straight to the target.
    pub fn intermediate_state(&self) -> &'static str {
        match self {
            Command::Open => DoorState::Opening.as_str(),
            Command::Close => DoorState::Closing.as_str(),
            Command::TurnOn | Command::TurnOff => self.target_state(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Open => "open",
            Command::Close => "close",
            Command::TurnOn => "turn_on",
            Command::TurnOff => "turn_off",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorState {
    Open,
    Closed,
    Opening,
    Closing,
    Stopped,
    Transition,
    Autoreverse,
    Unknown,
}

impl DoorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoorState::Open => "open",
            DoorState::Closed => "closed",
            DoorState::Opening => "opening",
            DoorState::Closing => "closing",
            DoorState::Stopped => "stopped",
            DoorState::Transition => "transition",
            DoorState::Autoreverse => "autoreverse",
            DoorState::Unknown => "unknown",
        }
    }

    pub fn from_myq_str(s: &str) -> Self {
        match s {
            "open" => DoorState::Open,
            "closed" => DoorState::Closed,
            "opening" => DoorState::Opening,
            "closing" => DoorState::Closing,
            "stopped" => DoorState::Stopped,
            "transition" => DoorState::Transition,
            "autoreverse" => DoorState::Autoreverse,
            _ => DoorState::Unknown,
        }
    }

    pub fn is_moving(&self) -> bool {
        matches!(
            self,
            DoorState::Opening | DoorState::Closing | DoorState::Transition
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LampState {
    On,
    Off,
}

impl LampState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LampState::On => "on",
            LampState::Off => "off",
        }
    }

    pub fn from_myq_str(s: &str) -> Option<Self> {
        match s {
            "on" => Some(LampState::On),
            "off" => Some(LampState::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
    Unknown,
}

impl LockState {
    pub fn from_myq_str(s: &str) -> Self {
        match s {
            "locked" => LockState::Locked,
            "unlocked" => LockState::Unlocked,
            _ => LockState::Unknown,
        }
    }
}

/// Pending command recorded on a device between send and confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub command: Command,
    pub started_at: DateTime<Utc>,
    /// Vendor `last_update` marker at send time; a new marker means the
    /// cloud has caught up and the optimistic state can be dropped.
    pub(crate) vendor_marker: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub name: String,
    /// Owned devices, by identifier, in discovery order.
    pub device_ids: Vec<String>,
    pub last_state_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub id: String,
    pub account_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub family: String,
    pub kind: DeviceKind,
    pub device_type: Option<String>,
    pub platform: Option<String>,
    /// Raw vendor state payload.
    pub state: Map<String, Value>,
    pub state_update: Option<DateTime<Utc>>,
    pub(crate) transition: Option<Transition>,
}

impl Device {
    fn flag(&self, key: &str) -> bool {
        self.state.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn online(&self) -> bool {
        self.flag("online")
    }

    pub fn open_allowed(&self) -> bool {
        self.kind == DeviceKind::Cover && self.flag("is_unattended_open_allowed")
    }

    pub fn close_allowed(&self) -> bool {
        self.kind == DeviceKind::Cover && self.flag("is_unattended_close_allowed")
    }

    pub fn low_battery(&self) -> bool {
        self.flag("dps_low_battery_mode")
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.state.get("firmware_version").and_then(Value::as_str)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.kind.capabilities()
    }

    /// State as last reported by the cloud, ignoring optimistic updates.
    pub fn reported_state(&self) -> Option<&str> {
        let key = self.kind.state_key()?;
        self.state.get(key).and_then(Value::as_str)
    }

    /// Current state: the optimistic transitional state while a command is
    /// pending, otherwise the reported one.
    pub fn current_state(&self) -> Option<&str> {
        match &self.transition {
            Some(t) => Some(t.command.intermediate_state()),
            None => self.reported_state(),
        }
    }

    pub fn door_state(&self) -> Option<DoorState> {
        match self.kind {
            DeviceKind::Cover => self.current_state().map(DoorState::from_myq_str),
            _ => None,
        }
    }

    pub fn lamp_state(&self) -> Option<LampState> {
        match self.kind {
            DeviceKind::Lamp => self.current_state().and_then(LampState::from_myq_str),
            _ => None,
        }
    }

    pub fn lock_state(&self) -> Option<LockState> {
        match self.kind {
            DeviceKind::Lock => self.reported_state().map(LockState::from_myq_str),
            _ => None,
        }
    }

    pub fn pending_command(&self) -> Option<Command> {
        self.transition.as_ref().map(|t| t.command)
    }

    pub(crate) fn vendor_marker(&self) -> Option<&str> {
        self.state.get("last_update").and_then(Value::as_str)
    }
}

/// Result of a successfully issued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The cloud now reports the target state.
    Confirmed,
    /// The device was already in the target state; nothing was sent.
    AlreadyInState,
    /// Accepted by the cloud; confirmation continues in the background.
    Pending,
}

/// Events emitted when the registry changes.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceDiscovered { device_id: String, kind: DeviceKind },
    DeviceRemoved { device_id: String },
    DeviceStateChanged { device_id: String, old: Option<String>, new: Option<String> },
    DeviceOnlineChanged { device_id: String, online: bool },
}
