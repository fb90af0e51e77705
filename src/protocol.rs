use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::types::Command;
use crate::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.myq-cloud.com/api/v6";

pub const LOGIN_PATH: &str = "/login";
pub const ACCOUNTS_PATH: &str = "/accounts";

/// Minimum token lifetime trusted from a grant, in seconds.
pub const MIN_TOKEN_LIFETIME_SECS: i64 = 20 * 60;
/// Longer grants are cut down to this, in seconds.
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 30 * 24 * 60 * 60;

pub fn devices_path(account_id: &str) -> String {
    format!("/accounts/{account_id}/devices")
}

pub fn device_state_path(account_id: &str) -> String {
    format!("/accounts/{account_id}/devices/state")
}

pub fn actions_path(device_id: &str) -> String {
    format!("/devices/{device_id}/actions")
}

pub fn password_grant(username: &str, password: &SecretString, brand: Option<&str>) -> Value {
    json!({
        "grant_type": "password",
        "username": username,
        "password": password.expose_secret(),
        "brand": brand,
    })
}

pub fn refresh_grant(refresh_token: &str) -> Value {
    json!({
        "grant_type": "refresh_token",
        "refresh_token": refresh_token,
    })
}

pub fn action_body(command: Command) -> Value {
    json!({ "action": command.as_action_str() })
}

/// Copy of a request body safe to write to logs.
pub fn redacted(body: &Value) -> Value {
    let mut copy = body.clone();
    if let Some(obj) = copy.as_object_mut() {
        for key in ["password", "refresh_token"] {
            if obj.contains_key(key) {
                obj.insert(key.to_string(), Value::String("***".into()));
            }
        }
    }
    copy
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<Value>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenGrant {
    /// Lifetime in seconds, clamped to the trusted range. Missing or
    /// unparseable values fall back to the minimum lifetime.
    pub fn lifetime_secs(&self) -> i64 {
        let parsed = match &self.expires_in {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        parsed
            .unwrap_or(MIN_TOKEN_LIFETIME_SECS)
            .clamp(MIN_TOKEN_LIFETIME_SECS, MAX_TOKEN_LIFETIME_SECS)
    }

    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountRecord {
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRecord {
    pub serial_number: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub device_family: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub device_platform: Option<String>,
    #[serde(default)]
    pub parent_device_id: Option<String>,
    #[serde(default)]
    pub state: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceStateRecord {
    pub serial_number: Option<String>,
    #[serde(default)]
    pub state: Map<String, Value>,
}

pub fn parse_grant(body: &Value) -> Result<TokenGrant> {
    Ok(TokenGrant::deserialize(body)?)
}

pub fn parse_accounts(body: &Value) -> Result<Vec<AccountRecord>> {
    list_field(body, "accounts")
}

pub fn parse_devices(body: &Value) -> Result<Vec<DeviceRecord>> {
    list_field(body, "items")
}

pub fn parse_states(body: &Value) -> Result<Vec<DeviceStateRecord>> {
    list_field(body, "items")
}

fn list_field<T: for<'de> Deserialize<'de>>(body: &Value, field: &str) -> Result<Vec<T>> {
    match body {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => match map.get(field) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(list @ Value::Array(_)) => Ok(Vec::<T>::deserialize(list)?),
            Some(other) => Err(Error::Protocol(format!(
                "expected array in `{field}`, got {other}"
            ))),
        },
        other => Err(Error::Protocol(format!("expected object, got {other}"))),
    }
}
