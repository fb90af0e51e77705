#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use myq_cloud::{CommandPolicy, Event, MyQClient, MyQClientBuilder, RetryPolicy};
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ACCOUNT: &str = "acct-1";
pub const GATEWAY: &str = "GW0001";
pub const DOOR: &str = "CG0001";
pub const LAMP: &str = "LP0001";

pub const STATE_PATH: &str = "/accounts/acct-1/devices/state";
pub const DEVICES_PATH: &str = "/accounts/acct-1/devices";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        jitter: false,
    }
}

pub fn fast_commands() -> CommandPolicy {
    CommandPolicy {
        poll_interval: Duration::from_millis(40),
        confirm_timeout: Duration::from_millis(400),
    }
}

pub fn builder(server: &MockServer) -> MyQClientBuilder {
    MyQClient::builder("owner@example.com", "hunter2")
        .base_url(server.uri())
        .retry_policy(fast_retry())
        .command_policy(fast_commands())
}

/// Collects every event the client emits.
pub fn recorder(builder: MyQClientBuilder) -> (MyQClientBuilder, Arc<Mutex<Vec<Event>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let builder = builder.on_event(move |e| sink.lock().unwrap().push(e.clone()));
    (builder, events)
}

pub fn grant(token: &str, refresh: Option<&str>) -> Value {
    json!({
        "access_token": token,
        "token_type": "Bearer",
        "expires_in": 3600,
        "refresh_token": refresh,
    })
}

pub fn door_state(door: &str, marker: &str, close_allowed: bool) -> Value {
    json!({
        "door_state": door,
        "online": true,
        "is_unattended_open_allowed": true,
        "is_unattended_close_allowed": close_allowed,
        "last_update": marker,
    })
}

pub fn lamp_state(lamp: &str, marker: &str) -> Value {
    json!({
        "lamp_state": lamp,
        "online": true,
        "last_update": marker,
    })
}

pub fn devices_body(close_allowed: bool) -> Value {
    json!({
        "count": 3,
        "items": [
            {
                "serial_number": GATEWAY,
                "name": "Hub",
                "device_family": "gateway",
                "device_type": "hub",
                "state": { "online": true, "firmware_version": "4.1" }
            },
            {
                "serial_number": DOOR,
                "name": "Garage Door",
                "device_family": "garagedoor",
                "device_type": "virtualgaragedooropener",
                "parent_device_id": GATEWAY,
                "state": door_state("closed", "t0", close_allowed)
            },
            {
                "serial_number": LAMP,
                "name": "Porch Light",
                "device_family": "lamp",
                "device_type": "lamp",
                "parent_device_id": GATEWAY,
                "state": lamp_state("off", "t0")
            }
        ]
    })
}

pub fn states_body(door: Value, lamp: Value) -> Value {
    json!({
        "items": [
            { "serial_number": DOOR, "state": door },
            { "serial_number": LAMP, "state": lamp }
        ]
    })
}

pub async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_partial_json(json!({ "grant_type": "password" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(grant("token-1", None)))
        .mount(server)
        .await;
}

pub async fn mount_topology(server: &MockServer, close_allowed: bool) {
    Mock::given(method("GET"))
        .and(path("/accounts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accounts": [{ "id": ACCOUNT, "name": "Home" }]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(DEVICES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(devices_body(close_allowed)))
        .mount(server)
        .await;
}

/// State served to the first `times` refreshes, ahead of any default mock.
pub async fn mount_state_first(server: &MockServer, body: Value, times: u64) {
    Mock::given(method("GET"))
        .and(path(STATE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .up_to_n_times(times)
        .with_priority(1)
        .mount(server)
        .await;
}

pub async fn mount_state(server: &MockServer, body: Value) {
    Mock::given(method("GET"))
        .and(path(STATE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Login, topology and a closed door with the lamp off.
pub async fn mount_home(server: &MockServer) {
    mount_login(server).await;
    mount_topology(server, true).await;
}

pub fn closed_home() -> Value {
    states_body(door_state("closed", "t0", true), lamp_state("off", "t0"))
}
