mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures_util::future::join_all;
use myq_cloud::{
    DeviceKind, DoorState, Error, Event, LampState, LockState, MessageLogMode, MyQClient, SyncPolicy,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn logged_in(server: &MockServer) -> MyQClient {
    mount_home(server).await;
    mount_state(server, closed_home()).await;
    MyQClient::login(builder(server)).await.expect("login should succeed")
}

#[tokio::test]
async fn login_discovers_accounts_and_devices() {
    init_tracing();
    let server = MockServer::start().await;
    let client = logged_in(&server).await;

    let accounts = client.accounts();
    assert_eq!(accounts.len(), 1);
    let account = client.account(ACCOUNT).unwrap();
    assert_eq!(account.name, "Home");
    assert_eq!(account.device_ids, vec![GATEWAY, DOOR, LAMP]);
    assert!(account.last_state_update.is_some());

    assert_eq!(client.covers().len(), 1);
    assert_eq!(client.lamps().len(), 1);
    assert_eq!(client.gateways().len(), 1);
    assert!(client.locks().is_empty());

    let door = client.device(DOOR).unwrap();
    assert_eq!(door.kind, DeviceKind::Cover);
    assert_eq!(door.parent_id.as_deref(), Some(GATEWAY));
    assert_eq!(door.door_state(), Some(DoorState::Closed));
    assert!(door.online());
    assert!(door.open_allowed());

    let lamp = client.device(LAMP).unwrap();
    assert_eq!(lamp.lamp_state(), Some(LampState::Off));
    assert!(!lamp.open_allowed());

    let gateway = client.device(GATEWAY).unwrap();
    assert_eq!(gateway.parent_id, None);
    assert_eq!(gateway.firmware_version(), Some("4.1"));
}

#[tokio::test]
async fn requests_carry_bearer_token() {
    let server = MockServer::start().await;
    mount_home(&server).await;
    Mock::given(method("GET"))
        .and(path(STATE_PATH))
        .and(header("Authorization", "Bearer token-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(closed_home()))
        .expect(1)
        .mount(&server)
        .await;

    MyQClient::login(builder(&server)).await.expect("login should succeed");
}

#[tokio::test]
async fn unknown_lookups_fail() {
    let server = MockServer::start().await;
    let client = logged_in(&server).await;

    assert!(matches!(client.device("nope"), Err(Error::DeviceNotFound(id)) if id == "nope"));
    assert!(matches!(client.account("nope"), Err(Error::AccountNotFound(_))));
    assert!(matches!(
        client.update_account("nope", true).await,
        Err(Error::AccountNotFound(_))
    ));
}

#[tokio::test]
async fn update_within_interval_is_skipped() {
    let server = MockServer::start().await;
    mount_home(&server).await;
    Mock::given(method("GET"))
        .and(path(STATE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(closed_home()))
        .expect(1)
        .mount(&server)
        .await;
    let client = MyQClient::login(builder(&server)).await.unwrap();

    let before = client.snapshot();
    client.update_account(ACCOUNT, false).await.unwrap();
    client.update(DOOR).await.unwrap();
    let after = client.snapshot();
    assert!(Arc::ptr_eq(&before, &after), "skipped update must not touch the cache");
}

#[tokio::test]
async fn forced_update_bypasses_interval() {
    let server = MockServer::start().await;
    mount_home(&server).await;
    mount_state_first(&server, closed_home(), 1).await;
    mount_state(
        &server,
        states_body(door_state("open", "t1", true), lamp_state("on", "t1")),
    )
    .await;
    let client = MyQClient::login(builder(&server)).await.unwrap();
    let first = client.last_state_update().unwrap();

    client.update_account(ACCOUNT, true).await.unwrap();

    assert_eq!(client.device(DOOR).unwrap().door_state(), Some(DoorState::Open));
    assert_eq!(client.device(LAMP).unwrap().lamp_state(), Some(LampState::On));
    assert!(client.last_state_update().unwrap() >= first);
}

#[tokio::test]
async fn concurrent_updates_share_one_request() {
    let server = MockServer::start().await;
    mount_home(&server).await;
    Mock::given(method("GET"))
        .and(path(STATE_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(closed_home())
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = builder(&server).build().unwrap();
    client.authenticate().await.unwrap();
    client.discover().await.unwrap();

    let snapshots = join_all((0..5).map(|_| {
        let client = client.clone();
        async move {
            client.update_account(ACCOUNT, false).await.unwrap();
            client.snapshot()
        }
    }))
    .await;

    for s in &snapshots[1..] {
        assert!(Arc::ptr_eq(&snapshots[0], s));
    }
    assert!(client.last_state_update().is_some());
}

#[tokio::test]
async fn expired_token_is_refreshed_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_partial_json(json!({ "grant_type": "password" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(grant("token-1", Some("refresh-1"))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_partial_json(json!({
            "grant_type": "refresh_token",
            "refresh_token": "refresh-1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(grant("token-2", Some("refresh-2"))))
        .expect(1)
        .mount(&server)
        .await;
    mount_topology(&server, true).await;
    mount_state_first(&server, closed_home(), 1).await;
    Mock::given(method("GET"))
        .and(path(STATE_PATH))
        .and(header("Authorization", "Bearer token-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STATE_PATH))
        .and(header("Authorization", "Bearer token-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(closed_home()))
        .expect(1)
        .mount(&server)
        .await;

    let client = MyQClient::login(builder(&server)).await.unwrap();
    client.update_account(ACCOUNT, true).await.expect("update should recover");
}

#[tokio::test]
async fn failed_refresh_falls_back_to_password_login() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_partial_json(json!({ "grant_type": "password" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(grant("token-1", Some("refresh-1"))))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_partial_json(json!({ "grant_type": "refresh_token" })))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .expect(1)
        .mount(&server)
        .await;
    mount_topology(&server, true).await;
    mount_state_first(&server, closed_home(), 1).await;
    Mock::given(method("GET"))
        .and(path(STATE_PATH))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;
    mount_state(&server, closed_home()).await;

    let client = MyQClient::login(builder(&server)).await.unwrap();
    client.update_account(ACCOUNT, true).await.expect("update should recover");
}

#[tokio::test]
async fn second_rejection_after_refresh_is_an_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(grant("token-1", None)))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/accounts"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let client = builder(&server).build().unwrap();
    client.authenticate().await.unwrap();
    let err = client.discover().await.unwrap_err();
    assert!(matches!(err, Error::Authentication { .. }), "got {err:?}");
}

#[tokio::test]
async fn rejected_credentials_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad password"))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(grant("token-1", None)))
        .expect(1)
        .mount(&server)
        .await;

    let client = builder(&server).build().unwrap();
    let err = client.authenticate().await.unwrap_err();
    assert!(matches!(err, Error::Authentication { ref reason } if reason == "bad password"));
    assert!(err.is_credentials_problem());

    assert!(matches!(client.authenticate().await, Err(Error::InvalidCredentials)));
    assert!(matches!(client.discover().await, Err(Error::InvalidCredentials)));

    client.set_password("correct horse");
    client.authenticate().await.expect("new password should be tried");
}

#[tokio::test]
async fn username_can_be_changed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_partial_json(json!({ "username": "second@example.com" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(grant("token-2", None)))
        .expect(1)
        .mount(&server)
        .await;

    let client = builder(&server).build().unwrap();
    assert_eq!(client.username(), "owner@example.com");
    client.set_username("second@example.com");
    assert_eq!(client.username(), "second@example.com");
    client.authenticate().await.unwrap();
}

#[tokio::test]
async fn rate_limit_exhaustion_keeps_cache() {
    let server = MockServer::start().await;
    mount_home(&server).await;
    mount_state_first(&server, closed_home(), 1).await;
    Mock::given(method("GET"))
        .and(path(STATE_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .expect(3)
        .mount(&server)
        .await;
    let client = MyQClient::login(builder(&server)).await.unwrap();
    let before = client.snapshot();

    let err = client.update_account(ACCOUNT, true).await.unwrap_err();
    assert!(
        matches!(err, Error::ServiceUnavailable { attempts: 3, last_status: Some(429) }),
        "got {err:?}"
    );
    assert!(Arc::ptr_eq(&before, &client.snapshot()));
    assert_eq!(client.device(DOOR).unwrap().door_state(), Some(DoorState::Closed));
}

#[tokio::test]
async fn transient_server_error_is_retried() {
    let server = MockServer::start().await;
    mount_home(&server).await;
    Mock::given(method("GET"))
        .and(path(STATE_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STATE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(closed_home()))
        .expect(1)
        .mount(&server)
        .await;

    MyQClient::login(builder(&server)).await.expect("503 should be retried");
}

#[tokio::test]
async fn permanent_error_is_not_retried() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/accounts"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such endpoint"))
        .expect(1)
        .mount(&server)
        .await;

    let err = MyQClient::login(builder(&server)).await.unwrap_err();
    assert!(matches!(err, Error::Permanent { status: 404, .. }), "got {err:?}");
}

#[tokio::test]
async fn malformed_state_is_a_sync_error() {
    let server = MockServer::start().await;
    mount_home(&server).await;
    mount_state(&server, json!({ "items": "not a list" })).await;

    let err = MyQClient::login(builder(&server)).await.unwrap_err();
    assert!(matches!(err, Error::Sync { ref account_id, .. } if account_id == ACCOUNT), "got {err:?}");
}

#[tokio::test]
async fn rediscovery_reports_added_and_removed_devices() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/accounts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accounts": [{ "id": ACCOUNT, "name": "Home" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(DEVICES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(devices_body(true)))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(DEVICES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {
                    "serial_number": DOOR,
                    "name": "Garage Door",
                    "device_family": "garagedoor",
                    "state": door_state("closed", "t0", true)
                },
                {
                    "serial_number": "LK0001",
                    "name": "Front Door",
                    "device_family": "locks",
                    "state": { "lock_state": "locked", "dps_low_battery_mode": true }
                }
            ]
        })))
        .mount(&server)
        .await;
    mount_state(&server, closed_home()).await;

    let (b, events) = recorder(builder(&server));
    let client = MyQClient::login(b).await.unwrap();
    events.lock().unwrap().clear();

    client.discover().await.unwrap();

    let events = events.lock().unwrap().clone();
    assert!(events.contains(&Event::DeviceRemoved {
        device_id: GATEWAY.into()
    }));
    assert!(events.contains(&Event::DeviceRemoved { device_id: LAMP.into() }));
    assert!(events.contains(&Event::DeviceDiscovered {
        device_id: "LK0001".into(),
        kind: DeviceKind::Lock,
    }));
    assert_eq!(client.locks().len(), 1);
    let lock = client.device("LK0001").unwrap();
    assert_eq!(lock.lock_state(), Some(LockState::Locked));
    assert!(lock.low_battery());
    assert!(matches!(client.device(LAMP), Err(Error::DeviceNotFound(_))));
    let door = client.device(DOOR).unwrap();
    assert_eq!(door.parent_id, None);
    assert_eq!(door.door_state(), Some(DoorState::Closed));
}

#[tokio::test]
async fn message_log_redacts_secrets() {
    let server = MockServer::start().await;
    mount_home(&server).await;
    mount_state(&server, closed_home()).await;
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("wire.ndjson");

    let client = MyQClient::login(
        builder(&server).message_log(MessageLogMode::Full, log_path.to_string_lossy()),
    )
    .await
    .unwrap();
    drop(client);

    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(!contents.contains("hunter2"));
    assert!(!contents.contains("token-1"));
    let lines: Vec<serde_json::Value> = contents
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(lines.iter().any(|l| l["path"] == "/login" && l["body"]["password"] == "***"));
    assert!(lines.iter().any(|l| l["path"] == STATE_PATH && l["dir"] == "resp"));
}

fn short_interval() -> SyncPolicy {
    SyncPolicy {
        min_refresh_interval: Duration::from_millis(300),
    }
}

#[tokio::test]
async fn empty_state_payload_still_starts_throttle_window() {
    let server = MockServer::start().await;
    mount_home(&server).await;
    Mock::given(method("GET"))
        .and(path(STATE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let client = builder(&server).sync_policy(short_interval()).build().unwrap();
    client.authenticate().await.unwrap();
    client.discover().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    client.update_account(ACCOUNT, false).await.unwrap();
    let refreshed = client.account(ACCOUNT).unwrap().last_state_update.unwrap();
    client.update_account(ACCOUNT, false).await.unwrap();

    assert!(client.device(DOOR).unwrap().state_update.unwrap() >= refreshed);
}

#[tokio::test]
async fn oversized_token_lifetime_is_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "token-1",
            "token_type": "Bearer",
            "expires_in": 9e15
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_topology(&server, true).await;
    mount_state(&server, closed_home()).await;

    let client = builder(&server).build().unwrap();
    client.authenticate().await.expect("long-lived grant should be usable");
    client.update_device_info().await.unwrap();
    assert_eq!(client.covers().len(), 1);
}

#[tokio::test]
async fn update_device_info_picks_up_new_devices() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/accounts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accounts": [{ "id": ACCOUNT, "name": "Home" }]
        })))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(DEVICES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(devices_body(true)))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    let mut grown = devices_body(true);
    grown["items"].as_array_mut().unwrap().push(json!({
        "serial_number": "LK0001",
        "name": "Front Door",
        "device_family": "locks",
        "state": { "lock_state": "unlocked" }
    }));
    Mock::given(method("GET"))
        .and(path(DEVICES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(grown))
        .mount(&server)
        .await;
    mount_state(&server, closed_home()).await;

    let client = MyQClient::login(builder(&server).sync_policy(short_interval()))
        .await
        .unwrap();
    assert!(client.locks().is_empty());

    // inside the interval: no second topology read
    client.update_device_info().await.unwrap();
    assert!(client.locks().is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;
    client.update_device_info().await.unwrap();
    let lock = client.device("LK0001").unwrap();
    assert_eq!(lock.lock_state(), Some(LockState::Unlocked));
}

#[tokio::test]
async fn unusable_refresh_margin_is_a_config_error() {
    let server = MockServer::start().await;
    let err = builder(&server)
        .token_refresh_margin(Duration::MAX)
        .build()
        .err()
        .expect("margin beyond the representable range must be rejected");
    assert!(matches!(err, Error::Config(_)), "got {err:?}");
}
