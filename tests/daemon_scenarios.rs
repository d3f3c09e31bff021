//! End-to-end scenarios for the configuration daemon.
//!
//! The first group drives the core loop directly with an in-process peer and
//! explicit instants. The second group runs the real socket server and
//! client, including a daemon restart with a live listener endpoint.

use std::path::Path;
use std::time::{Duration, Instant};

use settingsd::config::DaemonSettings;
use settingsd::daemon::client::{DaemonClient, ListenerEndpoint, ListenerEvent};
use settingsd::daemon::database::DatabaseSignature;
use settingsd::daemon::event_loop::{EventLoop, ExitReason};
use settingsd::daemon::listeners::ConnectionId;
use settingsd::daemon::peer::LocalConnector;
use settingsd::daemon::protocol::{DaemonRequest, DaemonResponse};
use settingsd::daemon::registry::DaemonRegistry;
use settingsd::daemon::server::DaemonServer;
use settingsd::Value;
use tempfile::TempDir;

fn settings(state_dir: &Path, sources: &[String]) -> DaemonSettings {
    let mut settings = DaemonSettings::with_state_dir(state_dir.to_path_buf());
    settings.default_sources = sources.to_vec();
    settings
}

fn core_loop(dir: &TempDir, connector: &LocalConnector, now: Instant) -> EventLoop {
    let registry = DaemonRegistry::new(
        settings(dir.path(), &["mem:readwrite:default".to_string()]),
        Box::new(connector.clone()),
    )
    .unwrap();
    EventLoop::new(registry, now)
}

fn set(key: &str, value: i64) -> DaemonRequest {
    DaemonRequest::Set {
        database: None,
        key: key.to_string(),
        value: Value::Int(value),
    }
}

// ============================================================================
// Core loop scenarios
// ============================================================================

#[test]
fn test_add_set_remove_scenario() {
    let dir = TempDir::new().unwrap();
    let connector = LocalConnector::new();
    let peer1 = connector.endpoint("peer1");
    let now = Instant::now();
    let mut lp = core_loop(&dir, &connector, now);

    let response = lp.handle_request(
        DaemonRequest::AddListener {
            database: None,
            location: "/apps/x".to_string(),
            peer: peer1.token().clone(),
            name: None,
        },
        now,
    );
    let id = match response {
        DaemonResponse::ListenerAdded { connection_id } => connection_id,
        other => panic!("unexpected response: {:?}", other),
    };
    assert_eq!(id, ConnectionId(1));

    lp.handle_request(set("/apps/x/y", 42), now);
    let notifications = peer1.take_notifications();
    assert_eq!(notifications.len(), 1);
    let n = &notifications[0];
    assert_eq!(n.connection_id, ConnectionId(1));
    assert_eq!(n.key, "/apps/x/y");
    assert_eq!(n.value, Some(Value::Int(42)));
    assert!(!n.is_default);
    assert!(n.is_writable);

    let response = lp.handle_request(
        DaemonRequest::RemoveListener {
            database: None,
            connection_id: id,
        },
        now,
    );
    assert!(matches!(
        response,
        DaemonResponse::ListenerRemoved { removed: true }
    ));

    lp.handle_request(set("/apps/x/y", 43), now);
    assert!(peer1.take_notifications().is_empty());
}

#[test]
fn test_unset_without_override_is_silent_success() {
    let dir = TempDir::new().unwrap();
    let connector = LocalConnector::new();
    let peer = connector.endpoint("peer");
    let now = Instant::now();
    let mut lp = core_loop(&dir, &connector, now);

    lp.handle_request(
        DaemonRequest::AddListener {
            database: None,
            location: "/apps".to_string(),
            peer: peer.token().clone(),
            name: None,
        },
        now,
    );

    let response = lp.handle_request(
        DaemonRequest::Unset {
            database: None,
            key: "/apps/x/y".to_string(),
            locale: None,
        },
        now,
    );
    assert!(matches!(response, DaemonResponse::Done));
    assert!(peer.take_notifications().is_empty());
}

#[test]
fn test_burst_of_sets_syncs_once() {
    let dir = TempDir::new().unwrap();
    let connector = LocalConnector::new();
    let base = Instant::now();
    let mut lp = core_loop(&dir, &connector, base);

    for i in 0..20 {
        let at = base + Duration::from_millis(100 * i);
        lp.handle_request(set("/apps/counter", i as i64), at);
        assert!(!lp.fire_next(at));
    }

    let sync_count = |lp: &EventLoop| {
        lp.registry()
            .database(&DatabaseSignature::default_database())
            .map(|db| db.sync_count())
            .unwrap_or_default()
    };
    assert_eq!(sync_count(&lp), 0);

    let fired_at = base + Duration::from_secs(5);
    assert!(lp.fire_next(fired_at));
    assert_eq!(sync_count(&lp), 1);
    assert!(!lp.fire_next(fired_at + Duration::from_secs(10)));
    assert_eq!(sync_count(&lp), 1);
}

#[test]
fn test_idle_daemon_exits_at_cleanup() {
    let dir = TempDir::new().unwrap();
    let connector = LocalConnector::new();
    let base = Instant::now();
    let mut lp = core_loop(&dir, &connector, base);

    lp.handle_request(set("/a", 1), base);
    while lp.exit_reason().is_none() {
        assert!(lp.fire_next(base + Duration::from_secs(60)));
    }
    assert_eq!(lp.exit_reason(), Some(ExitReason::Idle));
}

// ============================================================================
// Socket scenarios
// ============================================================================

async fn start_daemon(dir: &TempDir) -> settingsd::daemon::server::DaemonHandle {
    let source = format!("json:readwrite:{}", dir.path().join("user.json").display());
    let server = DaemonServer::with_paths(
        dir.path().join("daemon.sock"),
        dir.path().join("daemon.pid"),
        settings(&dir.path().join("state"), &[source]),
    )
    .expect("Failed to create server");
    server.run().await.expect("Failed to start server")
}

#[tokio::test]
async fn test_values_survive_daemon_restart() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("daemon.sock");

    let handle = start_daemon(&dir).await;
    let mut client = DaemonClient::connect_to(socket.clone()).await.unwrap();
    client
        .set("/apps/editor/tab_width", Value::Int(4))
        .await
        .unwrap();
    client.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("daemon did not stop");

    let handle = start_daemon(&dir).await;
    let mut client = DaemonClient::connect_to(socket).await.unwrap();
    let found = client.get("/apps/editor/tab_width", None).await.unwrap();
    assert_eq!(found.value, Some(Value::Int(4)));

    handle.shutdown();
}

#[tokio::test]
async fn test_listener_endpoint_follows_daemon_restart() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("daemon.sock");
    let (endpoint, mut events) = ListenerEndpoint::bind(&dir.path().join("peers")).unwrap();

    let handle = start_daemon(&dir).await;
    let mut client = DaemonClient::connect_to(socket.clone()).await.unwrap();
    let old_id = client
        .add_listener("/apps", endpoint.token().clone(), None)
        .await
        .unwrap();
    client.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("daemon did not stop");

    let handle = start_daemon(&dir).await;
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    let new_id = match event {
        ListenerEvent::Remapped(update) => {
            assert_eq!(update.old_id, old_id);
            update.new_id
        }
        other => panic!("unexpected event: {:?}", other),
    };
    assert_ne!(new_id, old_id);
    assert_eq!(
        endpoint.current_id(&DatabaseSignature::default_database(), old_id),
        new_id
    );

    let mut client = DaemonClient::connect_to(socket).await.unwrap();
    client.set("/apps/x", Value::Int(1)).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        ListenerEvent::Notified(n) => assert_eq!(n.connection_id, new_id),
        other => panic!("unexpected event: {:?}", other),
    }

    handle.shutdown();
}
