use async_trait::async_trait;
use clawlink::{IntegrationManager, ManagerOptions};
use clawlink_core::{ClawlinkPaths, ConfigPatch, ConfigScope, FileSettingsStore, GatewayMode, RetryPolicy, SettingsStore};
use clawlink_gateway::{
    ClientError, Connector, GatewayEvent, GatewayFrame, GatewayResponse, Transport,
    TransportEvent, CHALLENGE_EVENT, CONNECT_METHOD,
};
use clawlink_supervisor::{CommandError, CommandOutput, CommandRunner, CommandSpec};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Connector whose gateway is never reachable
#[derive(Default)]
struct UnreachableConnector {
    opens: AtomicUsize,
}

#[async_trait]
impl Connector for UnreachableConnector {
    async fn open(&self, url: &str) -> Result<Transport, ClientError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Err(ClientError::Transport(format!("connection refused: {}", url)))
    }
}

/// In-memory gateway: accepts every handshake, echoes requests and pushes a
/// `tick` event before each response.
#[derive(Default)]
struct EchoConnector {
    opens: AtomicUsize,
}

#[async_trait]
impl Connector for EchoConnector {
    async fn open(&self, _url: &str) -> Result<Transport, ClientError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let send = move |frame: GatewayFrame| {
            let _ = in_tx.send(TransportEvent::Frame(serde_json::to_string(&frame).unwrap()));
        };
        send(GatewayFrame::Event(GatewayEvent::new(
            CHALLENGE_EVENT,
            json!({"nonce": "abc"}),
        )));
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                let Ok(GatewayFrame::Request(request)) = serde_json::from_str(&text) else {
                    continue;
                };
                let payload = if request.method == CONNECT_METHOD {
                    json!({"type": "hello-ok", "protocol": 3})
                } else {
                    send(GatewayFrame::Event(GatewayEvent::new("tick", json!({}))));
                    json!({"method": request.method, "params": request.params})
                };
                send(GatewayFrame::Response(GatewayResponse::ok(request.id, payload)));
            }
        });

        Ok(Transport {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

fn options(temp: &tempfile::TempDir, connector: Arc<dyn Connector>) -> ManagerOptions {
    let paths = ClawlinkPaths::new(temp.path().join("home"));
    let mut options = ManagerOptions::new(paths);
    options.connector = connector;
    options.connect_retry = RetryPolicy::fixed(1, Duration::ZERO);
    options
}

#[tokio::test(start_paused = true)]
async fn test_restart_is_debounced() {
    let temp = tempfile::tempdir().unwrap();
    let connector = Arc::new(UnreachableConnector::default());
    let manager = IntegrationManager::new(options(&temp, connector.clone()));

    assert!(manager.restart(None).await);
    assert_eq!(connector.opens.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(1000)).await;
    assert!(!manager.restart(None).await);
    assert_eq!(connector.opens.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(2500)).await;
    assert!(manager.restart(None).await);
    assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_start_gives_up_after_connect_retries() {
    let temp = tempfile::tempdir().unwrap();
    let connector = Arc::new(UnreachableConnector::default());
    let mut options = options(&temp, connector.clone());
    options.connect_retry = RetryPolicy::fixed(5, Duration::from_secs(2));
    let manager = IntegrationManager::new(options);

    let started = tokio::time::Instant::now();
    let result = manager.start(None).await;
    assert!(matches!(result, Err(ClientError::Transport(_))));
    assert_eq!(connector.opens.load(Ordering::SeqCst), 5);
    assert!(started.elapsed() >= Duration::from_secs(8));

    let status = manager.status().await;
    assert!(!status.connected);
    assert_eq!(status.state, "closed");
    assert_eq!(
        manager.send_request("health", json!({})).await,
        Err(ClientError::NotConnected)
    );
}

#[tokio::test]
async fn test_start_request_and_events() {
    let temp = tempfile::tempdir().unwrap();
    let connector = Arc::new(EchoConnector::default());
    let manager = IntegrationManager::new(options(&temp, connector.clone()));

    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    manager.subscribe("tick", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    manager.start(None).await.unwrap();
    let status = manager.status().await;
    assert!(status.connected);
    assert_eq!(status.mode, GatewayMode::External);
    assert_eq!(status.device_id, manager.device_id());
    assert!(!status.process_running);

    let echoed = manager
        .send_request("chat.send", json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(echoed, json!({"method": "chat.send", "params": {"text": "hi"}}));
    assert_eq!(ticks.load(Ordering::SeqCst), 1);

    // Subscriptions survive a reconnect
    manager.stop().await;
    assert!(!manager.status().await.connected);
    manager.start(None).await.unwrap();
    manager.send_request("health", json!({})).await.unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
    assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_set_config_persists_to_one_scope() {
    let temp = tempfile::tempdir().unwrap();
    let workspace = temp.path().join("project");
    std::fs::create_dir_all(&workspace).unwrap();
    let manager = IntegrationManager::new(options(&temp, Arc::new(UnreachableConnector::default())));
    let settings = FileSettingsStore::new(temp.path().join("home/config.yaml"));
    let override_file = ClawlinkPaths::workspace_override_file(&workspace);

    let global = ConfigPatch {
        auth_token: Some("global-token-1234".to_string()),
        ..Default::default()
    };
    manager
        .set_config(&global, ConfigScope::Global, Some(workspace.as_path()))
        .unwrap();
    assert_eq!(
        settings.load().unwrap().auth_token.as_deref(),
        Some("global-token-1234")
    );
    assert!(!override_file.exists());

    let local = ConfigPatch {
        url: Some("ws://10.0.0.5:18789".to_string()),
        ..Default::default()
    };
    let config = manager
        .set_config(&local, ConfigScope::Workspace, Some(workspace.as_path()))
        .unwrap();
    assert_eq!(config.url, "ws://10.0.0.5:18789");
    assert_eq!(config.auth_token.as_deref(), Some("global-token-1234"));
    assert!(override_file.exists());
    assert!(settings.load().unwrap().url.is_none());

    assert!(manager
        .set_config(&local, ConfigScope::Workspace, None)
        .is_err());

    let invalid = ConfigPatch {
        url: Some("http://example.com".to_string()),
        ..Default::default()
    };
    assert!(manager
        .set_config(&invalid, ConfigScope::Global, None)
        .is_err());
    assert_eq!(manager.config().url, "ws://10.0.0.5:18789");

    // A fresh load layers the workspace override on top of global settings
    let reloaded = manager.load_config(Some(workspace.as_path()));
    assert_eq!(reloaded.url, "ws://10.0.0.5:18789");
    let global_only = manager.load_config(None);
    assert_eq!(global_only.url, "ws://127.0.0.1:18789");
    assert_eq!(global_only.auth_token.as_deref(), Some("global-token-1234"));
}

#[tokio::test]
async fn test_status_redacts_token() {
    let temp = tempfile::tempdir().unwrap();
    let manager = IntegrationManager::new(options(&temp, Arc::new(UnreachableConnector::default())));
    let patch = ConfigPatch {
        auth_token: Some("supersecret-abcd".to_string()),
        ..Default::default()
    };
    manager.set_config(&patch, ConfigScope::Global, None).unwrap();

    let status = manager.status().await;
    assert_eq!(status.auth_token.as_deref(), Some("****abcd"));
    let json = serde_json::to_string(&status).unwrap();
    assert!(!json.contains("supersecret"));
    assert!(json.contains("\"deviceId\""));
}

/// Blocks the first command until released, then reports every tool missing
struct GatedRunner {
    entered: Notify,
    release: Notify,
    calls: Mutex<usize>,
}

#[async_trait]
impl CommandRunner for GatedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let first = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls == 1
        };
        if first {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Err(CommandError::NotFound {
            program: spec.program.clone(),
        })
    }
}

#[tokio::test]
async fn test_only_one_install_at_a_time() {
    let temp = tempfile::tempdir().unwrap();
    let runner = Arc::new(GatedRunner {
        entered: Notify::new(),
        release: Notify::new(),
        calls: Mutex::new(0),
    });
    let mut options = options(&temp, Arc::new(UnreachableConnector::default()));
    options.runner = runner.clone();
    let manager = Arc::new(IntegrationManager::new(options));

    let first = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.install(|_| {}).await })
    };
    runner.entered.notified().await;

    let second = manager.install(|_| {}).await;
    assert!(!second.success);
    assert_eq!(
        second.error.as_deref(),
        Some("an install is already in progress")
    );

    runner.release.notify_one();
    let first = first.await.unwrap();
    assert!(!first.success);
    assert_eq!(
        first.error.as_deref(),
        Some("Node.js 22+ is required but was not found")
    );

    // The lock is released once the first install finishes
    let third = manager.install(|_| {}).await;
    assert_eq!(
        third.error.as_deref(),
        Some("Node.js 22+ is required but was not found")
    );
}

#[tokio::test]
async fn test_check_prerequisites_reports_missing_tools() {
    let temp = tempfile::tempdir().unwrap();
    let runner = Arc::new(GatedRunner {
        entered: Notify::new(),
        release: Notify::new(),
        calls: Mutex::new(1),
    });
    let mut options = options(&temp, Arc::new(UnreachableConnector::default()));
    options.runner = runner;
    let report = IntegrationManager::new(options).check_prerequisites().await;
    assert!(!report.ready);
    assert!(report.node.is_none());
    assert!(!report.node_ok);
}
