// Integration Manager
//
// Facade owning the live connection config and composing the gateway client,
// the process supervisor and the installer.

use clawlink_core::config::{
    redact_token, save_workspace_override, DEFAULT_GATEWAY_PORT,
};
use clawlink_core::{
    retry, ClawlinkError, ClawlinkPaths, ConfigLoader, ConfigPatch, ConfigScope, ConfigValidator,
    ConnectionConfig, FileSettingsStore, GatewayMode, RetryPolicy, SettingsStore,
};
use clawlink_gateway::{
    ClientError, ClientOptions, Connector, DeviceAuthStore, DeviceIdentity, EventSubscribers,
    GatewayClient, SubscriptionId, WebSocketConnector,
};
use clawlink_supervisor::installer::MIN_NODE_MAJOR;
use clawlink_supervisor::{
    check_prerequisites, CommandRunner, HttpHealthProbe, InstallProgress, Installer,
    InstallerOptions, LaunchSpec, PrerequisiteReport, Supervisor, SystemCommandRunner,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Initial connect: 5 attempts, 2 s apart
pub const CONNECT_RETRY: RetryPolicy = RetryPolicy::fixed(5, Duration::from_secs(2));
pub const RESTART_DEBOUNCE: Duration = Duration::from_millis(3000);

pub struct ManagerOptions {
    pub paths: ClawlinkPaths,
    /// Global settings; `None` keeps `Global` updates in memory only
    pub settings: Option<Arc<dyn SettingsStore>>,
    pub connector: Arc<dyn Connector>,
    pub runner: Arc<dyn CommandRunner>,
    pub connect_retry: RetryPolicy,
    pub restart_debounce: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
}

impl ManagerOptions {
    pub fn new(paths: ClawlinkPaths) -> Self {
        let settings: Arc<dyn SettingsStore> =
            Arc::new(FileSettingsStore::new(paths.settings_file()));
        Self {
            paths,
            settings: Some(settings),
            connector: Arc::new(WebSocketConnector),
            runner: Arc::new(SystemCommandRunner),
            connect_retry: CONNECT_RETRY,
            restart_debounce: RESTART_DEBOUNCE,
            handshake_timeout: clawlink_gateway::client::DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: clawlink_gateway::client::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::new(ClawlinkPaths::default())
    }
}

/// Snapshot reported by [`IntegrationManager::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub mode: GatewayMode,
    pub url: String,
    pub path: Option<PathBuf>,
    pub connected: bool,
    pub state: String,
    /// Redacted to the last 4 characters
    pub auth_token: Option<String>,
    pub device_id: String,
    pub process_running: bool,
    pub process_pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstallOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

struct InstallGuard<'a>(&'a AtomicBool);

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct IntegrationManager {
    options: ManagerOptions,
    identity: Arc<DeviceIdentity>,
    tokens: Arc<DeviceAuthStore>,
    events: Arc<EventSubscribers>,
    supervisor: Arc<Supervisor>,
    config: Mutex<ConnectionConfig>,
    client: Mutex<Option<GatewayClient>>,
    last_restart: Mutex<Option<Instant>>,
    installing: AtomicBool,
    /// Serializes start, stop and install
    lifecycle: tokio::sync::Mutex<()>,
}

impl IntegrationManager {
    pub fn new(options: ManagerOptions) -> Self {
        let identity = Arc::new(DeviceIdentity::load_or_create(
            &options.paths.device_identity_file(),
        ));
        let tokens = Arc::new(DeviceAuthStore::new(options.paths.device_auth_file()));
        let config = ConfigLoader::load(options.settings.as_deref(), None);
        Self {
            options,
            identity,
            tokens,
            events: Arc::new(EventSubscribers::new()),
            supervisor: Arc::new(Supervisor::new()),
            config: Mutex::new(config),
            client: Mutex::new(None),
            last_restart: Mutex::new(None),
            installing: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &ClawlinkPaths {
        &self.options.paths
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    /// Live config
    pub fn config(&self) -> ConnectionConfig {
        self.lock_config().clone()
    }

    /// Reload the live config from its layers
    pub fn load_config(&self, workspace_dir: Option<&Path>) -> ConnectionConfig {
        let config = ConfigLoader::load(self.options.settings.as_deref(), workspace_dir);
        *self.lock_config() = config.clone();
        config
    }

    /// Load config, run the local gateway in integrated mode, then connect.
    ///
    /// Connect failures are retried per the connect policy; on exhaustion the
    /// manager stays usable and reports `connected: false`.
    pub async fn start(&self, workspace_dir: Option<&Path>) -> Result<(), ClientError> {
        let _lifecycle = self.lifecycle.lock().await;
        let config = self.load_config(workspace_dir);
        if let Err(e) = ConfigValidator::validate(&config) {
            warn!("Not starting, invalid gateway config: {}", e);
            return Err(ClientError::Transport(e.to_string()));
        }

        if config.mode == GatewayMode::Integrated {
            let spec = LaunchSpec::new(
                config.checkout_path(&self.options.paths),
                &self.options.paths,
                DEFAULT_GATEWAY_PORT,
                config.auth_token.clone(),
            );
            if let Err(e) = self.supervisor.spawn(&spec).await {
                warn!("Failed to start local gateway: {}", e);
            }
        }

        self.connect_client(&config).await
    }

    async fn connect_client(&self, config: &ConnectionConfig) -> Result<(), ClientError> {
        let client = self.replace_client(config);
        let result = retry(&self.options.connect_retry, |attempt| {
            let client = client.clone();
            async move {
                client.connect().await.inspect_err(|e| {
                    warn!("Gateway connect attempt {} failed: {}", attempt, e);
                })
            }
        })
        .await;

        match &result {
            Ok(()) => info!("Gateway integration connected to {}", config.url),
            Err(e) => warn!(
                "Giving up on gateway at {} after {} attempts: {}",
                config.url, self.options.connect_retry.attempts, e
            ),
        }
        result
    }

    fn replace_client(&self, config: &ConnectionConfig) -> GatewayClient {
        let mut options =
            ClientOptions::new(config.url.clone()).with_token(config.auth_token.clone());
        options.handshake_timeout = self.options.handshake_timeout;
        options.request_timeout = self.options.request_timeout;

        let client = GatewayClient::new(
            options,
            Arc::clone(&self.identity),
            Arc::clone(&self.tokens),
            Arc::clone(&self.options.connector),
            Arc::clone(&self.events),
        );
        let previous = self.lock_client().replace(client.clone());
        if let Some(previous) = previous {
            previous.disconnect();
        }
        client
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: JsonValue,
    ) -> Result<JsonValue, ClientError> {
        let client = self.lock_client().clone();
        match client {
            Some(client) => client.send_request(method, params).await,
            None => Err(ClientError::NotConnected),
        }
    }

    /// Register a push-event handler; it stays registered across reconnects
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&str, &JsonValue) + Send + Sync + 'static,
    {
        self.events.subscribe(event, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub async fn status(&self) -> GatewayStatus {
        let config = self.config();
        let client = self.lock_client().clone();
        let state = client
            .as_ref()
            .map(|c| c.state().to_string())
            .unwrap_or_else(|| "idle".to_string());
        GatewayStatus {
            mode: config.mode,
            url: config.url,
            path: config.path,
            connected: client.as_ref().is_some_and(GatewayClient::is_connected),
            state,
            auth_token: config.auth_token.as_deref().map(redact_token),
            device_id: self.identity.device_id().to_string(),
            process_running: self.supervisor.is_running().await,
            process_pid: self.supervisor.pid().await,
        }
    }

    /// Merge `patch` into the live config and persist it to exactly one place
    pub fn set_config(
        &self,
        patch: &ConfigPatch,
        scope: ConfigScope,
        workspace_dir: Option<&Path>,
    ) -> Result<ConnectionConfig, ClawlinkError> {
        let mut candidate = self.config();
        candidate.apply(patch);
        ConfigValidator::validate(&candidate)?;

        match scope {
            ConfigScope::Global => match &self.options.settings {
                Some(store) => store.save(patch)?,
                None => debug!("No settings store, keeping update in memory"),
            },
            ConfigScope::Workspace => {
                let dir = workspace_dir
                    .ok_or_else(|| ClawlinkError::workspace_required("set_config"))?;
                save_workspace_override(dir, patch)?;
            }
        }

        self.lock_config().apply(patch);
        Ok(candidate)
    }

    /// `stop()` then `start()`, ignored within the debounce window of the
    /// last accepted restart. Returns whether the restart ran.
    pub async fn restart(&self, workspace_dir: Option<&Path>) -> bool {
        {
            let mut last = self
                .last_restart
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            if let Some(previous) = *last {
                if now.duration_since(previous) < self.options.restart_debounce {
                    debug!("Restart requested within debounce window, ignoring");
                    return false;
                }
            }
            *last = Some(now);
        }

        info!("Restarting gateway integration");
        self.stop().await;
        if let Err(e) = self.start(workspace_dir).await {
            warn!("Gateway integration restarted disconnected: {}", e);
        }
        true
    }

    /// Disconnect and stop the supervised gateway process
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let client = self.lock_client().take();
        if let Some(client) = client {
            client.disconnect();
        }
        if self.supervisor.stop().await {
            info!("Stopped local gateway");
        }
    }

    pub async fn check_prerequisites(&self) -> PrerequisiteReport {
        check_prerequisites(self.options.runner.as_ref(), MIN_NODE_MAJOR).await
    }

    /// Install and start a local gateway, then connect to it.
    ///
    /// Only one install runs at a time; a concurrent call fails immediately.
    pub async fn install<P>(&self, on_progress: P) -> InstallOutcome
    where
        P: Fn(&InstallProgress) + Sync,
    {
        if self.installing.swap(true, Ordering::SeqCst) {
            return InstallOutcome::failed("an install is already in progress");
        }
        let _guard = InstallGuard(&self.installing);

        let config = self.config();
        let installer = Installer::new(
            InstallerOptions::new(
                self.options.paths.clone(),
                config.checkout_path(&self.options.paths),
            ),
            Arc::clone(&self.options.runner),
            self.supervisor.clone(),
            Arc::new(HttpHealthProbe::for_port(DEFAULT_GATEWAY_PORT)),
        );

        let result = {
            let _lifecycle = self.lifecycle.lock().await;
            installer
                .run(config, self.options.settings.as_deref(), &on_progress)
                .await
        };

        match result {
            Ok(config) => {
                *self.lock_config() = config.clone();
                if let Err(e) = self.connect_client(&config).await {
                    warn!("Installed gateway is not reachable yet: {}", e);
                }
                InstallOutcome {
                    success: true,
                    error: None,
                }
            }
            Err(e) => InstallOutcome::failed(e.to_string()),
        }
    }

    fn lock_config(&self) -> MutexGuard<'_, ConnectionConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_client(&self) -> MutexGuard<'_, Option<GatewayClient>> {
        self.client.lock().unwrap_or_else(|e| e.into_inner())
    }
}
