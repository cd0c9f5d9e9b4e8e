//! clawlink Configuration
//!
//! Connection settings for the OpenClaw gateway, layered as
//! defaults → global settings (YAML) → workspace override (JSON).

use crate::error::ClawlinkError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// ============================================================================
// Constants
// ============================================================================

/// Loopback host the integrated gateway binds to
pub const DEFAULT_GATEWAY_HOST: &str = "127.0.0.1";
/// Default gateway port
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;
/// Health endpoint path served by the gateway
pub const DEFAULT_HEALTH_PATH: &str = "/health";
/// Upstream repository cloned by the installer
pub const DEFAULT_UPSTREAM_REPO: &str = "https://github.com/openclaw/openclaw.git";
/// Directory inside a workspace holding clawlink overrides
pub const WORKSPACE_OVERRIDE_DIR: &str = ".clawlink";
/// Workspace override file name
pub const WORKSPACE_OVERRIDE_FILE: &str = "gateway.json";

// ============================================================================
// Helper functions for paths (required for serde defaults)
// ============================================================================

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_clawlink_dir() -> PathBuf {
    home_dir().join(".clawlink")
}

/// WebSocket URL of the gateway on loopback
pub fn loopback_url(port: u16) -> String {
    format!("ws://{}:{}", DEFAULT_GATEWAY_HOST, port)
}

/// HTTP health URL of the gateway on loopback
pub fn loopback_health_url(port: u16) -> String {
    format!(
        "http://{}:{}{}",
        DEFAULT_GATEWAY_HOST, port, DEFAULT_HEALTH_PATH
    )
}

// ============================================================================
// Paths
// ============================================================================

/// Fixed on-disk locations used by clawlink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClawlinkPaths {
    root: PathBuf,
}

impl ClawlinkPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identity_dir(&self) -> PathBuf {
        self.root.join("identity")
    }

    pub fn device_identity_file(&self) -> PathBuf {
        self.identity_dir().join("device.json")
    }

    pub fn device_auth_file(&self) -> PathBuf {
        self.identity_dir().join("device-auth.json")
    }

    /// Global settings file
    pub fn settings_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    /// Checkout used when integrated mode has no explicit path
    pub fn default_checkout(&self) -> PathBuf {
        self.root.join("openclaw")
    }

    /// State directory handed to the supervised gateway
    pub fn gateway_state_dir(&self) -> PathBuf {
        self.root.join("gateway")
    }

    pub fn gateway_workspace_dir(&self) -> PathBuf {
        self.gateway_state_dir().join("workspace")
    }

    /// Bind config written for the supervised gateway
    pub fn gateway_config_file(&self) -> PathBuf {
        self.gateway_state_dir().join("openclaw.json")
    }

    pub fn workspace_override_file(workspace_dir: &Path) -> PathBuf {
        workspace_dir
            .join(WORKSPACE_OVERRIDE_DIR)
            .join(WORKSPACE_OVERRIDE_FILE)
    }
}

impl Default for ClawlinkPaths {
    fn default() -> Self {
        Self::new(default_clawlink_dir())
    }
}

// ============================================================================
// Connection Config
// ============================================================================

/// Whether the gateway is reached remotely or supervised locally
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    /// Connect to an already running gateway
    #[default]
    External,
    /// Spawn and supervise a local gateway checkout
    Integrated,
}

impl std::fmt::Display for GatewayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::External => write!(f, "external"),
            Self::Integrated => write!(f, "integrated"),
        }
    }
}

impl std::str::FromStr for GatewayMode {
    type Err = ClawlinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "external" => Ok(Self::External),
            "integrated" => Ok(Self::Integrated),
            other => Err(ClawlinkError::config_invalid(
                "mode",
                format!("unknown mode '{}', expected external or integrated", other),
            )),
        }
    }
}

/// Live connection configuration owned by the integration manager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default)]
    pub mode: GatewayMode,
    #[serde(default = "ConnectionConfig::default_url")]
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Local checkout used in integrated mode
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl ConnectionConfig {
    fn default_url() -> String {
        loopback_url(DEFAULT_GATEWAY_PORT)
    }

    /// Merge a partial update into this config
    pub fn apply(&mut self, patch: &ConfigPatch) {
        if let Some(mode) = patch.mode {
            self.mode = mode;
        }
        if let Some(url) = &patch.url {
            self.url = url.clone();
        }
        if let Some(token) = &patch.auth_token {
            self.auth_token = if token.is_empty() {
                None
            } else {
                Some(token.clone())
            };
        }
        if let Some(path) = &patch.path {
            self.path = Some(path.clone());
        }
    }

    /// Checkout path, falling back to the default location
    pub fn checkout_path(&self, paths: &ClawlinkPaths) -> PathBuf {
        self.path.clone().unwrap_or_else(|| paths.default_checkout())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mode: GatewayMode::External,
            url: Self::default_url(),
            auth_token: None,
            path: None,
        }
    }
}

/// Partial update of a [`ConnectionConfig`]
///
/// An empty `auth_token` clears the token when applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<GatewayMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none() && self.url.is_none() && self.auth_token.is_none() && self.path.is_none()
    }

    /// Overlay `other` on top of this patch (fields set in `other` win)
    pub fn merge(&mut self, other: &ConfigPatch) {
        if other.mode.is_some() {
            self.mode = other.mode;
        }
        if other.url.is_some() {
            self.url = other.url.clone();
        }
        if other.auth_token.is_some() {
            self.auth_token = other.auth_token.clone();
        }
        if other.path.is_some() {
            self.path = other.path.clone();
        }
    }
}

/// Where a config update is persisted besides the live config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    /// Global settings store
    Global,
    /// Workspace-local override file
    Workspace,
}

/// Redact a bearer token to at most its last 4 characters
pub fn redact_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

// ============================================================================
// Settings Store
// ============================================================================

/// Global settings store consulted at load time and written by `Global` updates
pub trait SettingsStore: Send + Sync {
    /// Stored gateway settings (empty patch when nothing is stored)
    fn load(&self) -> Result<ConfigPatch, ClawlinkError>;

    /// Merge `patch` into the stored settings
    fn save(&self, patch: &ConfigPatch) -> Result<(), ClawlinkError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    gateway: ConfigPatch,
}

/// YAML-backed settings store (`~/.clawlink/config.yaml`)
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<SettingsFile, ClawlinkError> {
        if !self.path.exists() {
            return Ok(SettingsFile::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(SettingsFile::default());
        }
        serde_yml::from_str(&content).map_err(|e| {
            ClawlinkError::config_parse_error(self.path.display().to_string(), e.to_string())
        })
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> Result<ConfigPatch, ClawlinkError> {
        Ok(self.read_file()?.gateway)
    }

    fn save(&self, patch: &ConfigPatch) -> Result<(), ClawlinkError> {
        let mut file = self.read_file()?;
        file.gateway.merge(patch);
        let content = serde_yml::to_string(&file)?;
        write_private_file(&self.path, &content)?;
        debug!("Saved gateway settings to {}", self.path.display());
        Ok(())
    }
}

// ============================================================================
// Owner-only files
// ============================================================================

/// Write `content` to `path` readable by the owner only, creating parent
/// directories. Every file holding a gateway token or key goes through here.
pub fn write_private_file(path: &Path, content: &str) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    // `mode` only applies on creation
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(content.as_bytes())?;
    Ok(())
}

// ============================================================================
// Workspace Override
// ============================================================================

/// Read `<workspace>/.clawlink/gateway.json`, if present
pub fn load_workspace_override(workspace_dir: &Path) -> Result<Option<ConfigPatch>, ClawlinkError> {
    let path = ClawlinkPaths::workspace_override_file(workspace_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let patch = serde_json::from_str(&content)
        .map_err(|e| ClawlinkError::config_parse_error(path.display().to_string(), e.to_string()))?;
    Ok(Some(patch))
}

/// Merge `patch` into the workspace override file, creating it if needed
pub fn save_workspace_override(workspace_dir: &Path, patch: &ConfigPatch) -> Result<(), ClawlinkError> {
    let path = ClawlinkPaths::workspace_override_file(workspace_dir);
    let mut existing = match load_workspace_override(workspace_dir) {
        Ok(existing) => existing.unwrap_or_default(),
        Err(e) => {
            warn!("Replacing unreadable workspace override: {}", e);
            ConfigPatch::default()
        }
    };
    existing.merge(patch);
    write_private_file(&path, &serde_json::to_string_pretty(&existing)?)?;
    debug!("Saved workspace override to {}", path.display());
    Ok(())
}

// ============================================================================
// Config Loading and Validation
// ============================================================================

/// Resolves the effective connection config from its layers
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, then global settings, then the workspace override.
    ///
    /// Unreadable layers are skipped with a warning.
    pub fn load(settings: Option<&dyn SettingsStore>, workspace_dir: Option<&Path>) -> ConnectionConfig {
        let mut config = ConnectionConfig::default();

        if let Some(store) = settings {
            match store.load() {
                Ok(patch) => config.apply(&patch),
                Err(e) => warn!("Ignoring global gateway settings: {}", e),
            }
        }

        if let Some(dir) = workspace_dir {
            match load_workspace_override(dir) {
                Ok(Some(patch)) => {
                    debug!("Applying workspace override from {}", dir.display());
                    config.apply(&patch);
                }
                Ok(None) => {}
                Err(e) => warn!("Ignoring workspace override: {}", e),
            }
        }

        config
    }
}

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &ConnectionConfig) -> Result<(), ClawlinkError> {
        if !(config.url.starts_with("ws://") || config.url.starts_with("wss://")) {
            return Err(ClawlinkError::config_invalid(
                "url",
                format!("'{}' must start with ws:// or wss://", config.url),
            ));
        }
        if let Some(path) = &config.path {
            if path.as_os_str().is_empty() {
                return Err(ClawlinkError::config_invalid("path", "cannot be empty"));
            }
        }
        Ok(())
    }
}
