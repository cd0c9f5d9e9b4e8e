// Device Authentication
//
// Role-scoped device tokens granted by the gateway after a successful handshake,
// and the pipe-delimited payload a device signs to prove its identity.

use clawlink_core::config::write_private_file;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

const DEVICE_AUTH_RECORD_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum AuthStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Bearer token issued to this device for one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthToken {
    pub token: String,
    pub role: String,
    pub scopes: BTreeSet<String>,
    pub updated_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceAuthRecord {
    version: u32,
    device_id: String,
    #[serde(default)]
    tokens: BTreeMap<String, DeviceAuthToken>,
}

impl DeviceAuthRecord {
    fn empty(device_id: &str) -> Self {
        Self {
            version: DEVICE_AUTH_RECORD_VERSION,
            device_id: device_id.to_string(),
            tokens: BTreeMap::new(),
        }
    }
}

/// File-backed store of device tokens, keyed by `(device_id, role)`
pub struct DeviceAuthStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl DeviceAuthStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored token for `role`, if the record belongs to `device_id`
    pub fn load(&self, device_id: &str, role: &str) -> Option<DeviceAuthToken> {
        let record = self.read_record()?;
        if record.device_id != device_id {
            return None;
        }
        record.tokens.get(role).cloned()
    }

    /// Store a token for `role`, keeping tokens for other roles.
    ///
    /// A record belonging to a different device is discarded.
    pub fn store<I, S>(
        &self,
        device_id: &str,
        role: &str,
        token: &str,
        scopes: I,
    ) -> Result<DeviceAuthToken, AuthStoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut record = self.record_for(device_id);
        let entry = DeviceAuthToken {
            token: token.to_string(),
            role: role.to_string(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        record.tokens.insert(role.to_string(), entry.clone());
        self.write_record(&record)?;
        debug!("Stored device token for role {}", role);
        Ok(entry)
    }

    /// Remove the token for `role`. Returns whether one was present.
    pub fn clear(&self, device_id: &str, role: &str) -> Result<bool, AuthStoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut record = self.record_for(device_id);
        let removed = record.tokens.remove(role).is_some();
        if removed {
            self.write_record(&record)?;
            debug!("Cleared device token for role {}", role);
        }
        Ok(removed)
    }

    fn record_for(&self, device_id: &str) -> DeviceAuthRecord {
        match self.read_record() {
            Some(record) if record.device_id == device_id => record,
            Some(_) => {
                debug!("Device auth record belongs to another device, starting fresh");
                DeviceAuthRecord::empty(device_id)
            }
            None => DeviceAuthRecord::empty(device_id),
        }
    }

    fn read_record(&self) -> Option<DeviceAuthRecord> {
        if !self.path.exists() {
            return None;
        }
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_str::<DeviceAuthRecord>(&content) {
            Ok(record) if record.version == DEVICE_AUTH_RECORD_VERSION => Some(record),
            Ok(record) => {
                warn!("Ignoring device auth record version {}", record.version);
                None
            }
            Err(e) => {
                warn!("Ignoring corrupt device auth record: {}", e);
                None
            }
        }
    }

    fn write_record(&self, record: &DeviceAuthRecord) -> Result<(), AuthStoreError> {
        write_private_file(&self.path, &serde_json::to_string_pretty(record)?)?;
        Ok(())
    }
}

/// Fields covered by the device signature, in wire order
#[derive(Debug, Clone)]
pub struct DeviceAuthPayload<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a BTreeSet<String>,
    pub signed_at_ms: i64,
    pub token: Option<&'a str>,
    pub nonce: Option<&'a str>,
}

impl DeviceAuthPayload<'_> {
    /// `v2` when the challenge carried a nonce, `v1` otherwise
    pub fn version(&self) -> &'static str {
        if self.nonce.is_some() {
            "v2"
        } else {
            "v1"
        }
    }

    /// The pipe-delimited string that gets signed
    pub fn build(&self) -> String {
        let scopes = self
            .scopes
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let signed_at = self.signed_at_ms.to_string();
        let mut parts = vec![
            self.version(),
            self.device_id,
            self.client_id,
            self.client_mode,
            self.role,
            scopes.as_str(),
            signed_at.as_str(),
            self.token.unwrap_or_default(),
        ];
        if let Some(nonce) = self.nonce {
            parts.push(nonce);
        }
        parts.join("|")
    }
}
