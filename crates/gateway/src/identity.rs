// Device Identity Management
//
// Each installation owns one ed25519 keypair. The device id is the hex SHA-256
// of the raw 32-byte public key and is what the gateway pairs tokens against.

use base64::prelude::*;
use clawlink_core::config::write_private_file;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// DER SubjectPublicKeyInfo header preceding the raw ed25519 key
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

const IDENTITY_RECORD_VERSION: u32 = 1;

/// Failures reading a persisted identity. Recovered by regeneration.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported identity record version {0}")]
    Version(u32),
    #[error("invalid key material: {0}")]
    Key(String),
}

/// Versioned on-disk identity record
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRecord {
    version: u32,
    device_id: String,
    /// SPKI DER, standard base64
    public_key_der: String,
    /// PKCS#8 DER, standard base64
    private_key_der: String,
    created_at_ms: i64,
}

/// Long-lived device keypair plus its fingerprint
#[derive(Clone)]
pub struct DeviceIdentity {
    device_id: String,
    signing_key: SigningKey,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    /// Generate a fresh in-memory identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let device_id = fingerprint(&signing_key.verifying_key().to_bytes());
        Self {
            device_id,
            signing_key,
        }
    }

    /// Load the identity at `path`, generating and persisting one if the file
    /// is missing or unusable. Never fails.
    pub fn load_or_create(path: &Path) -> Self {
        match read_identity(path) {
            Ok(Some(identity)) => return identity,
            Ok(None) => debug!("No device identity at {}, generating", path.display()),
            Err(e) => warn!(
                "Device identity at {} is unusable ({}), regenerating",
                path.display(),
                e
            ),
        }

        let identity = Self::generate();
        match write_identity(path, &identity, chrono::Utc::now().timestamp_millis()) {
            Ok(()) => info!("Created device identity {}", identity.device_id),
            Err(e) => warn!(
                "Failed to persist device identity to {}: {}",
                path.display(),
                e
            ),
        }
        identity
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Raw 32-byte public key, URL-safe base64 without padding
    pub fn public_key_base64url(&self) -> String {
        BASE64_URL_SAFE_NO_PAD.encode(self.verifying_key().to_bytes())
    }

    /// Public key as DER SubjectPublicKeyInfo
    pub fn public_key_der(&self) -> Result<Vec<u8>, IdentityError> {
        let doc = self
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| IdentityError::Key(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Sign `payload`, returning a URL-safe base64 signature without padding
    pub fn sign(&self, payload: &str) -> String {
        let signature = self.signing_key.sign(payload.as_bytes());
        BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes())
    }
}

/// Hex SHA-256 of raw public key bytes
pub fn fingerprint(raw_public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(raw_public_key))
}

/// Strip the fixed ed25519 SPKI header, returning the raw 32-byte key
pub fn raw_public_key_from_spki(spki_der: &[u8]) -> Option<&[u8]> {
    if spki_der.len() == ED25519_SPKI_PREFIX.len() + 32 && spki_der.starts_with(&ED25519_SPKI_PREFIX)
    {
        Some(&spki_der[ED25519_SPKI_PREFIX.len()..])
    } else {
        None
    }
}

/// Device id for a DER-encoded ed25519 public key
pub fn derive_device_id(spki_der: &[u8]) -> Option<String> {
    raw_public_key_from_spki(spki_der).map(fingerprint)
}

fn read_identity(path: &Path) -> Result<Option<DeviceIdentity>, IdentityError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)?;
    let record: IdentityRecord = serde_json::from_str(&content)?;
    if record.version != IDENTITY_RECORD_VERSION {
        return Err(IdentityError::Version(record.version));
    }

    let public_der = BASE64_STANDARD
        .decode(&record.public_key_der)
        .map_err(|e| IdentityError::Key(e.to_string()))?;
    let private_der = BASE64_STANDARD
        .decode(&record.private_key_der)
        .map_err(|e| IdentityError::Key(e.to_string()))?;

    let verifying_key = VerifyingKey::from_public_key_der(&public_der)
        .map_err(|e| IdentityError::Key(e.to_string()))?;
    let signing_key =
        SigningKey::from_pkcs8_der(&private_der).map_err(|e| IdentityError::Key(e.to_string()))?;
    if signing_key.verifying_key() != verifying_key {
        return Err(IdentityError::Key(
            "public key does not match private key".to_string(),
        ));
    }

    let derived = derive_device_id(&public_der)
        .ok_or_else(|| IdentityError::Key("not an ed25519 public key".to_string()))?;
    let identity = DeviceIdentity {
        device_id: derived,
        signing_key,
    };

    if record.device_id != identity.device_id {
        debug!(
            "Correcting stored device id {} -> {}",
            record.device_id, identity.device_id
        );
        if let Err(e) = write_identity(path, &identity, record.created_at_ms) {
            warn!("Failed to rewrite corrected device identity: {}", e);
        }
    }

    Ok(Some(identity))
}

fn write_identity(
    path: &Path,
    identity: &DeviceIdentity,
    created_at_ms: i64,
) -> Result<(), IdentityError> {
    let private_der = identity
        .signing_key
        .to_pkcs8_der()
        .map_err(|e| IdentityError::Key(e.to_string()))?;
    let record = IdentityRecord {
        version: IDENTITY_RECORD_VERSION,
        device_id: identity.device_id.clone(),
        public_key_der: BASE64_STANDARD.encode(identity.public_key_der()?),
        private_key_der: BASE64_STANDARD.encode(private_der.as_bytes()),
        created_at_ms,
    };
    write_private_file(path, &serde_json::to_string_pretty(&record)?)?;
    Ok(())
}
