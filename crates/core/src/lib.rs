pub mod config;
pub mod error;
pub mod retry;

// Re-export commonly used types
pub use config::{
    ClawlinkPaths, ConfigLoader, ConfigPatch, ConfigScope, ConfigValidator, ConnectionConfig,
    FileSettingsStore, GatewayMode, SettingsStore,
};
pub use error::{ClawlinkError, DomainError, InfraError};
pub use retry::{retry, Backoff, RetryPolicy};
