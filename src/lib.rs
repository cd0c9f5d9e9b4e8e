// ClawLink - OpenClaw gateway integration
//
// Connects to a remote OpenClaw gateway, or installs and supervises a local
// one, behind a single `IntegrationManager`.

pub mod manager;

pub use manager::{
    GatewayStatus, InstallOutcome, IntegrationManager, ManagerOptions, CONNECT_RETRY,
    RESTART_DEBOUNCE,
};

pub use clawlink_core::{ClawlinkPaths, ConfigPatch, ConfigScope, ConnectionConfig, GatewayMode};
pub use clawlink_gateway::{ClientError, ConnectionState};
pub use clawlink_supervisor::{InstallProgress, InstallStep, PrerequisiteReport, StepStatus};
