// ClawLink Supervisor
//
// Local OpenClaw gateway lifecycle: installing a checkout, running it as a
// child process and polling its health endpoint.

pub mod command;
pub mod health;
pub mod installer;
pub mod process;

pub use command::{CommandError, CommandOutput, CommandRunner, CommandSpec, SystemCommandRunner};
pub use health::{health_check, HealthProbe, HttpHealthProbe};
pub use installer::{
    check_prerequisites, InstallError, InstallProgress, InstallStep, Installer, InstallerOptions,
    PrerequisiteReport, StepStatus,
};
pub use process::{GatewayLauncher, GatewayProcess, LaunchSpec, Supervisor, SupervisorError};
