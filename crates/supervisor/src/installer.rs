// OpenClaw Installer
//
// Ordered pipeline that fetches, builds, configures and starts a local
// gateway. The first failing step aborts the rest; re-running is safe.

use crate::command::{CommandError, CommandOutput, CommandRunner, CommandSpec};
use crate::health::{health_check, HealthProbe, INSTALL_HEALTH_POLICY};
use crate::process::{GatewayLauncher, LaunchSpec, SupervisorError};
use clawlink_core::config::{
    loopback_url, write_private_file, DEFAULT_GATEWAY_PORT, DEFAULT_UPSTREAM_REPO,
};
use clawlink_core::{ClawlinkPaths, ConfigPatch, ConnectionConfig, GatewayMode, RetryPolicy, SettingsStore};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

/// File whose presence marks a non-git directory as an OpenClaw checkout
pub const CHECKOUT_MARKER: &str = "openclaw.mjs";
pub const MIN_NODE_MAJOR: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallStep {
    Prereqs,
    Clone,
    Install,
    Build,
    UiBuild,
    AuthToken,
    Config,
    Start,
    HealthCheck,
}

impl InstallStep {
    pub const ALL: [InstallStep; 9] = [
        Self::Prereqs,
        Self::Clone,
        Self::Install,
        Self::Build,
        Self::UiBuild,
        Self::AuthToken,
        Self::Config,
        Self::Start,
        Self::HealthCheck,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Prereqs => "prereqs",
            Self::Clone => "clone",
            Self::Install => "install",
            Self::Build => "build",
            Self::UiBuild => "ui-build",
            Self::AuthToken => "auth-token",
            Self::Config => "config",
            Self::Start => "start",
            Self::HealthCheck => "health-check",
        }
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Done,
    Skipped,
    Failed,
}

/// One progress notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallProgress {
    pub step: InstallStep,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Node.js {required}+ is required but was not found")]
    NodeMissing { required: u32 },

    #[error("Node.js {required}+ is required (found {found})")]
    NodeTooOld { required: u32, found: String },

    #[error("git is required but was not found")]
    GitMissing,

    #[error("pnpm is not available and could not be installed: {0}")]
    PnpmUnavailable(String),

    #[error("{} exists but is not an OpenClaw repository", .0.display())]
    NotARepository(PathBuf),

    #[error("{step} failed: {reason}")]
    StepFailed { step: InstallStep, reason: String },

    #[error("failed to write gateway config: {0}")]
    Config(String),

    #[error("failed to start gateway: {0}")]
    Start(#[from] SupervisorError),

    #[error("gateway did not become healthy")]
    Unhealthy,
}

/// Result of probing the host toolchain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisiteReport {
    pub node: Option<String>,
    pub node_ok: bool,
    pub pnpm: Option<String>,
    pub git: Option<String>,
    pub ready: bool,
}

/// Probe node, pnpm and git without changing anything
pub async fn check_prerequisites(runner: &dyn CommandRunner, min_node_major: u32) -> PrerequisiteReport {
    let node = tool_version(runner, "node").await;
    let node_ok = node
        .as_deref()
        .and_then(parse_node_major)
        .is_some_and(|major| major >= min_node_major);
    let pnpm = tool_version(runner, "pnpm").await;
    let git = tool_version(runner, "git").await;
    let ready = node_ok && pnpm.is_some() && git.is_some();
    PrerequisiteReport {
        node,
        node_ok,
        pnpm,
        git,
        ready,
    }
}

async fn tool_version(runner: &dyn CommandRunner, program: &str) -> Option<String> {
    match runner.run(&CommandSpec::new(program, ["--version"])).await {
        Ok(output) if output.success => output
            .stdout
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty()),
        Ok(_) => None,
        Err(e) => {
            debug!("{}", e);
            None
        }
    }
}

/// Major version from `node --version` output such as `v22.11.0`
pub fn parse_node_major(version: &str) -> Option<u32> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .next()?
        .parse()
        .ok()
}

/// Fresh gateway bearer token: 32 random bytes, hex encoded
pub fn generate_auth_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Clone)]
pub struct InstallerOptions {
    pub repo_url: String,
    pub checkout: PathBuf,
    pub paths: ClawlinkPaths,
    pub port: u16,
    pub min_node_major: u32,
    pub health_policy: RetryPolicy,
}

impl InstallerOptions {
    pub fn new(paths: ClawlinkPaths, checkout: PathBuf) -> Self {
        Self {
            repo_url: DEFAULT_UPSTREAM_REPO.to_string(),
            checkout,
            paths,
            port: DEFAULT_GATEWAY_PORT,
            min_node_major: MIN_NODE_MAJOR,
            health_policy: INSTALL_HEALTH_POLICY,
        }
    }
}

enum StepOutcome {
    Done(Option<String>),
    Skipped(String),
}

pub struct Installer {
    options: InstallerOptions,
    runner: Arc<dyn CommandRunner>,
    launcher: Arc<dyn GatewayLauncher>,
    probe: Arc<dyn HealthProbe>,
}

impl Installer {
    pub fn new(
        options: InstallerOptions,
        runner: Arc<dyn CommandRunner>,
        launcher: Arc<dyn GatewayLauncher>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            options,
            runner,
            launcher,
            probe,
        }
    }

    pub fn options(&self) -> &InstallerOptions {
        &self.options
    }

    /// Run every step in order, returning the integrated-mode config on success
    pub async fn run<P>(
        &self,
        mut config: ConnectionConfig,
        settings: Option<&dyn SettingsStore>,
        on_progress: &P,
    ) -> Result<ConnectionConfig, InstallError>
    where
        P: Fn(&InstallProgress) + Sync,
    {
        info!(
            "Installing OpenClaw gateway into {}",
            self.options.checkout.display()
        );

        self.step(InstallStep::Prereqs, on_progress, self.ensure_prerequisites())
            .await?;
        self.step(InstallStep::Clone, on_progress, self.fetch_checkout())
            .await?;
        self.step(
            InstallStep::Install,
            on_progress,
            self.pnpm(InstallStep::Install, &["install", "--frozen-lockfile"]),
        )
        .await?;
        self.step(
            InstallStep::Build,
            on_progress,
            self.pnpm(InstallStep::Build, &["build"]),
        )
        .await?;
        self.step(
            InstallStep::UiBuild,
            on_progress,
            self.pnpm(InstallStep::UiBuild, &["ui:build"]),
        )
        .await?;

        let mut token = String::new();
        self.step(InstallStep::AuthToken, on_progress, async {
            token = generate_auth_token();
            Ok(StepOutcome::Done(None))
        })
        .await?;

        self.step(InstallStep::Config, on_progress, async {
            config.mode = GatewayMode::Integrated;
            config.url = loopback_url(self.options.port);
            config.path = Some(self.options.checkout.clone());
            config.auth_token = Some(token.clone());
            self.write_gateway_config(&token)?;
            if let Some(store) = settings {
                let patch = ConfigPatch {
                    mode: Some(GatewayMode::Integrated),
                    url: Some(config.url.clone()),
                    auth_token: Some(token.clone()),
                    path: Some(self.options.checkout.clone()),
                };
                store
                    .save(&patch)
                    .map_err(|e| InstallError::Config(e.to_string()))?;
            }
            Ok(StepOutcome::Done(Some(
                self.options.paths.gateway_config_file().display().to_string(),
            )))
        })
        .await?;

        self.step(InstallStep::Start, on_progress, async {
            let spec = LaunchSpec::new(
                self.options.checkout.clone(),
                &self.options.paths,
                self.options.port,
                Some(token.clone()),
            );
            self.launcher.launch(&spec).await?;
            Ok(StepOutcome::Done(None))
        })
        .await?;

        self.step(InstallStep::HealthCheck, on_progress, async {
            if health_check(self.probe.as_ref(), &self.options.health_policy).await {
                Ok(StepOutcome::Done(None))
            } else {
                Err(InstallError::Unhealthy)
            }
        })
        .await?;

        info!("OpenClaw gateway installed");
        Ok(config)
    }

    async fn step<P, F>(&self, step: InstallStep, on_progress: &P, work: F) -> Result<(), InstallError>
    where
        P: Fn(&InstallProgress) + Sync,
        F: Future<Output = Result<StepOutcome, InstallError>>,
    {
        let report = |status, detail: Option<String>| {
            on_progress(&InstallProgress {
                step,
                status,
                detail,
            })
        };

        info!("Install step: {}", step);
        report(StepStatus::Running, None);
        match work.await {
            Ok(StepOutcome::Done(detail)) => {
                report(StepStatus::Done, detail);
                Ok(())
            }
            Ok(StepOutcome::Skipped(detail)) => {
                info!("Install step {} skipped: {}", step, detail);
                report(StepStatus::Skipped, Some(detail));
                Ok(())
            }
            Err(e) => {
                error!("Install step {} failed: {}", step, e);
                report(StepStatus::Failed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn ensure_prerequisites(&self) -> Result<StepOutcome, InstallError> {
        let required = self.options.min_node_major;
        let report = check_prerequisites(self.runner.as_ref(), required).await;

        let node = report.node.ok_or(InstallError::NodeMissing { required })?;
        if !report.node_ok {
            return Err(InstallError::NodeTooOld {
                required,
                found: node,
            });
        }
        if report.git.is_none() {
            return Err(InstallError::GitMissing);
        }
        let pnpm = match report.pnpm {
            Some(version) => version,
            None => {
                info!("pnpm not found, installing it with npm");
                let output = self
                    .runner
                    .run(&CommandSpec::new("npm", ["install", "-g", "pnpm"]))
                    .await
                    .map_err(|e| InstallError::PnpmUnavailable(e.to_string()))?;
                if !output.success {
                    return Err(InstallError::PnpmUnavailable(output.failure_reason()));
                }
                "installed".to_string()
            }
        };

        Ok(StepOutcome::Done(Some(format!("node {}, pnpm {}", node, pnpm))))
    }

    async fn fetch_checkout(&self) -> Result<StepOutcome, InstallError> {
        let checkout = &self.options.checkout;

        if checkout.join(".git").exists() {
            let spec = CommandSpec::new("git", ["pull", "--ff-only"]).in_dir(checkout);
            self.exec(InstallStep::Clone, &spec).await?;
            return Ok(StepOutcome::Done(Some("updated existing checkout".to_string())));
        }
        if checkout.join(CHECKOUT_MARKER).exists() {
            return Ok(StepOutcome::Skipped(format!(
                "using existing checkout at {}",
                checkout.display()
            )));
        }
        if checkout.exists() {
            return Err(InstallError::NotARepository(checkout.clone()));
        }

        if let Some(parent) = checkout.parent() {
            std::fs::create_dir_all(parent).map_err(|e| InstallError::StepFailed {
                step: InstallStep::Clone,
                reason: e.to_string(),
            })?;
        }
        let spec = CommandSpec::new(
            "git",
            [
                "clone".to_string(),
                "--depth".to_string(),
                "1".to_string(),
                self.options.repo_url.clone(),
                checkout.display().to_string(),
            ],
        );
        self.exec(InstallStep::Clone, &spec).await?;
        Ok(StepOutcome::Done(Some(format!(
            "cloned {}",
            self.options.repo_url
        ))))
    }

    async fn pnpm(&self, step: InstallStep, args: &[&str]) -> Result<StepOutcome, InstallError> {
        let spec = CommandSpec::new("pnpm", args.iter().copied()).in_dir(&self.options.checkout);
        self.exec(step, &spec).await?;
        Ok(StepOutcome::Done(None))
    }

    async fn exec(&self, step: InstallStep, spec: &CommandSpec) -> Result<CommandOutput, InstallError> {
        let output = self
            .runner
            .run(spec)
            .await
            .map_err(|e: CommandError| InstallError::StepFailed {
                step,
                reason: e.to_string(),
            })?;
        if !output.success {
            return Err(InstallError::StepFailed {
                step,
                reason: format!("{} ({})", spec, output.failure_reason()),
            });
        }
        Ok(output)
    }

    fn write_gateway_config(&self, token: &str) -> Result<(), InstallError> {
        let content = json!({
            "gateway": {
                "mode": "local",
                "bind": "loopback",
                "port": self.options.port,
                "auth": {"mode": "token", "token": token}
            }
        });
        let content = serde_json::to_string_pretty(&content)
            .map_err(|e| InstallError::Config(e.to_string()))?;
        write_private_file(&self.options.paths.gateway_config_file(), &content)
            .map_err(|e| InstallError::Config(e.to_string()))
    }
}
