// Gateway Process Supervisor
//
// Runs the OpenClaw gateway from a local checkout as a child process bound
// to loopback. At most one process is supervised at a time.

use crate::health::{health_check, HttpHealthProbe, SPAWN_HEALTH_POLICY};
use async_trait::async_trait;
use clawlink_core::{ClawlinkPaths, RetryPolicy};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const GATEWAY_TOKEN_ENV: &str = "OPENCLAW_GATEWAY_TOKEN";
pub const STATE_DIR_ENV: &str = "OPENCLAW_STATE_DIR";
pub const CONFIG_PATH_ENV: &str = "OPENCLAW_CONFIG_PATH";
pub const WORKSPACE_DIR_ENV: &str = "OPENCLAW_WORKSPACE_DIR";

/// Provider credentials passed through from the host environment
pub const PROVIDER_KEY_ENVS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GEMINI_API_KEY",
    "OPENROUTER_API_KEY",
    "GROQ_API_KEY",
    "MISTRAL_API_KEY",
    "XAI_API_KEY",
];

/// Time between SIGTERM and a forced kill
pub const STOP_GRACE: Duration = Duration::from_secs(5);

const PREBUILT_ENTRY: &str = "dist/index.js";
const SOURCE_ENTRY: &str = "src/index.ts";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no gateway entry point (dist/index.js or src/index.ts) in {}", .0.display())]
    NoEntryPoint(PathBuf),

    #[error("failed to spawn gateway: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Everything needed to launch the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub checkout: PathBuf,
    pub port: u16,
    pub token: Option<String>,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub workspace_dir: PathBuf,
}

impl LaunchSpec {
    pub fn new(checkout: PathBuf, paths: &ClawlinkPaths, port: u16, token: Option<String>) -> Self {
        Self {
            checkout,
            port,
            token,
            state_dir: paths.gateway_state_dir(),
            config_path: paths.gateway_config_file(),
            workspace_dir: paths.gateway_workspace_dir(),
        }
    }
}

/// Program and arguments that start the gateway, run from the checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub program: String,
    pub args: Vec<String>,
}

/// Prefer the prebuilt bundle, fall back to running the sources through tsx
pub fn resolve_entry_point(checkout: &Path, port: u16) -> Option<EntryPoint> {
    let gateway_args = [
        "gateway".to_string(),
        "--bind".to_string(),
        "loopback".to_string(),
        "--port".to_string(),
        port.to_string(),
    ];

    if checkout.join(PREBUILT_ENTRY).is_file() {
        let mut args = vec![PREBUILT_ENTRY.to_string()];
        args.extend(gateway_args);
        return Some(EntryPoint {
            program: "node".to_string(),
            args,
        });
    }

    if checkout.join(SOURCE_ENTRY).is_file() {
        let mut args = vec![
            "exec".to_string(),
            "tsx".to_string(),
            SOURCE_ENTRY.to_string(),
        ];
        args.extend(gateway_args);
        return Some(EntryPoint {
            program: "pnpm".to_string(),
            args,
        });
    }

    None
}

/// Environment overlay for the child, reading passthrough keys via `host_env`
pub fn launch_env<F>(spec: &LaunchSpec, host_env: F) -> Vec<(String, String)>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = Vec::new();
    if let Some(token) = &spec.token {
        env.push((GATEWAY_TOKEN_ENV.to_string(), token.clone()));
    }
    for key in PROVIDER_KEY_ENVS {
        if let Some(value) = host_env(key).filter(|v| !v.is_empty()) {
            env.push((key.to_string(), value));
        }
    }
    env.push((
        STATE_DIR_ENV.to_string(),
        spec.state_dir.display().to_string(),
    ));
    env.push((
        CONFIG_PATH_ENV.to_string(),
        spec.config_path.display().to_string(),
    ));
    env.push((
        WORKSPACE_DIR_ENV.to_string(),
        spec.workspace_dir.display().to_string(),
    ));
    env
}

/// A running (or exited) gateway child process
pub struct GatewayProcess {
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
    exited: Arc<AtomicBool>,
}

impl GatewayProcess {
    /// Spawn `entry` in `cwd` and start monitoring it
    pub fn spawn(
        entry: &EntryPoint,
        cwd: &Path,
        env: Vec<(String, String)>,
    ) -> Result<Self, SupervisorError> {
        let mut command = Command::new(&entry.program);
        command
            .args(&entry.args)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so `pnpm exec tsx` and the gateway it starts are
        // signalled together
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn()?;

        let pid = child.id();
        info!(
            "Spawned OpenClaw gateway (pid {:?}): {} {}",
            pid,
            entry.program,
            entry.args.join(" ")
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, true));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));
        let monitor = tokio::spawn(monitor(child, stop_rx, Arc::clone(&exited)));

        Ok(Self {
            pid,
            stop_tx: Some(stop_tx),
            monitor,
            exited,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    /// SIGTERM, then kill after [`STOP_GRACE`]. Resolves once the child is gone.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Err(e) = (&mut self.monitor).await {
            warn!("Gateway monitor task failed: {}", e);
        }
    }
}

async fn monitor(mut child: Child, mut stop_rx: oneshot::Receiver<()>, exited: Arc<AtomicBool>) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => warn!("OpenClaw gateway exited unexpectedly ({})", status),
            Err(e) => warn!("Failed to wait for OpenClaw gateway: {}", e),
        },
        _ = &mut stop_rx => terminate(&mut child).await,
    }
    exited.store(true, Ordering::SeqCst);
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    let group = child.id().map(|pid| pid as libc::pid_t);
    #[cfg(unix)]
    if let Some(pgid) = group {
        debug!("Sending SIGTERM to gateway process group {}", pgid);
        signal_group(pgid, libc::SIGTERM);
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => info!("OpenClaw gateway stopped ({})", status),
        Ok(Err(e)) => warn!("Failed to wait for OpenClaw gateway: {}", e),
        Err(_) => {
            warn!(
                "OpenClaw gateway did not exit within {:?}, killing",
                STOP_GRACE
            );
            if let Err(e) = child.kill().await {
                warn!("Failed to kill OpenClaw gateway: {}", e);
            }
        }
    }

    // Survivors in the group, e.g. a gateway whose launcher already exited
    #[cfg(unix)]
    if let Some(pgid) = group {
        signal_group(pgid, libc::SIGKILL);
    }
}

#[cfg(unix)]
fn signal_group(pgid: libc::pid_t, signal: libc::c_int) {
    // SAFETY: the group was created for our child by `process_group(0)`
    unsafe {
        libc::kill(-pgid, signal);
    }
}

async fn forward_output<R>(stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!(target: "clawlink::openclaw", "{}", line);
        } else {
            info!(target: "clawlink::openclaw", "{}", line);
        }
    }
}

/// Starts and stops the supervised gateway
#[async_trait]
pub trait GatewayLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<(), SupervisorError>;
    async fn shutdown(&self);
}

/// Owner of the single supervised gateway process
pub struct Supervisor {
    current: Mutex<Option<GatewayProcess>>,
    health_policy: RetryPolicy,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_health_policy(SPAWN_HEALTH_POLICY)
    }

    pub fn with_health_policy(health_policy: RetryPolicy) -> Self {
        Self {
            current: Mutex::new(None),
            health_policy,
        }
    }

    /// Stop any supervised process, spawn a new one and wait for it to answer.
    ///
    /// A gateway that never turns healthy is logged, not an error.
    pub async fn spawn(&self, spec: &LaunchSpec) -> Result<Option<u32>, SupervisorError> {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            info!("Stopping previously supervised gateway");
            previous.stop().await;
        }

        let entry = resolve_entry_point(&spec.checkout, spec.port)
            .ok_or_else(|| SupervisorError::NoEntryPoint(spec.checkout.clone()))?;
        for dir in [&spec.state_dir, &spec.workspace_dir] {
            std::fs::create_dir_all(dir)?;
        }

        let env = launch_env(spec, |key| std::env::var(key).ok());
        let process = GatewayProcess::spawn(&entry, &spec.checkout, env)?;
        let pid = process.pid();
        *current = Some(process);
        drop(current);

        let probe = HttpHealthProbe::for_port(spec.port);
        if health_check(&probe, &self.health_policy).await {
            info!("OpenClaw gateway is healthy at {}", probe.url());
        } else {
            warn!(
                "OpenClaw gateway did not answer {} after {} attempts",
                probe.url(),
                self.health_policy.attempts
            );
        }
        Ok(pid)
    }

    /// Stop the supervised process, if any
    pub async fn stop(&self) -> bool {
        let process = self.current.lock().await.take();
        match process {
            Some(process) => {
                process.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(GatewayProcess::is_running)
    }

    pub async fn pid(&self) -> Option<u32> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|p| p.is_running())
            .and_then(GatewayProcess::pid)
    }
}

#[async_trait]
impl GatewayLauncher for Supervisor {
    async fn launch(&self, spec: &LaunchSpec) -> Result<(), SupervisorError> {
        self.spawn(spec).await.map(|_| ())
    }

    async fn shutdown(&self) {
        self.stop().await;
    }
}
