mod cli;

use anyhow::Context;
use clap::Parser;
use clawlink::{InstallProgress, IntegrationManager, ManagerOptions, StepStatus};
use clawlink_core::{ClawlinkPaths, ConfigPatch, ConfigScope, GatewayMode};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{Cli, Commands, ConfigCommands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clawlink=info,warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let paths = cli.home.clone().map(ClawlinkPaths::new).unwrap_or_default();
    let workspace = match cli.workspace.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let manager = IntegrationManager::new(ManagerOptions::new(paths));
    manager.load_config(Some(workspace.as_path()));

    match cli.command {
        Commands::Status => {
            print_json(&manager.status().await)?;
        }
        Commands::Connect => {
            manager.start(Some(workspace.as_path())).await?;
            print_json(&manager.status().await)?;
            if manager.config().mode == GatewayMode::Integrated {
                info!("Local gateway running, press Ctrl+C to stop");
                wait_for_shutdown(&manager).await?;
            } else {
                manager.stop().await;
            }
        }
        Commands::Call { method, params } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("params must be valid JSON")?;
            manager.start(Some(workspace.as_path())).await?;
            let result = manager.send_request(&method, params).await;
            manager.stop().await;
            print_json(&result?)?;
        }
        Commands::Watch { event } => {
            manager.subscribe(event, |name, payload| {
                println!("{} {}", name, payload);
            });
            manager.start(Some(workspace.as_path())).await?;
            info!("Watching gateway events, press Ctrl+C to stop");
            wait_for_shutdown(&manager).await?;
        }
        Commands::Install => {
            let outcome = manager.install(print_progress).await;
            print_json(&outcome)?;
            if !outcome.success {
                anyhow::bail!("install failed");
            }
            wait_for_shutdown(&manager).await?;
        }
        Commands::Prereqs => {
            let report = manager.check_prerequisites().await;
            print_json(&report)?;
            if !report.ready {
                std::process::exit(1);
            }
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => print_json(&redacted(manager.config()))?,
            ConfigCommands::Set {
                mode,
                url,
                token,
                path,
                local,
            } => {
                let patch = ConfigPatch {
                    mode,
                    url,
                    auth_token: token,
                    path: path.map(absolute),
                };
                if patch.is_empty() {
                    anyhow::bail!("nothing to set; pass --mode, --url, --token or --path");
                }
                let scope = if local {
                    ConfigScope::Workspace
                } else {
                    ConfigScope::Global
                };
                let config = manager.set_config(&patch, scope, Some(workspace.as_path()))?;
                print_json(&redacted(config))?;
            }
        },
    }

    Ok(())
}

fn print_progress(progress: &InstallProgress) {
    let marker = match progress.status {
        StepStatus::Running => "..",
        StepStatus::Done => "ok",
        StepStatus::Skipped => "--",
        StepStatus::Failed => "!!",
    };
    match &progress.detail {
        Some(detail) => eprintln!("[{}] {} ({})", marker, progress.step, detail),
        None => eprintln!("[{}] {}", marker, progress.step),
    }
}

async fn wait_for_shutdown(manager: &IntegrationManager) -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    manager.stop().await;
    Ok(())
}

fn redacted(mut config: clawlink::ConnectionConfig) -> clawlink::ConnectionConfig {
    config.auth_token = config
        .auth_token
        .as_deref()
        .map(clawlink_core::config::redact_token);
    config
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
