use clap::{Parser, Subcommand};
use clawlink_core::GatewayMode;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "clawlink", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Data directory (defaults to ~/.clawlink)
    #[arg(long, value_name = "DIR", global = true)]
    pub home: Option<PathBuf>,

    /// Workspace whose .clawlink/gateway.json overrides global settings
    #[arg(short, long, value_name = "DIR", global = true)]
    pub workspace: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the effective gateway configuration and device identity
    Status,

    /// Connect (starting the local gateway in integrated mode) and stay attached
    Connect,

    /// Send one request and print the response payload
    Call {
        /// Method name, e.g. "health"
        method: String,

        /// JSON params
        #[arg(default_value = "{}")]
        params: String,
    },

    /// Print pushed events until interrupted
    Watch {
        /// Event name, or "*" for all
        #[arg(default_value = "*")]
        event: String,
    },

    /// Install, build and start a local OpenClaw gateway
    Install,

    /// Check node, pnpm and git
    Prereqs,

    /// Gateway settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration (token redacted)
    Show,

    /// Update settings globally, or for the workspace with --local
    Set {
        #[arg(long)]
        mode: Option<GatewayMode>,

        #[arg(long)]
        url: Option<String>,

        /// Bearer token; an empty value clears it
        #[arg(long)]
        token: Option<String>,

        /// OpenClaw checkout used in integrated mode
        #[arg(long)]
        path: Option<PathBuf>,

        /// Write to the workspace override instead of global settings
        #[arg(long)]
        local: bool,
    },
}
