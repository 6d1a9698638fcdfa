//! Command-line interface.
//!
//! One binary; the default subcommand serves the gateway over stdio. The
//! offline subcommands (`status`, `logs`, `refresh`, `init`) talk to a
//! running gateway only through the user-scoped cache directory — a status
//! snapshot, a log file, and a refresh marker — which is never
//! authoritative state.
//!
//! # Exit Codes
//!
//! - `0` success
//! - `2` configuration or policy error
//! - `3` downstream start-up failure when running non-interactively
//! - `130` interrupted

mod offline;
mod serve;

pub use offline::{run_init, run_logs, run_refresh, run_status};
pub use serve::run_serve;

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::cache_dir;

/// Successful exit.
pub const EXIT_OK: u8 = 0;
/// Configuration or policy error.
pub const EXIT_CONFIG: u8 = 2;
/// Downstream start-up failure (non-interactive).
pub const EXIT_STARTUP: u8 = 3;
/// Interrupted by signal.
pub const EXIT_INTERRUPT: u8 = 130;

/// Name of the gateway log file in the cache directory.
pub const LOG_FILE: &str = "gateway.log";

/// Progressive-disclosure MCP gateway.
///
/// Collapses any number of downstream MCP servers into nine meta-tools so
/// the upstream assistant fetches full tool schemas only on demand.
#[derive(Debug, Parser)]
#[command(name = "mcp-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the MCP config file
    #[arg(short, long, global = true, env = "MCP_GATEWAY_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Path to the policy file
    #[arg(long, global = true, env = "MCP_GATEWAY_POLICY", value_name = "FILE")]
    pub policy: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "MCP_GATEWAY_LOG_LEVEL", value_name = "LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands; absent means `serve`.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway server over stdio (the default)
    Serve,

    /// Show the running gateway's status snapshot
    Status {
        /// Emit raw JSON
        #[arg(long)]
        json: bool,
        /// Limit output to one server
        #[arg(long, value_name = "NAME")]
        server: Option<String>,
        /// Include pending request counts
        #[arg(long)]
        pending: bool,
    },

    /// Print (or follow) the gateway log
    Logs {
        /// Keep printing as new lines arrive
        #[arg(long)]
        follow: bool,
        /// Number of trailing lines to print
        #[arg(long, value_name = "N", default_value_t = 50)]
        tail: usize,
        /// Only show lines at this level or above
        #[arg(long, value_name = "L")]
        level: Option<String>,
    },

    /// Ask a running gateway to reload config and reconcile sessions
    Refresh {
        /// Limit the refresh to one server
        #[arg(long, value_name = "NAME")]
        server: Option<String>,
        /// Restart unchanged sessions too
        #[arg(long)]
        force: bool,
    },

    /// Write a starter .mcp.json into a project
    Init {
        /// Project directory (defaults to the current directory)
        #[arg(long, value_name = "DIR")]
        project: Option<PathBuf>,
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
}

/// Runs the parsed CLI to an exit code.
pub async fn run(mut cli: Cli) -> u8 {
    let command = cli.command.take().unwrap_or(Command::Serve);
    let serving = matches!(command, Command::Serve);
    init_tracing(cli.log_level.as_deref(), serving);

    match command {
        Command::Serve => run_serve(&cli).await,
        Command::Status {
            json,
            server,
            pending,
        } => run_status(json, server.as_deref(), pending),
        Command::Logs {
            follow,
            tail,
            level,
        } => run_logs(follow, tail, level.as_deref()).await,
        Command::Refresh { server, force } => run_refresh(&cli, server.as_deref(), force),
        Command::Init { project, force } => run_init(project.as_deref(), force),
    }
}

/// Initialises the tracing subscriber.
///
/// Logs always go to stderr — stdout carries the protocol. When serving,
/// they are additionally teed into the cache-directory log file so the
/// `logs` subcommand has something to read.
fn init_tracing(level: Option<&str>, tee_to_file: bool) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)
            .unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let log_file = if tee_to_file {
        cache_dir().and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(LOG_FILE))
                .ok()
        })
    } else {
        None
    };

    let writer = TeeMakeWriter {
        file: log_file.map(|f| Arc::new(Mutex::new(f))),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .init();
}

/// `MakeWriter` that duplicates log lines to stderr and the log file.
#[derive(Clone)]
struct TeeMakeWriter {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: self.file.clone(),
        }
    }
}

struct TeeWriter {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let _ = file.write_all(buf);
        }
        std::io::stderr().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let _ = file.flush();
        }
        std::io::stderr().flush()
    }
}
