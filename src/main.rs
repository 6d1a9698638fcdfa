//! mcp-gateway: progressive-disclosure gateway for MCP tool servers
//!
//! The default subcommand serves the gateway over stdio for an upstream
//! MCP client. Offline subcommands inspect or nudge a running gateway
//! through the user-scoped cache directory.

use std::process::ExitCode;

use clap::Parser;

use mcp_gateway::cli::{self, Cli};

/// Entry point for the mcp-gateway binary.
fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(cli::run(cli));
    ExitCode::from(code)
}
