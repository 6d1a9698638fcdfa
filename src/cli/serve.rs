//! The `serve` subcommand: wire everything up and run the stdio loop.

use std::sync::Arc;

use tracing::{error, info};

use crate::catalog::CatalogRegistry;
use crate::cli::{Cli, EXIT_CONFIG, EXIT_INTERRUPT, EXIT_OK, EXIT_STARTUP};
use crate::config::load_config;
use crate::gateway::{ConfigSources, Dispatcher, GatewayServer};
use crate::manifest::Manifest;
use crate::policy::load_policy;
use crate::provision::Provisioner;
use crate::session::SessionManager;

/// Runs the gateway until the upstream closes stdin or a signal arrives.
pub async fn run_serve(cli: &Cli) -> u8 {
    let project_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Cannot determine working directory: {e}");
            return EXIT_CONFIG;
        }
    };

    let config = match load_config(cli.config.as_deref(), &project_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            eprintln!("Run `mcp-gateway init` to create a starter .mcp.json");
            return EXIT_CONFIG;
        }
    };
    let policy = match load_policy(cli.policy.as_deref()) {
        Ok(policy) => policy,
        Err(e) => {
            eprintln!("Policy error: {e}");
            return EXIT_CONFIG;
        }
    };
    let manifest = match Manifest::builtin() {
        Ok(manifest) => Arc::new(manifest),
        Err(e) => {
            eprintln!("Manifest error: {e}");
            return EXIT_CONFIG;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        servers = config.mcp_servers.len(),
        "starting mcp-gateway"
    );

    let manager = Arc::new(SessionManager::new());
    let catalog = Arc::new(CatalogRegistry::new());
    let provisioner = Arc::new(Provisioner::new(Arc::clone(&manifest), Arc::clone(&manager)));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&manager),
        catalog,
        policy,
        manifest,
        provisioner,
        ConfigSources {
            config_path: cli.config.clone(),
            policy_path: cli.policy.clone(),
            project_dir,
        },
    ));

    let configured = config.mcp_servers.len();
    let report = dispatcher.startup(&config).await;
    if configured > 0 && report.ready.is_empty() {
        error!(failed = report.failed.len(), "every downstream failed to start");
        return EXIT_STARTUP;
    }

    let mut server = GatewayServer::new(dispatcher);
    server.write_status_file().await;
    info!("gateway ready, waiting for upstream client");

    tokio::select! {
        result = server.run() => match result {
            Ok(()) => {
                info!("gateway shut down cleanly");
                EXIT_OK
            }
            Err(e) => {
                error!(error = %e, "transport error");
                1
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, closing sessions");
            manager.shutdown().await;
            EXIT_INTERRUPT
        }
    }
}
