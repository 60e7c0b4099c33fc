mod config;
mod gateway;
mod http;
mod placeholder;
mod sandbox;
mod secrets;
mod server;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::gateway::ExecutionGateway;
use crate::http::{build_http_client, FetchClient};
use crate::sandbox::Sandbox;
use crate::secrets::SecretStore;
use crate::server::Server;

fn print_help() {
    println!(
        "\
runjs-gateway v{}

Runs JavaScript in a bounded sandbox on behalf of an LLM client, filling in
stored secrets behind opaque placeholder tokens. Speaks line-delimited
JSON-RPC on stdin/stdout.

USAGE:
    runjs-gateway [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/gateway.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG                 Log level filter for tracing, written to stderr
                             (e.g. debug, runjs_gateway=debug,warn)
    RUNJS_MASTER_KEY         Master key for the secret store (32+ bytes)

EXAMPLES:
    runjs-gateway                             # uses config/gateway.toml
    runjs-gateway /etc/runjs/gateway.toml     # custom config path
    RUST_LOG=debug runjs-gateway              # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("runjs-gateway v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // stdout carries the protocol, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("runjs_gateway=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/gateway.toml".to_string());

    info!("runjs-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    info!("Sandbox limits: {}", config.sandbox.describe());
    info!(
        "HTTP: {} retries, {}s overall ceiling",
        config.resilience.max_retries, config.resilience.overall_timeout_secs
    );

    let store = Arc::new(SecretStore::from_config(&config.secrets)?);
    let client = build_http_client(&config.http)?;
    let fetch = FetchClient::new(client, config.resilience.clone(), config.http.max_body_bytes);
    let sandbox = Sandbox::new(config.sandbox.clone(), fetch);
    let gateway = Arc::new(ExecutionGateway::new(store, sandbox));
    let server = Arc::new(Server::new(gateway));

    info!("Serving JSON-RPC on stdio");
    tokio::select! {
        result = server.serve(tokio::io::stdin(), tokio::io::stdout()) => {
            if let Err(e) = &result {
                error!("Server error: {e}");
            }
            result?;
            info!("Input closed, exiting");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
        }
    }
    Ok(())
}
