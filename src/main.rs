use std::sync::Arc;

use doubt_gate::server::{ServerState, serve, shutdown_signal, spawn_ledger_pruner};
use doubt_gate::{AppState, Config};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE_PATH: &str = "./Config.yml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| CONFIG_FILE_PATH.to_owned());

    let config = Config::load_from_file(&config_path)
        .and_then(Config::into_runtime)
        .unwrap_or_else(|e| {
            error!(%e, path = %config_path, "fatal: invalid configuration");
            std::process::exit(1);
        });
    let config = Arc::new(config);

    let api_key = config.api_key_from_env();
    if api_key.is_none() {
        warn!(
            env = %config.upstream.api_key_env,
            "completion credential not set, every question will be refused"
        );
    }

    let app = AppState::from_config(Arc::clone(&config), api_key.as_deref()).unwrap_or_else(|e| {
        error!(%e, "fatal: failed to build application state");
        std::process::exit(1);
    });

    if let Some(interval) = config.prune_interval {
        spawn_ledger_pruner(app.ledger.clone(), interval);
    }

    let listener = TcpListener::bind(config.listen).await.unwrap_or_else(|e| {
        error!(%e, addr = %config.listen, "fatal: failed to bind");
        std::process::exit(1);
    });

    info!(
        addr = %config.listen,
        path = %config.path,
        anonymous_limit = config.quota.anonymous_limit,
        authenticated_limit = config.quota.authenticated_limit,
        model = %config.upstream.model,
        "listening"
    );

    serve(listener, ServerState::new(app), shutdown_signal()).await;
}
