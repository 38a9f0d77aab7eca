//! Server accept loop, background tasks, and graceful shutdown.
//!
//! Contains the runtime infrastructure between the TCP listener and the
//! per-request pipeline, kept out of `main()` so that it stays testable
//! without signal handling or `std::process::exit`.

use std::sync::Arc;
use std::time::Duration;

use hyper::Response;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::handler::{AppState, ResponseBody, apply_cors, respond};
use crate::{GateError, QuotaLedger};

/// Runtime state shared across the accept loop.
pub struct ServerState {
    /// Configuration, ledger, and gateway shared by all handlers.
    pub app: AppState,
    /// Bounds the number of concurrent in-flight requests.
    pub semaphore: Arc<Semaphore>,
}

impl ServerState {
    /// Wraps `app` with a semaphore sized from its configuration.
    pub fn new(app: AppState) -> Self {
        let semaphore = Arc::new(Semaphore::new(app.config.max_concurrent_requests));
        Self { app, semaphore }
    }
}

/// Accepts connections on `listener` and serves each one on its own task.
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. In-flight requests on already-spawned tasks continue
/// to completion independently. When a client disconnects mid-request,
/// hyper drops the request future, which cancels any outstanding
/// completion call.
pub async fn serve(listener: TcpListener, state: ServerState, shutdown: impl Future<Output = ()>) {
    let ServerState { app, semaphore } = state;
    let concurrency_limit = app.config.max_concurrent_requests;

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let app = app.clone();
                let semaphore = Arc::clone(&semaphore);

                tokio::spawn(async move {
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let app = app.clone();
                        let semaphore = Arc::clone(&semaphore);
                        async move {
                            let _permit = match semaphore.try_acquire() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        limit = concurrency_limit,
                                        "concurrency limit reached, rejecting request"
                                    );
                                    let mut resp = GateError::ServiceUnavailable {
                                        limit: concurrency_limit,
                                    }
                                    .into_response();
                                    apply_cors(resp.headers_mut(), &app.config.allowed_origin);
                                    return Ok::<Response<ResponseBody>, std::convert::Infallible>(
                                        resp,
                                    );
                                }
                            };

                            let resp = respond(req, &app, client_addr).await;
                            Ok::<Response<ResponseBody>, std::convert::Infallible>(resp)
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        warn!(%e, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

/// Spawns a background task that periodically drops expired ledger
/// records, bounding memory under high-cardinality traffic.
pub fn spawn_ledger_pruner(ledger: QuotaLedger, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let before = ledger.tracked_keys();
            let pruned = ledger.prune_expired();
            if pruned > 0 {
                info!(
                    before,
                    after = ledger.tracked_keys(),
                    pruned,
                    "quota ledger cleanup completed"
                );
            }
        }
    })
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}
