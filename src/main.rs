use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use logistics_dispatch::api;
use logistics_dispatch::auth::JwtAuthenticator;
use logistics_dispatch::backends::Backends;
use logistics_dispatch::config::{Backend, Config};
use logistics_dispatch::error::AppError;
use logistics_dispatch::observability;
use logistics_dispatch::state::AppState;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config =
        Config::from_env().map_err(|err| AppError::Internal(format!("invalid config: {err}")))?;

    observability::init_tracing(&config.log_level, config.log_format);

    let backends = build_backends(&config).await?;
    let authenticator = Arc::new(JwtAuthenticator::hs256(&config.jwt_secret));
    let state = Arc::new(AppState::new(
        config.dispatch.clone(),
        backends,
        authenticator,
    ));

    state
        .start_consumers()
        .map_err(|err| AppError::Internal(format!("failed to start consumers: {err}")))?;
    state.start_pending_sweeper();

    let app = api::rest::router(state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        backend = ?config.backend,
        match_radius_km = config.dispatch.match_radius_km,
        "http server started"
    );

    tokio::spawn(shutdown_signal(state.shutdown.clone()));
    api::rest::serve(
        listener,
        app,
        state.shutdown.clone(),
        config.shutdown_timeout,
    )
    .await
    .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    tracing::info!("draining");
    state
        .drain(config.shutdown_timeout, config.resource_close_timeout)
        .await;
    tracing::info!("shutdown complete");

    Ok(())
}

async fn build_backends(config: &Config) -> Result<Backends, AppError> {
    match config.backend {
        Backend::Memory => {
            let (backends, _) =
                Backends::in_memory(&config.dispatch, config.operator_classes.clone());
            Ok(backends)
        }
        #[cfg(feature = "external")]
        Backend::External => Backends::external(config).await,
        #[cfg(not(feature = "external"))]
        Backend::External => Err(AppError::Internal(
            "BACKEND=external requires building with --features external".to_string(),
        )),
    }
}

/// Resolves on Ctrl-C or SIGTERM and cancels `token`, so background loops
/// and live sockets start winding down together with the HTTP listener.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    token.cancel();
}
