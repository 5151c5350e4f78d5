// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::net::SocketAddr;
use std::process::ExitCode;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use platform_identity::{
    api::router,
    auth::{AuthEngine, EngineError},
    config::{ConfigError, Settings, TlsSettings, LOG_FORMAT_ENV},
    state::AppState,
};

const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("invalid bind address {0}")]
    Address(String),

    #[error("failed to install the rustls crypto provider")]
    CryptoProvider,

    #[error("TLS: {0}")]
    Tls(std::io::Error),

    #[error("server: {0}")]
    Io(#[from] std::io::Error),
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    // Before any TLS or outbound HTTPS
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| StartupError::CryptoProvider)?;

    let settings = Settings::from_env()?;
    info!(
        public_url = %settings.public_url,
        audience = %settings.token_audience,
        oidc = settings.oidc.is_some(),
        tls = settings.tls.is_some(),
        "Loaded configuration"
    );

    let engine = AuthEngine::from_settings(&settings).await?;
    let addr: SocketAddr = settings
        .bind_address()
        .parse()
        .map_err(|_| StartupError::Address(settings.bind_address()))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    serve(AppState::new(engine, settings), addr, shutdown).await
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}

async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), StartupError> {
    let tls = state.settings.tls.clone();
    let app = router(state);

    match tls {
        Some(tls) => serve_tls(app, addr, &tls, shutdown).await,
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(addr = %listener.local_addr()?, "Listening on http (docs at /docs)");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await?;
            info!("Server stopped");
            Ok(())
        }
    }
}

async fn serve_tls(
    app: Router,
    addr: SocketAddr,
    tls: &TlsSettings,
    shutdown: CancellationToken,
) -> Result<(), StartupError> {
    let config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(StartupError::Tls)?;

    info!(%addr, cert = %tls.cert_path.display(), "Listening on https (docs at /docs)");
    tokio::select! {
        result = axum_server::bind_rustls(addr, config).serve(app.into_make_service()) => {
            result?;
        }
        _ = shutdown.cancelled() => {
            info!("Server stopped");
        }
    }
    Ok(())
}
