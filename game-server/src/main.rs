use anyhow::Context;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::FutureExt;
use game_server::board::{self, BoardDescription};
use game_server::config::ServerConfig;
use game_server::game::Game;
use game_server::state::AppState;
use game_server::{connection, tickers};
use protocol::{ErrorCode, ErrorContext, OutgoingMessage};
use std::panic::AssertUnwindSafe;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
/// Activates error tracing, then runs the server. Exit codes: 0 for a normal
/// shutdown, 1 for a fatal startup error, 2 for a panic caught at top level.
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true),
        )
        .init();

    match AssertUnwindSafe(run()).catch_unwind().await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            tracing::error!(?err, "fatal startup error");
            ExitCode::from(1)
        }
        Err(_) => {
            tracing::error!("unexpected panic reached the top level");
            ExitCode::from(2)
        }
    }
}

/// Loads the configuration and the board, wires up the tickers and the
/// shutdown path, and serves the WebSocket route until the process is told
/// to stop.
async fn run() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("invalid configuration")?;
    let description = match &config.map_path {
        Some(path) => board::load_description(path)
            .await
            .with_context(|| format!("failed to load map file {}", path.display()))?,
        None => BoardDescription::default_room(),
    };
    let game = Game::new(&description).context("rejected map description")?;
    let state = Arc::new(AppState::new(config, game));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tickers = tickers::spawn_tickers(state.clone(), shutdown_rx.clone());

    // On ctrl-c every active client gets a farewell error and a close frame,
    // then the acceptor is told to wind down.
    let signal_state = state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("failed to listen for the shutdown signal");
            return;
        }
        tracing::info!("shutdown signal received");
        let farewell = OutgoingMessage::error(
            ErrorCode::ServerShutdown,
            "server is shutting down",
            ErrorContext::default(),
        )
        .encode();
        {
            let mut registry = signal_state.registry.lock().await;
            registry.shutdown_all(&farewell);
        }
        let _ = shutdown_tx.send(true);
    });

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state.clone());

    let address = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    tracing::info!(address, "listening for clients");

    let mut serve_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        })
        .await
        .context("server failed")?;

    for ticker in tickers {
        ticker.abort();
    }
    tracing::info!("server stopped");
    Ok(())
}

/// Upgrades the request and hands the socket to the per-connection tasks.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| connection::handle_socket(socket, state))
}
