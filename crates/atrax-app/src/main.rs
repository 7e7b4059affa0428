mod cli;

use std::net::SocketAddr;
use std::sync::Arc;

use atrax_core::{DownstreamServer, ProxyConfig, Router};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Json;
use clap::Parser;
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use cli::{Cli, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = ProxyConfig::load(&cli.config)?;
    let host = config.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
    let port = config.port.unwrap_or(8080);

    let router = Router::new(config.server_configs(), config.conflict_strategy)?;
    router.start_all().await;

    let downstream = Arc::new(DownstreamServer::new(Arc::clone(&router)));
    let app = axum::Router::new()
        .route("/mcp", post(handle_rpc))
        .with_state(downstream)
        .merge(
            axum::Router::new()
                .route("/mcp/server-reply", post(handle_server_reply))
                .with_state(Arc::clone(&router)),
        );

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "atrax listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    router.stop_all().await;
    Ok(())
}

async fn handle_rpc(State(downstream): State<Arc<DownstreamServer>>, Json(body): Json<Value>) -> impl IntoResponse {
    match downstream.handle_value(body).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// A downstream client's reply to a server-initiated request (e.g.
/// `sampling/createMessage`), keyed by the `downstreamId` handed out in the
/// matching `DownstreamEvent::ServerRequest`.
#[derive(Debug, Deserialize)]
struct ServerReplyBody {
    #[serde(rename = "downstreamId")]
    downstream_id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ServerReplyError>,
}

#[derive(Debug, Deserialize)]
struct ServerReplyError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

async fn handle_server_reply(State(router): State<Arc<Router>>, Json(body): Json<ServerReplyBody>) -> impl IntoResponse {
    let outcome = match (body.result, body.error) {
        (Some(result), _) => Ok(result),
        (None, Some(err)) => Err((err.code, err.message, err.data)),
        (None, None) => {
            return (
                StatusCode::BAD_REQUEST,
                "server reply must carry one of 'result' or 'error'",
            )
                .into_response()
        }
    };

    match router.resolve_server_request(body.downstream_id, outcome).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

fn init_tracing(cli: &Cli) {
    let filter = cli
        .log_level
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl_c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
