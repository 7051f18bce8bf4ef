use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use async_stream::stream;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use fanout_events::ChannelSink;
use fanout_kernel::{Aggregator, SourceInfo, demo_registry};
use fanout_protocol::{AggregatorError, ChatMessage, RequestId, SourceId, SourceRequest};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod sse;

use crate::sse::SseFrame;

#[derive(Debug, Parser)]
#[command(name = "fanout-api")]
#[command(about = "Fan-out aggregation API")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:8787")]
    listen: SocketAddr,
    /// Concurrent source invocations allowed across all sessions.
    #[arg(long, default_value_t = fanout_runtime::DEFAULT_MAX_SOURCES)]
    pool_size: usize,
    #[arg(long, default_value_t = 45)]
    source_timeout_secs: u64,
    #[arg(long, default_value_t = 2_000)]
    cancel_grace_ms: u64,
    #[arg(long, default_value_t = fanout_runtime::DEFAULT_MAX_SOURCES)]
    max_sources: usize,
}

#[derive(Clone)]
struct AppState {
    aggregator: Aggregator,
}

#[derive(Debug, Deserialize)]
struct StreamRequest {
    request_id: Option<RequestId>,
    prompt: String,
    #[serde(default)]
    history: Vec<ChatMessage>,
    sources: Vec<SourceId>,
}

#[derive(Debug, Serialize)]
struct SourceListResponse {
    sources: Vec<SourceInfo>,
    max_sources_per_request: usize,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<AggregatorError> for ApiError {
    fn from(error: AggregatorError) -> Self {
        let status = match &error {
            AggregatorError::InvalidRequest(_) | AggregatorError::UnknownSource(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let aggregator = Aggregator::builder()
        .pool_size(cli.pool_size)
        .shared_pool(true)
        .source_timeout(Duration::from_secs(cli.source_timeout_secs))
        .cancel_grace(Duration::from_millis(cli.cancel_grace_ms))
        .max_sources_per_request(cli.max_sources)
        .registry(demo_registry())
        .build();

    let app = router(AppState { aggregator });

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(
        listen = %cli.listen,
        pool_size = cli.pool_size,
        source_timeout_secs = cli.source_timeout_secs,
        "fanout-api listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/sources", get(list_sources))
        .route("/v1/streams", post(create_stream))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "fanout-api"
    }))
}

async fn list_sources(State(state): State<AppState>) -> Json<SourceListResponse> {
    Json(SourceListResponse {
        sources: state.aggregator.sources(),
        max_sources_per_request: state.aggregator.max_sources_per_request(),
    })
}

/// Streams one aggregation session as SSE.
///
/// Dropping the response stream (client disconnect) closes the sink, which
/// cancels the session.
async fn create_stream(
    State(state): State<AppState>,
    Json(request): Json<StreamRequest>,
) -> ApiResult<(HeaderMap, Sse<impl Stream<Item = Result<Event, Infallible>>>)> {
    let mut source_request = SourceRequest::new(request.prompt, request.history);
    if let Some(request_id) = request.request_id {
        source_request.request_id = request_id;
    }

    let capacity = state
        .aggregator
        .config()
        .channel_capacity(request.sources.len());
    let (sink, mut events) = ChannelSink::new(capacity);
    let disconnected = sink.closed();
    let handle = state
        .aggregator
        .start(source_request, &request.sources, sink)?;

    let request_id = handle.request_id().clone();
    let canceller = handle.canceller();
    let watcher = tokio::spawn(async move {
        disconnected.await;
        if canceller.cancel() {
            info!(request_id = %request_id, "client went away; session cancelled");
        }
    });

    let stream = stream! {
        while let Some(event) = events.next().await {
            yield Ok(SseFrame::from_stream_event(&event).into_event());
        }
        watcher.abort();
        match handle.join().await {
            Ok(report) => yield Ok(SseFrame::done(&report).into_event()),
            Err(error) => {
                warn!(%error, "session ended with an error");
                yield Ok(SseFrame::error(&error).into_event());
            }
        }
    };

    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    );
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok((headers, sse))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use fanout_protocol::AggregatorError;

    use super::ApiError;

    #[test]
    fn validation_errors_map_to_bad_request() {
        let invalid = ApiError::from(AggregatorError::InvalidRequest("empty prompt".to_owned()));
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);

        let unknown = ApiError::from(AggregatorError::UnknownSource("ghost".into()));
        assert_eq!(unknown.status, StatusCode::BAD_REQUEST);
        assert_eq!(unknown.message, "unknown source: ghost");
    }

    #[test]
    fn session_errors_map_to_internal() {
        let aborted = ApiError::from(AggregatorError::Aborted("task panicked".to_owned()));
        assert_eq!(aborted.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
