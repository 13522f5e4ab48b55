use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use keytide::config::Config;
use keytide::engine::Engine;
use keytide::transport;

struct AppState {
    engine: Arc<Engine>,
    http_client: reqwest::Client,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::info!("keytide starting");

    let config_path = keytide::config::default_config_path();
    let config = Config::load(&config_path, &[])?;

    let engine = Arc::new(Engine::new(
        config,
        std::path::PathBuf::from("key_usage.json"),
        std::path::PathBuf::from("unavailable.json"),
    ));

    spawn_tick_task(engine.clone());

    let http_client = reqwest::Client::builder().timeout(Duration::from_secs(120)).build()?;

    let state = Arc::new(AppState { engine, http_client });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/*path", any(proxy))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 48888));
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("keytide shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

/// Runs the engine's periodic maintenance (record pruning, reset catch-up)
/// once a minute, independent of request traffic, so a quiet proxy still
/// rolls its daily quota over on time.
fn spawn_tick_task(engine: Arc<Engine>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            if let Err(e) = engine.tick() {
                tracing::error!(error = %e, "periodic maintenance tick failed");
            }
        }
    });
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.status())
}

async fn proxy(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let query = parse_query(raw_query.as_deref());
    let requested_model = requested_model_from_path(&path);

    match transport::forward(
        &state.http_client,
        &state.engine,
        method,
        &path,
        &query,
        headers,
        body,
        requested_model.as_deref(),
    )
    .await
    {
        Ok(forwarded) => {
            let mut response = Response::builder().status(forwarded.status);
            *response.headers_mut().expect("builder has no prior error") = forwarded.headers;
            response.body(axum::body::Body::from(forwarded.body)).expect("response body is valid")
        }
        Err(e) => {
            tracing::error!(error = %e, "proxy request failed");
            let status = match &e {
                keytide::error::KeytideError::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
                keytide::error::KeytideError::InvalidKey => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(serde_json::json!({ "error": e.user_message() }))).into_response()
        }
    }
}

/// Recovers the model the client asked for from a `.../models/<model>:generateContent`
/// path, matching how the original proxy's clients address Gemini models —
/// there is no separate query parameter for it.
fn requested_model_from_path(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let model = segment.split(':').next()?;
    if model.is_empty() {
        None
    } else {
        Some(model.to_string())
    }
}

fn parse_query(raw: Option<&str>) -> Vec<(String, String)> {
    let Some(raw) = raw else { return Vec::new() };
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
