//! Live poll voting service.
//!
//! Votes land in a shared counter store (Redis in multi-worker deployments,
//! an in-process store otherwise) where increments and duplicate-voter
//! checks are atomic, and a background job reconciles those counts into the
//! durable poll records on a fixed period. Subscribers of a poll's realtime
//! channel get a results snapshot pushed after every accepted vote.
//!
//! Consistency between the cache and the durable records is eventual with a
//! bounded delay. The cache is the freshest view of every tally; the
//! durable record is what survives a restart.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    http::{HeaderValue, Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod ratelimit;
pub mod realtime;
pub mod routes;
pub mod state;
pub mod store;
pub mod sync;
pub mod voting;

use realtime::ws_handler;
use routes::{
    create_poll_handler, get_poll_handler, health_handler, list_polls_handler, results_handler,
    vote_handler,
};
use state::AppState;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/polls", post(create_poll_handler).get(list_polls_handler))
        .route("/api/polls/{id}", get(get_poll_handler))
        .route("/api/polls/{id}/results", get(results_handler))
        .route("/api/polls/{id}/vote", post(vote_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

pub async fn start_server() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = AppState::new().await;

    info!("Starting server...");

    let origin = state
        .config
        .client_url
        .parse::<HeaderValue>()
        .expect("CLIENT_URL misconfigured!");
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    let app = app(state.clone()).layer(cors);

    let _reconciler = sync::spawn(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await.unwrap();
    info!("Server running on {address}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();

    println!("Server shutting down...");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
