//! `dialog-core-server`: binds the webhook, media, and operator routes and
//! wires the provider HTTP clients, the shared rate limiter, the event bus,
//! and the session registry into one [`dialog_core::session::AppState`].
//!
//! Exit codes: 0 normal, 2 config error, 3 bind failure, 130
//! signal-terminated.

use axum::routing::{get, post};
use axum::Router;
use dialog_core::events::EventBus;
use dialog_core::persistence::NoopBookingHook;
use dialog_core::providers::{FallbackTtsProvider, HttpNluProvider, HttpSttProvider, HttpTtsProvider};
use dialog_core::ratelimit::TokenBucket;
use dialog_core::session::{AppState, PendingCallRegistry, Providers, SessionRegistry};
use dialog_core::{media_ws, ops_ws, webhook, Config};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_BIND_FAILURE: i32 = 3;
const EXIT_SIGNAL_TERMINATED: i32 = 130;

/// How often the event bus emits a keepalive to operator subscribers.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(port = config.http_port, "starting dialog-core-server");

    let http_client = reqwest::Client::new();
    let limiter = Arc::new(TokenBucket::new(config.provider_qps));

    let primary_tts = HttpTtsProvider::new(&config.providers, http_client.clone(), limiter.clone());
    let mut fallback_providers = config.providers.clone();
    fallback_providers.tts_endpoint = config.providers.tts_fallback_endpoint.clone();
    fallback_providers.tts_api_key = config.providers.tts_fallback_api_key.clone();
    let fallback_tts = HttpTtsProvider::new(&fallback_providers, http_client.clone(), limiter.clone());

    let providers = Providers {
        stt: Arc::new(HttpSttProvider::new(&config.providers, http_client.clone(), limiter.clone())),
        tts: Arc::new(FallbackTtsProvider::new(primary_tts, fallback_tts)),
        nlu: Arc::new(HttpNluProvider::new(&config.providers, http_client, limiter)),
        booking_hook: Arc::new(NoopBookingHook),
    };

    let event_bus = Arc::new(EventBus::new());
    spawn_keepalive(event_bus.clone());

    let state = AppState {
        config: config.clone(),
        event_bus,
        registry: SessionRegistry::new(),
        providers,
        pending_calls: PendingCallRegistry::new(),
    };

    let app = Router::new()
        .route("/webhook", post(webhook::incoming_call_handler))
        .route("/media/{call_id}", get(media_ws::media_ws_handler))
        .route("/ops", get(ops_ws::ops_ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(address = %addr, error = %e, "failed to bind HTTP listener");
            std::process::exit(EXIT_BIND_FAILURE);
        }
    };
    info!(address = %addr, "listening");

    let signaled = Arc::new(AtomicBool::new(false));
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(signaled.clone()))
        .await;

    match result {
        Ok(()) if signaled.load(Ordering::SeqCst) => std::process::exit(EXIT_SIGNAL_TERMINATED),
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "server error");
            std::process::exit(EXIT_SIGNAL_TERMINATED);
        }
    }
}

fn spawn_keepalive(event_bus: Arc<EventBus>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        loop {
            ticker.tick().await;
            event_bus.publish_keepalive();
        }
    });
}

async fn shutdown_signal(signaled: Arc<AtomicBool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    signaled.store(true, Ordering::SeqCst);
    info!("shutdown signal received, draining connections");
}
