use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use scan_core::config::Configuration;
use scan_core::flags::Flags;
use scan_core::handlers;
use scan_core::orchestrator::Orchestrator;
use scan_core::scanner_controller::ScannerController;
use scan_core::serial_manager::SerialManager;
use scan_core::state::AppState;
use scan_core::ultrasound::mjpeg::{run_producer, FrameBus};
use scan_core::ultrasound::UltrasoundSession;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scan_core=info".into()),
        )
        .init();

    info!("scan-core v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Configuration::default());
    std::fs::create_dir_all(&config.state_dir).ok();
    std::fs::create_dir_all(&config.data_root).ok();

    let flags = Arc::new(Flags::new(config.state_dir.clone()));
    let serial = SerialManager::new(Arc::clone(&config));
    serial.start().await;

    let scanner = Arc::new(ScannerController::new(Arc::clone(&serial), Arc::clone(&config), Arc::clone(&flags)));
    let ultrasound = Arc::new(UltrasoundSession::new(Arc::clone(&config)));
    let orchestrator = Orchestrator::new(
        Arc::clone(&config),
        Arc::clone(&serial),
        Arc::clone(&scanner),
        Arc::clone(&ultrasound),
        Arc::clone(&flags),
    );

    let frame_bus = FrameBus::new(4);
    tokio::spawn(run_producer(Arc::clone(&ultrasound), Arc::clone(&config), frame_bus.clone()));

    let state = AppState {
        config: Arc::clone(&config),
        serial: Arc::clone(&serial),
        scanner: Arc::clone(&scanner),
        ultrasound: Arc::clone(&ultrasound),
        flags: Arc::clone(&flags),
        orchestrator: Arc::clone(&orchestrator),
        frame_bus,
    };

    let cors_origins_env =
        std::env::var("CORS_ORIGINS").unwrap_or_else(|_| "http://localhost:5173".to_string());
    let cors = if cors_origins_env.trim() == "*" {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> =
            cors_origins_env.split(',').filter_map(|o| o.trim().parse::<HeaderValue>().ok()).collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    };

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/position", get(handlers::position))
        .route("/jog", post(handlers::jog))
        .route("/continuous-move/start", post(handlers::continuous_move_start))
        .route("/continuous-move/stop", post(handlers::continuous_move_stop))
        .route("/go-to-init", post(handlers::go_to_init))
        .route("/scan-plan", post(handlers::plan_scan))
        .route("/scan/single", post(handlers::run_single_sweep))
        .route("/scan/multi", post(handlers::run_multi_sweep))
        .route("/preview/live", get(handlers::live_preview))
        .route("/shutdown", post(handlers::shutdown))
        .layer(cors)
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "8420".to_string());
    let addr = format!("0.0.0.0:{port}");
    info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await.expect("bind HTTP listener");
    axum::serve(listener, app).await.expect("axum server exited");
}
