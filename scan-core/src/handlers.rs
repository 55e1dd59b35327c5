//! HTTP surface (spec §6): plain JSON request/response handlers over the
//! Scanner Controller, Orchestrator, and live MJPEG preview. No
//! Socket.IO layer — the operator UI polls/streams over plain HTTP, so
//! the teacher's `socketioxide` dependency has no counterpart here (see
//! DESIGN.md).

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::stream::StreamExt;
use scan_protocol::{Axis, ScanMode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::state::AppState;

// ─── Health ────────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "serialConnected": state.serial.is_connected(),
        "scanning": state.flags.scanning(),
        "multisweep": state.flags.multisweep(),
    }))
}

// ─── Position ─────────────────────────────────────────────────────────────

pub async fn position(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snap = state.scanner.get_position_snapshot().await;
    Json(serde_json::to_value(snap).unwrap_or_default())
}

// ─── Jog ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct JogRequest {
    pub axis: AxisParam,
    pub step: f64,
    pub direction: i8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisParam {
    X,
    Y,
    Z,
    E,
}

impl From<AxisParam> for Axis {
    fn from(p: AxisParam) -> Axis {
        match p {
            AxisParam::X => Axis::X,
            AxisParam::Y => Axis::Y,
            AxisParam::Z => Axis::Z,
            AxisParam::E => Axis::E,
        }
    }
}

pub async fn jog(State(state): State<AppState>, Json(req): Json<JogRequest>) -> Response {
    match state.orchestrator.jog_once(req.axis.into(), req.step, req.direction).await {
        Ok((ok, message)) => Json(json!({ "ok": ok, "message": message })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ContinuousMoveRequest {
    pub axis: AxisParam,
    pub direction: i8,
}

pub async fn continuous_move_start(
    State(state): State<AppState>,
    Json(req): Json<ContinuousMoveRequest>,
) -> Response {
    match state.orchestrator.start_continuous(req.axis.into(), req.direction).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Omitting `axis`/`direction` (an empty `{}` body) stops every running
/// worker; providing both stops only that one (spec §4.4's
/// `stop_continuous(action | all)`).
#[derive(Debug, Default, Deserialize)]
pub struct ContinuousMoveStopRequest {
    pub axis: Option<AxisParam>,
    pub direction: Option<i8>,
}

pub async fn continuous_move_stop(
    State(state): State<AppState>,
    Json(req): Json<ContinuousMoveStopRequest>,
) -> Json<serde_json::Value> {
    let target = match (req.axis, req.direction) {
        (Some(axis), Some(direction)) => Some((axis.into(), direction)),
        _ => None,
    };
    state.orchestrator.stop_continuous(target).await;
    Json(json!({ "ok": true }))
}

// ─── Homing ───────────────────────────────────────────────────────────────

pub async fn go_to_init(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (ok, message) = state.scanner.go_to_init().await;
    Json(json!({ "ok": ok, "message": message }))
}

// ─── Scan planning and execution ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PlanScanRequest {
    pub mode: ScanModeParam,
    pub x0: Option<f64>,
    pub x1: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanModeParam {
    Long,
    Short,
    Custom,
}

impl From<ScanModeParam> for ScanMode {
    fn from(p: ScanModeParam) -> ScanMode {
        match p {
            ScanModeParam::Long => ScanMode::Long,
            ScanModeParam::Short => ScanMode::Short,
            ScanModeParam::Custom => ScanMode::Custom,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ScanPlanResponse {
    pub x0: f64,
    pub x1: f64,
    pub mode: &'static str,
}

pub async fn plan_scan(State(state): State<AppState>, Json(req): Json<PlanScanRequest>) -> Response {
    let plan = state.orchestrator.plan_scan(req.mode.into(), req.x0.zip(req.x1));
    Json(ScanPlanResponse { x0: plan.x0, x1: plan.x1, mode: plan.mode.as_str() }).into_response()
}

pub async fn run_single_sweep(State(state): State<AppState>) -> Response {
    let Some(plan) = state.flags.scanplan() else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "no scan plan set" }))).into_response();
    };
    match state.orchestrator.run_single_sweep(plan).await {
        Ok(dir) => Json(json!({ "ok": true, "folder": dir })).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn run_multi_sweep(State(state): State<AppState>) -> Response {
    let Some(plan) = state.flags.scanplan() else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "no scan plan set" }))).into_response();
    };
    match state.orchestrator.run_multi_sweep(plan).await {
        Ok((a, b)) => Json(json!({ "ok": true, "folders": [a, b] })).into_response(),
        Err(e) => error_response(e),
    }
}

// ─── Live MJPEG preview ───────────────────────────────────────────────────

const MJPEG_BOUNDARY: &str = "scanframe";

pub async fn live_preview(State(state): State<AppState>) -> Response {
    let rx = state.frame_bus.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(frame) => {
                let mut chunk = Vec::with_capacity(frame.len() + 64);
                chunk.extend_from_slice(format!("--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", frame.len()).as_bytes());
                chunk.extend_from_slice(&frame);
                chunk.extend_from_slice(b"\r\n");
                Some(Ok::<_, std::io::Error>(Bytes::from(chunk)))
            }
            Err(_) => {
                warn!("mjpeg: subscriber lagged, dropping to latest frame");
                None
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"))
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ─── Shutdown ─────────────────────────────────────────────────────────────

/// Acknowledges immediately and triggers shutdown asynchronously (spec §6)
/// so the HTTP response isn't blocked on child-process teardown.
pub async fn shutdown(State(state): State<AppState>) -> Json<serde_json::Value> {
    info!("handlers: shutdown requested over HTTP");
    tokio::spawn(async move {
        state.orchestrator.shutdown().await;
        std::process::exit(0);
    });
    Json(json!({ "ok": true, "message": "shutting down" }))
}

fn error_response(e: scan_protocol::ErrorKind) -> Response {
    use scan_protocol::ErrorKind::*;
    let status = match e {
        NotConnected | ProbeUnavailable(_) | NotReady => StatusCode::SERVICE_UNAVAILABLE,
        Timeout => StatusCode::GATEWAY_TIMEOUT,
        OutOfRange | InvalidArgument(_) => StatusCode::BAD_REQUEST,
        AlreadyActive => StatusCode::CONFLICT,
        ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        QueueFull => StatusCode::TOO_MANY_REQUESTS,
        IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}
