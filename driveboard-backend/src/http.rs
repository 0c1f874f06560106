//! HTTP surface (`backend/web.py`'s `GcodeHandler`/`StatusHandler`/
//! `ConfigHandler`/`FirmwareHandler`): streamed G-code submission,
//! status JSON, config JSON, and stubbed firmware actions.

use crate::config::BackendConfig;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use driveboard_engine::DriveboardHandle;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct AppState {
    pub driveboard: DriveboardHandle,
    pub config: BackendConfig,
    /// Holds the whole duration of a streamed job's POST body so two
    /// concurrent uploads can't interleave their lines on the wire.
    pub job_lock: std::sync::Arc<Mutex<()>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/config", get(get_config))
        .route("/gcode", post(post_gcode))
        .route("/firmware/:action", post(firmware_action))
        .with_state(state)
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let latest = state.driveboard.latest();
    Json(json!({
        "state": format!("{:?}", latest.state),
        "job_percent": latest.job_percent,
        "status": latest.status,
    }))
}

#[derive(Serialize)]
struct ConfigResponse {
    baudrate: u32,
    serial_port: Option<String>,
    http_port: u16,
    gcode_tcp_port: u16,
    debug: bool,
    public: bool,
}

async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(ConfigResponse {
        baudrate: state.config.driveboard.baudrate,
        serial_port: state.config.driveboard.serial_port.clone(),
        http_port: state.config.http_port,
        gcode_tcp_port: state.config.gcode_tcp_port,
        debug: state.config.debug,
        public: state.config.public,
    })
}

/// Body is newline-separated G-code; held under `job_lock` for the
/// whole request so a second upload can't interleave lines with this
/// one (spec.md §5).
async fn post_gcode(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let _guard = state.job_lock.lock().await;
    for (lineno, line) in body.lines().enumerate() {
        match state.driveboard.submit_gcode_line(line.to_string()).await {
            Ok(response) => {
                if let Some(reason) = response.strip_prefix("error:") {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({ "gcode_error": format!("line {}: {reason}", lineno + 1) })),
                    )
                        .into_response();
                }
            }
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "gcode_error": format!("line {}: {e}", lineno + 1) })),
                )
                    .into_response();
            }
        }
    }
    StatusCode::OK.into_response()
}

/// The firmware build/flash/reset actions the original exposes over
/// HTTP. Out of scope here (flashing firmware is not part of this
/// engine); kept as named routes so the surface shape matches.
async fn firmware_action(Path(action): Path<String>) -> impl IntoResponse {
    tracing::debug!(action, "firmware action requested but not implemented");
    (StatusCode::NOT_IMPLEMENTED, Json(json!({ "error": format!("firmware {action} is not implemented") })))
}
