//! WebSocket status push (`backend/web.py`'s `StatusWebsocket`): every
//! connected client receives the latest status snapshot on a fixed
//! interval, matching the original's 200ms `PeriodicCallback`.

use crate::http::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use std::time::Duration;

const PUSH_INTERVAL: Duration = Duration::from_millis(200);

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| push_status(socket, state))
}

async fn push_status(mut socket: WebSocket, state: AppState) {
    let mut ticker = tokio::time::interval(PUSH_INTERVAL);
    loop {
        ticker.tick().await;
        let latest = state.driveboard.latest();
        let payload = serde_json::json!({
            "state": format!("{:?}", latest.state),
            "job_percent": latest.job_percent,
            "status": latest.status,
        });
        let text = match serde_json::to_string(&payload) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize status push");
                continue;
            }
        };
        if socket.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
}
