#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use huddle_domain::{ChatMessage, RoomName};
use huddle_protocol::WS_PATH;
use serde::Deserialize;
use tracing::debug;

use crate::server::context::AppContext;
use crate::server::health::HealthState;
use crate::server::socket::run_socket;

#[derive(Clone)]
struct HttpState {
	ctx: Arc<AppContext>,
	health: HealthState,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
	room: Option<String>,
}

/// WebSocket endpoint, history API and health probes.
pub fn router(ctx: Arc<AppContext>, health: HealthState) -> Router {
	Router::new()
		.route(WS_PATH, get(ws_upgrade))
		.route("/api/messages", get(recent_messages))
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.with_state(HttpState { ctx, health })
}

async fn ws_upgrade(State(state): State<HttpState>, ws: WebSocketUpgrade) -> Response {
	let max = state.ctx.settings.max_frame_bytes;
	let ctx = state.ctx;
	ws.max_message_size(max)
		.max_frame_size(max)
		.on_upgrade(move |socket| run_socket(socket, ctx))
}

async fn recent_messages(State(state): State<HttpState>, Query(query): Query<HistoryQuery>) -> Response {
	let history: Vec<ChatMessage> = match query.room.as_deref().filter(|r| !r.trim().is_empty()) {
		None => state.ctx.messages.history(&RoomName::general()).await,
		Some(raw) => match RoomName::new(raw) {
			Ok(room) => state.ctx.messages.history(&room).await,
			Err(e) => {
				debug!(room = raw, error = %e, "history requested for invalid room");
				Vec::new()
			}
		},
	};

	([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], Json(history)).into_response()
}

async fn healthz(State(state): State<HttpState>) -> impl IntoResponse {
	state.health.liveness()
}

async fn readyz(State(state): State<HttpState>) -> impl IntoResponse {
	state.health.readiness()
}
