#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use huddle_protocol::EncodedFrame;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::server::context::AppContext;
use crate::server::hub::SessionId;
use crate::server::session::{Session, SessionChannels, SessionSettings};

type WsSink = SplitSink<WebSocket, Message>;

/// Drives one upgraded WebSocket until either side closes it.
///
/// The read loop runs here; writes (queued frames and heartbeats) go through a
/// separate pump task so a slow peer never blocks inbound handling.
pub async fn run_socket(socket: WebSocket, ctx: Arc<AppContext>) {
	let settings = ctx.settings.clone();
	let (mut session, channels) = Session::open(ctx);
	let session_id = session.id();

	let (sink, mut stream) = socket.split();
	let mut writer = tokio::spawn(write_pump_task(session_id, sink, channels, settings.clone()));
	let mut writer_done = false;

	loop {
		let next = tokio::select! {
			_ = &mut writer => {
				writer_done = true;
				break;
			}
			next = timeout(settings.idle_timeout, stream.next()) => next,
		};

		let msg = match next {
			Err(_) => {
				debug!(session_id, error = %TransportError::IdleTimeout(settings.idle_timeout), "closing idle session");
				break;
			}
			Ok(None) => break,
			Ok(Some(Err(e))) => {
				debug!(session_id, error = %TransportError::WebSocket(e), "websocket read failed");
				break;
			}
			Ok(Some(Ok(msg))) => msg,
		};

		match msg {
			Message::Text(text) => session.handle_text(text.as_str()).await,
			Message::Binary(_) => {
				metrics::counter!("huddle_server_protocol_errors_total").increment(1);
				warn!(session_id, "dropping binary frame");
			}
			// Heartbeat replies only refresh the read deadline.
			Message::Ping(_) | Message::Pong(_) => {}
			Message::Close(_) => break,
		}
	}

	// Unregistering drops the hub's close handle, which stops the pump.
	drop(session);

	if !writer_done && timeout(settings.write_timeout, &mut writer).await.is_err() {
		writer.abort();
	}
}

async fn write_pump_task(session_id: SessionId, sink: WsSink, channels: SessionChannels, settings: SessionSettings) {
	if let Err(e) = write_pump(session_id, sink, channels, &settings).await {
		debug!(session_id, error = %e, "write pump stopped");
	}
}

async fn write_pump(
	session_id: SessionId,
	mut sink: WsSink,
	channels: SessionChannels,
	settings: &SessionSettings,
) -> Result<(), TransportError> {
	let SessionChannels { mut outbound, mut closed } = channels;
	let limit = settings.write_timeout;

	let mut ping = interval_at(Instant::now() + settings.ping_period, settings.ping_period);
	ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			biased;

			reason = &mut closed => {
				if let Ok(reason) = reason {
					debug!(session_id, ?reason, "hub closed session");
				}
				// Frames queued before the close (kick or ban notices) still go out.
				outbound.close();
				with_timeout(limit, async {
					while let Ok(frame) = outbound.try_recv() {
						sink.feed(text(&frame)).await?;
					}
					sink.send(Message::Close(None)).await
				})
				.await?;
				return Ok(());
			}

			frame = outbound.recv() => {
				let Some(frame) = frame else {
					with_timeout(limit, sink.send(Message::Close(None))).await?;
					return Ok(());
				};
				with_timeout(limit, async {
					sink.feed(text(&frame)).await?;
					while let Ok(frame) = outbound.try_recv() {
						sink.feed(text(&frame)).await?;
					}
					sink.flush().await
				})
				.await?;
			}

			_ = ping.tick() => {
				with_timeout(limit, sink.send(Message::Ping(Default::default()))).await?;
			}
		}
	}
}

fn text(frame: &EncodedFrame) -> Message {
	Message::Text(frame.as_str().to_owned().into())
}

async fn with_timeout<T>(
	limit: Duration,
	fut: impl Future<Output = Result<T, axum::Error>>,
) -> Result<T, TransportError> {
	match timeout(limit, fut).await {
		Ok(res) => res.map_err(TransportError::WebSocket),
		Err(_) => Err(TransportError::WriteTimeout(limit)),
	}
}
