#![forbid(unsafe_code)]

use std::time::Duration;

use huddle_domain::ChatMessage;
use huddle_protocol::{EncodedFrame, ServerFrame};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::hub::SessionId;

/// Streams `history` oldest-first into one session's outbound queue.
///
/// Runs beside the session so that live traffic keeps flowing. A full queue
/// skips the message; a closed queue ends the replay. Resolves to the number
/// of messages delivered.
pub fn spawn_history_replay(
	session_id: SessionId,
	history: Vec<ChatMessage>,
	outbound: mpsc::Sender<EncodedFrame>,
	delay: Duration,
) -> JoinHandle<usize> {
	tokio::spawn(async move {
		let total = history.len();
		let mut delivered = 0usize;

		for message in history {
			let frame = match ServerFrame::Message(message).encode() {
				Ok(frame) => frame,
				Err(e) => {
					warn!(session_id, error = %e, "failed to encode history message");
					continue;
				}
			};

			match outbound.try_send(frame) {
				Ok(()) => delivered += 1,
				Err(TrySendError::Full(_)) => {
					metrics::counter!("huddle_server_frames_dropped_total").increment(1);
				}
				Err(TrySendError::Closed(_)) => break,
			}

			if !delay.is_zero() {
				tokio::time::sleep(delay).await;
			}
		}

		debug!(session_id, delivered, total, "history replay finished");
		delivered
	})
}
