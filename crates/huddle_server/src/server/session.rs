#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use huddle_domain::{ChatMessage, HexColor, RoomName, UserRecord};
use huddle_protocol::{COMMAND_PREFIX, ClientFrame, DEFAULT_MAX_FRAME_SIZE, EncodedFrame, ServerFrame};
use huddle_util::secret::SecretString;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::server::commands::{self, Command};
use crate::server::context::AppContext;
use crate::server::hub::{BoundUser, BroadcastScope, CloseReason, SessionId, SessionRegistration};
use crate::server::replay::spawn_history_replay;

/// Text sent to anonymous sessions that try to chat.
pub const LOGIN_REQUIRED_TEXT: &str = "Please login first using /login <user> <pass> or /register <user> <pass>";

#[derive(Debug, Clone)]
pub struct SessionSettings {
	/// Bounded outbound queue size per session.
	pub outbound_queue_capacity: usize,
	/// Heartbeat interval; shorter than `idle_timeout`.
	pub ping_period: Duration,
	/// Read deadline, refreshed by every received frame.
	pub idle_timeout: Duration,
	pub write_timeout: Duration,
	pub max_frame_bytes: usize,
	/// Pause between replayed history messages.
	pub history_replay_delay: Duration,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 256,
			ping_period: Duration::from_secs(54),
			idle_timeout: Duration::from_secs(60),
			write_timeout: Duration::from_secs(10),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			history_replay_delay: Duration::from_millis(5),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
	Anonymous,
	Authenticated(BoundUser),
}

/// Receiving ends handed to the transport.
pub struct SessionChannels {
	pub outbound: mpsc::Receiver<EncodedFrame>,
	pub closed: oneshot::Receiver<CloseReason>,
}

/// Protocol state of one live connection.
///
/// Registered with the hub on `open`; dropping it unregisters.
pub struct Session {
	id: SessionId,
	ctx: Arc<AppContext>,
	outbound: mpsc::Sender<EncodedFrame>,
	room: watch::Receiver<RoomName>,
	auth: AuthState,
	is_admin: bool,
}

impl Session {
	/// Registers a new session and queues the welcome message.
	pub fn open(ctx: Arc<AppContext>) -> (Self, SessionChannels) {
		let id = ctx.next_session_id();
		let (outbound, outbound_rx) = mpsc::channel(ctx.settings.outbound_queue_capacity.max(1));
		let (close_tx, closed) = oneshot::channel();
		let (room_tx, room) = watch::channel(RoomName::general());

		ctx.hub.register(SessionRegistration {
			id,
			outbound: outbound.clone(),
			close: close_tx,
			room: room_tx,
		});
		metrics::counter!("huddle_server_connections_total").increment(1);
		debug!(session_id = id, "session opened");

		let session = Self {
			id,
			ctx,
			outbound,
			room,
			auth: AuthState::Anonymous,
			is_admin: false,
		};
		session.notify(session.ctx.identity.welcome_message.clone());

		(
			session,
			SessionChannels {
				outbound: outbound_rx,
				closed,
			},
		)
	}

	pub fn id(&self) -> SessionId {
		self.id
	}

	pub fn ctx(&self) -> &Arc<AppContext> {
		&self.ctx
	}

	pub fn current_room(&self) -> RoomName {
		self.room.borrow().clone()
	}

	pub fn user(&self) -> Option<&BoundUser> {
		match &self.auth {
			AuthState::Authenticated(user) => Some(user),
			AuthState::Anonymous => None,
		}
	}

	pub fn is_admin(&self) -> bool {
		self.is_admin
	}

	pub(crate) fn set_admin(&mut self, is_admin: bool) {
		self.is_admin = is_admin;
	}

	/// Binds the session to `user`, taking over its admin flag.
	pub(crate) fn bind(&mut self, user: &UserRecord) {
		let bound = BoundUser {
			username: user.username.clone(),
			ipid: user.ipid.clone(),
		};
		self.ctx.hub.bind_user(self.id, Some(bound.clone()));
		self.auth = AuthState::Authenticated(bound);
		self.is_admin = user.is_admin;
	}

	pub(crate) fn unbind(&mut self) {
		self.ctx.hub.bind_user(self.id, None);
		self.auth = AuthState::Anonymous;
		self.is_admin = false;
	}

	/// Unicast a system message addressed to the current room.
	pub fn notify(&self, text: impl Into<String>) {
		self.send(ServerFrame::system(text, self.current_room()));
	}

	/// Unicast to this session only; dropped when the queue is full.
	pub fn send(&self, frame: ServerFrame) {
		let encoded = match frame.encode() {
			Ok(encoded) => encoded,
			Err(e) => {
				warn!(session_id = self.id, error = %e, "failed to encode frame");
				return;
			}
		};

		if let Err(e) = self.outbound.try_send(encoded) {
			metrics::counter!("huddle_server_frames_dropped_total").increment(1);
			debug!(session_id = self.id, error = %e, "unicast frame dropped");
		}
	}

	/// Replays the current room's history to this session in the background.
	pub(crate) async fn replay_history(&self) {
		let room = self.current_room();
		let history = self.ctx.messages.history(&room).await;
		debug!(session_id = self.id, room = %room, messages = history.len(), "replaying history");
		spawn_history_replay(
			self.id,
			history,
			self.outbound.clone(),
			self.ctx.settings.history_replay_delay,
		);
	}

	/// Decodes one inbound text frame; malformed frames are logged and dropped.
	pub async fn handle_text(&mut self, raw: &str) {
		match ClientFrame::decode_bounded(raw, self.ctx.settings.max_frame_bytes) {
			Ok(frame) => self.handle_frame(frame).await,
			Err(e) => {
				metrics::counter!("huddle_server_protocol_errors_total").increment(1);
				warn!(session_id = self.id, error = %e, "dropping malformed frame");
			}
		}
	}

	pub async fn handle_frame(&mut self, frame: ClientFrame) {
		match frame {
			ClientFrame::Message(text) if text.starts_with(COMMAND_PREFIX) => commands::dispatch(self, &text).await,
			ClientFrame::Message(text) => self.chat(text).await,
			ClientFrame::Login(login) => {
				commands::run(
					self,
					Command::Login {
						username: login.username,
						password: SecretString::new(login.password),
					},
				)
				.await
			}
			ClientFrame::RoomJoin(join) => commands::run(self, Command::RoomJoin(join.room)).await,
			ClientFrame::Error(text) => debug!(session_id = self.id, %text, "client reported an error"),
		}
	}

	/// Logs a chat line in the current room and broadcasts it to that room.
	async fn chat(&mut self, content: String) {
		let Some(user) = self.user().cloned() else {
			self.notify(LOGIN_REQUIRED_TEXT);
			return;
		};
		if content.trim().is_empty() {
			return;
		}

		let room = self.current_room();

		let Some(record) = self.ctx.credentials.get(&user.username).await else {
			warn!(session_id = self.id, username = %user.username, "bound user has no record");
			self.unbind();
			self.notify(CommandError::LoginRequired.to_string());
			return;
		};

		let colors = self.ctx.moderation.clans().await;
		let display = record.decorated_name(|tag| colors.get(tag).cloned().unwrap_or_else(HexColor::white));
		let message = ChatMessage::from_user(&record, display, content, room.clone());

		let frame = match ServerFrame::Message(message.clone()).encode() {
			Ok(frame) => frame,
			Err(e) => {
				warn!(session_id = self.id, error = %e, "failed to encode chat message");
				return;
			}
		};

		let ctx = &self.ctx;
		let scope = BroadcastScope::Room(room.clone());
		let logged = ctx
			.moderation
			.while_room_exists(&room, || ctx.messages.append_then(message, |_| ctx.hub.broadcast(scope, frame)))
			.await;
		if logged.is_none() {
			self.notify("Room does not exist.");
			return;
		}
		metrics::counter!("huddle_server_messages_total").increment(1);
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		self.ctx.hub.unregister(self.id);
		debug!(session_id = self.id, "session closed");
	}
}
