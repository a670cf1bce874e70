#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use huddle_domain::{ChatMessage, RoomName};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum inbound frame size in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge { len: usize, max: usize },

	#[error("malformed envelope: {0}")]
	Malformed(#[source] serde_json::Error),

	#[error("unknown frame type: {0}")]
	UnknownType(String),

	#[error("unexpected payload for {kind}: {source}")]
	PayloadShape {
		kind: &'static str,
		#[source]
		source: serde_json::Error,
	},

	#[error("encode frame: {0}")]
	Encode(#[source] serde_json::Error),
}

/// Envelope discriminator (`type` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
	Message,
	Login,
	Error,
	RoomJoin,
}

impl FrameKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			FrameKind::Message => "message",
			FrameKind::Login => "login",
			FrameKind::Error => "error",
			FrameKind::RoomJoin => "room_join",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"message" => Some(FrameKind::Message),
			"login" => Some(FrameKind::Login),
			"error" => Some(FrameKind::Error),
			"room_join" => Some(FrameKind::RoomJoin),
			_ => None,
		}
	}
}

impl fmt::Display for FrameKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// `login` payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginPayload {
	pub username: String,
	pub password: String,
}

impl fmt::Debug for LoginPayload {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LoginPayload")
			.field("username", &self.username)
			.field("password", &"<redacted>")
			.finish()
	}
}

/// `room_join` payload, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomJoinPayload {
	pub room: String,
}

impl From<&RoomName> for RoomJoinPayload {
	fn from(room: &RoomName) -> Self {
		Self {
			room: room.as_str().to_string(),
		}
	}
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	payload: serde_json::Value,
}

/// Frames sent by participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
	/// Raw input line: chat text or a `/command`.
	Message(String),
	Login(LoginPayload),
	Error(String),
	RoomJoin(RoomJoinPayload),
}

impl ClientFrame {
	/// Decode an inbound envelope.
	///
	/// The envelope is read first and its payload is then validated against the
	/// shape expected for the declared type.
	pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
		let env: RawEnvelope = serde_json::from_str(raw).map_err(ProtocolError::Malformed)?;
		let kind = FrameKind::parse(&env.kind).ok_or(ProtocolError::UnknownType(env.kind))?;

		match kind {
			FrameKind::Message => payload_as(kind, env.payload).map(ClientFrame::Message),
			FrameKind::Login => payload_as(kind, env.payload).map(ClientFrame::Login),
			FrameKind::Error => payload_as(kind, env.payload).map(ClientFrame::Error),
			FrameKind::RoomJoin => payload_as(kind, env.payload).map(ClientFrame::RoomJoin),
		}
	}

	/// Same as `decode` but rejects frames larger than `max_frame_size` bytes.
	pub fn decode_bounded(raw: &str, max_frame_size: usize) -> Result<Self, ProtocolError> {
		if raw.len() > max_frame_size {
			return Err(ProtocolError::FrameTooLarge {
				len: raw.len(),
				max: max_frame_size,
			});
		}
		Self::decode(raw)
	}

	pub fn kind(&self) -> FrameKind {
		match self {
			ClientFrame::Message(_) => FrameKind::Message,
			ClientFrame::Login(_) => FrameKind::Login,
			ClientFrame::Error(_) => FrameKind::Error,
			ClientFrame::RoomJoin(_) => FrameKind::RoomJoin,
		}
	}

	pub fn encode(&self) -> Result<String, ProtocolError> {
		serde_json::to_string(self).map_err(ProtocolError::Encode)
	}
}

fn payload_as<T: DeserializeOwned>(kind: FrameKind, payload: serde_json::Value) -> Result<T, ProtocolError> {
	serde_json::from_value(payload).map_err(|source| ProtocolError::PayloadShape {
		kind: kind.as_str(),
		source,
	})
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
	Message(ChatMessage),
	RoomJoin(RoomJoinPayload),
	Error(String),
}

impl ServerFrame {
	/// System notice addressed to `room`.
	pub fn system(text: impl Into<String>, room: RoomName) -> Self {
		ServerFrame::Message(ChatMessage::system(text, room))
	}

	pub fn room_join(room: &RoomName) -> Self {
		ServerFrame::RoomJoin(room.into())
	}

	pub fn kind(&self) -> FrameKind {
		match self {
			ServerFrame::Message(_) => FrameKind::Message,
			ServerFrame::RoomJoin(_) => FrameKind::RoomJoin,
			ServerFrame::Error(_) => FrameKind::Error,
		}
	}

	pub fn encode(&self) -> Result<EncodedFrame, ProtocolError> {
		serde_json::to_string(self)
			.map(EncodedFrame::from)
			.map_err(ProtocolError::Encode)
	}

	pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
		serde_json::from_str(raw).map_err(ProtocolError::Malformed)
	}
}

/// Serialized server frame, shared between every queue it is fanned out to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedFrame(Arc<str>);

impl EncodedFrame {
	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl From<String> for EncodedFrame {
	fn from(s: String) -> Self {
		Self(Arc::from(s))
	}
}

impl fmt::Display for EncodedFrame {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}
