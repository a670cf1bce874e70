#![forbid(unsafe_code)]

pub mod frame;

pub use frame::{
	ClientFrame, DEFAULT_MAX_FRAME_SIZE, EncodedFrame, FrameKind, LoginPayload, ProtocolError, RoomJoinPayload, ServerFrame,
};

/// Prefix marking a `message` payload as a command line.
pub const COMMAND_PREFIX: char = '/';

/// Path of the duplex endpoint.
pub const WS_PATH: &str = "/ws";
