#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

/// Failure reading or rewriting one persisted collection.
#[derive(Debug, Error)]
pub enum PersistenceError {
	#[error("read {}: {source}", .path.display())]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("write {}: {source}", .path.display())]
	Write {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("decode {}: {source}", .path.display())]
	Decode {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},

	#[error("encode: {0}")]
	Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("user already exists")]
	UserExists,

	/// Unknown user and wrong password collapse into this one variant.
	#[error("invalid credentials")]
	InvalidCredentials,

	#[error("this identity is banned")]
	Banned,

	#[error("could not hash password")]
	Hash,

	#[error("could not save user record")]
	Persistence(#[source] PersistenceError),
}

/// Dispatcher failures. `Display` is the text unicast to the invoking session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
	#[error("Unknown command: {0}")]
	Unknown(String),

	#[error("Usage: {0}")]
	Usage(&'static str),

	#[error("Unknown subcommand.")]
	UnknownSubcommand,

	#[error("Admin only.")]
	AdminOnly,

	#[error("Please login first.")]
	LoginRequired,

	/// Validation failure with its own user-facing text.
	#[error("{0}")]
	Rejected(String),

	#[error("Internal error, please try again.")]
	Internal,
}

#[derive(Debug, Error)]
pub enum TransportError {
	#[error("websocket: {0}")]
	WebSocket(#[source] axum::Error),

	#[error("no frame received within {0:?}")]
	IdleTimeout(std::time::Duration),

	#[error("write did not complete within {0:?}")]
	WriteTimeout(std::time::Duration),
}
