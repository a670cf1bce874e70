#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use huddle_domain::{ChatMessage, RoomName};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::PersistenceError;
use crate::store::persist::{read_json_if_exists, write_json_atomic};

/// Per-room message history, one JSON array file per room (`<dir>/<room>.json`).
pub struct MessageLog {
	dir: PathBuf,
	rooms: RwLock<HashMap<RoomName, Vec<ChatMessage>>>,
}

impl MessageLog {
	pub async fn load(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
		let dir = dir.into();
		tokio::fs::create_dir_all(&dir)
			.await
			.map_err(|source| PersistenceError::Write {
				path: dir.clone(),
				source,
			})?;

		let mut rooms = HashMap::new();
		let mut entries = tokio::fs::read_dir(&dir)
			.await
			.map_err(|source| PersistenceError::Read {
				path: dir.clone(),
				source,
			})?;

		while let Some(entry) = entries.next_entry().await.map_err(|source| PersistenceError::Read {
			path: dir.clone(),
			source,
		})? {
			let path = entry.path();
			if path.extension().and_then(|e| e.to_str()) != Some("json") {
				continue;
			}
			let Some(room) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| RoomName::new(s).ok()) else {
				warn!(path = %path.display(), "skipping message file with invalid room name");
				continue;
			};

			match read_json_if_exists::<Vec<ChatMessage>>(&path).await {
				Ok(messages) => {
					rooms.insert(room, messages.unwrap_or_default());
				}
				Err(e) => warn!(room = %room, error = %e, "skipping unreadable message file"),
			}
		}

		info!(dir = %dir.display(), rooms = rooms.len(), "loaded message log");
		Ok(Self {
			dir,
			rooms: RwLock::new(rooms),
		})
	}

	pub async fn append(&self, message: ChatMessage) {
		self.append_then(message, |_| ()).await;
	}

	/// Appends to the room's history and calls `publish` while still holding
	/// the write lock, so publication order matches log order per room.
	///
	/// The room file is then rewritten; a failed write is logged and the
	/// message stays in memory.
	pub async fn append_then(&self, message: ChatMessage, publish: impl FnOnce(&ChatMessage)) {
		let room = message.room.clone();
		let mut rooms = self.rooms.write().await;
		let history = rooms.entry(room.clone()).or_default();
		history.push(message);

		if let Some(last) = history.last() {
			publish(last);
		}

		if let Err(e) = write_json_atomic(&room_file(&self.dir, &room), &*history).await {
			metrics::counter!("huddle_server_persistence_failures_total", "collection" => "messages").increment(1);
			error!(room = %room, error = %e, "failed to persist message log");
		}
	}

	/// Full history of `room`, oldest first. Unknown rooms yield an empty list.
	pub async fn history(&self, room: &RoomName) -> Vec<ChatMessage> {
		self.rooms.read().await.get(room).cloned().unwrap_or_default()
	}

	pub async fn flush_all(&self) -> Result<(), PersistenceError> {
		let rooms = self.rooms.read().await;
		for (room, history) in rooms.iter() {
			write_json_atomic(&room_file(&self.dir, room), history).await?;
		}
		Ok(())
	}
}

fn room_file(dir: &Path, room: &RoomName) -> PathBuf {
	dir.join(format!("{}.json", room.as_str()))
}
