#![forbid(unsafe_code)]

pub mod credentials;
pub mod hasher;
pub mod messages;
pub mod moderation;
pub mod persist;

#[cfg(test)]
mod store_tests;

use std::path::{Path, PathBuf};

use huddle_domain::{ChatMessage, RoomName, UserRecord};
use huddle_util::secret::SecretString;

use crate::error::PersistenceError;
use crate::store::moderation::ModerationConfig;
use crate::store::persist::{read_json_if_exists, write_json_atomic};

pub const USERS_FILE: &str = "users.json";
pub const MESSAGES_DIR: &str = "messages";
pub const MODERATION_FILE: &str = "moderation.json";

/// File locations below the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
	pub root: PathBuf,
}

impl DataLayout {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn users_file(&self) -> PathBuf {
		self.root.join(USERS_FILE)
	}

	pub fn messages_dir(&self) -> PathBuf {
		self.root.join(MESSAGES_DIR)
	}

	pub fn moderation_file(&self) -> PathBuf {
		self.root.join(MODERATION_FILE)
	}
}

/// Creates the data directory skeleton without touching existing files.
/// Returns the paths that were created.
pub async fn init_data_dir(layout: &DataLayout, seed_admin: Option<&SecretString>) -> Result<Vec<PathBuf>, PersistenceError> {
	let mut created = Vec::new();

	let moderation_path = layout.moderation_file();
	let had_moderation = exists(&moderation_path).await;
	ModerationConfig::load_or_create(&moderation_path, seed_admin).await?;
	if !had_moderation {
		created.push(moderation_path);
	}

	let users = layout.users_file();
	if read_json_if_exists::<Vec<UserRecord>>(&users).await?.is_none() {
		write_json_atomic(&users, &Vec::<UserRecord>::new()).await?;
		created.push(users);
	}

	let general = layout.messages_dir().join(format!("{}.json", RoomName::general()));
	if read_json_if_exists::<Vec<ChatMessage>>(&general).await?.is_none() {
		write_json_atomic(&general, &Vec::<ChatMessage>::new()).await?;
		created.push(general);
	}

	Ok(created)
}

async fn exists(path: &Path) -> bool {
	tokio::fs::try_exists(path).await.unwrap_or(false)
}
