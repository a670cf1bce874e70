#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use huddle_domain::{ClanTag, Ipid, UserRecord};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::error::{AuthError, PersistenceError};
use crate::store::hasher::CredentialHasher;
use crate::store::persist::{read_json_if_exists, write_json_atomic};

/// User records keyed by username, persisted as one JSON array.
pub struct CredentialStore {
	path: PathBuf,
	users: RwLock<BTreeMap<String, UserRecord>>,
	hasher: Arc<dyn CredentialHasher>,
}

/// Result of a clan membership edit on a user located by ipid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClanEdit {
	pub username: String,
	pub changed: bool,
}

impl CredentialStore {
	pub async fn load(path: impl Into<PathBuf>, hasher: Arc<dyn CredentialHasher>) -> Result<Self, PersistenceError> {
		let path = path.into();
		let records: Vec<UserRecord> = read_json_if_exists(&path).await?.unwrap_or_default();

		let mut users = BTreeMap::new();
		for record in records {
			users.insert(record.username.clone(), record);
		}
		info!(path = %path.display(), users = users.len(), "loaded user records");

		Ok(Self {
			path,
			users: RwLock::new(users),
			hasher,
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Creates a record with a fresh ipid.
	///
	/// The record is inserted before the file is rewritten and removed again if
	/// the write fails.
	pub async fn register(&self, username: &str, password: &str) -> Result<UserRecord, AuthError> {
		if self.users.read().await.contains_key(username) {
			return Err(AuthError::UserExists);
		}

		let hasher = Arc::clone(&self.hasher);
		let password = password.to_string();
		let password_hash = tokio::task::spawn_blocking(move || hasher.hash(&password))
			.await
			.map_err(|_| AuthError::Hash)??;

		let mut users = self.users.write().await;
		if users.contains_key(username) {
			return Err(AuthError::UserExists);
		}

		let ipid = unused_ipid(&users, Ipid::generate);

		let record = UserRecord::new(username, password_hash, ipid);
		users.insert(username.to_string(), record.clone());

		if let Err(e) = self.persist(&users).await {
			users.remove(username);
			error!(username, error = %e, "registration rolled back: user file write failed");
			return Err(AuthError::Persistence(e));
		}

		debug!(username, ipid = %record.ipid, "registered user");
		Ok(record)
	}

	/// Verifies a password. Unknown user and wrong password are indistinguishable.
	pub async fn authenticate(&self, username: &str, password: &str) -> Result<UserRecord, AuthError> {
		let Some(record) = self.get(username).await else {
			return Err(AuthError::InvalidCredentials);
		};

		let hasher = Arc::clone(&self.hasher);
		let password = password.to_string();
		let stored = record.password_hash.clone();
		let ok = tokio::task::spawn_blocking(move || hasher.verify(&password, &stored))
			.await
			.unwrap_or(false);

		if ok { Ok(record) } else { Err(AuthError::InvalidCredentials) }
	}

	pub async fn get(&self, username: &str) -> Option<UserRecord> {
		self.users.read().await.get(username).cloned()
	}

	/// Matches either the username or the display name.
	pub async fn find_by_name(&self, name: &str) -> Option<UserRecord> {
		let users = self.users.read().await;
		users
			.get(name)
			.or_else(|| users.values().find(|u| u.display_name.as_deref() == Some(name)))
			.cloned()
	}

	/// Users carrying `tag`, sorted by username.
	pub async fn members_of(&self, tag: &ClanTag) -> Vec<UserRecord> {
		self.users.read().await.values().filter(|u| u.has_clan(tag)).cloned().collect()
	}

	pub async fn len(&self) -> usize {
		self.users.read().await.len()
	}

	/// Sets the display name; returns the previously shown name.
	pub async fn set_display_name(&self, username: &str, display_name: &str) -> Option<String> {
		self.mutate(|users| {
			let user = users.get_mut(username)?;
			let old = user.shown_name().to_string();
			user.display_name = Some(display_name.to_string());
			Some(old)
		})
		.await
	}

	pub async fn set_admin(&self, username: &str) -> bool {
		self.mutate(|users| {
			let user = users.get_mut(username)?;
			user.is_admin = true;
			Some(())
		})
		.await
		.is_some()
	}

	pub async fn add_clan(&self, ipid: &Ipid, tag: &ClanTag) -> Option<ClanEdit> {
		self.mutate(|users| {
			let user = users.values_mut().find(|u| &u.ipid == ipid)?;
			let changed = user.add_clan(tag.clone());
			Some(ClanEdit {
				username: user.username.clone(),
				changed,
			})
		})
		.await
	}

	pub async fn remove_clan(&self, ipid: &Ipid, tag: &ClanTag) -> Option<ClanEdit> {
		self.mutate(|users| {
			let user = users.values_mut().find(|u| &u.ipid == ipid)?;
			let changed = user.remove_clan(tag);
			Some(ClanEdit {
				username: user.username.clone(),
				changed,
			})
		})
		.await
	}

	pub async fn flush(&self) -> Result<(), PersistenceError> {
		let users = self.users.read().await;
		self.persist(&users).await
	}

	/// Applies `f` under the write lock and rewrites the file when it returns
	/// `Some`. A failed write is logged; memory stays authoritative.
	async fn mutate<R>(&self, f: impl FnOnce(&mut BTreeMap<String, UserRecord>) -> Option<R>) -> Option<R> {
		let mut users = self.users.write().await;
		let out = f(&mut users)?;

		if let Err(e) = self.persist(&users).await {
			metrics::counter!("huddle_server_persistence_failures_total", "collection" => "users").increment(1);
			error!(path = %self.path.display(), error = %e, "failed to persist user records");
		}

		Some(out)
	}

	async fn persist(&self, users: &BTreeMap<String, UserRecord>) -> Result<(), PersistenceError> {
		let records: Vec<&UserRecord> = users.values().collect();
		write_json_atomic(&self.path, &records).await
	}
}

/// Draws from `generate` until the ipid is neither the system sentinel nor
/// assigned to an existing user.
pub(crate) fn unused_ipid(users: &BTreeMap<String, UserRecord>, mut generate: impl FnMut() -> Ipid) -> Ipid {
	loop {
		let candidate = generate();
		if candidate.as_str() != Ipid::SYSTEM && !users.values().any(|u| u.ipid == candidate) {
			return candidate;
		}
	}
}
