#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use huddle_domain::{ClanTag, HexColor, Ipid, RoomName};
use huddle_util::secret::{SecretString, constant_time_eq};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::error::PersistenceError;
use crate::store::persist::{read_json_if_exists, write_json_atomic};

/// Admin secret used when nothing is persisted or configured.
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin";

#[derive(Clone, Serialize, Deserialize)]
struct ModerationState {
	admin_password: String,
	#[serde(default)]
	banned_ip_ids: Vec<Ipid>,
	#[serde(default)]
	clans: BTreeMap<ClanTag, HexColor>,
	#[serde(default)]
	rooms: Vec<RoomName>,
}

impl ModerationState {
	fn with_admin(admin_password: String) -> Self {
		Self {
			admin_password,
			banned_ip_ids: Vec::new(),
			clans: BTreeMap::new(),
			rooms: vec![RoomName::general()],
		}
	}

	/// The default room is always present and listed first.
	fn normalize(&mut self) -> bool {
		let mut changed = false;
		if !self.rooms.iter().any(RoomName::is_default) {
			self.rooms.insert(0, RoomName::general());
			changed = true;
		}
		let before = self.rooms.len();
		let mut seen = Vec::with_capacity(before);
		self.rooms.retain(|r| {
			if seen.contains(r) {
				false
			} else {
				seen.push(r.clone());
				true
			}
		});
		changed || self.rooms.len() != before
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomRemoval {
	Removed,
	Missing,
	/// The default room cannot be removed.
	Protected,
}

/// Ban list, clan colors, room registry and admin secret, rewritten whole on
/// every mutation.
pub struct ModerationConfig {
	path: PathBuf,
	state: RwLock<ModerationState>,
}

impl ModerationConfig {
	/// Loads `path`, creating it with defaults when missing. A configured
	/// `seed_admin` replaces the persisted secret.
	pub async fn load_or_create(path: impl Into<PathBuf>, seed_admin: Option<&SecretString>) -> Result<Self, PersistenceError> {
		let path = path.into();
		let (mut state, mut dirty) = match read_json_if_exists::<ModerationState>(&path).await? {
			Some(state) => (state, false),
			None => (ModerationState::with_admin(DEFAULT_ADMIN_PASSWORD.to_string()), true),
		};

		if let Some(seed) = seed_admin
			&& !seed.is_empty()
			&& seed.expose() != state.admin_password
		{
			state.admin_password = seed.expose().to_string();
			dirty = true;
			info!("moderation config: admin secret taken from server config");
		}

		dirty |= state.normalize();

		if dirty {
			write_json_atomic(&path, &state).await?;
		}

		info!(
			path = %path.display(),
			rooms = state.rooms.len(),
			bans = state.banned_ip_ids.len(),
			clans = state.clans.len(),
			"loaded moderation config"
		);

		Ok(Self {
			path,
			state: RwLock::new(state),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub async fn admin_secret_matches(&self, candidate: &str) -> bool {
		let state = self.state.read().await;
		constant_time_eq(state.admin_password.as_bytes(), candidate.as_bytes())
	}

	pub async fn is_banned(&self, ipid: &Ipid) -> bool {
		self.state.read().await.banned_ip_ids.contains(ipid)
	}

	/// Returns `true` when the ipid was not banned before. Banning twice is a
	/// successful no-op.
	pub async fn ban(&self, ipid: &Ipid) -> bool {
		self.mutate(|s| {
			if s.banned_ip_ids.contains(ipid) {
				return false;
			}
			s.banned_ip_ids.push(ipid.clone());
			true
		})
		.await
	}

	pub async fn unban(&self, ipid: &Ipid) -> bool {
		self.mutate(|s| {
			let before = s.banned_ip_ids.len();
			s.banned_ip_ids.retain(|b| b != ipid);
			s.banned_ip_ids.len() != before
		})
		.await
	}

	pub async fn set_clan(&self, tag: ClanTag, color: HexColor) {
		self.mutate(|s| {
			s.clans.insert(tag, color);
			true
		})
		.await;
	}

	/// Snapshot of tag colors, sorted by tag.
	pub async fn clans(&self) -> BTreeMap<ClanTag, HexColor> {
		self.state.read().await.clans.clone()
	}

	pub async fn room_exists(&self, room: &RoomName) -> bool {
		self.state.read().await.rooms.contains(room)
	}

	/// Runs `f` only if `room` is listed; removal of that room waits until
	/// `f` completes.
	pub async fn while_room_exists<F, Fut, T>(&self, room: &RoomName, f: F) -> Option<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = T>,
	{
		let state = self.state.read().await;
		if !state.rooms.contains(room) {
			return None;
		}
		let out = f().await;
		drop(state);
		Some(out)
	}

	pub async fn rooms(&self) -> Vec<RoomName> {
		self.state.read().await.rooms.clone()
	}

	/// Returns `true` when the room is new. Adding an existing room is a
	/// successful no-op.
	pub async fn add_room(&self, room: RoomName) -> bool {
		self.mutate(|s| {
			if s.rooms.contains(&room) {
				return false;
			}
			s.rooms.push(room);
			true
		})
		.await
	}

	pub async fn remove_room(&self, room: &RoomName) -> RoomRemoval {
		if room.is_default() {
			return RoomRemoval::Protected;
		}

		let removed = self
			.mutate(|s| {
				let before = s.rooms.len();
				s.rooms.retain(|r| r != room);
				s.rooms.len() != before
			})
			.await;

		if removed { RoomRemoval::Removed } else { RoomRemoval::Missing }
	}

	pub async fn flush(&self) -> Result<(), PersistenceError> {
		let state = self.state.read().await;
		write_json_atomic(&self.path, &*state).await
	}

	/// Applies `f` under the write lock; the file is rewritten only when `f`
	/// reports a change. A failed write is logged and memory stays
	/// authoritative.
	async fn mutate(&self, f: impl FnOnce(&mut ModerationState) -> bool) -> bool {
		let mut state = self.state.write().await;
		if !f(&mut state) {
			return false;
		}

		if let Err(e) = write_json_atomic(&self.path, &*state).await {
			metrics::counter!("huddle_server_persistence_failures_total", "collection" => "moderation").increment(1);
			error!(path = %self.path.display(), error = %e, "failed to persist moderation config");
		}
		true
	}
}
