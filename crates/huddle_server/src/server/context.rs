#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::ServerConfig;
use crate::error::PersistenceError;
use crate::server::hub::{Hub, HubConfig, SessionId};
use crate::server::session::SessionSettings;
use crate::store::DataLayout;
use crate::store::credentials::CredentialStore;
use crate::store::hasher::CredentialHasher;
use crate::store::messages::MessageLog;
use crate::store::moderation::ModerationConfig;

/// Name and address the server reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
	pub name: String,
	pub host: String,
	pub port: u16,
	pub welcome_message: String,
}

/// Process-wide state, built once at startup and shared as `Arc<AppContext>`.
pub struct AppContext {
	pub settings: SessionSettings,
	pub identity: ServerIdentity,
	pub credentials: CredentialStore,
	pub messages: MessageLog,
	pub moderation: ModerationConfig,
	pub hub: Hub,
	pub started_at: DateTime<Utc>,
	next_session_id: AtomicU64,
}

impl AppContext {
	/// Loads the three persisted collections and spawns the hub loop.
	pub async fn load(cfg: &ServerConfig, hasher: Arc<dyn CredentialHasher>) -> anyhow::Result<Self> {
		let layout = DataLayout::new(&cfg.storage.data_dir);

		let moderation = ModerationConfig::load_or_create(layout.moderation_file(), cfg.moderation.admin_password.as_ref())
			.await
			.context("load moderation config")?;
		let credentials = CredentialStore::load(layout.users_file(), hasher)
			.await
			.context("load user records")?;
		let messages = MessageLog::load(layout.messages_dir())
			.await
			.context("load message log")?;

		let hub = Hub::spawn(HubConfig {
			debug_logs: cfg.server.hub_debug_logs,
		});

		info!(
			data_dir = %layout.root.display(),
			users_file = %credentials.path().display(),
			moderation_file = %moderation.path().display(),
			users = credentials.len().await,
			"application context ready"
		);

		Ok(Self {
			settings: cfg.session.clone(),
			identity: ServerIdentity {
				name: cfg.server.server_name.clone(),
				host: cfg.server.host.clone(),
				port: cfg.server.port,
				welcome_message: cfg.server.welcome_message.clone(),
			},
			credentials,
			messages,
			moderation,
			hub,
			started_at: Utc::now(),
			next_session_id: AtomicU64::new(1),
		})
	}

	pub fn next_session_id(&self) -> SessionId {
		self.next_session_id.fetch_add(1, Ordering::Relaxed)
	}

	/// Rewrites every persisted collection.
	pub async fn flush(&self) -> Result<(), PersistenceError> {
		self.credentials.flush().await?;
		self.messages.flush_all().await?;
		self.moderation.flush().await?;
		Ok(())
	}
}
