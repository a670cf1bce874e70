#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::server::context::AppContext;
use crate::store::hasher::{Argon2Hasher, CredentialHasher};

/// Argon2 with minimal cost so tests do not spend seconds hashing.
pub fn fast_hasher() -> Arc<dyn CredentialHasher> {
	Arc::new(Argon2Hasher::with_params(8, 1, 1).expect("argon2 params"))
}

pub fn test_config(data_dir: &Path) -> ServerConfig {
	let mut cfg = ServerConfig::default();
	cfg.server.host = "127.0.0.1".to_string();
	cfg.server.server_name = "Test Server".to_string();
	cfg.storage.data_dir = data_dir.to_path_buf();
	cfg.moderation.admin_password = None;
	cfg.session.history_replay_delay = Duration::ZERO;
	cfg
}

pub async fn test_context_with(cfg: &ServerConfig) -> Arc<AppContext> {
	Arc::new(AppContext::load(cfg, fast_hasher()).await.expect("context"))
}

pub async fn test_context(data_dir: &Path) -> Arc<AppContext> {
	test_context_with(&test_config(data_dir)).await
}
