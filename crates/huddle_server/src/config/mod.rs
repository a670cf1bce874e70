#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use huddle_util::secret::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::session::SessionSettings;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8999;
pub const DEFAULT_SERVER_NAME: &str = "CMPPChat Server";
pub const DEFAULT_WELCOME_MESSAGE: &str = "Welcome to CMPPChat! Type /help for commands.";

/// Default config path: `~/.huddle/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".huddle").join("config.toml"))
}

/// Default data directory: `~/.huddle/data`, or `./data` without a home directory.
pub fn default_data_dir() -> PathBuf {
	match dirs::home_dir() {
		Some(home) => home.join(".huddle").join("data"),
		None => PathBuf::from("data"),
	}
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub session: SessionSettings,
	pub storage: StorageSettings,
	pub moderation: ModerationSettings,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	pub host: String,
	pub port: u16,
	/// Name reported by `/server info`.
	pub server_name: String,
	/// First system message every new session receives.
	pub welcome_message: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Log every hub registration change at debug level.
	pub hub_debug_logs: bool,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
	/// Holds `users.json`, `moderation.json` and `messages/`.
	pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ModerationSettings {
	/// Overrides the persisted admin secret when set.
	pub admin_password: Option<SecretString>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	session: FileSessionSettings,

	#[serde(default)]
	storage: FileStorageSettings,

	#[serde(default)]
	moderation: FileModerationSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	host: Option<String>,
	port: Option<u16>,
	server_name: Option<String>,
	welcome_message: Option<String>,
	metrics_bind: Option<String>,
	hub_debug_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSessionSettings {
	outbound_queue_capacity: Option<usize>,
	ping_period_secs: Option<u64>,
	idle_timeout_secs: Option<u64>,
	write_timeout_secs: Option<u64>,
	max_frame_bytes: Option<usize>,
	history_replay_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStorageSettings {
	data_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileModerationSettings {
	admin_password: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = SessionSettings::default();
		let mut session = SessionSettings {
			outbound_queue_capacity: file
				.session
				.outbound_queue_capacity
				.filter(|v| *v > 0)
				.unwrap_or(defaults.outbound_queue_capacity),
			ping_period: file
				.session
				.ping_period_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.ping_period),
			idle_timeout: file
				.session
				.idle_timeout_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.idle_timeout),
			write_timeout: file
				.session
				.write_timeout_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.write_timeout),
			max_frame_bytes: file
				.session
				.max_frame_bytes
				.filter(|v| *v > 0)
				.unwrap_or(defaults.max_frame_bytes),
			history_replay_delay: file
				.session
				.history_replay_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.history_replay_delay),
		};

		if session.ping_period >= session.idle_timeout {
			warn!(
				ping_secs = session.ping_period.as_secs(),
				idle_secs = session.idle_timeout.as_secs(),
				"session config: ping_period must be shorter than idle_timeout; using defaults"
			);
			session.ping_period = defaults.ping_period;
			session.idle_timeout = defaults.idle_timeout;
		}

		Self {
			server: ServerSettings {
				host: file
					.server
					.host
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_HOST.to_string()),
				port: file.server.port.filter(|p| *p != 0).unwrap_or(DEFAULT_PORT),
				server_name: file
					.server
					.server_name
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string()),
				welcome_message: file
					.server
					.welcome_message
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_WELCOME_MESSAGE.to_string()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				hub_debug_logs: file.server.hub_debug_logs.unwrap_or(false),
			},
			session,
			storage: StorageSettings {
				data_dir: file
					.storage
					.data_dir
					.filter(|s| !s.trim().is_empty())
					.map(PathBuf::from)
					.unwrap_or_else(default_data_dir),
			},
			moderation: ModerationSettings {
				admin_password: file
					.moderation
					.admin_password
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn env_string(name: &str) -> Option<String> {
	let v = std::env::var(name).ok()?;
	let v = v.trim().to_string();
	(!v.is_empty()).then_some(v)
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("HUDDLE_HOST") {
		cfg.server.host = v;
		info!("server config: host overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_PORT") {
		match v.parse::<u16>() {
			Ok(port) if port != 0 => {
				cfg.server.port = port;
				info!(port, "server config: port overridden by env");
			}
			_ => warn!(value = %v, "server config: ignoring invalid HUDDLE_PORT"),
		}
	}

	if let Some(v) = env_string("HUDDLE_SERVER_NAME") {
		cfg.server.server_name = v;
		info!("server config: server_name overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_WELCOME_MESSAGE") {
		cfg.server.welcome_message = v;
		info!("server config: welcome_message overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Ok(v) = std::env::var("HUDDLE_HUB_DEBUG_LOGS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.server.hub_debug_logs = enabled;
		info!(enabled, "server config: hub_debug_logs overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_DATA_DIR") {
		cfg.storage.data_dir = PathBuf::from(v);
		info!(data_dir = %cfg.storage.data_dir.display(), "storage: data_dir overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_ADMIN_PASSWORD") {
		cfg.moderation.admin_password = Some(SecretString::new(v));
		info!("moderation: admin_password overridden by env");
	}

	if let Ok(v) = std::env::var("HUDDLE_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.session.outbound_queue_capacity = capacity;
		info!(capacity, "session config: outbound_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("HUDDLE_HISTORY_REPLAY_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.session.history_replay_delay = Duration::from_millis(ms);
		info!(ms, "session config: history_replay_delay overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_resolves_to_defaults() {
		let cfg = ServerConfig::from_file(FileConfig::default());
		assert_eq!(cfg.server.host, "localhost");
		assert_eq!(cfg.server.port, 8999);
		assert_eq!(cfg.server.welcome_message, DEFAULT_WELCOME_MESSAGE);
		assert_eq!(cfg.session.outbound_queue_capacity, 256);
		assert_eq!(cfg.session.max_frame_bytes, 512);
		assert!(cfg.moderation.admin_password.is_none());
		assert!(cfg.storage.data_dir.ends_with("data"));
	}

	#[test]
	fn toml_sections_are_applied() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("config.toml");
		fs::write(
			&path,
			r#"
[server]
host = "0.0.0.0"
port = 9000
server_name = "  "

[session]
outbound_queue_capacity = 8
history_replay_delay_ms = 0

[storage]
data_dir = "/srv/huddle"

[moderation]
admin_password = "s3cret"
"#,
		)
		.expect("write");

		let file = read_toml_if_exists(&path).expect("read").expect("exists");
		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.server.host, "0.0.0.0");
		assert_eq!(cfg.server.port, 9000);
		assert_eq!(cfg.server.server_name, DEFAULT_SERVER_NAME);
		assert_eq!(cfg.session.outbound_queue_capacity, 8);
		assert_eq!(cfg.session.history_replay_delay, Duration::ZERO);
		assert_eq!(cfg.storage.data_dir, PathBuf::from("/srv/huddle"));
		assert_eq!(
			cfg.moderation.admin_password.as_ref().map(SecretString::expose),
			Some("s3cret")
		);
	}

	#[test]
	fn ping_period_must_undercut_idle_timeout() {
		let file = FileConfig {
			session: FileSessionSettings {
				ping_period_secs: Some(90),
				idle_timeout_secs: Some(30),
				..Default::default()
			},
			..Default::default()
		};
		let cfg = ServerConfig::from_file(file);
		assert!(cfg.session.ping_period < cfg.session.idle_timeout);
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let dir = tempfile::tempdir().expect("tempdir");
		assert!(read_toml_if_exists(&dir.path().join("absent.toml")).expect("read").is_none());
	}

	#[test]
	fn env_bool_spellings() {
		assert_eq!(parse_env_bool(" Yes "), Some(true));
		assert_eq!(parse_env_bool("off"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}
