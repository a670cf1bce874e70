#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length (in characters) of room names and display names.
pub const MAX_NAME_CHARS: usize = 20;

/// Room every server carries; it can never be removed.
pub const DEFAULT_ROOM: &str = "general";

/// Sender name used for server-originated messages.
pub const SYSTEM_SENDER: &str = "System";

/// Color used for clan tags without a configured color.
pub const DEFAULT_TAG_COLOR: &str = "#FFFFFF";

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("too long: {len} chars (max {max})")]
	TooLong { len: usize, max: usize },
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Validated room name.
///
/// Room names double as file names for the message log, so only
/// alphanumerics, `-` and `_` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

impl RoomName {
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let len = name.chars().count();
		if len > MAX_NAME_CHARS {
			return Err(ParseIdError::TooLong {
				len,
				max: MAX_NAME_CHARS,
			});
		}

		if !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
			return Err(ParseIdError::InvalidFormat(format!(
				"room name may only contain letters, digits, '-' and '_': {name}"
			)));
		}

		Ok(Self(name))
	}

	/// The always-present default room.
	pub fn general() -> Self {
		Self(DEFAULT_ROOM.to_string())
	}

	pub fn is_default(&self) -> bool {
		self.0 == DEFAULT_ROOM
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl Default for RoomName {
	fn default() -> Self {
		Self::general()
	}
}

impl fmt::Display for RoomName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomName::new(s.trim().to_string())
	}
}

impl TryFrom<String> for RoomName {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		RoomName::new(value)
	}
}

impl From<RoomName> for String {
	fn from(value: RoomName) -> Self {
		value.0
	}
}

/// Surrogate identity assigned at registration (`a.b.c.d`).
///
/// Moderation addresses users by this handle rather than by username.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ipid(String);

impl Ipid {
	/// Sentinel identity carried by system messages.
	pub const SYSTEM: &'static str = "0.0.0.0";

	/// Mint a fresh random identity.
	pub fn generate() -> Self {
		let mut rng = rand::rng();
		let octets: [u8; 4] = [rng.random(), rng.random(), rng.random(), rng.random()];
		Self(format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]))
	}

	pub fn system() -> Self {
		Self(Self::SYSTEM.to_string())
	}

	/// Wrap a user-supplied identity string (moderation targets).
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Ipid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Ipid {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ipid::new(s.trim().to_string())
	}
}

/// Short decorative clan label (1-2 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClanTag(String);

impl ClanTag {
	pub const MAX_CHARS: usize = 2;

	pub fn new(tag: impl Into<String>) -> Result<Self, ParseIdError> {
		let tag = tag.into();
		if tag.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		let len = tag.chars().count();
		if len > Self::MAX_CHARS {
			return Err(ParseIdError::TooLong {
				len,
				max: Self::MAX_CHARS,
			});
		}
		Ok(Self(tag))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ClanTag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl TryFrom<String> for ClanTag {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		ClanTag::new(value)
	}
}

impl From<ClanTag> for String {
	fn from(value: ClanTag) -> Self {
		value.0
	}
}

/// `#RRGGBB` color code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexColor(String);

impl HexColor {
	pub fn new(color: impl Into<String>) -> Result<Self, ParseIdError> {
		let color = color.into();
		let Some(digits) = color.strip_prefix('#') else {
			return Err(ParseIdError::InvalidFormat(format!("expected #RRGGBB, got {color}")));
		};
		if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
			return Err(ParseIdError::InvalidFormat(format!("expected #RRGGBB, got {color}")));
		}
		Ok(Self(color))
	}

	pub fn white() -> Self {
		Self(DEFAULT_TAG_COLOR.to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for HexColor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl TryFrom<String> for HexColor {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		HexColor::new(value)
	}
}

impl From<HexColor> for String {
	fn from(value: HexColor) -> Self {
		value.0
	}
}

/// Durable user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
	pub username: String,
	/// Opaque password hash (PHC string).
	pub password_hash: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub display_name: Option<String>,
	#[serde(rename = "ip_id")]
	pub ipid: Ipid,
	#[serde(default)]
	pub clans: Vec<ClanTag>,
	#[serde(default)]
	pub is_admin: bool,
}

impl UserRecord {
	pub fn new(username: impl Into<String>, password_hash: impl Into<String>, ipid: Ipid) -> Self {
		Self {
			username: username.into(),
			password_hash: password_hash.into(),
			display_name: None,
			ipid,
			clans: Vec::new(),
			is_admin: false,
		}
	}

	/// Display name if set, username otherwise.
	pub fn shown_name(&self) -> &str {
		self.display_name.as_deref().unwrap_or(&self.username)
	}

	pub fn has_clan(&self, tag: &ClanTag) -> bool {
		self.clans.contains(tag)
	}

	/// Adds a tag; returns `false` when the user already carries it.
	pub fn add_clan(&mut self, tag: ClanTag) -> bool {
		if self.has_clan(&tag) {
			return false;
		}
		self.clans.push(tag);
		true
	}

	/// Removes a tag; returns `false` when the user did not carry it.
	pub fn remove_clan(&mut self, tag: &ClanTag) -> bool {
		let before = self.clans.len();
		self.clans.retain(|t| t != tag);
		self.clans.len() != before
	}

	/// Sender name with clan markup, e.g. `[<#FF0000>AB</>]alice`.
	pub fn decorated_name(&self, color_of: impl Fn(&ClanTag) -> HexColor) -> String {
		if self.clans.is_empty() {
			return self.shown_name().to_string();
		}

		let mut out = String::from("[");
		for tag in &self.clans {
			out.push('<');
			out.push_str(color_of(tag).as_str());
			out.push('>');
			out.push_str(tag.as_str());
			out.push_str("</>");
		}
		out.push(']');
		out.push_str(self.shown_name());
		out
	}
}

/// One chat line, immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub sender: String,
	pub sender_display: String,
	pub sender_id: Ipid,
	pub content: String,
	pub timestamp: DateTime<Utc>,
	pub room: RoomName,
	#[serde(default)]
	pub is_system: bool,
}

impl ChatMessage {
	/// A user-authored message stamped with the current time.
	pub fn from_user(user: &UserRecord, sender_display: String, content: impl Into<String>, room: RoomName) -> Self {
		Self {
			sender: user.username.clone(),
			sender_display,
			sender_id: user.ipid.clone(),
			content: content.into(),
			timestamp: Utc::now(),
			room,
			is_system: false,
		}
	}

	/// A server notice using the system sentinel sender.
	pub fn system(content: impl Into<String>, room: RoomName) -> Self {
		Self {
			sender: SYSTEM_SENDER.to_string(),
			sender_display: SYSTEM_SENDER.to_string(),
			sender_id: Ipid::system(),
			content: content.into(),
			timestamp: Utc::now(),
			room,
			is_system: true,
		}
	}
}
