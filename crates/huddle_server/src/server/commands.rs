#![forbid(unsafe_code)]

use std::fmt::Write as _;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use huddle_domain::{ChatMessage, ClanTag, HexColor, Ipid, MAX_NAME_CHARS, ParseIdError, RoomName};
use huddle_protocol::{EncodedFrame, ServerFrame};
use huddle_util::secret::SecretString;
use tracing::{error, info, warn};

use crate::error::{AuthError, CommandError};
use crate::server::context::AppContext;
use crate::server::hub::SessionSelector;
use crate::server::session::Session;
use crate::store::moderation::RoomRemoval;

pub const HELP_TEXT: &str = "Available commands:
/register <username> <password> - Create an account
/login <username> <password> - Log in
/logout - Log out
/name <new_name> - Change your display name
/join <room_name> - Join a room
/room <join|list|create|remove> - Manage rooms
/member list [room] - List online members
/userinfo <username_or_displayname> - Show user info
/clan <create|add|remove|list> - Manage clans
/server info - Show server info
/admin <password> - Become admin
/kick <ip_id> - Kick a user (admin)
/ban <ip_id> - Ban a user (admin)
/help - Show this help";

/// A parsed `/verb args...` line.
///
/// Only arity is checked here; values are validated after permission checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	Register { username: String, password: SecretString },
	Login { username: String, password: SecretString },
	Logout,
	Name(String),
	Help,
	Admin(SecretString),
	ClanCreate { tag: String, color: String },
	ClanAdd { ipid: String, tag: String },
	ClanRemove { ipid: String, tag: String },
	ClanList,
	RoomJoin(String),
	RoomList,
	RoomCreate(String),
	RoomRemove(String),
	Kick(String),
	Ban(String),
	MemberList(Option<String>),
	UserInfo(String),
	ServerInfo,
}

impl Command {
	pub fn parse(line: &str) -> Result<Self, CommandError> {
		let mut parts = line.split_whitespace();
		let verb = parts.next().unwrap_or_default();
		let args: Vec<&str> = parts.collect();

		let cmd = match verb {
			"/register" => {
				let [username, password] = exact::<2>(&args, "/register <username> <password>")?;
				Self::Register {
					username: username.to_string(),
					password: SecretString::new(password),
				}
			}
			"/login" => {
				let [username, password] = exact::<2>(&args, "/login <username> <password>")?;
				Self::Login {
					username: username.to_string(),
					password: SecretString::new(password),
				}
			}
			"/logout" => Self::Logout,
			"/name" => {
				if args.is_empty() {
					return Err(CommandError::Usage("/name <new_name>"));
				}
				Self::Name(args.join(" "))
			}
			"/help" => Self::Help,
			"/admin" => {
				let [password] = exact::<1>(&args, "/admin <password>")?;
				Self::Admin(SecretString::new(password))
			}
			"/clan" => Self::parse_clan(&args)?,
			"/room" => Self::parse_room(&args)?,
			"/join" => {
				let [room] = exact::<1>(&args, "/join <room_name>")?;
				Self::RoomJoin(room.to_string())
			}
			"/kick" => {
				let [ipid] = exact::<1>(&args, "/kick <ip_id>")?;
				Self::Kick(ipid.to_string())
			}
			"/ban" => {
				let [ipid] = exact::<1>(&args, "/ban <ip_id>")?;
				Self::Ban(ipid.to_string())
			}
			"/member" => match args.as_slice() {
				["list"] => Self::MemberList(None),
				["list", room] => Self::MemberList(Some(room.to_string())),
				_ => return Err(CommandError::Usage("/member list [room]")),
			},
			"/userinfo" => {
				let [name] = exact::<1>(&args, "/userinfo <username_or_displayname>")?;
				Self::UserInfo(name.to_string())
			}
			"/server" => match args.first() {
				None => return Err(CommandError::Usage("/server <info>")),
				Some(&"info") => Self::ServerInfo,
				Some(_) => return Err(CommandError::UnknownSubcommand),
			},
			other => return Err(CommandError::Unknown(other.to_string())),
		};

		Ok(cmd)
	}

	fn parse_clan(args: &[&str]) -> Result<Self, CommandError> {
		let Some((sub, rest)) = args.split_first() else {
			return Err(CommandError::Usage("/clan <create|add|remove|list> ..."));
		};

		let cmd = match *sub {
			"list" => Self::ClanList,
			"create" => {
				let [tag, color] = exact::<2>(rest, "/clan create <tag> <hex_color>")?;
				Self::ClanCreate {
					tag: tag.to_string(),
					color: color.to_string(),
				}
			}
			"add" => {
				let [ipid, tag] = exact::<2>(rest, "/clan add <ipid> <tag>")?;
				Self::ClanAdd {
					ipid: ipid.to_string(),
					tag: tag.to_string(),
				}
			}
			"remove" => {
				let [ipid, tag] = exact::<2>(rest, "/clan remove <ipid> <tag>")?;
				Self::ClanRemove {
					ipid: ipid.to_string(),
					tag: tag.to_string(),
				}
			}
			_ => return Err(CommandError::UnknownSubcommand),
		};

		Ok(cmd)
	}

	fn parse_room(args: &[&str]) -> Result<Self, CommandError> {
		let Some((sub, rest)) = args.split_first() else {
			return Err(CommandError::Usage("/room <join|list|create|remove> ..."));
		};

		let cmd = match *sub {
			"list" => Self::RoomList,
			"join" => {
				let [room] = exact::<1>(rest, "/room join <room_name>")?;
				Self::RoomJoin(room.to_string())
			}
			"create" => {
				let [room] = exact::<1>(rest, "/room create <room_name>")?;
				Self::RoomCreate(room.to_string())
			}
			"remove" => {
				let [room] = exact::<1>(rest, "/room remove <room_name>")?;
				Self::RoomRemove(room.to_string())
			}
			_ => return Err(CommandError::UnknownSubcommand),
		};

		Ok(cmd)
	}

	/// Short name used in logs; never includes arguments.
	pub fn verb(&self) -> &'static str {
		match self {
			Self::Register { .. } => "register",
			Self::Login { .. } => "login",
			Self::Logout => "logout",
			Self::Name(_) => "name",
			Self::Help => "help",
			Self::Admin(_) => "admin",
			Self::ClanCreate { .. } => "clan create",
			Self::ClanAdd { .. } => "clan add",
			Self::ClanRemove { .. } => "clan remove",
			Self::ClanList => "clan list",
			Self::RoomJoin(_) => "room join",
			Self::RoomList => "room list",
			Self::RoomCreate(_) => "room create",
			Self::RoomRemove(_) => "room remove",
			Self::Kick(_) => "kick",
			Self::Ban(_) => "ban",
			Self::MemberList(_) => "member list",
			Self::UserInfo(_) => "userinfo",
			Self::ServerInfo => "server info",
		}
	}
}

fn exact<'a, const N: usize>(args: &[&'a str], usage: &'static str) -> Result<[&'a str; N], CommandError> {
	<[&str; N]>::try_from(args).map_err(|_| CommandError::Usage(usage))
}

/// Parses and runs one `/command` line on behalf of `session`.
pub async fn dispatch(session: &mut Session, line: &str) {
	match Command::parse(line) {
		Ok(cmd) => run(session, cmd).await,
		Err(e) => session.notify(e.to_string()),
	}
}

/// Runs a parsed command; failures are unicast back, a panic becomes an error frame.
pub async fn run(session: &mut Session, cmd: Command) {
	let verb = cmd.verb();
	metrics::counter!("huddle_server_commands_total", "verb" => verb).increment(1);

	match AssertUnwindSafe(execute(session, cmd)).catch_unwind().await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => session.notify(e.to_string()),
		Err(_) => {
			error!(session_id = session.id(), verb, "command handler panicked");
			session.send(ServerFrame::Error(CommandError::Internal.to_string()));
		}
	}
}

async fn execute(session: &mut Session, cmd: Command) -> Result<(), CommandError> {
	let ctx = Arc::clone(session.ctx());

	match cmd {
		Command::Register { username, password } => register(session, &ctx, &username, &password).await,
		Command::Login { username, password } => login(session, &ctx, &username, &password).await,
		Command::Logout => {
			if let Some(user) = session.user() {
				info!(session_id = session.id(), username = %user.username, "user logged out");
			}
			session.unbind();
			session.notify("Logged out.");
			Ok(())
		}
		Command::Name(name) => rename(session, &ctx, &name).await,
		Command::Help => {
			session.notify(HELP_TEXT);
			Ok(())
		}
		Command::Admin(password) => {
			if !ctx.moderation.admin_secret_matches(password.expose()).await {
				warn!(session_id = session.id(), "failed admin attempt");
				return Err(rejected("Incorrect password."));
			}
			session.set_admin(true);
			if let Some(user) = session.user() {
				ctx.credentials.set_admin(&user.username).await;
			}
			info!(session_id = session.id(), "session elevated to admin");
			session.notify("You are now an admin.");
			Ok(())
		}
		Command::ClanCreate { tag, color } => {
			require_admin(session)?;
			let tag = parse_tag(tag)?;
			let color = HexColor::new(color).map_err(|_| rejected("Color must be hex code (e.g. #FF0000)."))?;
			ctx.moderation.set_clan(tag.clone(), color.clone()).await;
			session.notify(format!("Clan {tag} created with color {color}."));
			Ok(())
		}
		Command::ClanAdd { ipid, tag } => {
			require_admin(session)?;
			let ipid = Ipid::new(ipid).map_err(|_| rejected("User not found."))?;
			let tag = parse_tag(tag)?;
			let edit = ctx
				.credentials
				.add_clan(&ipid, &tag)
				.await
				.ok_or_else(|| rejected("User not found."))?;
			if edit.changed {
				session.notify(format!("Added {} to clan {tag}.", edit.username));
			} else {
				session.notify("User already in clan.");
			}
			Ok(())
		}
		Command::ClanRemove { ipid, tag } => {
			require_admin(session)?;
			let ipid = Ipid::new(ipid).map_err(|_| rejected("User not found."))?;
			let tag = parse_tag(tag)?;
			let edit = ctx
				.credentials
				.remove_clan(&ipid, &tag)
				.await
				.ok_or_else(|| rejected("User not found."))?;
			if edit.changed {
				session.notify(format!("Removed {} from clan {tag}.", edit.username));
			} else {
				session.notify("User is not in clan.");
			}
			Ok(())
		}
		Command::ClanList => {
			session.notify(clan_list(&ctx).await);
			Ok(())
		}
		Command::RoomJoin(room) => {
			require_login(session)?;
			join_room(session, &ctx, room).await
		}
		Command::RoomList => {
			require_login(session)?;
			let mut out = String::from("Available Rooms:");
			for room in ctx.moderation.rooms().await {
				let _ = write!(out, "\n• {room}");
			}
			session.notify(out);
			Ok(())
		}
		Command::RoomCreate(room) => {
			require_login(session)?;
			require_admin(session)?;
			create_room(session, &ctx, room).await
		}
		Command::RoomRemove(room) => {
			require_login(session)?;
			require_admin(session)?;
			remove_room(session, &ctx, room).await
		}
		Command::Kick(ipid) => {
			require_admin(session)?;
			let ipid = Ipid::new(ipid).map_err(|_| rejected("User not active."))?;
			let notice = encode(ServerFrame::system("You have been kicked.", RoomName::general()))?;
			let n = ctx.hub.force_disconnect(SessionSelector::Ipid(ipid.clone()), Some(notice)).await;
			if n == 0 {
				return Err(rejected("User not active."));
			}
			info!(session_id = session.id(), %ipid, sessions = n, "user kicked");
			session.notify("User kicked.");
			Ok(())
		}
		Command::Ban(ipid) => {
			require_admin(session)?;
			let ipid = Ipid::new(ipid).map_err(|e| rejected(format!("Invalid ipid: {e}")))?;
			ban(&ctx, &ipid).await?;
			info!(session_id = session.id(), %ipid, "user banned");
			session.notify("User banned.");
			Ok(())
		}
		Command::MemberList(room) => {
			session.notify(member_list(&ctx, room.as_deref()).await);
			Ok(())
		}
		Command::UserInfo(name) => {
			let text = user_info(&ctx, &name).await?;
			session.notify(text);
			Ok(())
		}
		Command::ServerInfo => {
			session.notify(server_info(&ctx).await);
			Ok(())
		}
	}
}

fn rejected(text: impl Into<String>) -> CommandError {
	CommandError::Rejected(text.into())
}

fn require_login(session: &Session) -> Result<(), CommandError> {
	match session.user() {
		Some(_) => Ok(()),
		None => Err(CommandError::LoginRequired),
	}
}

fn require_admin(session: &Session) -> Result<(), CommandError> {
	if session.is_admin() { Ok(()) } else { Err(CommandError::AdminOnly) }
}

fn parse_tag(tag: String) -> Result<ClanTag, CommandError> {
	ClanTag::new(tag).map_err(|_| rejected("Tag must be 1-2 characters."))
}

fn encode(frame: ServerFrame) -> Result<EncodedFrame, CommandError> {
	frame.encode().map_err(|e| {
		error!(error = %e, "failed to encode server frame");
		CommandError::Internal
	})
}

async fn register(session: &mut Session, ctx: &AppContext, username: &str, password: &SecretString) -> Result<(), CommandError> {
	let user = ctx
		.credentials
		.register(username, password.expose())
		.await
		.map_err(|e| rejected(format!("Registration failed: {e}")))?;

	session.bind(&user);
	info!(session_id = session.id(), username = %user.username, ipid = %user.ipid, "user registered");
	session.notify(format!("Registered and logged in as {} ({})", user.username, user.ipid));
	session.replay_history().await;
	Ok(())
}

async fn login(session: &mut Session, ctx: &AppContext, username: &str, password: &SecretString) -> Result<(), CommandError> {
	let session_id = session.id();
	let user = ctx
		.credentials
		.authenticate(username, password.expose())
		.await
		.map_err(|e| {
			warn!(session_id, username, "failed login attempt");
			rejected(format!("Login failed: {e}"))
		})?;

	if ctx.moderation.is_banned(&user.ipid).await {
		warn!(session_id, username, ipid = %user.ipid, "banned user tried to log in");
		return Err(rejected(format!("Login failed: {}", AuthError::Banned)));
	}

	session.bind(&user);
	info!(session_id = session.id(), username = %user.username, ipid = %user.ipid, "user logged in");
	session.notify(format!("Logged in as {} ({})", user.username, user.ipid));
	session.replay_history().await;
	Ok(())
}

async fn rename(session: &Session, ctx: &AppContext, name: &str) -> Result<(), CommandError> {
	let Some(user) = session.user().cloned() else {
		return Err(rejected("You must be logged in to change name."));
	};
	if name.chars().count() > MAX_NAME_CHARS {
		return Err(rejected(format!("Name too long (max {MAX_NAME_CHARS} chars).")));
	}

	let old = ctx
		.credentials
		.set_display_name(&user.username, name)
		.await
		.ok_or_else(|| rejected("User not found."))?;
	session.notify(format!("Name changed from {old} to {name}"));
	Ok(())
}

async fn join_room(session: &Session, ctx: &AppContext, room: String) -> Result<(), CommandError> {
	let room = RoomName::new(room).map_err(|_| rejected("Room does not exist."))?;
	if !ctx.moderation.room_exists(&room).await {
		return Err(rejected("Room does not exist."));
	}

	let frames = vec![
		encode(ServerFrame::room_join(&room))?,
		encode(ServerFrame::system(format!("Joined room: {room}"), room.clone()))?,
	];
	if !ctx.hub.join_room(session.id(), room.clone(), frames).await {
		return Ok(());
	}
	info!(session_id = session.id(), %room, "session joined room");

	// A removal that finished between the check above and the join did not
	// see this session in the room.
	if !ctx.moderation.room_exists(&room).await
		&& ctx
			.hub
			.migrate_session(session.id(), room.clone(), RoomName::general(), room_removed_frames()?)
			.await
	{
		info!(session_id = session.id(), %room, "room removed during join, moved to general");
	}
	Ok(())
}

async fn create_room(session: &Session, ctx: &AppContext, room: String) -> Result<(), CommandError> {
	let room = RoomName::new(room).map_err(|e| match e {
		ParseIdError::TooLong { .. } => rejected("Room name too long."),
		ParseIdError::Empty => CommandError::Usage("/room create <room_name>"),
		ParseIdError::InvalidFormat(_) => rejected("Room name may only contain letters, digits, '-' and '_'."),
	})?;

	if !ctx.moderation.add_room(room.clone()).await {
		return Err(rejected("Room already exists."));
	}
	ctx.messages
		.append(ChatMessage::system(format!("Welcome to the {room} room!"), room.clone()))
		.await;

	info!(session_id = session.id(), %room, "room created");
	session.notify(format!("Room {room} created."));
	Ok(())
}

async fn remove_room(session: &Session, ctx: &AppContext, room: String) -> Result<(), CommandError> {
	if room == huddle_domain::DEFAULT_ROOM {
		return Err(rejected("Cannot remove general room."));
	}
	let room = RoomName::new(room).map_err(|_| rejected("Room does not exist."))?;

	// Unlisted first, so joins that land after the migration re-check and leave.
	match ctx.moderation.remove_room(&room).await {
		RoomRemoval::Removed => {}
		RoomRemoval::Missing => return Err(rejected("Room does not exist.")),
		RoomRemoval::Protected => return Err(rejected("Cannot remove general room.")),
	}

	let moved = ctx
		.hub
		.migrate_room(room.clone(), RoomName::general(), room_removed_frames()?)
		.await;
	info!(session_id = session.id(), %room, moved, "room removed");
	session.notify(format!("Room {room} removed."));
	Ok(())
}

fn room_removed_frames() -> Result<Vec<EncodedFrame>, CommandError> {
	let general = RoomName::general();
	Ok(vec![
		encode(ServerFrame::room_join(&general))?,
		encode(ServerFrame::system("Room was removed. Moved to general.", general.clone()))?,
	])
}

/// Records the ban, then disconnects every live session of that identity.
pub(crate) async fn ban(ctx: &AppContext, ipid: &Ipid) -> Result<usize, CommandError> {
	ctx.moderation.ban(ipid).await;
	let notice = encode(ServerFrame::system("You have been banned.", RoomName::general()))?;
	Ok(ctx.hub.force_disconnect(SessionSelector::Ipid(ipid.clone()), Some(notice)).await)
}

async fn clan_list(ctx: &AppContext) -> String {
	let clans = ctx.moderation.clans().await;
	if clans.is_empty() {
		return "No clans.".to_string();
	}

	let mut out = String::from("Clans List:");
	for (tag, color) in clans {
		let _ = write!(out, "\n• [{tag}] (Color: {color})\n  Members: ");
		let members = ctx.credentials.members_of(&tag).await;
		if members.is_empty() {
			out.push_str("(No members)");
		} else {
			let names: Vec<String> = members
				.iter()
				.map(|m| format!("{} ({})", m.username, m.ipid))
				.collect();
			out.push_str(&names.join(", "));
		}
	}
	out
}

async fn member_list(ctx: &AppContext, room: Option<&str>) -> String {
	let mut out = match room {
		Some(room) => format!("Members in {room}:"),
		None => "All Online Members:".to_string(),
	};

	let mut found = false;
	for info in ctx.hub.snapshot().await {
		let Some(user) = info.user else { continue };
		if room.is_some_and(|r| r != info.room.as_str()) {
			continue;
		}
		let shown = match ctx.credentials.get(&user.username).await {
			Some(record) => record.shown_name().to_string(),
			None => user.username.clone(),
		};
		let _ = write!(out, "\n• {} ({shown}) [Room: {}]", user.username, info.room);
		found = true;
	}

	if !found {
		out.push_str("\nNo members found.");
	}
	out
}

async fn user_info(ctx: &AppContext, name: &str) -> Result<String, CommandError> {
	let record = ctx
		.credentials
		.find_by_name(name)
		.await
		.ok_or_else(|| rejected("User not found."))?;

	let live = ctx
		.hub
		.snapshot()
		.await
		.into_iter()
		.find(|s| s.user.as_ref().is_some_and(|u| u.username == record.username));

	let clans = if record.clans.is_empty() {
		"None".to_string()
	} else {
		record.clans.iter().map(ClanTag::as_str).collect::<Vec<_>>().join(", ")
	};

	let mut out = String::from("User Info:");
	let _ = write!(out, "\n• Username: {}", record.username);
	let _ = write!(out, "\n• Display Name: {}", record.shown_name());
	match &live {
		Some(s) => {
			let _ = write!(out, "\n• Status: Online\n• Room: {}", s.room);
		}
		None => out.push_str("\n• Status: Offline"),
	}
	let _ = write!(out, "\n• IPID: {}", record.ipid);
	let _ = write!(out, "\n• Admin: {}", if record.is_admin { "Yes" } else { "No" });
	let _ = write!(out, "\n• Clans: {clans}");
	Ok(out)
}

async fn server_info(ctx: &AppContext) -> String {
	let online = ctx.hub.snapshot().await.len();
	let rooms = ctx.moderation.rooms().await.len();
	format!(
		"Server Info:\n• Name: {}\n• Host: {}\n• Port: {}\n• Online: {online}\n• Rooms: {rooms}\n• Up since: {}",
		ctx.identity.name,
		ctx.identity.host,
		ctx.identity.port,
		ctx.started_at.to_rfc3339(),
	)
}
