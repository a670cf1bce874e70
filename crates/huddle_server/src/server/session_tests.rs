#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use huddle_domain::{ChatMessage, Ipid, RoomName};
use huddle_protocol::{ClientFrame, LoginPayload, RoomJoinPayload, ServerFrame};
use tokio::time::timeout;

use crate::config::DEFAULT_WELCOME_MESSAGE;
use crate::server::context::AppContext;
use crate::server::hub::CloseReason;
use crate::server::session::{LOGIN_REQUIRED_TEXT, Session, SessionChannels};
use crate::test_support::test_context;

struct Client {
	session: Session,
	channels: SessionChannels,
}

impl Client {
	/// Opens a session and consumes the welcome message.
	async fn connect(ctx: &Arc<AppContext>) -> Self {
		let (session, channels) = Session::open(Arc::clone(ctx));
		let mut client = Self { session, channels };
		assert_eq!(client.text().await, DEFAULT_WELCOME_MESSAGE);
		client
	}

	async fn registered(ctx: &Arc<AppContext>, username: &str) -> Self {
		let mut client = Self::connect(ctx).await;
		client.line(&format!("/register {username} pw-{username}")).await;
		let reply = client.text().await;
		assert!(reply.starts_with(&format!("Registered and logged in as {username} (")), "{reply}");
		client
	}

	async fn admin(ctx: &Arc<AppContext>, username: &str) -> Self {
		let mut client = Self::registered(ctx, username).await;
		client.line("/admin admin").await;
		assert_eq!(client.text().await, "You are now an admin.");
		client
	}

	fn ipid(&self) -> Ipid {
		self.session.user().expect("bound").ipid.clone()
	}

	async fn line(&mut self, text: &str) {
		self.session.handle_frame(ClientFrame::Message(text.to_string())).await;
	}

	async fn frame(&mut self) -> ServerFrame {
		let raw = timeout(Duration::from_millis(500), self.channels.outbound.recv())
			.await
			.expect("expected a frame within timeout")
			.expect("queue open");
		ServerFrame::decode(raw.as_str()).expect("decode")
	}

	async fn chat(&mut self) -> ChatMessage {
		match self.frame().await {
			ServerFrame::Message(m) => m,
			other => panic!("expected a message frame, got {other:?}"),
		}
	}

	async fn text(&mut self) -> String {
		match self.frame().await {
			ServerFrame::Message(m) => m.content,
			ServerFrame::RoomJoin(j) => format!("room_join:{}", j.room),
			ServerFrame::Error(e) => format!("error:{e}"),
		}
	}

	async fn quiet(&mut self) {
		assert!(
			timeout(Duration::from_millis(50), self.channels.outbound.recv()).await.is_err(),
			"unexpected frame"
		);
	}
}

#[tokio::test]
async fn anonymous_chat_is_refused_with_login_hint() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let mut anon = Client::connect(&ctx).await;

	anon.line("hello?").await;
	let reply = anon.chat().await;
	assert_eq!(reply.content, LOGIN_REQUIRED_TEXT);
	assert!(reply.is_system);
	assert!(ctx.messages.history(&RoomName::general()).await.is_empty());
}

#[tokio::test]
async fn duplicate_registration_is_reported_to_the_second_session() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let _alice = Client::registered(&ctx, "alice").await;

	let mut other = Client::connect(&ctx).await;
	other.line("/register alice other").await;
	assert_eq!(other.text().await, "Registration failed: user already exists");

	other.line("/login alice pw-alice").await;
	assert!(other.text().await.starts_with("Logged in as alice ("));
}

#[tokio::test]
async fn wrong_password_and_unknown_user_look_the_same() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let _alice = Client::registered(&ctx, "alice").await;

	let mut c = Client::connect(&ctx).await;
	c.line("/login alice nope").await;
	let wrong = c.text().await;
	c.line("/login nobody nope").await;
	let unknown = c.text().await;
	assert_eq!(wrong, unknown);
	assert_eq!(wrong, "Login failed: invalid credentials");
}

#[tokio::test]
async fn chat_is_logged_and_broadcast_to_the_room() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let mut alice = Client::registered(&ctx, "alice").await;
	let mut bob = Client::registered(&ctx, "bob").await;

	alice.line("hello there").await;
	for c in [&mut alice, &mut bob] {
		let m = c.chat().await;
		assert_eq!(m.sender, "alice");
		assert_eq!(m.sender_display, "alice");
		assert_eq!(m.content, "hello there");
		assert_eq!(m.room, RoomName::general());
		assert!(!m.is_system);
	}

	let history = ctx.messages.history(&RoomName::general()).await;
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].content, "hello there");

	alice.line("   ").await;
	alice.quiet().await;
}

#[tokio::test]
async fn login_replays_history_after_the_reply() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let mut alice = Client::registered(&ctx, "alice").await;
	alice.line("one").await;
	alice.line("two").await;
	assert_eq!(alice.text().await, "one");
	assert_eq!(alice.text().await, "two");

	let mut carol = Client::connect(&ctx).await;
	carol.line("/register carol pw").await;
	assert!(carol.text().await.starts_with("Registered and logged in as carol"));
	assert_eq!(carol.text().await, "one");
	assert_eq!(carol.text().await, "two");
}

#[tokio::test]
async fn login_and_room_join_frames_behave_like_commands() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let mut admin = Client::admin(&ctx, "root").await;
	admin.line("/room create dev").await;
	assert_eq!(admin.text().await, "Room dev created.");
	let _ = Client::registered(&ctx, "dora").await;

	let mut c = Client::connect(&ctx).await;
	c.session
		.handle_frame(ClientFrame::Login(LoginPayload {
			username: "dora".to_string(),
			password: "pw-dora".to_string(),
		}))
		.await;
	assert!(c.text().await.starts_with("Logged in as dora ("));

	c.session
		.handle_frame(ClientFrame::RoomJoin(RoomJoinPayload {
			room: "dev".to_string(),
		}))
		.await;
	assert_eq!(c.text().await, "room_join:dev");
	assert_eq!(c.text().await, "Joined room: dev");
	assert_eq!(c.session.current_room().as_str(), "dev");
}

#[tokio::test]
async fn malformed_frames_are_dropped_and_the_session_survives() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let mut c = Client::connect(&ctx).await;

	c.session.handle_text("{not json").await;
	c.session.handle_text(r#"{"type":"teleport","payload":1}"#).await;
	c.session.handle_text(r#"{"type":"login","payload":"alice"}"#).await;
	c.quiet().await;

	c.session.handle_text(r#"{"type":"message","payload":"/help"}"#).await;
	assert!(c.text().await.starts_with("Available commands:"));
}

#[tokio::test]
async fn rooms_isolate_chat_and_removal_moves_members_home() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let mut admin = Client::admin(&ctx, "root").await;
	let mut bob = Client::registered(&ctx, "bob").await;

	admin.line("/room create dev").await;
	assert_eq!(admin.text().await, "Room dev created.");
	admin.line("/room create dev").await;
	assert_eq!(admin.text().await, "Room already exists.");

	bob.line("/join dev").await;
	assert_eq!(bob.text().await, "room_join:dev");
	assert_eq!(bob.text().await, "Joined room: dev");

	admin.line("general only").await;
	assert_eq!(admin.text().await, "general only");
	bob.quiet().await;

	bob.line("dev only").await;
	let m = bob.chat().await;
	assert_eq!(m.room.as_str(), "dev");
	admin.quiet().await;

	let dev = RoomName::new("dev").expect("room");
	let dev_history = ctx.messages.history(&dev).await;
	assert_eq!(dev_history.first().map(|m| m.content.as_str()), Some("Welcome to the dev room!"));

	admin.line("/room remove general").await;
	assert_eq!(admin.text().await, "Cannot remove general room.");
	admin.line("/room remove dev").await;
	assert_eq!(admin.text().await, "Room dev removed.");

	assert_eq!(bob.text().await, "room_join:general");
	assert_eq!(bob.text().await, "Room was removed. Moved to general.");
	assert!(bob.session.current_room().is_default());
	assert!(!ctx.moderation.room_exists(&dev).await);

	bob.line("/join dev").await;
	assert_eq!(bob.text().await, "Room does not exist.");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_racing_room_removal_never_strands_the_joiner() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let mut admin = Client::admin(&ctx, "root").await;
	let mut bob = Client::registered(&ctx, "bob").await;
	let tmp = RoomName::new("tmp").expect("room");

	for round in 0..25 {
		admin.line("/room create tmp").await;
		assert_eq!(admin.text().await, "Room tmp created.");

		let joiner = tokio::spawn(async move {
			bob.line("/join tmp").await;
			bob
		});
		admin.line("/room remove tmp").await;
		assert_eq!(admin.text().await, "Room tmp removed.");
		bob = joiner.await.expect("join task");

		assert!(!ctx.moderation.room_exists(&tmp).await);
		assert!(bob.session.current_room().is_default(), "round {round}: bob left in removed room");
		let hub_room = ctx
			.hub
			.snapshot()
			.await
			.into_iter()
			.find(|info| info.id == bob.session.id())
			.map(|info| info.room);
		assert_eq!(hub_room, Some(RoomName::general()), "round {round}");

		while bob.channels.outbound.try_recv().is_ok() {}
	}
}

#[tokio::test]
async fn logout_returns_to_anonymous_and_drops_admin() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let mut alice = Client::admin(&ctx, "alice").await;

	alice.line("/logout").await;
	assert_eq!(alice.text().await, "Logged out.");
	assert!(alice.session.user().is_none());
	assert!(!alice.session.is_admin());

	alice.line("still here?").await;
	assert_eq!(alice.text().await, LOGIN_REQUIRED_TEXT);
	assert!(ctx.messages.history(&RoomName::general()).await.is_empty());

	alice.line("/kick 1.2.3.4").await;
	assert_eq!(alice.text().await, "Admin only.");

	let mut bob = Client::registered(&ctx, "bob").await;
	bob.line("/member list").await;
	let members = bob.text().await;
	assert!(!members.contains("alice"), "{members}");
	assert!(members.contains("bob"), "{members}");

	let live = ctx.hub.snapshot().await;
	assert_eq!(live.len(), 2);
	assert!(live.iter().any(|info| info.id == alice.session.id() && info.user.is_none()));

	alice.line("/login alice pw-alice").await;
	assert!(alice.text().await.starts_with("Logged in as alice ("));
}

#[tokio::test]
async fn admin_commands_require_elevation() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let mut bob = Client::registered(&ctx, "bob").await;

	bob.line("/kick 1.2.3.4").await;
	assert_eq!(bob.text().await, "Admin only.");
	bob.line("/room create dev").await;
	assert_eq!(bob.text().await, "Admin only.");
	bob.line("/admin wrong").await;
	assert_eq!(bob.text().await, "Incorrect password.");

	let mut anon = Client::connect(&ctx).await;
	anon.line("/room list").await;
	assert_eq!(anon.text().await, "Please login first.");
}

#[tokio::test]
async fn kick_notifies_then_disconnects_the_target() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let mut admin = Client::admin(&ctx, "root").await;
	let mut bob = Client::registered(&ctx, "bob").await;

	admin.line(&format!("/kick {}", bob.ipid())).await;
	assert_eq!(admin.text().await, "User kicked.");
	assert_eq!(bob.text().await, "You have been kicked.");
	let reason = timeout(Duration::from_millis(500), &mut bob.channels.closed)
		.await
		.expect("closed in time")
		.expect("reason");
	assert_eq!(reason, CloseReason::ForceDisconnect);

	admin.line(&format!("/kick {}", bob.ipid())).await;
	assert_eq!(admin.text().await, "User not active.");
}

#[tokio::test]
async fn ban_disconnects_and_blocks_future_logins() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let mut admin = Client::admin(&ctx, "root").await;
	let mut bob = Client::registered(&ctx, "bob").await;
	let ipid = bob.ipid();

	admin.line(&format!("/ban {ipid}")).await;
	assert_eq!(admin.text().await, "User banned.");
	assert_eq!(bob.text().await, "You have been banned.");
	assert!(ctx.moderation.is_banned(&ipid).await);

	let mut again = Client::connect(&ctx).await;
	again.line("/login bob pw-bob").await;
	assert_eq!(again.text().await, "Login failed: this identity is banned");
	assert!(again.session.user().is_none());
}

#[tokio::test]
async fn display_name_and_clan_tags_decorate_chat() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let mut admin = Client::admin(&ctx, "root").await;
	let mut bob = Client::registered(&ctx, "bob").await;

	bob.line("/name abcdefghijklmnopqrstu").await;
	assert_eq!(bob.text().await, "Name too long (max 20 chars).");
	bob.line("/name Bobby").await;
	assert_eq!(bob.text().await, "Name changed from bob to Bobby");

	admin.line("/clan create ABC #FF0000").await;
	assert_eq!(admin.text().await, "Tag must be 1-2 characters.");
	admin.line("/clan create AB red").await;
	assert_eq!(admin.text().await, "Color must be hex code (e.g. #FF0000).");
	admin.line("/clan create AB #FF0000").await;
	assert_eq!(admin.text().await, "Clan AB created with color #FF0000.");
	admin.line(&format!("/clan add {} AB", bob.ipid())).await;
	assert_eq!(admin.text().await, "Added bob to clan AB.");
	admin.line(&format!("/clan add {} AB", bob.ipid())).await;
	assert_eq!(admin.text().await, "User already in clan.");

	bob.line("hi").await;
	let m = bob.chat().await;
	assert_eq!(m.sender, "bob");
	assert_eq!(m.sender_display, "[<#FF0000>AB</>]Bobby");
	assert_eq!(admin.chat().await.sender_display, "[<#FF0000>AB</>]Bobby");

	admin.line("/clan list").await;
	let list = admin.text().await;
	assert!(list.contains("• [AB] (Color: #FF0000)"), "{list}");
	assert!(list.contains(&format!("bob ({})", bob.ipid())), "{list}");
}

#[tokio::test]
async fn info_commands_report_live_state() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let mut alice = Client::registered(&ctx, "alice").await;
	let _anon = Client::connect(&ctx).await;

	alice.line("/member list").await;
	let members = alice.text().await;
	assert!(members.starts_with("All Online Members:"));
	assert!(members.contains("• alice (alice) [Room: general]"), "{members}");

	alice.line("/member list dev").await;
	assert_eq!(alice.text().await, "Members in dev:\nNo members found.");

	alice.line("/userinfo alice").await;
	let info = alice.text().await;
	assert!(info.contains("• Status: Online"), "{info}");
	assert!(info.contains(&format!("• IPID: {}", alice.ipid())), "{info}");

	alice.line("/userinfo ghost").await;
	assert_eq!(alice.text().await, "User not found.");

	alice.line("/server info").await;
	let server = alice.text().await;
	assert!(server.contains("• Name: Test Server"), "{server}");
	assert!(server.contains("• Online: 2"), "{server}");
	assert!(server.contains("• Rooms: 1"), "{server}");

	alice.line("/room list").await;
	assert_eq!(alice.text().await, "Available Rooms:\n• general");

	alice.line("/dance").await;
	assert_eq!(alice.text().await, "Unknown command: /dance");
}

#[tokio::test]
async fn dropping_a_session_unregisters_it() {
	let dir = tempfile::tempdir().expect("tempdir");
	let ctx = test_context(dir.path()).await;
	let alice = Client::registered(&ctx, "alice").await;
	assert_eq!(ctx.hub.snapshot().await.len(), 1);

	drop(alice);
	assert!(ctx.hub.snapshot().await.is_empty());
}
