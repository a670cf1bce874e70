#![forbid(unsafe_code)]

use std::sync::Arc;

use huddle_domain::{ChatMessage, ClanTag, HexColor, Ipid, RoomName, UserRecord};
use huddle_util::secret::SecretString;

use crate::error::AuthError;
use crate::store::credentials::{CredentialStore, unused_ipid};
use crate::store::hasher::{Argon2Hasher, CredentialHasher};
use crate::store::messages::MessageLog;
use crate::store::moderation::{ModerationConfig, RoomRemoval};
use crate::store::persist::read_json_if_exists;
use crate::store::{DataLayout, init_data_dir};

fn fast_hasher() -> Arc<dyn CredentialHasher> {
	Arc::new(Argon2Hasher::with_params(8, 1, 1).expect("argon2 params"))
}

#[tokio::test]
async fn duplicate_registration_is_rejected_and_original_password_still_works() {
	let dir = tempfile::tempdir().expect("tempdir");
	let store = CredentialStore::load(dir.path().join("users.json"), fast_hasher())
		.await
		.expect("load");

	let alice = store.register("alice", "secret1").await.expect("register");
	assert_eq!(alice.username, "alice");
	assert_eq!(alice.ipid.as_str().split('.').count(), 4);

	let err = store.register("alice", "other").await.expect_err("duplicate");
	assert!(matches!(err, AuthError::UserExists));
	assert_eq!(err.to_string(), "user already exists");

	let authed = store.authenticate("alice", "secret1").await.expect("login");
	assert_eq!(authed.ipid, alice.ipid);
	assert!(matches!(
		store.authenticate("alice", "other").await,
		Err(AuthError::InvalidCredentials)
	));
}

#[tokio::test]
async fn unknown_user_and_wrong_password_fail_the_same_way() {
	let dir = tempfile::tempdir().expect("tempdir");
	let store = CredentialStore::load(dir.path().join("users.json"), fast_hasher())
		.await
		.expect("load");
	store.register("bob", "pw").await.expect("register");

	let unknown = store.authenticate("nobody", "pw").await.expect_err("unknown");
	let wrong = store.authenticate("bob", "nope").await.expect_err("wrong");
	assert_eq!(unknown.to_string(), wrong.to_string());
}

#[tokio::test]
async fn concurrent_registrations_for_one_name_admit_exactly_one() {
	let dir = tempfile::tempdir().expect("tempdir");
	let store = Arc::new(
		CredentialStore::load(dir.path().join("users.json"), fast_hasher())
			.await
			.expect("load"),
	);

	let mut tasks = Vec::new();
	for i in 0..8 {
		let store = Arc::clone(&store);
		tasks.push(tokio::spawn(async move { store.register("carol", &format!("pw{i}")).await }));
	}

	let mut ok = 0;
	for t in tasks {
		match t.await.expect("join") {
			Ok(_) => ok += 1,
			Err(AuthError::UserExists) => {}
			Err(other) => panic!("unexpected error: {other:?}"),
		}
	}
	assert_eq!(ok, 1);
	assert_eq!(store.len().await, 1);

	let persisted: Vec<UserRecord> = read_json_if_exists(store.path())
		.await
		.expect("read")
		.expect("exists");
	assert_eq!(persisted.len(), 1);
}

#[tokio::test]
async fn failed_registration_write_rolls_back_memory() {
	let dir = tempfile::tempdir().expect("tempdir");
	let users_path = dir.path().join("users.json");
	let store = CredentialStore::load(&users_path, fast_hasher()).await.expect("load");

	// A directory in place of the users file makes the rename fail.
	std::fs::create_dir_all(&users_path).expect("mkdir");

	let err = store.register("dave", "pw").await.expect_err("write must fail");
	assert!(matches!(err, AuthError::Persistence(_)));
	assert!(store.get("dave").await.is_none());
	assert_eq!(store.len().await, 0);
}

#[tokio::test]
async fn user_edits_are_persisted_and_reloaded() {
	let dir = tempfile::tempdir().expect("tempdir");
	let path = dir.path().join("users.json");
	let store = CredentialStore::load(&path, fast_hasher()).await.expect("load");
	let erin = store.register("erin", "pw").await.expect("register");

	let tag = ClanTag::new("AB").expect("tag");
	assert_eq!(store.set_display_name("erin", "Erin W").await.as_deref(), Some("erin"));
	assert!(store.set_admin("erin").await);
	assert!(store.add_clan(&erin.ipid, &tag).await.expect("found").changed);
	assert!(!store.add_clan(&erin.ipid, &tag).await.expect("found").changed);
	assert!(store.add_clan(&Ipid::new("9.9.9.9").expect("ipid"), &tag).await.is_none());

	let reloaded = CredentialStore::load(&path, fast_hasher()).await.expect("reload");
	let rec = reloaded.get("erin").await.expect("record");
	assert_eq!(rec.display_name.as_deref(), Some("Erin W"));
	assert!(rec.is_admin);
	assert_eq!(rec.clans, vec![tag.clone()]);
	assert_eq!(reloaded.find_by_name("Erin W").await.map(|u| u.username), Some("erin".to_string()));
	assert_eq!(reloaded.members_of(&tag).await.len(), 1);

	let removed = reloaded.remove_clan(&erin.ipid, &tag).await.expect("found");
	assert_eq!(removed.username, "erin");
	assert!(removed.changed);
}

#[tokio::test]
async fn appended_message_round_trips_through_history_and_disk() {
	let dir = tempfile::tempdir().expect("tempdir");
	let log = MessageLog::load(dir.path().join("messages")).await.expect("load");

	let room = RoomName::new("dev").expect("room");
	let user = UserRecord::new("alice", "h", Ipid::new("1.2.3.4").expect("ipid"));
	let msg = ChatMessage::from_user(&user, "alice".to_string(), "hello", room.clone());

	let mut published = Vec::new();
	log.append_then(msg.clone(), |m| published.push(m.content.clone())).await;
	assert_eq!(published, vec!["hello".to_string()]);
	assert_eq!(log.history(&room).await, vec![msg.clone()]);
	assert!(log.history(&RoomName::general()).await.is_empty());

	let reloaded = MessageLog::load(dir.path().join("messages")).await.expect("reload");
	assert_eq!(reloaded.history(&room).await, vec![msg]);
}

#[tokio::test]
async fn message_log_skips_files_that_are_not_rooms() {
	let dir = tempfile::tempdir().expect("tempdir");
	let messages = dir.path().join("messages");
	std::fs::create_dir_all(&messages).expect("mkdir");
	std::fs::write(messages.join("not a room.json"), "[]").expect("write");
	std::fs::write(messages.join("broken.json"), "{").expect("write");
	std::fs::write(messages.join("general.json"), "[]").expect("write");

	let log = MessageLog::load(&messages).await.expect("load");
	assert!(log.history(&RoomName::general()).await.is_empty());
}

#[tokio::test]
async fn banning_twice_leaves_one_entry() {
	let dir = tempfile::tempdir().expect("tempdir");
	let path = dir.path().join("moderation.json");
	let cfg = ModerationConfig::load_or_create(&path, None).await.expect("load");

	let ipid = Ipid::new("10.0.0.1").expect("ipid");
	assert!(cfg.ban(&ipid).await);
	assert!(!cfg.ban(&ipid).await);
	assert!(cfg.is_banned(&ipid).await);

	let raw: serde_json::Value = read_json_if_exists(&path).await.expect("read").expect("exists");
	assert_eq!(raw["banned_ip_ids"], serde_json::json!(["10.0.0.1"]));

	assert!(cfg.unban(&ipid).await);
	assert!(!cfg.unban(&ipid).await);
	assert!(!cfg.is_banned(&ipid).await);
}

#[tokio::test]
async fn rooms_default_room_is_protected_and_duplicates_are_noops() {
	let dir = tempfile::tempdir().expect("tempdir");
	let cfg = ModerationConfig::load_or_create(dir.path().join("moderation.json"), None)
		.await
		.expect("load");

	assert_eq!(cfg.rooms().await, vec![RoomName::general()]);
	let tmp = RoomName::new("tmp").expect("room");
	assert!(cfg.add_room(tmp.clone()).await);
	assert!(!cfg.add_room(tmp.clone()).await);
	assert_eq!(cfg.rooms().await.len(), 2);

	assert_eq!(cfg.remove_room(&RoomName::general()).await, RoomRemoval::Protected);
	assert_eq!(cfg.remove_room(&tmp).await, RoomRemoval::Removed);
	assert_eq!(cfg.remove_room(&tmp).await, RoomRemoval::Missing);
	assert!(cfg.room_exists(&RoomName::general()).await);
}

#[tokio::test]
async fn admin_secret_defaults_and_can_be_seeded() {
	let dir = tempfile::tempdir().expect("tempdir");
	let path = dir.path().join("moderation.json");

	let cfg = ModerationConfig::load_or_create(&path, None).await.expect("load");
	assert!(cfg.admin_secret_matches("admin").await);
	assert!(!cfg.admin_secret_matches("Admin").await);

	let seeded = ModerationConfig::load_or_create(&path, Some(&SecretString::new("s3cret")))
		.await
		.expect("reload");
	assert!(seeded.admin_secret_matches("s3cret").await);
	assert!(!seeded.admin_secret_matches("admin").await);
}

#[tokio::test]
async fn clan_colors_survive_reload() {
	let dir = tempfile::tempdir().expect("tempdir");
	let path = dir.path().join("moderation.json");
	let cfg = ModerationConfig::load_or_create(&path, None).await.expect("load");

	let tag = ClanTag::new("X").expect("tag");
	assert!(cfg.clans().await.is_empty());
	cfg.set_clan(tag.clone(), HexColor::new("#00FF00").expect("color")).await;
	cfg.set_clan(tag.clone(), HexColor::new("#0000FF").expect("color")).await;

	let reloaded = ModerationConfig::load_or_create(&path, None).await.expect("reload");
	let clans = reloaded.clans().await;
	assert_eq!(clans.len(), 1);
	assert_eq!(clans.get(&tag).map(HexColor::as_str), Some("#0000FF"));
}

#[tokio::test]
async fn init_creates_skeleton_once() {
	let dir = tempfile::tempdir().expect("tempdir");
	let layout = DataLayout::new(dir.path().join("data"));

	let created = init_data_dir(&layout, None).await.expect("init");
	assert_eq!(created.len(), 3);
	assert!(layout.users_file().is_file());
	assert!(layout.moderation_file().is_file());
	assert!(layout.messages_dir().join("general.json").is_file());

	let again = init_data_dir(&layout, None).await.expect("init again");
	assert!(again.is_empty());
}

#[test]
fn generated_ipids_skip_the_system_sentinel_and_taken_ones() {
	let taken = Ipid::new("1.2.3.4").expect("ipid");
	let mut users = std::collections::BTreeMap::new();
	users.insert("alice".to_string(), UserRecord::new("alice", "h", taken.clone()));

	let mut draws = vec![Ipid::system(), taken, Ipid::new("5.6.7.8").expect("ipid")].into_iter();
	let ipid = unused_ipid(&users, || draws.next().expect("a fresh candidate"));
	assert_eq!(ipid.as_str(), "5.6.7.8");
	assert_eq!(draws.next(), None);
}

#[tokio::test]
async fn room_removal_waits_for_work_running_in_that_room() {
	let dir = tempfile::tempdir().expect("tempdir");
	let cfg = Arc::new(
		ModerationConfig::load_or_create(dir.path().join("moderation.json"), None)
			.await
			.expect("load"),
	);
	let dev = RoomName::new("dev").expect("room");
	assert!(cfg.add_room(dev.clone()).await);

	let (started_tx, started_rx) = tokio::sync::oneshot::channel();
	let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
	let held = tokio::spawn({
		let cfg = Arc::clone(&cfg);
		let dev = dev.clone();
		async move {
			cfg.while_room_exists(&dev, move || async move {
				let _ = started_tx.send(());
				let _ = release_rx.await;
				"appended"
			})
			.await
		}
	});
	started_rx.await.expect("work started");

	let remover = tokio::spawn({
		let cfg = Arc::clone(&cfg);
		let dev = dev.clone();
		async move { cfg.remove_room(&dev).await }
	});
	tokio::time::sleep(std::time::Duration::from_millis(50)).await;
	assert!(!remover.is_finished());

	release_tx.send(()).expect("release");
	assert_eq!(held.await.expect("held task"), Some("appended"));
	assert_eq!(remover.await.expect("remover task"), RoomRemoval::Removed);
	assert_eq!(cfg.while_room_exists(&dev, || async {}).await, None);
}
