#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use huddle_domain::{Ipid, RoomName};
use huddle_protocol::EncodedFrame;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

pub type SessionId = u64;

/// User a session is authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundUser {
	pub username: String,
	pub ipid: Ipid,
}

/// Why the hub closed a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
	SlowConsumer,
	ForceDisconnect,
	Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastScope {
	All,
	Room(RoomName),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSelector {
	Ipid(Ipid),
}

/// Point-in-time view of one live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
	pub id: SessionId,
	pub user: Option<BoundUser>,
	pub room: RoomName,
}

/// Everything the hub needs to deliver to and close one session.
#[derive(Debug)]
pub struct SessionRegistration {
	pub id: SessionId,
	pub outbound: mpsc::Sender<EncodedFrame>,
	pub close: oneshot::Sender<CloseReason>,
	pub room: watch::Sender<RoomName>,
}

/// Configuration for `Hub`.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
	pub debug_logs: bool,
}

enum HubCommand {
	Register(SessionRegistration),
	Unregister(SessionId),
	Broadcast {
		scope: BroadcastScope,
		frame: EncodedFrame,
	},
	BindUser {
		id: SessionId,
		user: Option<BoundUser>,
	},
	JoinRoom {
		id: SessionId,
		room: RoomName,
		frames: Vec<EncodedFrame>,
		resp: oneshot::Sender<bool>,
	},
	MigrateRoom {
		from: RoomName,
		to: RoomName,
		only: Option<SessionId>,
		frames: Vec<EncodedFrame>,
		resp: oneshot::Sender<usize>,
	},
	ForceDisconnect {
		selector: SessionSelector,
		notice: Option<EncodedFrame>,
		resp: oneshot::Sender<usize>,
	},
	Snapshot {
		resp: oneshot::Sender<Vec<SessionInfo>>,
	},
	Shutdown {
		notice: Option<EncodedFrame>,
		resp: oneshot::Sender<usize>,
	},
}

/// Handle to the connection registry.
///
/// The live-session set is owned by one task; every membership change and
/// every broadcast is a message to it, processed one at a time.
#[derive(Debug, Clone)]
pub struct Hub {
	tx: mpsc::UnboundedSender<HubCommand>,
}

impl std::fmt::Debug for HubCommand {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			HubCommand::Register(_) => "Register",
			HubCommand::Unregister(_) => "Unregister",
			HubCommand::Broadcast { .. } => "Broadcast",
			HubCommand::BindUser { .. } => "BindUser",
			HubCommand::JoinRoom { .. } => "JoinRoom",
			HubCommand::MigrateRoom { .. } => "MigrateRoom",
			HubCommand::ForceDisconnect { .. } => "ForceDisconnect",
			HubCommand::Snapshot { .. } => "Snapshot",
			HubCommand::Shutdown { .. } => "Shutdown",
		};
		f.write_str(name)
	}
}

impl Hub {
	/// Spawns the coordinating loop. It runs until every handle is dropped.
	pub fn spawn(cfg: HubConfig) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		tokio::spawn(run_hub(rx, cfg));
		Self { tx }
	}

	pub fn register(&self, registration: SessionRegistration) {
		self.submit(HubCommand::Register(registration));
	}

	/// Removes the session if it is still live; safe to call more than once.
	pub fn unregister(&self, id: SessionId) {
		self.submit(HubCommand::Unregister(id));
	}

	pub fn broadcast(&self, scope: BroadcastScope, frame: EncodedFrame) {
		self.submit(HubCommand::Broadcast { scope, frame });
	}

	pub fn bind_user(&self, id: SessionId, user: Option<BoundUser>) {
		self.submit(HubCommand::BindUser { id, user });
	}

	/// Moves one session to `room` and queues `frames` to it in the same step.
	pub async fn join_room(&self, id: SessionId, room: RoomName, frames: Vec<EncodedFrame>) -> bool {
		self.request(|resp| HubCommand::JoinRoom { id, room, frames, resp })
			.await
			.unwrap_or(false)
	}

	/// Moves every session in `from` to `to`, queueing `frames` to each.
	/// Returns how many sessions moved.
	pub async fn migrate_room(&self, from: RoomName, to: RoomName, frames: Vec<EncodedFrame>) -> usize {
		self.request(|resp| HubCommand::MigrateRoom {
			from,
			to,
			only: None,
			frames,
			resp,
		})
		.await
		.unwrap_or(0)
	}

	/// Moves session `id` from `from` to `to` only if it is still in `from`.
	pub async fn migrate_session(&self, id: SessionId, from: RoomName, to: RoomName, frames: Vec<EncodedFrame>) -> bool {
		self.request(|resp| HubCommand::MigrateRoom {
			from,
			to,
			only: Some(id),
			frames,
			resp,
		})
		.await
		.is_some_and(|moved| moved > 0)
	}

	/// Queues `notice` to every matching session, then closes them.
	/// Returns how many sessions were disconnected.
	pub async fn force_disconnect(&self, selector: SessionSelector, notice: Option<EncodedFrame>) -> usize {
		self.request(|resp| HubCommand::ForceDisconnect { selector, notice, resp })
			.await
			.unwrap_or(0)
	}

	pub async fn snapshot(&self) -> Vec<SessionInfo> {
		self.request(|resp| HubCommand::Snapshot { resp }).await.unwrap_or_default()
	}

	/// Notifies and closes every session; later registrations are closed on
	/// arrival.
	pub async fn shutdown(&self, notice: Option<EncodedFrame>) -> usize {
		self.request(|resp| HubCommand::Shutdown { notice, resp })
			.await
			.unwrap_or(0)
	}

	fn submit(&self, cmd: HubCommand) {
		if let Err(e) = self.tx.send(cmd) {
			debug!(command = ?e.0, "hub: loop is gone, command dropped");
		}
	}

	async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> HubCommand) -> Option<T> {
		let (resp, rx) = oneshot::channel();
		self.tx.send(make(resp)).ok()?;
		rx.await.ok()
	}
}

struct LiveSession {
	outbound: mpsc::Sender<EncodedFrame>,
	close: Option<oneshot::Sender<CloseReason>>,
	room: watch::Sender<RoomName>,
	user: Option<BoundUser>,
}

impl LiveSession {
	fn in_room(&self, room: &RoomName) -> bool {
		&*self.room.borrow() == room
	}

	fn matches(&self, selector: &SessionSelector) -> bool {
		match selector {
			SessionSelector::Ipid(ipid) => self.user.as_ref().is_some_and(|u| &u.ipid == ipid),
		}
	}

	/// Non-blocking enqueue.
	fn offer(&self, frame: &EncodedFrame) -> Result<(), mpsc::error::TrySendError<EncodedFrame>> {
		self.outbound.try_send(frame.clone())
	}

	fn close(mut self, reason: CloseReason) {
		if let Some(close) = self.close.take() {
			let _ = close.send(reason);
		}
	}
}

struct HubState {
	sessions: BTreeMap<SessionId, LiveSession>,
	closing: bool,
	cfg: HubConfig,
}

async fn run_hub(mut rx: mpsc::UnboundedReceiver<HubCommand>, cfg: HubConfig) {
	let mut state = HubState {
		sessions: BTreeMap::new(),
		closing: false,
		cfg,
	};

	while let Some(cmd) = rx.recv().await {
		state.apply(cmd);
		metrics::gauge!("huddle_server_active_sessions").set(state.sessions.len() as f64);
	}

	debug!("hub: all handles dropped, loop exiting");
}

impl HubState {
	fn apply(&mut self, cmd: HubCommand) {
		match cmd {
			HubCommand::Register(reg) => self.register(reg),
			HubCommand::Unregister(id) => {
				if self.sessions.remove(&id).is_some() && self.cfg.debug_logs {
					debug!(session_id = id, "hub: unregistered");
				}
			}
			HubCommand::Broadcast { scope, frame } => self.broadcast(&scope, &frame),
			HubCommand::BindUser { id, user } => {
				if let Some(s) = self.sessions.get_mut(&id) {
					s.user = user;
				}
			}
			HubCommand::JoinRoom { id, room, frames, resp } => {
				let joined = match self.sessions.get(&id) {
					Some(s) => {
						s.room.send_replace(room);
						self.unicast(id, &frames);
						true
					}
					None => false,
				};
				let _ = resp.send(joined);
			}
			HubCommand::MigrateRoom {
				from,
				to,
				only,
				frames,
				resp,
			} => {
				let ids: Vec<SessionId> = self
					.sessions
					.iter()
					.filter(|(id, s)| only.is_none_or(|only| only == **id) && s.in_room(&from))
					.map(|(id, _)| *id)
					.collect();
				for id in &ids {
					if let Some(s) = self.sessions.get(id) {
						s.room.send_replace(to.clone());
					}
					self.unicast(*id, &frames);
				}
				let _ = resp.send(ids.len());
			}
			HubCommand::ForceDisconnect { selector, notice, resp } => {
				let ids: Vec<SessionId> = self
					.sessions
					.iter()
					.filter(|(_, s)| s.matches(&selector))
					.map(|(id, _)| *id)
					.collect();
				for id in &ids {
					if let Some(notice) = &notice {
						self.unicast(*id, std::slice::from_ref(notice));
					}
					if let Some(s) = self.sessions.remove(id) {
						s.close(CloseReason::ForceDisconnect);
					}
				}
				let _ = resp.send(ids.len());
			}
			HubCommand::Snapshot { resp } => {
				let infos = self
					.sessions
					.iter()
					.map(|(id, s)| SessionInfo {
						id: *id,
						user: s.user.clone(),
						room: s.room.borrow().clone(),
					})
					.collect();
				let _ = resp.send(infos);
			}
			HubCommand::Shutdown { notice, resp } => {
				self.closing = true;
				if let Some(notice) = &notice {
					self.broadcast(&BroadcastScope::All, notice);
				}
				let sessions = std::mem::take(&mut self.sessions);
				let n = sessions.len();
				for (_, s) in sessions {
					s.close(CloseReason::Shutdown);
				}
				let _ = resp.send(n);
			}
		}
	}

	fn register(&mut self, reg: SessionRegistration) {
		let live = LiveSession {
			outbound: reg.outbound,
			close: Some(reg.close),
			room: reg.room,
			user: None,
		};

		if self.closing {
			live.close(CloseReason::Shutdown);
			return;
		}

		if self.cfg.debug_logs {
			debug!(session_id = reg.id, live = self.sessions.len() + 1, "hub: registered");
		}
		self.sessions.insert(reg.id, live);
	}

	/// Delivers to every session in scope; a full queue evicts its session.
	fn broadcast(&mut self, scope: &BroadcastScope, frame: &EncodedFrame) {
		metrics::counter!("huddle_server_broadcasts_total").increment(1);

		let mut dead = Vec::new();
		for (id, s) in &self.sessions {
			if let BroadcastScope::Room(room) = scope
				&& !s.in_room(room)
			{
				continue;
			}
			match s.offer(frame) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => dead.push((*id, Some(CloseReason::SlowConsumer))),
				Err(mpsc::error::TrySendError::Closed(_)) => dead.push((*id, None)),
			}
		}

		self.evict(dead);
	}

	/// Enqueues `frames` to one session in order. A full queue evicts it.
	fn unicast(&mut self, id: SessionId, frames: &[EncodedFrame]) {
		let Some(s) = self.sessions.get(&id) else {
			return;
		};

		let mut outcome = None;
		for frame in frames {
			match s.offer(frame) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					outcome = Some(Some(CloseReason::SlowConsumer));
					break;
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {
					outcome = Some(None);
					break;
				}
			}
		}

		if let Some(reason) = outcome {
			self.evict(vec![(id, reason)]);
		}
	}

	fn evict(&mut self, dead: Vec<(SessionId, Option<CloseReason>)>) {
		for (id, reason) in dead {
			let Some(s) = self.sessions.remove(&id) else {
				continue;
			};
			match reason {
				Some(reason) => {
					metrics::counter!("huddle_server_slow_consumer_evictions_total").increment(1);
					debug!(session_id = id, ?reason, "hub: evicted session with full outbound queue");
					s.close(reason);
				}
				None => {
					if self.cfg.debug_logs {
						debug!(session_id = id, "hub: dropped session with closed outbound queue");
					}
				}
			}
		}
	}
}
