#![forbid(unsafe_code)]

use std::sync::Arc;

use huddle_domain::{Ipid, RoomName};
use huddle_protocol::ServerFrame;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::server::commands;
use crate::server::context::AppContext;
use crate::server::hub::{BroadcastScope, SessionSelector};

pub const CONSOLE_HELP: &str = "Available commands: ban <ipid>, kick <ipid>, unban <ipid>, broadcast <msg>, stop";

/// Operator command read from the server's standard input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
	Help,
	Stop,
	Kick(Ipid),
	Ban(Ipid),
	Unban(Ipid),
	Broadcast(String),
}

impl ConsoleCommand {
	/// `Ok(None)` for a blank line.
	pub fn parse(line: &str) -> Result<Option<Self>, String> {
		let line = line.trim();
		if line.is_empty() {
			return Ok(None);
		}

		let (verb, rest) = match line.split_once(char::is_whitespace) {
			Some((verb, rest)) => (verb, rest.trim()),
			None => (line, ""),
		};

		let ipid = |usage: &str| -> Result<Ipid, String> {
			if rest.is_empty() {
				return Err(format!("Usage: {usage}"));
			}
			Ipid::new(rest).map_err(|e| format!("Invalid ipid: {e}"))
		};

		let cmd = match verb {
			"help" => Self::Help,
			"stop" => Self::Stop,
			"kick" => Self::Kick(ipid("kick <ipid>")?),
			"ban" => Self::Ban(ipid("ban <ipid>")?),
			"unban" => Self::Unban(ipid("unban <ipid>")?),
			"broadcast" if rest.is_empty() => return Err("Usage: broadcast <msg>".to_string()),
			"broadcast" => Self::Broadcast(rest.to_string()),
			other => return Err(format!("Unknown command: {other}. {CONSOLE_HELP}")),
		};

		Ok(Some(cmd))
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleReply {
	pub text: String,
	pub stop: bool,
}

impl ConsoleReply {
	fn text(text: impl Into<String>) -> Self {
		Self {
			text: text.into(),
			stop: false,
		}
	}
}

pub async fn execute(ctx: &AppContext, cmd: ConsoleCommand) -> ConsoleReply {
	match cmd {
		ConsoleCommand::Help => ConsoleReply::text(CONSOLE_HELP),
		ConsoleCommand::Stop => ConsoleReply {
			text: "Stopping server...".to_string(),
			stop: true,
		},
		ConsoleCommand::Kick(ipid) => {
			let notice = ServerFrame::system("You have been kicked.", RoomName::general())
				.encode()
				.ok();
			let n = ctx.hub.force_disconnect(SessionSelector::Ipid(ipid.clone()), notice).await;
			info!(%ipid, sessions = n, "console kick");
			ConsoleReply::text(if n > 0 { "User kicked." } else { "User not found." })
		}
		ConsoleCommand::Ban(ipid) => match commands::ban(ctx, &ipid).await {
			Ok(n) => {
				info!(%ipid, sessions = n, "console ban");
				ConsoleReply::text("User banned.")
			}
			Err(e) => ConsoleReply::text(e.to_string()),
		},
		ConsoleCommand::Unban(ipid) => {
			if ctx.moderation.unban(&ipid).await {
				info!(%ipid, "console unban");
				ConsoleReply::text("User unbanned.")
			} else {
				ConsoleReply::text("User was not banned.")
			}
		}
		ConsoleCommand::Broadcast(text) => {
			match ServerFrame::system(format!("[Admin] {text}"), RoomName::general()).encode() {
				Ok(frame) => ctx.hub.broadcast(BroadcastScope::All, frame),
				Err(e) => warn!(error = %e, "failed to encode console broadcast"),
			}
			ConsoleReply::text("Broadcast sent.")
		}
	}
}

/// Reads operator commands from stdin until `stop` or EOF.
pub fn spawn_console(ctx: Arc<AppContext>, stop: watch::Sender<bool>) {
	tokio::spawn(async move {
		let mut lines = BufReader::new(tokio::io::stdin()).lines();
		loop {
			let line = match lines.next_line().await {
				Ok(Some(line)) => line,
				Ok(None) => break,
				Err(e) => {
					warn!(error = %e, "console input failed");
					break;
				}
			};

			let cmd = match ConsoleCommand::parse(&line) {
				Ok(Some(cmd)) => cmd,
				Ok(None) => continue,
				Err(text) => {
					println!("{text}");
					continue;
				}
			};

			let reply = execute(&ctx, cmd).await;
			println!("{}", reply.text);
			if reply.stop {
				let _ = stop.send(true);
				break;
			}
		}
	});
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_operator_commands() {
		assert_eq!(ConsoleCommand::parse("   ").expect("blank"), None);
		assert_eq!(ConsoleCommand::parse("stop").expect("stop"), Some(ConsoleCommand::Stop));
		assert_eq!(
			ConsoleCommand::parse("ban 1.2.3.4").expect("ban"),
			Some(ConsoleCommand::Ban(Ipid::new("1.2.3.4").expect("ipid")))
		);
		assert_eq!(
			ConsoleCommand::parse("broadcast  hello all ").expect("broadcast"),
			Some(ConsoleCommand::Broadcast("hello all".to_string()))
		);
	}

	#[test]
	fn rejects_missing_arguments_and_unknown_verbs() {
		assert_eq!(ConsoleCommand::parse("kick").expect_err("usage"), "Usage: kick <ipid>");
		assert_eq!(ConsoleCommand::parse("broadcast").expect_err("usage"), "Usage: broadcast <msg>");
		assert!(ConsoleCommand::parse("reboot").expect_err("unknown").starts_with("Unknown command: reboot"));
	}
}
