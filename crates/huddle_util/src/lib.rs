#![forbid(unsafe_code)]

pub mod secret {
	use std::fmt;

	/// String whose `Debug`/`Display` never print the value.
	#[derive(Clone, PartialEq, Eq, Default)]
	pub struct SecretString(String);

	impl SecretString {
		pub fn new(s: impl Into<String>) -> Self {
			Self(s.into())
		}

		/// Access the inner secret string.
		pub fn expose(&self) -> &str {
			&self.0
		}

		pub fn is_empty(&self) -> bool {
			self.0.is_empty()
		}
	}

	impl fmt::Debug for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("SecretString(<redacted>)")
		}
	}

	impl fmt::Display for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("<redacted>")
		}
	}

	/// Compare two byte strings without short-circuiting on the first mismatch.
	pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
		if a.len() != b.len() {
			return false;
		}

		let mut diff = 0u8;
		for (x, y) in a.iter().zip(b.iter()) {
			diff |= x ^ y;
		}

		diff == 0
	}

}

pub mod endpoint {
	/// Parsed `ws://host:port` (or bare `host:port`) bind endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct BindEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl BindEndpoint {
		pub fn new(host: impl Into<String>, port: u16) -> Self {
			Self { host: host.into(), port }
		}

		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// `ws://host:port`
		pub fn url(&self) -> String {
			format!("ws://{}", self.hostport())
		}

		/// Parse `ws://host:port` or `host:port`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let rest = match s.split_once("://") {
				Some(("ws", rest)) => rest,
				Some((scheme, _)) => return Err(format!("unsupported scheme {scheme:?} (expected ws://host:port): {s}")),
				None => s,
			};

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("invalid endpoint (expected ws://host:port without path/query/fragment): {s}"));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected ws://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected ws://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!("invalid endpoint host (IPv6 must be bracketed like ws://[::1]:8999): {s}"));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

}
