#![forbid(unsafe_code)]

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

use crate::error::AuthError;

/// Opaque hash/verify capability used by the credential store.
///
/// Both calls are CPU bound; the store runs them on the blocking pool.
pub trait CredentialHasher: Send + Sync + 'static {
	fn hash(&self, password: &str) -> Result<String, AuthError>;

	/// Constant-time verification of `password` against a stored hash.
	fn verify(&self, password: &str, stored_hash: &str) -> bool;
}

/// Argon2id with PHC-string output.
#[derive(Debug, Clone)]
pub struct Argon2Hasher {
	params: Params,
}

impl Argon2Hasher {
	pub fn new() -> Self {
		Self {
			params: Params::default(),
		}
	}

	/// Custom cost parameters (memory KiB, iterations, lanes).
	pub fn with_params(m_cost: u32, t_cost: u32, p_cost: u32) -> Result<Self, AuthError> {
		let params = Params::new(m_cost, t_cost, p_cost, None).map_err(|_| AuthError::Hash)?;
		Ok(Self { params })
	}

	fn argon2(&self) -> Argon2<'static> {
		Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
	}
}

impl Default for Argon2Hasher {
	fn default() -> Self {
		Self::new()
	}
}

impl CredentialHasher for Argon2Hasher {
	fn hash(&self, password: &str) -> Result<String, AuthError> {
		let salt = SaltString::generate(&mut OsRng);
		self.argon2()
			.hash_password(password.as_bytes(), &salt)
			.map(|h| h.to_string())
			.map_err(|_| AuthError::Hash)
	}

	fn verify(&self, password: &str, stored_hash: &str) -> bool {
		let Ok(parsed) = PasswordHash::new(stored_hash) else {
			return false;
		};
		self.argon2().verify_password(password.as_bytes(), &parsed).is_ok()
	}
}
