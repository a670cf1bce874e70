#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::StatusCode;

/// Readiness flag shared between startup and the probe handlers.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	pub(crate) fn liveness(&self) -> (StatusCode, &'static str) {
		(StatusCode::OK, "ok")
	}

	pub(crate) fn readiness(&self) -> (StatusCode, &'static str) {
		if self.is_ready() {
			(StatusCode::OK, "ready")
		} else {
			(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
		}
	}
}
