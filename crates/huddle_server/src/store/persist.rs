#![forbid(unsafe_code)]

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::PersistenceError;

/// Reads and decodes `path`; a missing file is `Ok(None)`.
pub async fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
	match tokio::fs::read(path).await {
		Ok(bytes) => serde_json::from_slice(&bytes)
			.map(Some)
			.map_err(|source| PersistenceError::Decode {
				path: path.to_path_buf(),
				source,
			}),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
		Err(source) => Err(PersistenceError::Read {
			path: path.to_path_buf(),
			source,
		}),
	}
}

/// Rewrites `path` in full: serialize, write a sibling temp file, rename over.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistenceError> {
	let bytes = serde_json::to_vec_pretty(value)?;

	if let Some(parent) = path.parent()
		&& !parent.as_os_str().is_empty()
	{
		tokio::fs::create_dir_all(parent)
			.await
			.map_err(|source| write_err(parent, source))?;
	}

	let tmp = tmp_path(path);
	tokio::fs::write(&tmp, &bytes)
		.await
		.map_err(|source| write_err(&tmp, source))?;

	if let Err(source) = tokio::fs::rename(&tmp, path).await {
		let _ = tokio::fs::remove_file(&tmp).await;
		return Err(write_err(path, source));
	}

	Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
	let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
	name.push(".tmp");
	path.with_file_name(name)
}

fn write_err(path: &Path, source: std::io::Error) -> PersistenceError {
	PersistenceError::Write {
		path: path.to_path_buf(),
		source,
	}
}
