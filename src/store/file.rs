//! Simple file-backed [`TokenStore`] for unattended bot deployments.

// std
use std::{
	fs,
	io::Write,
	path::{Path, PathBuf},
};
// crates.io
use tracing::warn;
// self
use crate::{
	_prelude::*,
	store::{StoreError, StoreFuture, TokenStore},
	token::TokenState,
};

/// Persists the token state to a JSON file after each mutation.
///
/// Writes go through a temporary sibling file followed by an atomic rename, so a
/// crash mid-save never leaves a truncated snapshot behind. The file holds both
/// the access and the rotating refresh secret in plaintext; deployments must keep
/// its permissions tight.
#[derive(Clone, Debug)]
pub struct FileStore {
	path: PathBuf,
	inner: Arc<RwLock<Option<TokenState>>>,
}
impl FileStore {
	/// Opens (or creates) a store at the provided path, eagerly loading existing data.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let path = path.into();

		Self::ensure_parent_exists(&path)?;

		let snapshot = Self::load_snapshot(&path)?;

		Ok(Self { path, inner: Arc::new(RwLock::new(snapshot)) })
	}

	fn load_snapshot(path: &Path) -> Result<Option<TokenState>, StoreError> {
		if !path.exists() {
			return Ok(None);
		}

		let metadata = path.metadata().map_err(|e| StoreError::Backend {
			message: format!("Failed to inspect {}: {e}", path.display()),
		})?;

		if metadata.len() == 0 {
			return Ok(None);
		}

		let bytes = fs::read(path).map_err(|e| StoreError::Backend {
			message: format!("Failed to read {}: {e}", path.display()),
		})?;

		// A corrupt snapshot means re-authorizing, not crashing the bot.
		match serde_json::from_slice(&bytes) {
			Ok(state) => Ok(Some(state)),
			Err(e) => {
				warn!("Ignoring unparseable token snapshot {}: {e}", path.display());

				Ok(None)
			},
		}
	}

	/// Returns `true` if a snapshot file exists on disk.
	pub fn exists(&self) -> bool {
		self.path.exists()
	}

	fn ensure_parent_exists(path: &Path) -> Result<(), StoreError> {
		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
				message: format!("Failed to create store directory {}: {e}", parent.display()),
			})?;
		}
		Ok(())
	}

	fn persist_locked(&self, contents: &Option<TokenState>) -> Result<(), StoreError> {
		Self::ensure_parent_exists(&self.path)?;

		match contents {
			Some(state) => {
				let serialized =
					serde_json::to_vec_pretty(state).map_err(|e| StoreError::Serialization {
						message: format!("Failed to serialize token state: {e}"),
					})?;
				let mut tmp_path = self.path.clone();

				tmp_path.set_extension("tmp");

				{
					let mut options = fs::OpenOptions::new();

					options.write(true).create(true).truncate(true);

					// The snapshot holds live credentials, so the file must be
					// owner-only from the moment it exists.
					#[cfg(unix)]
					{
						use std::os::unix::fs::OpenOptionsExt;

						options.mode(0o600);
					}

					let mut file = options.open(&tmp_path).map_err(|e| StoreError::Backend {
						message: format!("Failed to create {}: {e}", tmp_path.display()),
					})?;

					file.write_all(&serialized).map_err(|e| StoreError::Backend {
						message: format!("Failed to write {}: {e}", tmp_path.display()),
					})?;
					file.sync_all().map_err(|e| StoreError::Backend {
						message: format!("Failed to sync {}: {e}", tmp_path.display()),
					})?;
				}

				fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::Backend {
					message: format!("Failed to replace {}: {e}", self.path.display()),
				})
			},
			None =>
				if self.path.exists() {
					fs::remove_file(&self.path).map_err(|e| StoreError::Backend {
						message: format!("Failed to remove {}: {e}", self.path.display()),
					})
				} else {
					Ok(())
				},
		}
	}
}
impl TokenStore for FileStore {
	fn load(&self) -> StoreFuture<'_, Option<TokenState>> {
		Box::pin(async move { Ok(self.inner.read().clone()) })
	}

	fn save(&self, state: TokenState) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			let mut guard = self.inner.write();

			*guard = Some(state);
			self.persist_locked(&guard)?;

			Ok(())
		})
	}

	fn clear(&self) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			let mut guard = self.inner.write();

			*guard = None;
			self.persist_locked(&guard)?;

			Ok(())
		})
	}
}
