//! Persistent username → descriptor-list mapping.
//!
//! The whole store is one JSON document rewritten on every change. Writers
//! hold the exclusive lock for the duration of the rewrite, so readers never
//! observe a half-applied enrollment. Users keep their insertion order; the
//! login loop scores them in that order.

use crate::types::{Descriptor, DescriptorError, StoreVariant, UserRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store {path} holds {found:?} descriptors, configured for {expected:?}")]
    VariantMismatch {
        path: String,
        expected: StoreVariant,
        found: StoreVariant,
    },
    #[error("store checksum mismatch: file is corrupt or was partially written")]
    Corrupt,
    #[error("unsupported store version {0}")]
    UnsupportedVersion(u32),
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("descriptor list must not be empty")]
    NoDescriptors,
    #[error("descriptor {index}: {source}")]
    InvalidDescriptor {
        index: usize,
        #[source]
        source: DescriptorError,
    },
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Result of a status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStatus {
    pub exists: bool,
    pub users: usize,
    pub variant: StoreVariant,
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    version: u32,
    variant: StoreVariant,
    checksum: String,
    users: &'a [UserRecord],
}

#[derive(Deserialize)]
struct StoreFile {
    version: u32,
    variant: StoreVariant,
    checksum: String,
    users: Vec<UserRecord>,
}

/// Shared, read-mostly descriptor store backed by a single file.
pub struct DescriptorStore {
    path: PathBuf,
    variant: StoreVariant,
    users: RwLock<Vec<UserRecord>>,
}

impl DescriptorStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>, variant: StoreVariant) -> Result<Self, StoreError> {
        let path = path.into();
        let users = read_users(&path, variant)?;

        tracing::info!(
            path = %path.display(),
            kind = ?variant.kind,
            dimension = variant.dimension,
            users = users.len(),
            "descriptor store opened"
        );

        Ok(Self {
            path,
            variant,
            users: RwLock::new(users),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn variant(&self) -> StoreVariant {
        self.variant
    }

    /// Re-read the backing file, replacing the in-memory view.
    pub fn reload(&self) -> Result<(), StoreError> {
        let mut guard = self.write_guard()?;
        *guard = read_users(&self.path, self.variant)?;
        Ok(())
    }

    /// Consistent copy of every record, in enrollment order.
    pub fn snapshot(&self) -> Result<Vec<UserRecord>, StoreError> {
        Ok(self.read_guard()?.clone())
    }

    pub fn get(&self, username: &str) -> Result<UserRecord, StoreError> {
        self.read_guard()?
            .iter()
            .find(|r| r.username == username)
            .cloned()
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read_guard()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    pub fn status(&self) -> Result<StoreStatus, StoreError> {
        Ok(StoreStatus {
            exists: self.path.exists(),
            users: self.len()?,
            variant: self.variant,
        })
    }

    /// Store `descriptors` under `username`, replacing any previous record.
    ///
    /// Validation happens before anything is touched; if the file rewrite
    /// fails the in-memory view is left unchanged.
    pub fn put(&self, username: &str, descriptors: Vec<Descriptor>) -> Result<(), StoreError> {
        if username.trim().is_empty() {
            return Err(StoreError::EmptyUsername);
        }
        if descriptors.is_empty() {
            return Err(StoreError::NoDescriptors);
        }
        for (index, descriptor) in descriptors.iter().enumerate() {
            self.variant
                .validate(descriptor)
                .map_err(|source| StoreError::InvalidDescriptor { index, source })?;
        }

        let record = UserRecord {
            username: username.to_string(),
            descriptors,
            enrolled_at: chrono::Utc::now().to_rfc3339(),
        };
        let count = record.descriptors.len();

        let mut guard = self.write_guard()?;
        let mut next = guard.clone();
        let replaced = match next.iter_mut().find(|r| r.username == username) {
            Some(existing) => {
                *existing = record;
                true
            }
            None => {
                next.push(record);
                false
            }
        };

        write_users(&self.path, self.variant, &next)?;
        *guard = next;

        tracing::info!(
            user = username,
            descriptors = count,
            replaced,
            "user record saved"
        );
        Ok(())
    }

    /// Delete `username`'s record.
    pub fn remove(&self, username: &str) -> Result<(), StoreError> {
        let mut guard = self.write_guard()?;
        let mut next = guard.clone();
        let before = next.len();
        next.retain(|r| r.username != username);
        if next.len() == before {
            return Err(StoreError::UserNotFound(username.to_string()));
        }

        write_users(&self.path, self.variant, &next)?;
        *guard = next;

        tracing::info!(user = username, "user record removed");
        Ok(())
    }

    fn read_guard(&self) -> Result<RwLockReadGuard<'_, Vec<UserRecord>>, StoreError> {
        self.users.read().map_err(|_| StoreError::Poisoned)
    }

    fn write_guard(&self) -> Result<RwLockWriteGuard<'_, Vec<UserRecord>>, StoreError> {
        self.users.write().map_err(|_| StoreError::Poisoned)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn checksum(users: &[UserRecord]) -> Result<String, StoreError> {
    let payload = serde_json::to_vec(users)?;
    let digest = Sha256::digest(&payload);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

fn read_users(path: &Path, expected: StoreVariant) -> Result<Vec<UserRecord>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no store file yet; starting empty");
            return Ok(Vec::new());
        }
        Err(e) => return Err(io_err(path)(e)),
    };

    let file: StoreFile = serde_json::from_slice(&bytes)?;

    if file.version != STORE_VERSION {
        return Err(StoreError::UnsupportedVersion(file.version));
    }
    if file.variant != expected {
        return Err(StoreError::VariantMismatch {
            path: path.display().to_string(),
            expected,
            found: file.variant,
        });
    }
    if checksum(&file.users)? != file.checksum {
        return Err(StoreError::Corrupt);
    }

    Ok(file.users)
}

/// Write the full store to a sibling temp file, then rename it into place.
fn write_users(path: &Path, variant: StoreVariant, users: &[UserRecord]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let file = StoreFileRef {
        version: STORE_VERSION,
        variant,
        checksum: checksum(users)?,
        users,
    };
    let encoded = serde_json::to_vec_pretty(&file)?;

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut out = fs::File::create(&tmp_path).map_err(io_err(&tmp_path))?;
    out.write_all(&encoded).map_err(io_err(&tmp_path))?;
    out.sync_all().map_err(io_err(&tmp_path))?;
    drop(out);

    fs::rename(&tmp_path, path).map_err(io_err(path))?;
    sync_parent_dir(path)?;
    tracing::debug!(path = %path.display(), bytes = encoded.len(), "store written");
    Ok(())
}

/// Flush the directory entry so a completed rename survives a crash.
fn sync_parent_dir(path: &Path) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let dir = fs::File::open(parent).map_err(io_err(parent))?;
    dir.sync_all().map_err(io_err(parent))
}
