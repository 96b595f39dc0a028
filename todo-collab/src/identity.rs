//! Client-local key/value storage and the persistent user id.
//!
//! The store is a single JSON object on disk. The user id lives under
//! [`USER_KEY`] and is generated once, then reused by every later run.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Local storage key holding the user id.
pub const USER_KEY: &str = ".todomvc-user";

const USER_PREFIX: &str = "anon";

/// Local storage failure.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed local storage: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON-file backed key/value store.
#[derive(Debug)]
pub struct LocalStorage {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl LocalStorage {
    /// Load `path`, or start empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IdentityError> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(IdentityError::Io { path, source }),
        };
        Ok(Self { path, entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Set and write through to disk.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), IdentityError> {
        self.entries.insert(key.into(), value.into());
        self.save()
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<String>, IdentityError> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write to a sibling temp file, then rename over the original.
    fn save(&self) -> Result<(), IdentityError> {
        let io_err = |source| IdentityError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_vec_pretty(&self.entries)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

/// `prefix` followed by a uniformly random base-36 number below 10000,
/// drawn from the thread-local RNG.
pub fn generate_id(prefix: &str) -> String {
    let n: u32 = rand::random_range(0..10_000);
    format!("{prefix}{}", to_base36(n))
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// The stored user id, generating and saving one on first use.
pub fn user_id(storage: &mut LocalStorage) -> Result<String, IdentityError> {
    if let Some(id) = storage.get(USER_KEY) {
        return Ok(id.to_string());
    }
    let id = generate_id(USER_PREFIX);
    storage.set(USER_KEY, id.clone())?;
    log::info!("created user id {id}");
    Ok(id)
}
