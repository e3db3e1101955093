//! File-based claim store.
//!
//! Each lock is one file at `{root}/{job}-{key}.lock` holding a small JSON
//! record with its creation time. Queue claims are permanent: a lockfile is
//! the durable "this host has handled this digest" marker and survives
//! restarts. Task pacing markers reuse the same files but are overwritten on
//! every run.

use std::io::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    created: String,
    #[serde(default)]
    info: serde_json::Value,
}

/// Claim registry rooted at a lock directory.
#[derive(Debug, Clone)]
pub struct LockStore {
    root: PathBuf,
}

impl LockStore {
    /// Creates a store rooted at `root`. The directory is created lazily on
    /// the first claim.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The conventional lock directory, `~/.kash_stash_locks`.
    pub fn default_root() -> anyhow::Result<PathBuf> {
        let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
        let home = PathBuf::from(home);
        if home.as_os_str().is_empty() {
            anyhow::bail!("HOME is set but empty");
        }
        Ok(home.join(".kash_stash_locks"))
    }

    fn lock_path(&self, job_name: &str, key: &str) -> PathBuf {
        self.root.join(format!("{job_name}-{key}.lock"))
    }

    /// Whether a lock exists for `(job_name, key)`.
    pub fn exists(&self, job_name: &str, key: &str) -> bool {
        self.lock_path(job_name, key).is_file()
    }

    /// Atomically claims `(job_name, key)`.
    ///
    /// Uses exclusive create: exactly one caller can ever observe `true` for
    /// a given key while the file exists. Returns `false` when the lock is
    /// already held.
    pub fn claim(&self, job_name: &str, key: &str) -> anyhow::Result<bool> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.lock_path(job_name, key);
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        file.write_all(Self::record_json().as_bytes())?;
        Ok(true)
    }

    /// Replaces (or creates) the lock for `(job_name, key)` with a fresh
    /// timestamp. Task pacing markers use this; queue claims never do.
    pub fn overwrite(&self, job_name: &str, key: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(self.lock_path(job_name, key), Self::record_json())?;
        Ok(())
    }

    /// Deletes the lock, best-effort. Missing files are not an error.
    pub fn release(&self, job_name: &str, key: &str) {
        let _ = std::fs::remove_file(self.lock_path(job_name, key));
    }

    /// Seconds since the lock was created, or infinity when the file is
    /// missing, unreadable, or its record does not parse.
    pub fn read_age_secs(&self, job_name: &str, key: &str) -> f64 {
        let raw = match std::fs::read_to_string(self.lock_path(job_name, key)) {
            Ok(raw) => raw,
            Err(_) => return f64::INFINITY,
        };
        let record: LockRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(_) => return f64::INFINITY,
        };
        match DateTime::parse_from_rfc3339(&record.created) {
            Ok(created) => (Utc::now() - created.with_timezone(&Utc))
                .num_milliseconds()
                .max(0) as f64
                / 1_000.0,
            Err(_) => f64::INFINITY,
        }
    }

    fn record_json() -> String {
        let record = LockRecord {
            created: Utc::now().to_rfc3339(),
            info: serde_json::json!({}),
        };
        serde_json::to_string(&record).unwrap_or_else(|_| String::from("{}"))
    }
}
