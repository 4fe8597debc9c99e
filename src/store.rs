//! Shared key/value store
//!
//! Durable state shared by every relay session and the control
//! surface: traffic counters, mode flags, the ignored-header list,
//! captured credentials, and the quota snapshot. All values are
//! string-encoded under a fixed key set, persisted as a single JSON
//! object file so any front end can read it.
//!
//! Every read/modify/write sequence on a key happens under one
//! process-wide mutex, which is the only cross-session coordination
//! point in the whole relay.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Recognized store keys. The key set and its string encoding are a
/// stable contract with external control-surface front ends.
pub mod keys {
    pub const DB_VERSION: &str = "db_version";
    pub const OPTIMIZE: &str = "optimize";
    pub const SAVELOG: &str = "savelog";
    pub const STOP: &str = "stop";
    pub const IMAP_BYTES: &str = "imap";
    pub const SMTP_BYTES: &str = "smtp";
    pub const IMAP_MSGS: &str = "imap_msgs";
    pub const SMTP_MSGS: &str = "smtp_msgs";
    pub const IGNORED_HEADERS: &str = "ignored_headers";
    pub const CREDENTIALS: &str = "credentials";
    pub const SERVERSTATS: &str = "serverstats";
}

/// Default header names excluded from optimized fetches.
pub const DEFAULT_IGNORED_HEADERS: &str =
    "AUTOCRYPT RETURN-PATH RECEIVED RECEIVED-SPF DKIM-SIGNATURE";

const DEFAULTS: &[(&str, &str)] = &[
    (keys::DB_VERSION, "1"),
    (keys::OPTIMIZE, "1"),
    (keys::SAVELOG, "0"),
    (keys::STOP, "0"),
    (keys::IMAP_BYTES, "0"),
    (keys::SMTP_BYTES, "0"),
    (keys::IMAP_MSGS, "0"),
    (keys::SMTP_MSGS, "0"),
    (keys::IGNORED_HEADERS, DEFAULT_IGNORED_HEADERS),
    (keys::CREDENTIALS, ""),
    (keys::SERVERSTATS, "0 0"),
];

/// Thread-safe key/value store shared by all sessions.
///
/// One instance spans the whole process; sessions and listeners hold
/// it behind an `Arc`.
#[derive(Debug)]
pub struct Store {
    path: Option<PathBuf>,
    values: Mutex<HashMap<String, String>>,
}

impl Store {
    /// Open (or create) the store file at `path`.
    ///
    /// Bootstraps every recognized key with its default when absent,
    /// so opening is idempotent across upgrades.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` when the file exists but cannot be read
    /// or parsed, or when the bootstrapped state cannot be written.
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut values: HashMap<String, String> = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| Error::Store(format!("read {}: {e}", path.display())))?;
            serde_json::from_str(&raw)
                .map_err(|e| Error::Store(format!("parse {}: {e}", path.display())))?
        } else {
            HashMap::new()
        };

        for (key, default) in DEFAULTS {
            values
                .entry((*key).to_string())
                .or_insert_with(|| (*default).to_string());
        }

        let store = Self {
            path: Some(path),
            values: Mutex::new(values),
        };
        {
            let values = store.values.lock().expect("store lock poisoned");
            store.persist(&values)?;
        }
        Ok(store)
    }

    /// An unpersisted store with default values, for tests and dry runs.
    #[must_use]
    pub fn in_memory() -> Self {
        let values = DEFAULTS
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self {
            path: None,
            values: Mutex::new(values),
        }
    }

    /// Read the value for `key`. Unknown keys read as empty.
    #[must_use]
    pub fn get(&self, key: &str) -> String {
        let values = self.values.lock().expect("store lock poisoned");
        values.get(key).cloned().unwrap_or_default()
    }

    /// Write `value` under `key` and persist.
    ///
    /// A persistence failure is logged and the in-memory value stands;
    /// the store never blocks the relay on disk trouble after open.
    pub fn set(&self, key: &str, value: &str) {
        let mut values = self.values.lock().expect("store lock poisoned");
        values.insert(key.to_string(), value.to_string());
        if let Err(e) = self.persist(&values) {
            warn!("store persist failed: {e}");
        }
    }

    // -- flags --

    #[must_use]
    pub fn optimize(&self) -> bool {
        self.get(keys::OPTIMIZE) == "1"
    }

    pub fn set_optimize(&self, on: bool) {
        self.set(keys::OPTIMIZE, flag(on));
    }

    #[must_use]
    pub fn savelog(&self) -> bool {
        self.get(keys::SAVELOG) == "1"
    }

    pub fn set_savelog(&self, on: bool) {
        self.set(keys::SAVELOG, flag(on));
    }

    #[must_use]
    pub fn stop(&self) -> bool {
        self.get(keys::STOP) == "1"
    }

    pub fn set_stop(&self, on: bool) {
        self.set(keys::STOP, flag(on));
    }

    // -- counters --

    /// Add `n` to the IMAP byte counter, returning the new total.
    pub fn add_imap(&self, n: u64) -> u64 {
        self.add(keys::IMAP_BYTES, n)
    }

    /// Add `n` to the SMTP byte counter, returning the new total.
    pub fn add_smtp(&self, n: u64) -> u64 {
        self.add(keys::SMTP_BYTES, n)
    }

    pub fn incr_imap_msgs(&self) {
        self.add(keys::IMAP_MSGS, 1);
    }

    pub fn incr_smtp_msgs(&self) {
        self.add(keys::SMTP_MSGS, 1);
    }

    #[must_use]
    pub fn counter(&self, key: &str) -> u64 {
        self.get(key).parse().unwrap_or(0)
    }

    /// Zero the traffic and message counters. Flags and configuration
    /// are untouched.
    pub fn reset(&self) {
        let mut values = self.values.lock().expect("store lock poisoned");
        for key in [
            keys::IMAP_BYTES,
            keys::SMTP_BYTES,
            keys::IMAP_MSGS,
            keys::SMTP_MSGS,
        ] {
            values.insert(key.to_string(), "0".to_string());
        }
        if let Err(e) = self.persist(&values) {
            warn!("store persist failed: {e}");
        }
    }

    // -- configuration --

    #[must_use]
    pub fn ignored_headers(&self) -> String {
        self.get(keys::IGNORED_HEADERS)
    }

    pub fn set_ignored_headers(&self, headers: &str) {
        self.set(keys::IGNORED_HEADERS, headers);
    }

    /// Captured login credentials, if any session has seen a LOGIN yet.
    #[must_use]
    pub fn credentials(&self) -> Option<(String, String)> {
        let raw = self.get(keys::CREDENTIALS);
        let (user, pass) = raw.split_once(' ')?;
        if user.is_empty() {
            return None;
        }
        Some((user.to_string(), pass.to_string()))
    }

    pub fn set_credentials(&self, user: &str, pass: &str) {
        self.set(keys::CREDENTIALS, &format!("{user} {pass}"));
    }

    /// Remote quota snapshot: (message count, bytes used).
    #[must_use]
    pub fn serverstats(&self) -> (u64, u64) {
        let raw = self.get(keys::SERVERSTATS);
        let mut parts = raw.split_whitespace();
        let msgs = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let bytes = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        (msgs, bytes)
    }

    pub fn set_serverstats(&self, msgs: u64, bytes: u64) {
        self.set(keys::SERVERSTATS, &format!("{msgs} {bytes}"));
    }

    // -- internals --

    /// Read-increment-write under a single lock acquisition.
    fn add(&self, key: &str, n: u64) -> u64 {
        let mut values = self.values.lock().expect("store lock poisoned");
        let current: u64 = values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let next = current + n;
        values.insert(key.to_string(), next.to_string());
        if let Err(e) = self.persist(&values) {
            warn!("store persist failed: {e}");
        }
        next
    }

    /// Write the whole map out. Called with the lock held so readers
    /// never observe a torn file.
    fn persist(&self, values: &HashMap<String, String>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = serde_json::to_string_pretty(values)
            .map_err(|e| Error::Store(format!("encode store: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw).map_err(|e| Error::Store(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, path)
            .map_err(|e| Error::Store(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }
}

const fn flag(on: bool) -> &'static str {
    if on { "1" } else { "0" }
}
