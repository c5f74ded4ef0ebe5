//! Persistence for the PlayOps control plane.
//!
//! [`JsonStore`] keeps a collection in memory and snapshots it to a JSON
//! file on every write. [`HostStore`] layers the session data model on
//! top: every state change goes through a compare-and-set on the host's
//! `(state, version)` pair, which is the linearization point for all
//! concurrent transitions on a host.

#![forbid(unsafe_code)]

use parking_lot::Mutex;
use play_proto::{Host, HostState, PlatformProfile};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record '{0}' not found")]
    NotFound(String),

    #[error("record '{0}' already exists")]
    Duplicate(String),

    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: HostState, to: HostState },

    #[error("invalid record: {0}")]
    Invalid(String),
}

// ─── JSON snapshot store ─────────────────────────────────────────────────────

/// A JSON file-backed store for one collection of records.
///
/// Data lives in memory at the layer above; this type only loads and
/// snapshots `{state_path}/state/{collection}.json`.
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(state_path: &Path, collection: &str) -> Self {
        let path = state_path.join("state").join(format!("{collection}.json"));
        Self { path }
    }

    /// Load the collection. Missing or corrupt files yield an empty map.
    pub fn load<T: DeserializeOwned>(&self) -> HashMap<String, T> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt state file, starting fresh");
                HashMap::new()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no state file, starting fresh");
                HashMap::new()
            }
        }
    }

    /// Snapshot the collection. Creates directories as needed.
    pub fn save<T: Serialize>(&self, data: &HashMap<String, T>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(data).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, content)
    }
}

// ─── Host store ──────────────────────────────────────────────────────────────

/// Outcome of a state-transition attempt.
#[derive(Debug, Clone)]
pub enum Transition {
    /// This caller won the CAS and applied the transition.
    Applied(Host),
    /// Another caller got there first; the host is already in the target
    /// state. Idempotent-ok for the loser.
    AlreadyInTarget(Host),
}

impl Transition {
    pub fn host(&self) -> &Host {
        match self {
            Self::Applied(h) | Self::AlreadyInTarget(h) => h,
        }
    }

    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Persisted host records. Records are never deleted; terminal states
/// are retained for billing.
pub struct HostStore {
    hosts: Mutex<HashMap<String, Host>>,
    store: JsonStore,
}

impl HostStore {
    pub fn open(state_path: &Path, collection: &str) -> Self {
        let store = JsonStore::new(state_path, collection);
        let hosts = store.load();
        debug!(count = hosts.len(), "loaded host records");
        Self { hosts: Mutex::new(hosts), store }
    }

    pub fn insert(&self, host: Host) -> Result<(), StoreError> {
        let mut hosts = self.hosts.lock();
        if hosts.contains_key(&host.host_id) {
            return Err(StoreError::Duplicate(host.host_id));
        }
        hosts.insert(host.host_id.clone(), host);
        self.snapshot(&hosts);
        Ok(())
    }

    pub fn get(&self, host_id: &str) -> Option<Host> {
        self.hosts.lock().get(host_id).cloned()
    }

    pub fn list(&self) -> Vec<Host> {
        self.hosts.lock().values().cloned().collect()
    }

    pub fn list_by_state(&self, states: &[HostState]) -> Vec<Host> {
        self.hosts
            .lock()
            .values()
            .filter(|h| states.contains(&h.state))
            .cloned()
            .collect()
    }

    /// Most recent non-terminal host owned by `user_id` for `platform`.
    pub fn find_active_for_user(&self, user_id: &str, platform: &str) -> Option<Host> {
        self.hosts
            .lock()
            .values()
            .filter(|h| h.user_id == user_id && h.platform == platform && !h.state.is_terminal())
            .max_by_key(|h| h.created_at)
            .cloned()
    }

    /// Update bookkeeping fields without a state change. Bumps the
    /// record version; serialized by the store lock.
    pub fn mutate<F>(&self, host_id: &str, f: F) -> Result<Host, StoreError>
    where
        F: FnOnce(&mut Host),
    {
        let mut hosts = self.hosts.lock();
        let host = hosts
            .get_mut(host_id)
            .ok_or_else(|| StoreError::NotFound(host_id.to_string()))?;
        f(host);
        host.version += 1;
        host.updated_at = chrono::Utc::now();
        let updated = host.clone();
        self.snapshot(&hosts);
        Ok(updated)
    }

    /// Compare-and-set against an explicit version, for callers that
    /// read, decide, then write.
    pub fn cas_update<F>(&self, host_id: &str, expected_version: u64, f: F) -> Result<Host, StoreError>
    where
        F: FnOnce(&mut Host),
    {
        let mut hosts = self.hosts.lock();
        let host = hosts
            .get_mut(host_id)
            .ok_or_else(|| StoreError::NotFound(host_id.to_string()))?;
        if host.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: host.version,
            });
        }
        f(host);
        host.version += 1;
        host.updated_at = chrono::Utc::now();
        let updated = host.clone();
        self.snapshot(&hosts);
        Ok(updated)
    }

    /// Attempt `state → to` under the store lock. The first caller wins;
    /// later callers racing toward the same target observe
    /// [`Transition::AlreadyInTarget`]. A transition the lifecycle graph
    /// forbids fails with [`StoreError::InvalidTransition`].
    pub fn transition<F>(&self, host_id: &str, to: HostState, f: F) -> Result<Transition, StoreError>
    where
        F: FnOnce(&mut Host),
    {
        let mut hosts = self.hosts.lock();
        let host = hosts
            .get_mut(host_id)
            .ok_or_else(|| StoreError::NotFound(host_id.to_string()))?;

        if host.state == to {
            return Ok(Transition::AlreadyInTarget(host.clone()));
        }
        if !host.state.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { from: host.state, to });
        }

        host.state = to;
        f(host);
        host.version += 1;
        host.updated_at = chrono::Utc::now();
        let updated = host.clone();
        self.snapshot(&hosts);
        Ok(Transition::Applied(updated))
    }

    fn snapshot(&self, hosts: &HashMap<String, Host>) {
        if let Err(e) = self.store.save(hosts) {
            warn!(error = %e, "failed to snapshot host store");
        }
    }
}

// ─── Profile store ───────────────────────────────────────────────────────────

/// Platform profiles, keyed by platform tag.
pub struct ProfileStore {
    profiles: Mutex<HashMap<String, PlatformProfile>>,
    store: JsonStore,
}

impl ProfileStore {
    pub fn open(state_path: &Path, collection: &str) -> Self {
        let store = JsonStore::new(state_path, collection);
        let profiles = store.load();
        debug!(count = profiles.len(), "loaded platform profiles");
        Self { profiles: Mutex::new(profiles), store }
    }

    pub fn upsert(&self, profile: PlatformProfile) -> Result<(), StoreError> {
        profile.validate().map_err(StoreError::Invalid)?;
        let mut profiles = self.profiles.lock();
        profiles.insert(profile.platform.clone(), profile);
        if let Err(e) = self.store.save(&profiles) {
            warn!(error = %e, "failed to snapshot profile store");
        }
        Ok(())
    }

    pub fn get(&self, platform: &str) -> Option<PlatformProfile> {
        self.profiles.lock().get(platform).cloned()
    }

    pub fn list(&self) -> Vec<PlatformProfile> {
        let mut all: Vec<PlatformProfile> = self.profiles.lock().values().cloned().collect();
        all.sort_by(|a, b| a.platform.cmp(&b.platform));
        all
    }
}
