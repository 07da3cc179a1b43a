//! Session State Store.
//!
//! In-memory map of [`SessionState`] keyed by logical session id, written
//! back to a single JSON file. Mutations only set a dirty flag; a background
//! task coalesces them into at most one write per `flush_interval`. Every
//! write goes to a temp file that is then renamed over the durable file, and
//! the shutdown path calls the very same [`SessionStore::flush`].

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tether_core::ids::SessionId;

use crate::error::StoreError;
use crate::session::{PersistedSession, SessionState};

const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub ttl: Duration,
    pub flush_interval: Duration,
    pub sweep_interval: Duration,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ttl: DEFAULT_TTL,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

pub struct SessionStore {
    config: StoreConfig,
    sessions: RwLock<HashMap<SessionId, SessionState>>,
    dirty: AtomicBool,
    /// Held from snapshot to rename; every flush shares one temp path.
    flush_lock: Mutex<()>,
    background: Mutex<Option<CancellationToken>>,
}

impl SessionStore {
    /// Empty store; nothing is read from disk.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            background: Mutex::new(None),
        }
    }

    /// Open the store, loading unexpired sessions from `config.path`.
    ///
    /// A missing file is a first run. An unreadable JSON document is moved
    /// aside to `<path>.corrupt` and the store starts empty.
    #[instrument(skip(config), fields(path = %config.path.display()))]
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let store = Self::new(config);
        let loaded = store.load(Utc::now())?;
        info!(sessions = loaded, "session store opened");
        Ok(store)
    }

    fn load(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let raw = match fs::read_to_string(&self.config.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let persisted: HashMap<SessionId, PersistedSession> = match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(e) => {
                let aside = self.config.path.with_extension("corrupt");
                warn!(error = %e, aside = %aside.display(), "session file unreadable, starting empty");
                if let Err(e) = fs::rename(&self.config.path, &aside) {
                    warn!(error = %e, "failed to move corrupt session file aside");
                }
                return Ok(0);
            }
        };

        let mut sessions = self.sessions.write();
        let mut skipped = 0usize;
        for (id, entry) in persisted {
            let state = SessionState::from(entry);
            if state.is_expired(now, self.config.ttl) {
                skipped += 1;
                continue;
            }
            sessions.insert(id, state);
        }
        if skipped > 0 {
            debug!(skipped, "skipped expired sessions on load");
        }
        Ok(sessions.len())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The stored state, or a fresh default that is *not* inserted.
    pub fn get(&self, id: &SessionId, default_model: &str) -> SessionState {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .unwrap_or_else(|| SessionState::new(default_model))
    }

    /// The stored state, if any.
    pub fn peek(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.read().get(id).cloned()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Upsert, stamping `last_activity`.
    pub fn save(&self, id: SessionId, mut state: SessionState) {
        state.last_activity = Utc::now();
        self.sessions.write().insert(id, state);
        self.mark_dirty();
    }

    /// Read-modify-write under one lock, so concurrent updates to the same
    /// session are not lost.
    pub fn update<F>(&self, id: &SessionId, default_model: &str, f: F) -> SessionState
    where
        F: FnOnce(&mut SessionState),
    {
        let mut sessions = self.sessions.write();
        let state = sessions
            .entry(id.clone())
            .or_insert_with(|| SessionState::new(default_model));
        f(state);
        state.last_activity = Utc::now();
        let snapshot = state.clone();
        drop(sessions);
        self.mark_dirty();
        snapshot
    }

    /// Move an entry to a new key (placeholder id → agent-assigned id).
    /// An existing entry under `to` wins; the placeholder entry is dropped.
    pub fn rename(&self, from: &SessionId, to: &SessionId) {
        if from == to {
            return;
        }
        let mut sessions = self.sessions.write();
        if let Some(state) = sessions.remove(from) {
            sessions.entry(to.clone()).or_insert(state);
            drop(sessions);
            self.mark_dirty();
        }
    }

    pub fn delete(&self, id: &SessionId) -> bool {
        let removed = self.sessions.write().remove(id).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Remove sessions idle longer than the TTL.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.config.ttl;
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, state| !state.is_expired(now, ttl));
        let removed = before - sessions.len();
        drop(sessions);
        if removed > 0 {
            self.mark_dirty();
        }
        removed
    }

    /// Write every session's persisted subset if anything changed.
    ///
    /// Returns whether a write happened. On failure the dirty flag is set
    /// again so the next cycle retries.
    pub fn flush(&self) -> Result<bool, StoreError> {
        let _guard = self.flush_lock.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let snapshot: HashMap<SessionId, PersistedSession> = self
            .sessions
            .read()
            .iter()
            .map(|(id, state)| (id.clone(), PersistedSession::from(state)))
            .collect();

        let result = serde_json::to_vec_pretty(&snapshot)
            .map_err(StoreError::from)
            .and_then(|bytes| write_atomic(&self.config.path, &bytes));

        match result {
            Ok(()) => {
                debug!(sessions = snapshot.len(), "session store flushed");
                Ok(true)
            }
            Err(e) => {
                self.mark_dirty();
                Err(e)
            }
        }
    }

    /// Start the debounced write-back and the TTL sweep. Calling it again
    /// replaces the previous tasks.
    pub fn spawn_background(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.background.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut flush_tick = tokio::time::interval(store.config.flush_interval);
            let mut sweep_tick = tokio::time::interval(store.config.sweep_interval);
            flush_tick.tick().await;
            sweep_tick.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = flush_tick.tick() => {
                        if let Err(e) = store.flush() {
                            warn!(error = %e, "session store flush failed, will retry");
                        }
                    }
                    _ = sweep_tick.tick() => {
                        let removed = store.cleanup_expired();
                        if removed > 0 {
                            info!(removed, "expired sessions evicted");
                        }
                    }
                }
            }
        })
    }

    /// Stop background tasks and flush synchronously.
    pub fn shutdown(&self) -> Result<bool, StoreError> {
        if let Some(cancel) = self.background.lock().take() {
            cancel.cancel();
        }
        self.flush()
    }
}

/// Write `bytes` to a sibling temp file, fsync it, then rename it over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_in(dir: &tempfile::TempDir) -> StoreConfig {
        StoreConfig::new(dir.path().join("sessions.json"))
    }

    fn sid(s: &str) -> SessionId {
        SessionId::from_raw(s)
    }

    #[test]
    fn get_unknown_returns_uninserted_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(config_in(&dir));
        let state = store.get(&sid("a"), "claude-sonnet-4-5");
        assert_eq!(state.model, "claude-sonnet-4-5");
        assert!(!store.contains(&sid("a")));
        assert!(!store.is_dirty());
    }

    #[test]
    fn save_stamps_activity_and_marks_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(config_in(&dir));
        let mut state = SessionState::new("m");
        state.last_activity = Utc::now() - chrono::Duration::days(30);
        store.save(sid("a"), state);

        let saved = store.peek(&sid("a")).unwrap();
        assert!(Utc::now() - saved.last_activity < chrono::Duration::seconds(5));
        assert!(store.is_dirty());
    }

    #[test]
    fn flush_is_skipped_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(config_in(&dir));
        assert!(!store.flush().unwrap());
        assert!(!dir.path().join("sessions.json").exists());
    }

    #[test]
    fn flush_writes_persisted_subset_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(config_in(&dir));
        let mut state = SessionState::new("m");
        state.supported_models = vec![json!({"value": "opus"})];
        state.last_init = Some(json!({"type": "system", "subtype": "init"}));
        state.total_cost_usd = 0.42;
        state.message_count = 7;
        state.checkpoints = vec!["u0".into(), "u1".into()];
        store.save(sid("sess-1"), state);

        assert!(store.flush().unwrap());
        assert!(!store.is_dirty());
        assert!(!dir.path().join("sessions.tmp").exists());

        let raw = fs::read_to_string(dir.path().join("sessions.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let entry = &doc["sess-1"];
        assert!(entry.get("supportedModels").is_none());
        assert!(entry.get("lastInit").is_none());
        assert_eq!(entry["totalCostUsd"], 0.42);
        assert_eq!(entry["messageCount"], 7);
        assert_eq!(entry["checkpoints"], json!(["u0", "u1"]));
    }

    #[test]
    fn reopen_restores_durable_fields_only() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::new(config_in(&dir));
            let mut state = SessionState::new("m");
            state.supported_models = vec![json!("opus")];
            state.last_init = Some(json!({}));
            state.total_cost_usd = 2.0;
            state.message_count = 4;
            state.checkpoints = vec!["c".into()];
            store.save(sid("s"), state);
            store.flush().unwrap();
        }

        let store = SessionStore::open(config_in(&dir)).unwrap();
        let state = store.peek(&sid("s")).unwrap();
        assert_eq!(state.total_cost_usd, 2.0);
        assert_eq!(state.message_count, 4);
        assert_eq!(state.checkpoints, vec!["c"]);
        assert!(state.supported_models.is_empty());
        assert!(state.last_init.is_none());
    }

    #[test]
    fn open_without_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(config_in(&dir)).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn open_skips_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let old = (Utc::now() - chrono::Duration::days(30)).to_rfc3339();
        let fresh = Utc::now().to_rfc3339();
        let doc = json!({
            "stale": {"model": "m", "lastActivity": old, "checkpoints": []},
            "fresh": {"model": "m", "lastActivity": fresh, "checkpoints": []}
        });
        fs::write(dir.path().join("sessions.json"), doc.to_string()).unwrap();

        let store = SessionStore::open(config_in(&dir)).unwrap();
        assert!(store.contains(&sid("fresh")));
        assert!(!store.contains(&sid("stale")));
    }

    #[test]
    fn open_moves_corrupt_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sessions.json"), "{not json").unwrap();
        let store = SessionStore::open(config_in(&dir)).unwrap();
        assert!(store.is_empty());
        assert!(dir.path().join("sessions.corrupt").exists());
    }

    #[test]
    fn cleanup_removes_idle_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.ttl = Duration::from_secs(3600);
        let store = SessionStore::new(config);
        store.save(sid("a"), SessionState::new("m"));
        store.save(sid("b"), SessionState::new("m"));

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(store.cleanup_expired_at(later), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn update_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(config_in(&dir));
        store.update(&sid("pending-1"), "m", |s| s.add_cost(0.5));
        store.rename(&sid("pending-1"), &sid("agent-abc"));

        assert!(!store.contains(&sid("pending-1")));
        let state = store.peek(&sid("agent-abc")).unwrap();
        assert!((state.total_cost_usd - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn delete_marks_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(config_in(&dir));
        store.save(sid("a"), SessionState::new("m"));
        store.flush().unwrap();
        assert!(store.delete(&sid("a")));
        assert!(store.is_dirty());
        assert!(!store.delete(&sid("a")));
    }

    #[test]
    fn failed_flush_keeps_dirty_flag() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("sessions.json");
        fs::create_dir_all(path.join("blocker")).unwrap();
        let store = SessionStore::new(StoreConfig::new(&path));
        store.save(sid("a"), SessionState::new("m"));

        assert!(store.flush().is_err());
        assert!(store.is_dirty());
    }

    #[test]
    fn concurrent_flushes_never_expose_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionStore::new(StoreConfig::new(&path));

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let store = &store;
                let path = &path;
                scope.spawn(move || {
                    let id = sid(&format!("w{worker}"));
                    for i in 0..200 {
                        store.update(&id, "m", |s| s.message_count = i);
                        store.flush().unwrap();
                        let raw = fs::read_to_string(path).unwrap();
                        let parsed: HashMap<String, serde_json::Value> =
                            serde_json::from_str(&raw).unwrap();
                        assert!(parsed.contains_key(id.as_str()));
                    }
                });
            }
        });

        assert!(!store.is_dirty());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_coalesces_saves() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(config_in(&dir)));
        let handle = store.spawn_background();

        for i in 0..10 {
            store.update(&sid("a"), "m", |s| s.message_count = i);
        }
        assert!(store.is_dirty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!store.is_dirty());
        assert!(dir.path().join("sessions.json").exists());

        store.shutdown().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.is_finished());
    }

    #[test]
    fn shutdown_flushes_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(config_in(&dir));
        store.save(sid("a"), SessionState::new("m"));
        assert!(store.shutdown().unwrap());
        let raw = fs::read_to_string(dir.path().join("sessions.json")).unwrap();
        assert!(raw.contains("\"a\""));
    }
}
