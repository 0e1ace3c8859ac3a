use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use foreman_types::{
    ConversationMessage, MessageRole, PendingOperation, SessionInfo, SessionSnapshot, SessionState,
};

const CURRENT_SESSION_FILE: &str = "current_session.json";
const INDEX_FILE: &str = "sessions_index.json";

#[derive(Debug, Clone)]
pub struct SessionManagerOptions {
    pub auto_save_interval_seconds: f64,
    pub compression_threshold_bytes: usize,
    pub max_sessions: usize,
}

impl Default for SessionManagerOptions {
    fn default() -> Self {
        Self {
            auto_save_interval_seconds: 30.0,
            compression_threshold_bytes: 10 * 1024,
            max_sessions: 50,
        }
    }
}

/// Session persistence and crash recovery. Owns the live snapshot; a
/// background loop flushes it while dirty. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    dir: PathBuf,
    options: SessionManagerOptions,
    current: Arc<RwLock<Option<SessionSnapshot>>>,
    dirty: Arc<AtomicBool>,
    auto_save_cancel: Arc<Mutex<Option<CancellationToken>>>,
}

impl SessionManager {
    pub fn new(dir: impl AsRef<Path>, options: SessionManagerOptions) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            options,
            current: Arc::new(RwLock::new(None)),
            dirty: Arc::new(AtomicBool::new(false)),
            auto_save_cancel: Arc::new(Mutex::new(None)),
        })
    }

    fn generate_session_id() -> String {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix = &Uuid::new_v4().simple().to_string()[..6];
        format!("session_{stamp}_{suffix}")
    }

    /// SHA-256 (16 hex chars) over the canonical JSON form minus the
    /// checksum field itself.
    pub fn compute_checksum(snapshot: &SessionSnapshot) -> String {
        let mut value = serde_json::to_value(snapshot).unwrap_or(Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.remove("checksum");
        }
        let canonical = value.to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        let hex = digest
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>();
        hex[..16].to_string()
    }

    fn session_paths(&self, session_id: &str) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{session_id}.json")),
            self.dir.join(format!("{session_id}.json.gz")),
        )
    }

    // --- lifecycle ---

    pub async fn start_session(
        &self,
        working_directory: &str,
        context: BTreeMap<String, Value>,
    ) -> anyhow::Result<SessionSnapshot> {
        let mut snapshot = SessionSnapshot::new(Self::generate_session_id(), working_directory);
        snapshot.context = context;

        *self.current.write().await = Some(snapshot.clone());
        self.dirty.store(true, Ordering::SeqCst);
        self.save().await?;
        self.start_auto_save().await;

        tracing::info!(session_id = %snapshot.session_id, "started new session");
        Ok(snapshot)
    }

    /// Open the named session if it exists on disk, otherwise start a fresh
    /// one under that id.
    pub async fn open_or_start(
        &self,
        session_id: &str,
        working_directory: &str,
    ) -> anyhow::Result<SessionSnapshot> {
        if let Some(snapshot) = self.load_snapshot(session_id).await {
            let mut snapshot = snapshot;
            snapshot.state = SessionState::Active;
            snapshot.updated_at = Utc::now();
            *self.current.write().await = Some(snapshot.clone());
            self.dirty.store(true, Ordering::SeqCst);
            self.start_auto_save().await;
            return Ok(snapshot);
        }

        let mut snapshot = SessionSnapshot::new(session_id, working_directory);
        snapshot.state = SessionState::Active;
        *self.current.write().await = Some(snapshot.clone());
        self.dirty.store(true, Ordering::SeqCst);
        self.save().await?;
        self.start_auto_save().await;
        Ok(snapshot)
    }

    pub async fn resume_session(&self, session_id: &str) -> Option<SessionSnapshot> {
        let mut snapshot = self.load_snapshot(session_id).await?;
        snapshot.state = SessionState::Recovered;
        snapshot.updated_at = Utc::now();

        *self.current.write().await = Some(snapshot.clone());
        self.dirty.store(true, Ordering::SeqCst);
        self.start_auto_save().await;

        tracing::info!(session_id, "resumed session");
        Some(snapshot)
    }

    pub async fn resume_latest(&self) -> Option<SessionSnapshot> {
        let sessions = self.list_sessions(1).await;
        let latest = sessions.first()?;
        self.resume_session(&latest.session_id.clone()).await
    }

    /// Look for the current-session marker left behind by an unclean
    /// shutdown. An `active` snapshot behind the marker is flagged crashed.
    pub async fn check_for_crash_recovery(&self) -> Option<SessionSnapshot> {
        let marker = self.dir.join(CURRENT_SESSION_FILE);
        let raw = std::fs::read_to_string(&marker).ok()?;
        let data: Value = serde_json::from_str(&raw).ok()?;
        let session_id = data.get("session_id")?.as_str()?;

        let mut snapshot = self.load_snapshot(session_id).await?;
        if snapshot.state == SessionState::Active {
            snapshot.state = SessionState::Crashed;
            tracing::warn!(session_id, "found crashed session");
            return Some(snapshot);
        }
        None
    }

    pub async fn end_session(&self) -> anyhow::Result<()> {
        {
            let mut current = self.current.write().await;
            if let Some(snapshot) = current.as_mut() {
                snapshot.state = SessionState::Completed;
                snapshot.updated_at = Utc::now();
            } else {
                return Ok(());
            }
        }
        self.dirty.store(true, Ordering::SeqCst);
        self.save().await?;

        let marker = self.dir.join(CURRENT_SESSION_FILE);
        if marker.exists() {
            let _ = std::fs::remove_file(marker);
        }

        self.stop_auto_save().await;
        *self.current.write().await = None;
        Ok(())
    }

    pub async fn current_session(&self) -> Option<SessionSnapshot> {
        self.current.read().await.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    // --- mutation ---

    pub async fn add_message(
        &self,
        role: MessageRole,
        content: &str,
        metadata: BTreeMap<String, Value>,
    ) -> anyhow::Result<()> {
        let mut current = self.current.write().await;
        let snapshot = current
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no active session"))?;
        let mut message = ConversationMessage::new(role, content);
        message.metadata = metadata;
        snapshot.messages.push(message);
        snapshot.updated_at = Utc::now();
        drop(current);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn update_context(&self, key: &str, value: Value) -> anyhow::Result<()> {
        let mut current = self.current.write().await;
        let snapshot = current
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no active session"))?;
        snapshot.context.insert(key.to_string(), value);
        snapshot.updated_at = Utc::now();
        drop(current);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn add_pending_operation(&self, operation: PendingOperation) {
        let mut current = self.current.write().await;
        if let Some(snapshot) = current.as_mut() {
            snapshot.pending_operations.push(operation);
            snapshot.updated_at = Utc::now();
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    pub async fn remove_pending_operation(&self, operation_id: &str) {
        let mut current = self.current.write().await;
        if let Some(snapshot) = current.as_mut() {
            snapshot
                .pending_operations
                .retain(|op| op.id != operation_id);
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    pub async fn clear_pending_operations(&self) -> Vec<PendingOperation> {
        let mut current = self.current.write().await;
        let Some(snapshot) = current.as_mut() else {
            return Vec::new();
        };
        let operations = std::mem::take(&mut snapshot.pending_operations);
        self.dirty.store(true, Ordering::SeqCst);
        operations
    }

    // --- persistence ---

    pub async fn save(&self) -> anyhow::Result<bool> {
        let snapshot = {
            let mut current = self.current.write().await;
            let Some(snapshot) = current.as_mut() else {
                return Ok(false);
            };
            snapshot.updated_at = Utc::now();
            snapshot.checksum = Self::compute_checksum(snapshot);
            snapshot.clone()
        };

        self.write_snapshot(&snapshot)?;

        let marker = json!({
            "session_id": snapshot.session_id,
            "updated_at": snapshot.updated_at,
        });
        std::fs::write(
            self.dir.join(CURRENT_SESSION_FILE),
            serde_json::to_string(&marker)?,
        )?;

        self.update_index(&snapshot)?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(true)
    }

    fn write_snapshot(&self, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(snapshot)?;
        let (plain, compressed) = self.session_paths(&snapshot.session_id);

        if content.len() > self.options.compression_threshold_bytes {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(content.as_bytes())?;
            std::fs::write(&compressed, encoder.finish()?)?;
            if plain.exists() {
                let _ = std::fs::remove_file(plain);
            }
        } else {
            std::fs::write(&plain, content)?;
            if compressed.exists() {
                let _ = std::fs::remove_file(compressed);
            }
        }
        Ok(())
    }

    /// Load a snapshot, verifying its checksum. A mismatch is recorded in
    /// the snapshot metadata but the snapshot is still returned.
    pub async fn load_snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let (plain, compressed) = self.session_paths(session_id);

        let content = if compressed.exists() {
            let bytes = std::fs::read(&compressed).ok()?;
            let mut decoder = flate2::read::GzDecoder::new(bytes.as_slice());
            let mut out = String::new();
            decoder.read_to_string(&mut out).ok()?;
            out
        } else if plain.exists() {
            std::fs::read_to_string(&plain).ok()?
        } else {
            return None;
        };

        let mut snapshot: SessionSnapshot = match serde_json::from_str(&content) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::error!(session_id, error = %err, "failed to parse session snapshot");
                return None;
            }
        };

        let expected = snapshot.checksum.clone();
        let actual = Self::compute_checksum(&snapshot);
        if !expected.is_empty() && expected != actual {
            tracing::warn!(session_id, "session checksum mismatch");
            snapshot
                .metadata
                .insert("checksum_mismatch".to_string(), json!(true));
        }

        Some(snapshot)
    }

    fn update_index(&self, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        let index_path = self.dir.join(INDEX_FILE);
        let mut index: BTreeMap<String, Value> = index_path
            .exists()
            .then(|| std::fs::read_to_string(&index_path).ok())
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        index.insert(
            snapshot.session_id.clone(),
            json!({
                "state": snapshot.state.as_str(),
                "created_at": snapshot.created_at,
                "updated_at": snapshot.updated_at,
                "message_count": snapshot.messages.len(),
                "working_directory": snapshot.working_directory,
                "summary": summarize(snapshot),
            }),
        );

        // Retention: prune the oldest sessions beyond the cap.
        if index.len() > self.options.max_sessions {
            let mut entries: Vec<(String, Value)> = index.into_iter().collect();
            entries.sort_by(|a, b| {
                let a_time = a.1.get("updated_at").and_then(Value::as_str).unwrap_or("");
                let b_time = b.1.get("updated_at").and_then(Value::as_str).unwrap_or("");
                b_time.cmp(a_time)
            });
            let evicted = entries.split_off(self.options.max_sessions);
            for (session_id, _) in &evicted {
                let (plain, compressed) = self.session_paths(session_id);
                let _ = std::fs::remove_file(plain);
                let _ = std::fs::remove_file(compressed);
            }
            index = entries.into_iter().collect();
        }

        std::fs::write(&index_path, serde_json::to_string_pretty(&index)?)?;
        Ok(())
    }

    pub async fn list_sessions(&self, limit: usize) -> Vec<SessionInfo> {
        let index_path = self.dir.join(INDEX_FILE);
        let Ok(raw) = std::fs::read_to_string(&index_path) else {
            return Vec::new();
        };
        let Ok(index) = serde_json::from_str::<BTreeMap<String, Value>>(&raw) else {
            return Vec::new();
        };

        let mut sessions: Vec<SessionInfo> = index
            .into_iter()
            .filter_map(|(session_id, data)| {
                Some(SessionInfo {
                    session_id,
                    state: serde_json::from_value(data.get("state")?.clone()).ok()?,
                    created_at: serde_json::from_value(data.get("created_at")?.clone()).ok()?,
                    updated_at: serde_json::from_value(data.get("updated_at")?.clone()).ok()?,
                    message_count: data.get("message_count")?.as_u64()? as usize,
                    working_directory: data.get("working_directory")?.as_str()?.to_string(),
                    summary: data.get("summary")?.as_str()?.to_string(),
                })
            })
            .collect();

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions.truncate(limit);
        sessions
    }

    /// Search summaries first, then fall back to a full-message scan,
    /// short-circuiting at `limit`.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<SessionInfo> {
        let needle = query.to_lowercase();
        let mut results = Vec::new();

        for info in self.list_sessions(100).await {
            if results.len() >= limit {
                break;
            }
            if info.summary.to_lowercase().contains(&needle) {
                results.push(info);
                continue;
            }
            if let Some(snapshot) = self.load_snapshot(&info.session_id).await {
                if snapshot
                    .messages
                    .iter()
                    .any(|m| m.content.to_lowercase().contains(&needle))
                {
                    results.push(info);
                }
            }
        }
        results
    }

    // --- auto-save ---

    pub async fn start_auto_save(&self) {
        let mut guard = self.auto_save_cancel.lock().await;
        if guard.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *guard = Some(cancel.clone());

        let manager = self.clone();
        let interval = Duration::from_secs_f64(self.options.auto_save_interval_seconds.max(0.1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if manager.is_dirty() {
                            if let Err(err) = manager.save().await {
                                tracing::error!(error = %err, "auto-save failed");
                            }
                        }
                    }
                }
            }
        });
    }

    pub async fn stop_auto_save(&self) {
        if let Some(cancel) = self.auto_save_cancel.lock().await.take() {
            cancel.cancel();
        }
    }
}

fn summarize(snapshot: &SessionSnapshot) -> String {
    if snapshot.messages.is_empty() {
        return "Empty session".to_string();
    }
    for message in &snapshot.messages {
        if message.role == MessageRole::User {
            let content = message.content.trim();
            if content.len() > 100 {
                return format!("{}...", &content[..97]);
            }
            return content.to_string();
        }
    }
    format!("{} messages", snapshot.messages.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_in(dir: &Path) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(dir, SessionManagerOptions::default()).expect("manager"))
    }

    #[tokio::test]
    async fn snapshots_round_trip_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_in(dir.path());

        let session = manager
            .start_session("/work", BTreeMap::new())
            .await
            .expect("start");
        manager
            .add_message(MessageRole::User, "hello", BTreeMap::new())
            .await
            .expect("message");
        manager
            .add_pending_operation(PendingOperation::new("task", json!({"description": "x"})))
            .await;
        manager.save().await.expect("save");

        let loaded = manager
            .load_snapshot(&session.session_id)
            .await
            .expect("load");
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.pending_operations.len(), 1);
        assert!(!loaded.metadata.contains_key("checksum_mismatch"));
    }

    #[tokio::test]
    async fn checksum_covers_everything_but_itself() {
        let mut snapshot = SessionSnapshot::new("ses_1", "/work");
        let first = SessionManager::compute_checksum(&snapshot);
        snapshot.checksum = first.clone();
        // Re-computing with the checksum field set must not change the digest.
        assert_eq!(SessionManager::compute_checksum(&snapshot), first);

        snapshot
            .messages
            .push(ConversationMessage::new(MessageRole::User, "edit"));
        assert_ne!(SessionManager::compute_checksum(&snapshot), first);
    }

    #[tokio::test]
    async fn corrupted_snapshots_load_with_mismatch_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_in(dir.path());
        let session = manager
            .start_session("/work", BTreeMap::new())
            .await
            .expect("start");
        manager.save().await.expect("save");

        // Tamper with the stored file without fixing the checksum.
        let path = dir.path().join(format!("{}.json", session.session_id));
        let mut snapshot: SessionSnapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("parse");
        snapshot.working_directory = "/elsewhere".to_string();
        std::fs::write(&path, serde_json::to_string_pretty(&snapshot).expect("json"))
            .expect("write");

        let loaded = manager
            .load_snapshot(&session.session_id)
            .await
            .expect("load");
        assert_eq!(loaded.metadata.get("checksum_mismatch"), Some(&json!(true)));
        assert_eq!(loaded.working_directory, "/elsewhere");
    }

    #[tokio::test]
    async fn large_snapshots_are_stored_compressed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = Arc::new(
            SessionManager::new(
                dir.path(),
                SessionManagerOptions {
                    compression_threshold_bytes: 256,
                    ..SessionManagerOptions::default()
                },
            )
            .expect("manager"),
        );

        let session = manager
            .start_session("/work", BTreeMap::new())
            .await
            .expect("start");
        manager
            .add_message(MessageRole::User, &"x".repeat(4096), BTreeMap::new())
            .await
            .expect("message");
        manager.save().await.expect("save");

        let (plain, compressed) = (
            dir.path().join(format!("{}.json", session.session_id)),
            dir.path().join(format!("{}.json.gz", session.session_id)),
        );
        assert!(compressed.exists());
        assert!(!plain.exists());

        let loaded = manager
            .load_snapshot(&session.session_id)
            .await
            .expect("load");
        assert_eq!(loaded.messages[0].content.len(), 4096);
    }

    #[tokio::test]
    async fn crash_marker_flags_active_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_in(dir.path());
        let session = manager
            .start_session("/work", BTreeMap::new())
            .await
            .expect("start");
        manager
            .add_message(MessageRole::User, "first", BTreeMap::new())
            .await
            .expect("message");
        manager
            .add_message(MessageRole::Assistant, "second", BTreeMap::new())
            .await
            .expect("message");
        manager
            .add_pending_operation(PendingOperation::new("task", json!({"description": "redo"})))
            .await;
        manager.save().await.expect("save");

        // Simulate a crash: a fresh manager over the same directory, with
        // the current-session marker still present.
        let recovered_manager = manager_in(dir.path());
        let crashed = recovered_manager
            .check_for_crash_recovery()
            .await
            .expect("crashed session");
        assert_eq!(crashed.state, SessionState::Crashed);
        assert_eq!(crashed.session_id, session.session_id);

        let resumed = recovered_manager
            .resume_session(&session.session_id)
            .await
            .expect("resume");
        assert_eq!(resumed.state, SessionState::Recovered);
        assert_eq!(resumed.messages.len(), 2);
        assert_eq!(resumed.pending_operations.len(), 1);
    }

    #[tokio::test]
    async fn clean_shutdown_leaves_no_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_in(dir.path());
        manager
            .start_session("/work", BTreeMap::new())
            .await
            .expect("start");
        manager.end_session().await.expect("end");

        assert!(!dir.path().join(CURRENT_SESSION_FILE).exists());
        let fresh = manager_in(dir.path());
        assert!(fresh.check_for_crash_recovery().await.is_none());
    }

    #[tokio::test]
    async fn retention_prunes_oldest_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = Arc::new(
            SessionManager::new(
                dir.path(),
                SessionManagerOptions {
                    max_sessions: 2,
                    ..SessionManagerOptions::default()
                },
            )
            .expect("manager"),
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            let session = manager
                .start_session("/work", BTreeMap::new())
                .await
                .expect("start");
            ids.push(session.session_id.clone());
            manager.end_session().await.expect("end");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let listed = manager.list_sessions(10).await;
        assert_eq!(listed.len(), 2);
        assert!(manager.load_snapshot(&ids[0]).await.is_none());
        assert!(manager.load_snapshot(&ids[2]).await.is_some());
    }

    #[tokio::test]
    async fn search_scans_summaries_then_messages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_in(dir.path());

        manager
            .start_session("/work", BTreeMap::new())
            .await
            .expect("start");
        manager
            .add_message(MessageRole::User, "investigate the flaky nightly build", BTreeMap::new())
            .await
            .expect("message");
        manager.end_session().await.expect("end");

        manager
            .start_session("/work", BTreeMap::new())
            .await
            .expect("start");
        manager
            .add_message(MessageRole::User, "draft the release notes", BTreeMap::new())
            .await
            .expect("message");
        manager
            .add_message(MessageRole::Assistant, "mentioning the scheduler fix", BTreeMap::new())
            .await
            .expect("message");
        manager.end_session().await.expect("end");

        let by_summary = manager.search("flaky", 10).await;
        assert_eq!(by_summary.len(), 1);

        // Only present in a non-summary message, so the full scan finds it.
        let by_message = manager.search("scheduler", 10).await;
        assert_eq!(by_message.len(), 1);

        assert!(manager.search("nowhere-to-be-found", 10).await.is_empty());
    }

    #[tokio::test]
    async fn auto_save_flushes_dirty_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = Arc::new(
            SessionManager::new(
                dir.path(),
                SessionManagerOptions {
                    auto_save_interval_seconds: 0.05,
                    ..SessionManagerOptions::default()
                },
            )
            .expect("manager"),
        );

        let session = manager
            .start_session("/work", BTreeMap::new())
            .await
            .expect("start");
        manager
            .add_message(MessageRole::User, "autosaved?", BTreeMap::new())
            .await
            .expect("message");
        assert!(manager.is_dirty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!manager.is_dirty());

        let loaded = manager
            .load_snapshot(&session.session_id)
            .await
            .expect("load");
        assert_eq!(loaded.messages.len(), 1);
        manager.stop_auto_save().await;
    }
}
