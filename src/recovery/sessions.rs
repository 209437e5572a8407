/// Resumable upload sessions
///
/// A session records which chunks of a file have been transferred, not which
/// backend received them, so an interrupted upload can continue on any
/// backend. Sessions live in memory and are optionally mirrored to SQLite so
/// they survive a restart.
use crate::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Default chunk size (1 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default age after which idle sessions are swept (24h)
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Default sweep interval (1h)
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(StorageError::SessionStore(format!(
                "unknown session status '{}'",
                other
            ))),
        }
    }
}

/// Progress record for one chunked upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub session_id: String,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub chunk_size_bytes: u64,
    pub total_chunks: u64,
    pub completed_chunks: BTreeSet<u64>,
    pub uploaded_bytes: u64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
    pub last_error: Option<String>,
}

impl UploadSession {
    fn new(file_name: &str, file_size_bytes: u64, chunk_size_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            session_id: generate_session_id(now),
            file_name: file_name.to_string(),
            file_size_bytes,
            chunk_size_bytes,
            total_chunks: file_size_bytes.div_ceil(chunk_size_bytes),
            completed_chunks: BTreeSet::new(),
            uploaded_bytes: 0,
            status: SessionStatus::Active,
            created_at: now,
            last_activity_at: now,
            metadata: HashMap::new(),
            last_error: None,
        }
    }

    /// An empty file has no chunks to record; only an explicit completion
    /// finishes it.
    pub fn is_complete(&self) -> bool {
        self.status == SessionStatus::Completed
            || (self.total_chunks > 0 && self.completed_chunks.len() as u64 >= self.total_chunks)
    }

    /// Lowest chunk index not yet transferred
    pub fn next_chunk(&self) -> Option<u64> {
        (0..self.total_chunks).find(|index| !self.completed_chunks.contains(index))
    }

    pub fn progress_percent(&self) -> f64 {
        if self.file_size_bytes == 0 {
            return if self.is_complete() { 100.0 } else { 0.0 };
        }
        (self.uploaded_bytes as f64 / self.file_size_bytes as f64) * 100.0
    }

    /// Where a resumed transfer should continue from
    pub fn resume_point(&self) -> ResumePoint {
        let next_chunk = self.next_chunk();
        let offset_bytes = match next_chunk {
            Some(index) => (index * self.chunk_size_bytes).min(self.file_size_bytes),
            None => self.file_size_bytes,
        };
        ResumePoint {
            session_id: self.session_id.clone(),
            next_chunk,
            offset_bytes,
            completed_chunks: self.completed_chunks.clone(),
        }
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

/// Handed to a resume operation so it can skip finished chunks
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub session_id: String,
    pub next_chunk: Option<u64>,
    pub offset_bytes: u64,
    pub completed_chunks: BTreeSet<u64>,
}

/// Result of `resume_upload`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeOutcome {
    pub success: bool,
    pub session_id: String,
    /// Byte offset reached; equals the file size on success
    pub resume_point: u64,
    /// False when the session was already complete and nothing ran
    pub resumed: bool,
}

/// `upload_{base36 millis}_{6 random chars}`
pub fn generate_session_id(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!(
        "upload_{}_{}",
        to_base36(now.timestamp_millis().max(0) as u64),
        suffix
    )
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push((value % 36) as usize);
        value /= 36;
    }
    digits
        .iter()
        .rev()
        .map(|&d| ID_ALPHABET[(d + 26) % 36] as char)
        .collect()
}

/// SQLite mirror of the in-memory session map
pub struct SessionDatabase {
    conn: Connection,
    db_path: PathBuf,
}

impl SessionDatabase {
    /// Open (or create) the session database; `:memory:` is accepted
    pub fn open(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if db_path.to_str() != Some(":memory:") {
            if let Some(parent) = db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS upload_sessions (
                session_id TEXT PRIMARY KEY NOT NULL,
                file_name TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                chunk_size INTEGER NOT NULL,
                total_chunks INTEGER NOT NULL,
                completed_chunks TEXT NOT NULL,
                uploaded_bytes INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                metadata TEXT NOT NULL,
                last_error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_activity
                ON upload_sessions(last_activity_at);
            "#,
        )?;

        Ok(Self { conn, db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Insert or update one session
    pub fn save(&mut self, session: &UploadSession) -> StorageResult<()> {
        let completed = serde_json::to_string(&session.completed_chunks)?;
        let metadata = serde_json::to_string(&session.metadata)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO upload_sessions (
                session_id, file_name, file_size, chunk_size, total_chunks,
                completed_chunks, uploaded_bytes, status,
                created_at, last_activity_at, metadata, last_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(session_id)
            DO UPDATE SET
                completed_chunks = excluded.completed_chunks,
                uploaded_bytes = excluded.uploaded_bytes,
                status = excluded.status,
                last_activity_at = excluded.last_activity_at,
                metadata = excluded.metadata,
                last_error = excluded.last_error
            "#,
            params![
                session.session_id,
                session.file_name,
                session.file_size_bytes as i64,
                session.chunk_size_bytes as i64,
                session.total_chunks as i64,
                completed,
                session.uploaded_bytes as i64,
                session.status.as_str(),
                session.created_at.to_rfc3339(),
                session.last_activity_at.to_rfc3339(),
                metadata,
                session.last_error,
            ],
        )?;
        tx.commit()?;

        Ok(())
    }

    pub fn delete(&self, session_id: &str) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM upload_sessions WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    /// Load every stored session. Rows that fail to decode are skipped with a
    /// warning rather than restored with guessed values.
    pub fn load_all(&self) -> StorageResult<Vec<UploadSession>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT session_id, file_name, file_size, chunk_size, total_chunks,
                   completed_chunks, uploaded_bytes, status,
                   created_at, last_activity_at, metadata, last_error
            FROM upload_sessions
            ORDER BY created_at ASC
            "#,
        )?;

        let rows = stmt.query_map([], |row| -> rusqlite::Result<SessionRow> {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
                row.get::<_, Option<String>>(11)?,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let row = row?;
            let session_id = row.0.clone();
            match decode_row(row) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Skipping corrupt persisted upload session"
                    );
                }
            }
        }

        Ok(sessions)
    }
}

type SessionRow = (
    String,
    String,
    i64,
    i64,
    i64,
    String,
    i64,
    String,
    String,
    String,
    String,
    Option<String>,
);

fn decode_row(row: SessionRow) -> StorageResult<UploadSession> {
    let (
        session_id,
        file_name,
        file_size,
        chunk_size,
        total_chunks,
        completed,
        uploaded_bytes,
        status,
        created_at,
        last_activity_at,
        metadata,
        last_error,
    ) = row;

    let completed_chunks: BTreeSet<u64> = serde_json::from_str(&completed)
        .map_err(|e| StorageError::SessionStore(format!("completed chunks: {}", e)))?;
    if completed_chunks.iter().any(|&index| index >= total_chunks as u64) {
        return Err(StorageError::SessionStore(format!(
            "completed chunk out of range for {} chunks",
            total_chunks
        )));
    }

    Ok(UploadSession {
        session_id,
        file_name,
        file_size_bytes: file_size as u64,
        chunk_size_bytes: chunk_size as u64,
        total_chunks: total_chunks as u64,
        completed_chunks,
        uploaded_bytes: uploaded_bytes as u64,
        status: status.parse()?,
        created_at: parse_timestamp(&created_at)?,
        last_activity_at: parse_timestamp(&last_activity_at)?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| StorageError::SessionStore(format!("metadata: {}", e)))?,
        last_error,
    })
}

fn parse_timestamp(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::SessionStore(format!("timestamp '{}': {}", s, e)))
}

struct TrackerInner {
    sessions: Mutex<HashMap<String, UploadSession>>,
    database: Option<Mutex<SessionDatabase>>,
    max_age: Duration,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

/// Owns every upload session; callers refer to sessions by id only
#[derive(Clone)]
pub struct UploadSessionTracker {
    inner: Arc<TrackerInner>,
}

impl Default for UploadSessionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGE)
    }
}

impl UploadSessionTracker {
    /// In-memory tracker
    pub fn new(max_age: Duration) -> Self {
        Self::build(None, max_age)
    }

    /// Tracker mirrored to a SQLite database
    pub fn with_database(database: SessionDatabase, max_age: Duration) -> Self {
        Self::build(Some(database), max_age)
    }

    fn build(database: Option<SessionDatabase>, max_age: Duration) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                sessions: Mutex::new(HashMap::new()),
                database: database.map(Mutex::new),
                max_age,
                cleanup_task: Mutex::new(None),
            }),
        }
    }

    pub fn max_age(&self) -> Duration {
        self.inner.max_age
    }

    /// Reload persisted sessions that have not expired; returns how many
    pub fn restore(&self) -> StorageResult<usize> {
        let Some(database) = &self.inner.database else {
            return Ok(0);
        };

        let stored = database.lock().unwrap().load_all()?;
        let cutoff = self.cutoff();
        let mut restored = 0;
        let mut expired = Vec::new();

        {
            let mut sessions = self.inner.sessions.lock().unwrap();
            for session in stored {
                if session.last_activity_at < cutoff {
                    expired.push(session.session_id);
                } else {
                    sessions.insert(session.session_id.clone(), session);
                    restored += 1;
                }
            }
        }

        for session_id in &expired {
            self.forget(session_id);
        }

        tracing::info!(
            restored,
            expired = expired.len(),
            "Restored upload sessions"
        );
        Ok(restored)
    }

    /// Start tracking a new upload
    pub fn create_session(
        &self,
        file_name: &str,
        file_size_bytes: u64,
        chunk_size_bytes: Option<u64>,
    ) -> StorageResult<UploadSession> {
        let chunk_size = chunk_size_bytes.unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(StorageError::Validation(
                "chunk size must be greater than zero".to_string(),
            ));
        }

        let session = UploadSession::new(file_name, file_size_bytes, chunk_size);
        tracing::debug!(
            session_id = %session.session_id,
            file_name,
            total_chunks = session.total_chunks,
            "Created upload session"
        );

        self.inner
            .sessions
            .lock()
            .unwrap()
            .insert(session.session_id.clone(), session.clone());
        self.persist(&session);

        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<UploadSession> {
        self.inner.sessions.lock().unwrap().get(session_id).cloned()
    }

    pub fn list_sessions(&self) -> Vec<UploadSession> {
        let mut sessions: Vec<_> = self
            .inner
            .sessions
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Record a finished chunk. Re-recording a chunk changes nothing but the
    /// activity timestamp.
    pub fn update_progress(
        &self,
        session_id: &str,
        chunk_index: u64,
        chunk_bytes: u64,
    ) -> StorageResult<UploadSession> {
        let snapshot = self.mutate(session_id, |session| {
            if chunk_index >= session.total_chunks {
                return Err(StorageError::Validation(format!(
                    "chunk {} out of range for session with {} chunks",
                    chunk_index, session.total_chunks
                )));
            }

            if session.completed_chunks.insert(chunk_index) {
                session.uploaded_bytes = session
                    .uploaded_bytes
                    .saturating_add(chunk_bytes)
                    .min(session.file_size_bytes);
            }

            if session.completed_chunks.len() as u64 == session.total_chunks {
                session.status = SessionStatus::Completed;
                session.uploaded_bytes = session.file_size_bytes;
            }
            Ok(())
        })?;

        if snapshot.status == SessionStatus::Completed {
            tracing::debug!(session_id, "Upload session completed");
        }
        Ok(snapshot)
    }

    /// Lowest chunk index still to transfer, `None` when everything is done
    pub fn get_next_chunk(&self, session_id: &str) -> StorageResult<Option<u64>> {
        self.get_session(session_id)
            .map(|session| session.next_chunk())
            .ok_or_else(|| StorageError::SessionNotFound(session_id.to_string()))
    }

    pub fn progress_percent(&self, session_id: &str) -> StorageResult<f64> {
        self.get_session(session_id)
            .map(|session| session.progress_percent())
            .ok_or_else(|| StorageError::SessionNotFound(session_id.to_string()))
    }

    pub fn pause_session(&self, session_id: &str) -> StorageResult<UploadSession> {
        self.mutate(session_id, |session| {
            if session.status == SessionStatus::Active {
                session.status = SessionStatus::Paused;
            }
            Ok(())
        })
    }

    pub fn mark_failed(&self, session_id: &str, error: &str) -> StorageResult<UploadSession> {
        self.mutate(session_id, |session| {
            if session.status != SessionStatus::Completed {
                session.status = SessionStatus::Failed;
            }
            session.last_error = Some(error.to_string());
            Ok(())
        })
    }

    pub fn complete_session(&self, session_id: &str) -> StorageResult<UploadSession> {
        self.mutate(session_id, |session| {
            session.status = SessionStatus::Completed;
            session.completed_chunks = (0..session.total_chunks).collect();
            session.uploaded_bytes = session.file_size_bytes;
            session.last_error = None;
            Ok(())
        })
    }

    pub fn remove_session(&self, session_id: &str) -> bool {
        let removed = self
            .inner
            .sessions
            .lock()
            .unwrap()
            .remove(session_id)
            .is_some();
        if removed {
            self.forget(session_id);
        }
        removed
    }

    /// Continue an interrupted upload
    ///
    /// A completed session returns immediately without running `operation`.
    /// Otherwise the session is reactivated, `operation` receives the resume
    /// point, and on success the session is marked complete. On failure the
    /// session is marked failed and the error is returned.
    pub async fn resume_upload<F, Fut>(
        &self,
        session_id: &str,
        operation: F,
    ) -> StorageResult<ResumeOutcome>
    where
        F: FnOnce(ResumePoint) -> Fut,
        Fut: Future<Output = StorageResult<()>>,
    {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| StorageError::SessionNotFound(session_id.to_string()))?;

        if session.is_complete() {
            tracing::debug!(session_id, "Session already complete, nothing to resume");
            return Ok(ResumeOutcome {
                success: true,
                session_id: session.session_id,
                resume_point: session.file_size_bytes,
                resumed: false,
            });
        }

        let session = self.mutate(session_id, |session| {
            session.status = SessionStatus::Active;
            Ok(())
        })?;
        let resume_point = session.resume_point();
        tracing::info!(
            session_id,
            offset_bytes = resume_point.offset_bytes,
            next_chunk = ?resume_point.next_chunk,
            "Resuming upload"
        );

        match operation(resume_point).await {
            Ok(()) => {
                let session = self.complete_session(session_id)?;
                Ok(ResumeOutcome {
                    success: true,
                    session_id: session.session_id,
                    resume_point: session.file_size_bytes,
                    resumed: true,
                })
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Resumed upload failed");
                // The session may have been swept while the operation ran
                let _ = self.mark_failed(session_id, &e.to_string());
                Err(e)
            }
        }
    }

    /// Drop sessions idle for longer than the max age; returns how many
    pub fn cleanup_expired(&self) -> usize {
        let cutoff = self.cutoff();
        let expired: Vec<String> = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            let expired: Vec<String> = sessions
                .values()
                .filter(|s| s.last_activity_at < cutoff)
                .map(|s| s.session_id.clone())
                .collect();
            for id in &expired {
                sessions.remove(id);
            }
            expired
        };

        for id in &expired {
            self.forget(id);
        }

        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "Swept expired upload sessions");
        }
        expired.len()
    }

    /// Run `cleanup_expired` periodically in the background
    pub fn start_cleanup(&self, interval: Duration) {
        let mut task = self.inner.cleanup_task.lock().unwrap();
        if task.is_some() {
            return;
        }

        let tracker = self.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let sweep = tracker.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || sweep.cleanup_expired()).await {
                    tracing::warn!(error = %e, "Session sweep task failed");
                }
            }
        }));
    }

    pub fn is_cleanup_running(&self) -> bool {
        self.inner.cleanup_task.lock().unwrap().is_some()
    }

    /// Stop the background sweep. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.cleanup_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn cutoff(&self) -> DateTime<Utc> {
        let max_age = chrono::Duration::from_std(self.inner.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        Utc::now() - max_age
    }

    fn mutate(
        &self,
        session_id: &str,
        change: impl FnOnce(&mut UploadSession) -> StorageResult<()>,
    ) -> StorageResult<UploadSession> {
        let snapshot = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| StorageError::SessionNotFound(session_id.to_string()))?;
            change(session)?;
            session.touch();
            session.clone()
        };
        self.persist(&snapshot);
        Ok(snapshot)
    }

    fn persist(&self, session: &UploadSession) {
        if let Some(database) = &self.inner.database {
            if let Err(e) = database.lock().unwrap().save(session) {
                tracing::warn!(
                    session_id = %session.session_id,
                    error = %e,
                    "Failed to persist upload session"
                );
            }
        }
    }

    fn forget(&self, session_id: &str) {
        if let Some(database) = &self.inner.database {
            if let Err(e) = database.lock().unwrap().delete(session_id) {
                tracing::warn!(session_id, error = %e, "Failed to delete persisted session");
            }
        }
    }
}
