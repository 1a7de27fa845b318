use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentMessage;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Passed,
    Failed,
    Error,
}

/// Durable record of one agent invocation. Created when the agent is
/// spawned, updated once when it finishes; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub feature_id: u64,
    /// Track name, or the synthetic tracks `verification` and `fix`.
    pub track: String,
    pub branch: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_context: Option<String>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub messages: Vec<AgentMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_used: Option<String>,
}

impl SessionRecord {
    pub fn start(feature_id: u64, track: &str, branch: &str, prompt: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            feature_id,
            track: track.into(),
            branch: branch.into(),
            status: SessionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            prompt: prompt.into(),
            extra_context: None,
            output: String::new(),
            messages: Vec::new(),
            error: None,
            agent_used: None,
        }
    }
}

/// Fields settable after creation. `None` leaves the stored value alone.
#[derive(Debug, Default, Clone)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub output: Option<String>,
    pub messages: Option<Vec<AgentMessage>>,
    pub error: Option<String>,
    pub agent_used: Option<String>,
}

impl SessionUpdate {
    /// The common completion update: final status, finish time, duration.
    pub fn finished(status: SessionStatus, started_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            status: Some(status),
            finished_at: Some(now),
            duration_ms: Some((now - started_at).num_milliseconds().max(0) as u64),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionFilter {
    pub feature_id: Option<u64>,
    pub track: Option<String>,
    pub status: Option<SessionStatus>,
}

impl SessionFilter {
    fn matches(&self, record: &SessionRecord) -> bool {
        self.feature_id.is_none_or(|id| record.feature_id == id)
            && self.track.as_ref().is_none_or(|t| &record.track == t)
            && self.status.is_none_or(|s| record.status == s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to read session log: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse session log: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("session not found: {0}")]
    NotFound(String),
}

/// Append-on-create, update-in-place session history. Tracks call in
/// concurrently; a single in-process writer lock serializes file access.
pub struct SessionLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SessionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn create_session(&self, record: SessionRecord) -> Result<(), SessionError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut sessions = self.read_all()?;
        sessions.push(record);
        self.write_all(&sessions)
    }

    pub fn update_session(&self, id: &str, update: SessionUpdate) -> Result<(), SessionError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut sessions = self.read_all()?;
        let record = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| SessionError::NotFound(id.into()))?;

        if let Some(status) = update.status {
            record.status = status;
        }
        if update.finished_at.is_some() {
            record.finished_at = update.finished_at;
        }
        if update.duration_ms.is_some() {
            record.duration_ms = update.duration_ms;
        }
        if let Some(output) = update.output {
            record.output = output;
        }
        if let Some(messages) = update.messages {
            record.messages = messages;
        }
        if update.error.is_some() {
            record.error = update.error;
        }
        if update.agent_used.is_some() {
            record.agent_used = update.agent_used;
        }
        self.write_all(&sessions)
    }

    /// Append a message to a running session's log without touching the
    /// rest of the record.
    pub fn append_message(&self, id: &str, message: AgentMessage) -> Result<(), SessionError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut sessions = self.read_all()?;
        let record = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| SessionError::NotFound(id.into()))?;
        record.messages.push(message);
        self.write_all(&sessions)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self.read_all()?.into_iter().find(|s| s.id == id))
    }

    pub fn get_latest_session_for_feature(
        &self,
        feature_id: u64,
    ) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|s| s.feature_id == feature_id)
            .max_by_key(|s| s.started_at))
    }

    /// Newest-first listing with offset/limit pagination.
    pub fn get_sessions(
        &self,
        filter: &SessionFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SessionRecord>, SessionError> {
        let mut sessions: Vec<SessionRecord> = self
            .read_all()?
            .into_iter()
            .filter(|s| filter.matches(s))
            .collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.started_at));
        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    pub fn get_session_count(&self, filter: &SessionFilter) -> Result<usize, SessionError> {
        Ok(self.read_all()?.iter().filter(|s| filter.matches(s)).count())
    }

    fn read_all(&self) -> Result<Vec<SessionRecord>, SessionError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if !content.trim().is_empty() => Ok(serde_json::from_str(&content)?),
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, sessions: &[SessionRecord]) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(sessions)?;
        std::fs::write(&self.path, content + "\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentMessage;

    fn log_in(dir: &Path) -> SessionLog {
        SessionLog::new(dir.join(".autodev").join("sessions.json"))
    }

    #[test]
    fn create_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        let record = SessionRecord::start(1, "main", "feature/1-x", "implement it");
        let id = record.id.clone();
        log.create_session(record).unwrap();

        let loaded = log.get_session(&id).unwrap().unwrap();
        assert_eq!(loaded.feature_id, 1);
        assert_eq!(loaded.status, SessionStatus::Running);
        assert!(loaded.finished_at.is_none());
    }

    #[test]
    fn update_transitions_once_to_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        let record = SessionRecord::start(1, "main", "feature/1-x", "p");
        let id = record.id.clone();
        let started = record.started_at;
        log.create_session(record).unwrap();

        let mut update = SessionUpdate::finished(SessionStatus::Passed, started);
        update.output = Some("ok".into());
        update.agent_used = Some("codex".into());
        log.update_session(&id, update).unwrap();

        let loaded = log.get_session(&id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Passed);
        assert!(loaded.finished_at.is_some());
        assert!(loaded.duration_ms.is_some());
        assert_eq!(loaded.output, "ok");
        assert_eq!(loaded.agent_used.as_deref(), Some("codex"));
    }

    #[test]
    fn update_unknown_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        let result = log.update_session("nope", SessionUpdate::default());
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }

    #[test]
    fn latest_session_for_feature() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());

        let mut first = SessionRecord::start(7, "main", "feature/7-a", "p");
        first.started_at = Utc::now() - chrono::Duration::seconds(60);
        let first_id = first.id.clone();
        log.create_session(first).unwrap();

        let second = SessionRecord::start(7, "verification", "feature/7-a", "p");
        let second_id = second.id.clone();
        log.create_session(second).unwrap();

        let latest = log.get_latest_session_for_feature(7).unwrap().unwrap();
        assert_eq!(latest.id, second_id);
        assert_ne!(latest.id, first_id);
    }

    #[test]
    fn filters_and_pagination() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());

        for i in 0..5u64 {
            let mut record = SessionRecord::start(i, "alpha", "b", "p");
            record.started_at = Utc::now() - chrono::Duration::seconds(100 - i as i64);
            log.create_session(record).unwrap();
        }
        let mut other = SessionRecord::start(9, "beta", "b", "p");
        other.status = SessionStatus::Failed;
        log.create_session(other).unwrap();

        let filter = SessionFilter {
            track: Some("alpha".into()),
            ..SessionFilter::default()
        };
        assert_eq!(log.get_session_count(&filter).unwrap(), 5);

        let page = log.get_sessions(&filter, 1, 2).unwrap();
        assert_eq!(page.len(), 2);
        // Newest first: feature ids 4,3,2,1,0 — offset 1 gives 3,2
        assert_eq!(page[0].feature_id, 3);
        assert_eq!(page[1].feature_id, 2);

        let failed = SessionFilter {
            status: Some(SessionStatus::Failed),
            ..SessionFilter::default()
        };
        assert_eq!(log.get_session_count(&failed).unwrap(), 1);
    }

    #[test]
    fn append_message_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        let record = SessionRecord::start(1, "main", "b", "p");
        let id = record.id.clone();
        log.create_session(record).unwrap();

        log.append_message(&id, AgentMessage::system_note("first")).unwrap();
        log.append_message(&id, AgentMessage::system_note("second")).unwrap();

        let loaded = log.get_session(&id).unwrap().unwrap();
        let contents: Vec<&str> = loaded
            .messages
            .iter()
            .filter_map(|m| m.content.as_deref())
            .collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        assert_eq!(
            log.get_session_count(&SessionFilter::default()).unwrap(),
            0
        );
    }

    #[test]
    fn concurrent_creates_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let log = std::sync::Arc::new(log_in(dir.path()));
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let log = log.clone();
            handles.push(std::thread::spawn(move || {
                log.create_session(SessionRecord::start(i, "main", "b", "p"))
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            log.get_session_count(&SessionFilter::default()).unwrap(),
            8
        );
    }
}
