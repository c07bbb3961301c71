use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::combat_log::RepairEvent;
use crate::error::SinkError;
use crate::session::{Session, SessionId};

const EVENTS_FILE_NAME: &str = "events.jsonl";
const SESSIONS_DIRECTORY_NAME: &str = "sessions";

/// Where parsed batches and session aggregates are persisted.
pub trait RepairSink: Send + Sync {
    /// Ensures a record exists for `session` and returns its id.
    fn get_or_create_active_session(&self, session: &Session) -> Result<SessionId, SinkError>;

    fn append_events(&self, session_id: SessionId, events: &[RepairEvent])
        -> Result<(), SinkError>;

    fn update_session(&self, session: &Session) -> Result<(), SinkError>;
}

#[derive(Debug, Default)]
struct MemoryStore {
    sessions: BTreeMap<SessionId, Session>,
    events: Vec<(SessionId, RepairEvent)>,
}

/// Keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    store: Mutex<MemoryStore>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_store(&self) -> MutexGuard<'_, MemoryStore> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session(&self, session_id: SessionId) -> Option<Session> {
        self.lock_store().sessions.get(&session_id).cloned()
    }

    pub fn events_for(&self, session_id: SessionId) -> Vec<RepairEvent> {
        self.lock_store()
            .events
            .iter()
            .filter(|(id, _)| *id == session_id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.lock_store().events.len()
    }
}

impl RepairSink for MemorySink {
    fn get_or_create_active_session(&self, session: &Session) -> Result<SessionId, SinkError> {
        let mut store = self.lock_store();
        store
            .sessions
            .entry(session.id)
            .or_insert_with(|| session.clone());
        Ok(session.id)
    }

    fn append_events(
        &self,
        session_id: SessionId,
        events: &[RepairEvent],
    ) -> Result<(), SinkError> {
        let mut store = self.lock_store();
        if !store.sessions.contains_key(&session_id) {
            return Err(SinkError::UnknownSession(session_id));
        }

        store
            .events
            .extend(events.iter().cloned().map(|event| (session_id, event)));
        Ok(())
    }

    fn update_session(&self, session: &Session) -> Result<(), SinkError> {
        let mut store = self.lock_store();
        let Some(stored) = store.sessions.get_mut(&session.id) else {
            return Err(SinkError::UnknownSession(session.id));
        };

        *stored = session.clone();
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventRecord<'a> {
    session_id: SessionId,
    #[serde(flatten)]
    event: &'a RepairEvent,
}

/// Appends events to `events.jsonl` and keeps one `sessions/<id>.json` per
/// session under a root directory.
#[derive(Debug)]
pub struct JsonFileSink {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let root = root.into();
        std::fs::create_dir_all(root.join(SESSIONS_DIRECTORY_NAME))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join(EVENTS_FILE_NAME)
    }

    pub fn session_path(&self, session_id: SessionId) -> PathBuf {
        self.root
            .join(SESSIONS_DIRECTORY_NAME)
            .join(format!("{session_id}.json"))
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RepairSink for JsonFileSink {
    fn get_or_create_active_session(&self, session: &Session) -> Result<SessionId, SinkError> {
        let _guard = self.lock_writes();
        let session_path = self.session_path(session.id);
        if !session_path.exists() {
            write_json_atomically(&session_path, session)?;
        }
        Ok(session.id)
    }

    fn append_events(
        &self,
        session_id: SessionId,
        events: &[RepairEvent],
    ) -> Result<(), SinkError> {
        let _guard = self.lock_writes();
        if !self.session_path(session_id).exists() {
            return Err(SinkError::UnknownSession(session_id));
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path())?;
        let mut writer = BufWriter::new(file);
        for event in events {
            serde_json::to_writer(&mut writer, &EventRecord { session_id, event })?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    fn update_session(&self, session: &Session) -> Result<(), SinkError> {
        let _guard = self.lock_writes();
        let session_path = self.session_path(session.id);
        if !session_path.exists() {
            return Err(SinkError::UnknownSession(session.id));
        }

        write_json_atomically(&session_path, session)
    }
}

fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> Result<(), SinkError> {
    let temp_path = temporary_path(path);
    let serialized = serde_json::to_string_pretty(value)?;
    std::fs::write(&temp_path, serialized)?;

    if let Err(error) = std::fs::rename(&temp_path, path) {
        if let Err(cleanup_error) = std::fs::remove_file(&temp_path) {
            tracing::warn!(
                path = %temp_path.display(),
                error = %cleanup_error,
                "Failed to remove temporary session file"
            );
        }
        return Err(error.into());
    }

    Ok(())
}

fn temporary_path(path: &Path) -> PathBuf {
    let Some(file_name) = path.file_name().and_then(|value| value.to_str()) else {
        return path.with_extension("json.tmp");
    };

    path.with_file_name(format!("{file_name}.tmp"))
}
