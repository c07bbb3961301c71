use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::combat_log::{
    detect_character_name, parse_lines, probe_log_directory, FileTailer, LogDirectoryStatus,
    ParserContext, RepairEvent,
};
use crate::error::MonitorError;
use crate::session::{Session, SessionAggregator, SessionStats, TargetSummary};
use crate::settings::MonitorSettings;
use crate::sink::RepairSink;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub character_name: Option<String>,
    pub log_directory: PathBuf,
    pub current_log_file: Option<PathBuf>,
    pub last_file_position: u64,
    pub is_monitoring: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub file: PathBuf,
    pub lines: usize,
    pub events: usize,
    /// `false` when the sink rejected the batch; the batch is not retried.
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No character configured.
    Idle,
    /// No log file for the character.
    NoFile,
    Processed(TickReport),
}

pub type TickResult = Result<TickOutcome, MonitorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub interval: Duration,
    pub error_backoff: Duration,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &MonitorSettings) -> Self {
        Self {
            interval: settings.poll_interval(),
            error_backoff: settings.error_backoff(),
        }
    }

    pub fn delay_after(&self, result: &TickResult) -> Duration {
        match result {
            Ok(_) => self.interval,
            Err(_) => self.error_backoff,
        }
    }
}

struct MonitorState {
    character_name: Option<String>,
    log_directory: PathBuf,
    context: ParserContext,
    tailer: FileTailer,
}

/// Ties tailing, parsing, aggregation and persistence together for one
/// character. All state sits behind locks; callers get snapshots.
pub struct LogMonitor {
    state: Mutex<MonitorState>,
    aggregator: SessionAggregator,
    sink: Arc<dyn RepairSink>,
    clock: Arc<dyn Clock>,
}

impl LogMonitor {
    pub fn new(
        settings: &MonitorSettings,
        sink: Arc<dyn RepairSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let character_name = settings.character_name().map(str::to_string);
        let context = ParserContext::new(character_name.clone().unwrap_or_default());

        Self {
            state: Mutex::new(MonitorState {
                character_name,
                log_directory: settings.log_directory.clone(),
                context,
                tailer: FileTailer::new(),
            }),
            aggregator: SessionAggregator::new(Arc::clone(&clock)),
            sink,
            clock,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Switches character. Context and tailer are reset under the same lock a
    /// tick holds, so the next tick re-resolves the file from offset 0.
    pub fn set_character_name(&self, character_name: &str) -> Result<(), MonitorError> {
        let character_name = character_name.trim();
        if character_name.is_empty() {
            return Err(MonitorError::EmptyCharacterName);
        }

        let mut state = self.lock_state();
        apply_character_name(&mut state, character_name);
        drop(state);

        tracing::info!(character = %character_name, "Character name set");
        Ok(())
    }

    /// Picks a character from recent log file names when none is configured.
    pub fn detect_character_if_unset(&self) -> Result<Option<String>, MonitorError> {
        let log_directory = {
            let state = self.lock_state();
            if let Some(character_name) = state.character_name.as_ref() {
                return Ok(Some(character_name.clone()));
            }
            state.log_directory.clone()
        };

        let detected = detect_character_name(&log_directory)
            .map_err(|error| MonitorError::io(&log_directory, error))?;

        match detected {
            Some(character_name) => Ok(Some(self.adopt_detected_character(&character_name))),
            None => {
                tracing::warn!(
                    log_directory = %log_directory.display(),
                    "Could not detect character name from log files"
                );
                Ok(None)
            }
        }
    }

    /// Applies a detected name unless one was set since detection started.
    /// Returns the name in effect.
    fn adopt_detected_character(&self, detected: &str) -> String {
        let mut state = self.lock_state();
        if let Some(character_name) = state.character_name.as_ref() {
            tracing::debug!(
                character = %character_name,
                detected = %detected,
                "Character set during detection, keeping it"
            );
            return character_name.clone();
        }

        apply_character_name(&mut state, detected);
        tracing::info!(character = %detected, "Detected character name");
        detected.to_string()
    }

    pub fn status(&self) -> MonitorStatus {
        let state = self.lock_state();
        let tailer_state = state.tailer.state();

        MonitorStatus {
            character_name: state.character_name.clone(),
            log_directory: state.log_directory.clone(),
            current_log_file: tailer_state.file.clone(),
            last_file_position: tailer_state.offset,
            is_monitoring: state.character_name.is_some(),
        }
    }

    pub fn log_directory_status(&self) -> LogDirectoryStatus {
        let log_directory = self.lock_state().log_directory.clone();
        probe_log_directory(&log_directory)
    }

    pub fn session(&self) -> Option<Session> {
        self.aggregator.snapshot()
    }

    pub fn stats(&self) -> SessionStats {
        self.aggregator.stats()
    }

    pub fn targets(&self) -> Vec<TargetSummary> {
        self.aggregator.targets()
    }

    /// Ends the active session and pushes its final state to the sink.
    pub fn close_session(&self) -> Option<Session> {
        let _state = self.lock_state();
        let closed = self.aggregator.close()?;
        if let Err(error) = self.sink.update_session(&closed) {
            tracing::error!(
                session_id = %closed.id,
                sink_error = %error,
                "Failed to persist closed session"
            );
        }
        Some(closed)
    }

    /// One poll: read new lines, parse, aggregate, forward. The state lock is
    /// held until the sink has the batch, so `close_session` and character
    /// changes never interleave with a tick.
    pub fn tick(&self) -> TickResult {
        let mut state = self.lock_state();
        let Some(character_name) = state.character_name.clone() else {
            return Ok(TickOutcome::Idle);
        };

        let log_directory = state.log_directory.clone();
        let Some(batch) = state.tailer.poll(&log_directory, &character_name)? else {
            return Ok(TickOutcome::NoFile);
        };

        let events = parse_lines(&batch.lines, &mut state.context, self.clock.as_ref());
        let persisted = if events.is_empty() {
            true
        } else {
            tracing::debug!(count = events.len(), "Found repair events in combat log");
            match self.aggregator.fold(&events) {
                Some(session) => self.forward_to_sink(&session, &events),
                None => true,
            }
        };
        drop(state);

        Ok(TickOutcome::Processed(TickReport {
            lines: batch.lines.len(),
            file: batch.file,
            events: events.len(),
            persisted,
        }))
    }

    fn forward_to_sink(&self, session: &Session, events: &[RepairEvent]) -> bool {
        let result = self
            .sink
            .get_or_create_active_session(session)
            .and_then(|session_id| self.sink.append_events(session_id, events))
            .and_then(|()| self.sink.update_session(session));

        match result {
            Ok(()) => {
                tracing::info!(
                    session_id = %session.id,
                    count = events.len(),
                    "Saved repair events"
                );
                true
            }
            Err(error) => {
                tracing::error!(
                    session_id = %session.id,
                    count = events.len(),
                    sink_error = %error,
                    "Failed to save repair events; batch dropped"
                );
                false
            }
        }
    }
}

/// Running monitor loop. Dropping the handle closes the stop channel, which
/// also ends the loop after its current tick, but without waiting for it.
pub struct MonitorHandle {
    stop_tx: mpsc::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signals the loop and waits for it to finish its current tick.
    pub async fn stop(self) {
        if let Err(error) = self.stop_tx.send(()).await {
            tracing::debug!("Monitor stop signal channel is closed: {error}");
        }

        if let Err(error) = self.join_handle.await {
            tracing::error!("Monitor loop task failed: {error}");
        }
    }
}

fn apply_character_name(state: &mut MonitorState, character_name: &str) {
    state.character_name = Some(character_name.to_string());
    state.context.reset(character_name);
    state.tailer.reset();
}

pub fn spawn_monitor(monitor: Arc<LogMonitor>, policy: BackoffPolicy) -> MonitorHandle {
    let (stop_tx, stop_rx) = mpsc::channel(1);
    let join_handle = tokio::spawn(run_monitor_loop(monitor, policy, stop_rx));

    MonitorHandle {
        stop_tx,
        join_handle,
    }
}

/// Ticks until a stop signal arrives (or every sender is dropped). The
/// signal is only observed between ticks.
pub async fn run_monitor_loop(
    monitor: Arc<LogMonitor>,
    policy: BackoffPolicy,
    mut stop_rx: mpsc::Receiver<()>,
) {
    tracing::info!(
        interval_ms = policy.interval.as_millis() as u64,
        error_backoff_ms = policy.error_backoff.as_millis() as u64,
        "Combat log monitor starting"
    );

    loop {
        let result = monitor.tick();
        match &result {
            Ok(TickOutcome::Processed(report)) if report.events > 0 => {
                tracing::debug!(
                    path = %report.file.display(),
                    lines = report.lines,
                    events = report.events,
                    persisted = report.persisted,
                    "Processed combat log update"
                );
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(
                    monitor_error = %error,
                    backoff_ms = policy.error_backoff.as_millis() as u64,
                    "Combat log monitor tick failed"
                );
            }
        }

        let delay = policy.delay_after(&result);
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::info!("Combat log monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::{spawn_monitor, BackoffPolicy, LogMonitor, TickOutcome};
    use crate::clock::{ManualClock, SystemClock};
    use crate::combat_log::RepairEvent;
    use crate::error::{MonitorError, SinkError};
    use crate::session::{Session, SessionId};
    use crate::settings::MonitorSettings;
    use crate::sink::{MemorySink, RepairSink};
    use chrono::{TimeZone, Utc};
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::Path;
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    const LOG_FILE_NAME: &str = "20240115_143000_Pilot One_Jita.txt";
    const LOG_LINES: &str = "Listener: Jita (0.9)\n\
[ 2024.01.15 14:30:25 ] (combat) Pilot One remotely repairs 1200 shield damage to Pilot Two - Large Shield Booster II - Jita\n\
[ 2024.01.15 14:30:26 ] (combat) Guardian Pilot remotely repairs 500 armor damage to you - Large Remote Armor Repairer II - Jita\n";

    struct FailingSink;

    impl RepairSink for FailingSink {
        fn get_or_create_active_session(&self, _session: &Session) -> Result<SessionId, SinkError> {
            Err(SinkError::Io(std::io::Error::other("database offline")))
        }

        fn append_events(&self, _id: SessionId, _events: &[RepairEvent]) -> Result<(), SinkError> {
            Err(SinkError::Io(std::io::Error::other("database offline")))
        }

        fn update_session(&self, _session: &Session) -> Result<(), SinkError> {
            Err(SinkError::Io(std::io::Error::other("database offline")))
        }
    }

    /// Blocks `append_events` until released, so a tick can be held mid-flight.
    struct GatedSink {
        store: MemorySink,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl RepairSink for GatedSink {
        fn get_or_create_active_session(&self, session: &Session) -> Result<SessionId, SinkError> {
            self.store.get_or_create_active_session(session)
        }

        fn append_events(&self, id: SessionId, events: &[RepairEvent]) -> Result<(), SinkError> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            self.store.append_events(id, events)
        }

        fn update_session(&self, session: &Session) -> Result<(), SinkError> {
            self.store.update_session(session)
        }
    }

    fn append(path: &Path, content: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open log for append");
        file.write_all(content.as_bytes()).expect("append to log");
    }

    fn settings_for(log_directory: &Path, character_name: Option<&str>) -> MonitorSettings {
        MonitorSettings {
            log_directory: log_directory.to_path_buf(),
            character_name: character_name.map(str::to_string),
            poll_interval_ms: 10,
            error_backoff_ms: 50,
            ..MonitorSettings::default()
        }
    }

    fn monitor_with(settings: &MonitorSettings, sink: Arc<dyn RepairSink>) -> LogMonitor {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap(),
        ));
        LogMonitor::new(settings, sink, clock)
    }

    #[test]
    fn idles_without_character() {
        let directory = tempfile::tempdir().expect("temp dir");
        let monitor = monitor_with(
            &settings_for(directory.path(), None),
            Arc::new(MemorySink::new()),
        );

        assert_eq!(monitor.tick().expect("tick"), TickOutcome::Idle);
        assert!(!monitor.status().is_monitoring);
    }

    #[test]
    fn tick_parses_aggregates_and_persists_new_lines() {
        let directory = tempfile::tempdir().expect("temp dir");
        append(&directory.path().join(LOG_FILE_NAME), LOG_LINES);
        let sink = Arc::new(MemorySink::new());
        let monitor = monitor_with(&settings_for(directory.path(), Some("Pilot One")), sink.clone());

        let TickOutcome::Processed(report) = monitor.tick().expect("tick") else {
            panic!("expected processed tick");
        };
        assert_eq!(report.lines, 3);
        assert_eq!(report.events, 2);
        assert!(report.persisted);

        let session = monitor.session().expect("active session");
        assert_eq!(session.total_outgoing_reps, 1);
        assert_eq!(session.total_incoming_reps, 1);
        assert_eq!(session.total_isk_value, 96.0 + 60.0);

        let stored_events = sink.events_for(session.id);
        assert_eq!(stored_events.len(), 2);
        assert_eq!(stored_events[0].system_security, "0.9");
        assert_eq!(
            sink.session(session.id).map(|stored| stored.total_reps()),
            Some(2)
        );

        let TickOutcome::Processed(second) = monitor.tick().expect("tick") else {
            panic!("expected processed tick");
        };
        assert_eq!(second.lines, 0);
        assert_eq!(sink.event_count(), 2);

        let status = monitor.status();
        assert_eq!(status.last_file_position, LOG_LINES.len() as u64);
        assert_eq!(
            status.current_log_file,
            Some(directory.path().join(LOG_FILE_NAME))
        );
    }

    #[test]
    fn switching_character_resets_tailer_and_context() {
        let directory = tempfile::tempdir().expect("temp dir");
        append(&directory.path().join(LOG_FILE_NAME), LOG_LINES);
        append(
            &directory.path().join("20240115_143000_Other Pilot_Jita.txt"),
            "[ 2024.01.15 14:31:00 ] (combat) Your Small Shield Booster II repairs 100 shield damage\n",
        );
        let sink = Arc::new(MemorySink::new());
        let monitor = monitor_with(&settings_for(directory.path(), Some("Pilot One")), sink.clone());
        monitor.tick().expect("tick");

        monitor.set_character_name("Other Pilot").expect("rename");
        let status = monitor.status();
        assert_eq!(status.current_log_file, None);
        assert_eq!(status.last_file_position, 0);

        monitor.tick().expect("tick");
        let session = monitor.session().expect("active session");
        let events = sink.events_for(session.id);
        let self_repair = events.last().expect("self repair stored");
        assert_eq!(self_repair.logi_pilot, "Other Pilot");
        assert_eq!(self_repair.system_name, "Unknown");
    }

    #[test]
    fn rejects_blank_character_name() {
        let directory = tempfile::tempdir().expect("temp dir");
        let monitor = monitor_with(
            &settings_for(directory.path(), Some("Pilot One")),
            Arc::new(MemorySink::new()),
        );

        assert!(matches!(
            monitor.set_character_name("  "),
            Err(MonitorError::EmptyCharacterName)
        ));
        assert_eq!(monitor.status().character_name.as_deref(), Some("Pilot One"));
    }

    #[test]
    fn unreadable_directory_is_transient_and_backs_off() {
        let directory = tempfile::tempdir().expect("temp dir");
        let not_a_directory = directory.path().join("Gamelogs");
        append(&not_a_directory, "this is a file\n");
        let settings = settings_for(&not_a_directory, Some("Pilot One"));
        let monitor = monitor_with(&settings, Arc::new(MemorySink::new()));

        let result = monitor.tick();
        let error = result.as_ref().expect_err("listing a file fails");
        assert!(error.is_transient());

        let policy = BackoffPolicy::from_settings(&settings);
        assert_eq!(policy.delay_after(&result), Duration::from_millis(50));
        assert_eq!(
            policy.delay_after(&Ok(TickOutcome::NoFile)),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn sink_failure_keeps_in_memory_totals() {
        let directory = tempfile::tempdir().expect("temp dir");
        append(&directory.path().join(LOG_FILE_NAME), LOG_LINES);
        let monitor = monitor_with(
            &settings_for(directory.path(), Some("Pilot One")),
            Arc::new(FailingSink),
        );

        let TickOutcome::Processed(report) = monitor.tick().expect("tick") else {
            panic!("expected processed tick");
        };
        assert!(!report.persisted);
        assert_eq!(monitor.session().map(|session| session.total_reps()), Some(2));
        assert_eq!(monitor.tick().expect("tick"), TickOutcome::Processed(super::TickReport {
            file: directory.path().join(LOG_FILE_NAME),
            lines: 0,
            events: 0,
            persisted: true,
        }));
    }

    #[test]
    fn detects_character_when_unset() {
        let directory = tempfile::tempdir().expect("temp dir");
        append(&directory.path().join(LOG_FILE_NAME), LOG_LINES);
        let monitor = monitor_with(
            &settings_for(directory.path(), None),
            Arc::new(MemorySink::new()),
        );

        let detected = monitor.detect_character_if_unset().expect("detection");

        assert_eq!(detected.as_deref(), Some("Pilot One"));
        assert!(monitor.status().is_monitoring);
        assert!(monitor.log_directory_status().accessible);
    }

    #[test]
    fn close_session_persists_final_state() {
        let directory = tempfile::tempdir().expect("temp dir");
        append(&directory.path().join(LOG_FILE_NAME), LOG_LINES);
        let sink = Arc::new(MemorySink::new());
        let monitor = monitor_with(&settings_for(directory.path(), Some("Pilot One")), sink.clone());
        monitor.tick().expect("tick");

        let closed = monitor.close_session().expect("closed session");

        assert!(monitor.session().is_none());
        let stored = sink.session(closed.id).expect("stored session");
        assert!(!stored.is_active);
        assert!(stored.end_time.is_some());
    }

    #[test]
    fn close_during_tick_leaves_stored_session_closed() {
        let directory = tempfile::tempdir().expect("temp dir");
        append(&directory.path().join(LOG_FILE_NAME), LOG_LINES);
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let sink = Arc::new(GatedSink {
            store: MemorySink::new(),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let monitor = Arc::new(monitor_with(
            &settings_for(directory.path(), Some("Pilot One")),
            sink.clone(),
        ));

        let ticking = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || monitor.tick())
        };
        entered_rx.recv().expect("tick reached the sink");

        let closing = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || monitor.close_session())
        };
        thread::sleep(Duration::from_millis(50));
        release_tx.send(()).expect("release tick");

        ticking.join().expect("tick thread").expect("tick");
        let closed = closing
            .join()
            .expect("close thread")
            .expect("closed session");

        assert!(monitor.session().is_none());
        let stored = sink.store.session(closed.id).expect("stored session");
        assert!(!stored.is_active);
        assert!(stored.end_time.is_some());
        assert_eq!(stored.total_reps(), 2);
    }

    #[test]
    fn detected_name_does_not_replace_one_set_meanwhile() {
        let directory = tempfile::tempdir().expect("temp dir");
        let monitor = monitor_with(
            &settings_for(directory.path(), None),
            Arc::new(MemorySink::new()),
        );
        monitor.set_character_name("Manual Pilot").expect("set name");

        let in_effect = monitor.adopt_detected_character("Pilot One");

        assert_eq!(in_effect, "Manual Pilot");
        assert_eq!(
            monitor.status().character_name.as_deref(),
            Some("Manual Pilot")
        );
    }

    #[tokio::test]
    async fn loop_processes_appends_and_stops_cleanly() {
        let directory = tempfile::tempdir().expect("temp dir");
        let log_path = directory.path().join(LOG_FILE_NAME);
        append(&log_path, "Listener: Jita (0.9)\n");
        let sink = Arc::new(MemorySink::new());
        let monitor = Arc::new(LogMonitor::new(
            &settings_for(directory.path(), Some("Pilot One")),
            sink.clone(),
            Arc::new(SystemClock),
        ));
        let settings = settings_for(directory.path(), Some("Pilot One"));
        let handle = spawn_monitor(Arc::clone(&monitor), BackoffPolicy::from_settings(&settings));

        append(&log_path, &LOG_LINES["Listener: Jita (0.9)\n".len()..]);
        let mut waited = Duration::ZERO;
        while sink.event_count() < 2 && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }

        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("loop stops promptly");

        let session = monitor.session().expect("session survives shutdown");
        assert_eq!(session.total_reps(), 2);
        assert_eq!(sink.event_count(), 2);
    }
}
