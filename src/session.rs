use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::clock::Clock;
use crate::combat_log::{Direction, RepairEvent, RepairKind};

pub type SessionId = Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetTally {
    pub total_amount: u64,
    pub repair_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub total_outgoing_reps: u64,
    pub total_incoming_reps: u64,
    pub total_shield_reps: u64,
    pub total_armor_reps: u64,
    pub total_isk_value: f64,
    pub average_reps_per_second: f64,
    pub peak_reps_per_second: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub targets: BTreeMap<String, TargetTally>,
}

impl Session {
    fn start(start_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_time,
            end_time: None,
            is_active: true,
            total_outgoing_reps: 0,
            total_incoming_reps: 0,
            total_shield_reps: 0,
            total_armor_reps: 0,
            total_isk_value: 0.0,
            average_reps_per_second: 0.0,
            peak_reps_per_second: 0.0,
            targets: BTreeMap::new(),
        }
    }

    pub fn total_reps(&self) -> u64 {
        self.total_outgoing_reps + self.total_incoming_reps
    }
}

/// Live numbers for a status display.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub current_reps: u64,
    pub reps_per_second: f64,
    pub shield_reps: u64,
    pub armor_reps: u64,
    pub total_isk_value: f64,
    pub session_active: bool,
    pub session_duration_minutes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSummary {
    pub name: String,
    pub total_amount: u64,
    pub repair_count: u64,
}

#[derive(Debug, Default)]
struct PeakSecond {
    second: Option<NaiveDateTime>,
    count: u64,
}

impl PeakSecond {
    fn record(&mut self, timestamp: NaiveDateTime) -> u64 {
        if self.second == Some(timestamp) {
            self.count += 1;
        } else {
            self.second = Some(timestamp);
            self.count = 1;
        }
        self.count
    }
}

#[derive(Debug)]
struct ActiveSession {
    session: Session,
    value_hundredths: u64,
    peak_second: PeakSecond,
}

impl ActiveSession {
    fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            session: Session::start(start_time),
            value_hundredths: 0,
            peak_second: PeakSecond::default(),
        }
    }

    fn fold_event(&mut self, event: &RepairEvent) {
        let session = &mut self.session;

        match event.direction {
            Direction::Outgoing => {
                session.total_outgoing_reps += 1;
                let tally = session.targets.entry(event.target_name.clone()).or_default();
                tally.total_amount += u64::from(event.amount);
                tally.repair_count += 1;
            }
            Direction::Incoming => session.total_incoming_reps += 1,
            Direction::SelfRepair => {}
        }

        match event.repair_type {
            RepairKind::Shield => session.total_shield_reps += 1,
            RepairKind::Armor => session.total_armor_reps += 1,
        }

        self.value_hundredths += event.value_hundredths();
        session.total_isk_value = self.value_hundredths as f64 / 100.0;

        if event.direction != Direction::SelfRepair {
            let in_second = self.peak_second.record(event.timestamp) as f64;
            if in_second > session.peak_reps_per_second {
                session.peak_reps_per_second = in_second;
            }
        }
    }

    fn refresh_rate(&mut self, now: DateTime<Utc>) {
        let elapsed_seconds = elapsed_seconds(self.session.start_time, now);
        self.session.average_reps_per_second = if elapsed_seconds > 0.0 {
            self.session.total_reps() as f64 / elapsed_seconds
        } else {
            0.0
        };
    }
}

fn elapsed_seconds(start: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - start).num_milliseconds() as f64 / 1000.0
}

fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Owns the single active session. Idle until the first non-empty batch;
/// back to idle only through [`SessionAggregator::close`].
pub struct SessionAggregator {
    clock: Arc<dyn Clock>,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionAggregator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            active: Mutex::new(None),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_active(&self) -> bool {
        self.lock_active().is_some()
    }

    /// Folds `events` into the active session, opening one if idle. Returns
    /// the updated session, or the current one (if any) for an empty batch.
    pub fn fold(&self, events: &[RepairEvent]) -> Option<Session> {
        let mut active = self.lock_active();
        if events.is_empty() {
            return active.as_ref().map(|state| state.session.clone());
        }

        let now = self.clock.now();
        let state = active.get_or_insert_with(|| {
            tracing::info!(started_at = %now, "Opening new logi session");
            ActiveSession::new(now)
        });

        for event in events {
            state.fold_event(event);
        }
        state.refresh_rate(now);

        Some(state.session.clone())
    }

    /// Ends the active session. The next batch opens a fresh one.
    pub fn close(&self) -> Option<Session> {
        let mut closed = self.lock_active().take()?;
        let now = self.clock.now();
        closed.refresh_rate(now);
        closed.session.end_time = Some(now);
        closed.session.is_active = false;

        tracing::info!(
            session_id = %closed.session.id,
            total_reps = closed.session.total_reps(),
            "Closed logi session"
        );
        Some(closed.session)
    }

    pub fn snapshot(&self) -> Option<Session> {
        self.lock_active().as_ref().map(|state| state.session.clone())
    }

    pub fn stats(&self) -> SessionStats {
        let active = self.lock_active();
        let Some(state) = active.as_ref() else {
            return SessionStats::default();
        };

        let session = &state.session;
        let elapsed_seconds = elapsed_seconds(session.start_time, self.clock.now());
        let reps_per_second = if elapsed_seconds > 0.0 {
            session.total_outgoing_reps as f64 / elapsed_seconds
        } else {
            0.0
        };

        SessionStats {
            current_reps: session.total_outgoing_reps,
            reps_per_second: round_to_tenth(reps_per_second),
            shield_reps: session.total_shield_reps,
            armor_reps: session.total_armor_reps,
            total_isk_value: session.total_isk_value,
            session_active: true,
            session_duration_minutes: round_to_tenth(elapsed_seconds.max(0.0) / 60.0),
        }
    }

    /// Outgoing repairs per target, largest total first.
    pub fn targets(&self) -> Vec<TargetSummary> {
        let active = self.lock_active();
        let Some(state) = active.as_ref() else {
            return Vec::new();
        };

        let mut targets = state
            .session
            .targets
            .iter()
            .map(|(name, tally)| TargetSummary {
                name: name.clone(),
                total_amount: tally.total_amount,
                repair_count: tally.repair_count,
            })
            .collect::<Vec<_>>();
        targets.sort_by(|left, right| {
            right
                .total_amount
                .cmp(&left.total_amount)
                .then_with(|| left.name.cmp(&right.name))
        });
        targets
    }
}
