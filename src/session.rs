//! Work sessions and the GOOD/BAD posture state machine.
//!
//! The tracker debounces per-frame verdicts, accumulates time spent in bad
//! posture, escalates warnings through a list of duration thresholds and
//! decays the accumulator again once good posture has been held for a while.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::StoreResult;
use crate::posture::{elapsed, MetricKind, PerMetric, PostureMetrics};
use crate::store::{self, DailySummary, FeedbackEntry, SessionExport, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostureState {
    Good,
    /// Severity of emitted warnings; the tracker itself never enters it.
    Warning,
    Bad,
}

impl PostureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Warning => "warning",
            Self::Bad => "bad",
        }
    }
}

impl fmt::Display for PostureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed stretch of one posture state.
#[derive(Debug, Clone, PartialEq)]
pub struct PostureEvent {
    /// When the state began.
    pub timestamp: DateTime<Utc>,
    pub state: PostureState,
    pub metrics: PostureMetrics,
    pub violations: PerMetric<bool>,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkSession {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub bad_posture_duration: Duration,
    pub warning_count: u32,
    pub events: Vec<PostureEvent>,
}

impl WorkSession {
    fn open(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time: None,
            bad_posture_duration: Duration::ZERO,
            warning_count: 0,
            events: Vec::new(),
        }
    }

    /// Elapsed wall-clock time, `None` while the session is open.
    pub fn duration(&self) -> Option<Duration> {
        self.end_time.map(|end| elapsed(self.start_time, end))
    }

    /// Share of the session spent in bad posture, in percent.
    pub fn bad_posture_percent(&self) -> f64 {
        let total = self.duration().unwrap_or_default().as_secs_f64().max(1.0);
        self.bad_posture_duration.as_secs_f64() / total * 100.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostureWarning {
    pub level: usize,
    pub severity: PostureState,
    pub bad_duration: Duration,
    pub violations: Vec<MetricKind>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSettings {
    /// Ascending.
    pub warning_thresholds: Vec<Duration>,
    pub min_state_duration: Duration,
    pub warning_reset_after: Duration,
}

impl From<&SessionConfig> for TrackerSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            warning_thresholds: config.warning_thresholds(),
            min_state_duration: config.min_state_duration(),
            warning_reset_after: config.warning_reset_after(),
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

pub struct SessionTracker {
    store: Arc<dyn SessionStore>,
    settings: TrackerSettings,
    session: Option<WorkSession>,
    state: PostureState,
    state_since: DateTime<Utc>,
    bad_accumulator: Duration,
    last_warning_level: Option<usize>,
    /// Closed sessions whose flush to the store has not succeeded yet.
    pending: Vec<WorkSession>,
    /// Set while nobody is in front of the camera.
    paused_at: Option<DateTime<Utc>>,
}

impl SessionTracker {
    pub fn new(store: Arc<dyn SessionStore>, settings: TrackerSettings) -> Self {
        Self {
            store,
            settings,
            session: None,
            state: PostureState::Good,
            state_since: Utc::now(),
            bad_accumulator: Duration::ZERO,
            last_warning_level: None,
            pending: Vec::new(),
            paused_at: None,
        }
    }

    pub fn state(&self) -> PostureState {
        self.state
    }

    pub fn current_session(&self) -> Option<&WorkSession> {
        self.session.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn bad_posture_accumulator(&self) -> Duration {
        self.bad_accumulator
    }

    pub fn last_warning_level(&self) -> Option<usize> {
        self.last_warning_level
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Feeds one classified frame. The frame's timestamp is taken as "now".
    ///
    /// Returns a warning when a new escalation level is reached. An error
    /// only means a closed session could not be persisted; it stays queued
    /// for [`flush_pending`](Self::flush_pending).
    pub fn update(
        &mut self,
        metrics: &PostureMetrics,
        violations: &PerMetric<bool>,
        is_active: bool,
    ) -> StoreResult<Option<PostureWarning>> {
        let now = metrics.timestamp;

        if !is_active {
            if self.session.is_some() {
                self.end_session_at(now)?;
            }
            return Ok(None);
        }
        if self.session.is_none() {
            self.start_session_at(now)?;
        }

        if self.paused_at.take().is_some() {
            // Time away belongs to neither state.
            self.state_since = now;
        }
        self.apply_verdict(metrics, violations, now);

        let warning = match self.state {
            PostureState::Bad => self.escalate(violations, now),
            PostureState::Good | PostureState::Warning => {
                self.recover(now);
                None
            }
        };
        Ok(warning)
    }

    /// Stops the clock while nobody is detected. A running BAD stretch is
    /// booked up to `now`; the next [`update`](Self::update) resumes timing
    /// from its own timestamp.
    pub fn pause_at(&mut self, now: DateTime<Utc>) {
        if self.session.is_none() || self.paused_at.is_some() {
            return;
        }
        if self.state == PostureState::Bad {
            self.bad_accumulator += elapsed(self.state_since, now);
        }
        self.state_since = now;
        self.paused_at = Some(now);
        debug!(target: "sentinel::session", "Tracking paused, person not detected");
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    pub fn start_session(&mut self) -> StoreResult<()> {
        self.start_session_at(Utc::now())
    }

    /// Opens a new session, closing the current one first.
    ///
    /// The new session is opened even if closing the previous one fails to
    /// persist; that failure is returned afterwards.
    pub fn start_session_at(&mut self, now: DateTime<Utc>) -> StoreResult<()> {
        let closed = if self.session.is_some() {
            self.end_session_at(now).map(|_| ())
        } else {
            Ok(())
        };

        self.session = Some(WorkSession::open(now));
        self.paused_at = None;
        self.bad_accumulator = Duration::ZERO;
        self.last_warning_level = None;
        self.state_since = now;
        info!(
            target: "sentinel::session",
            "Started posture monitoring session at {}",
            now.with_timezone(&Local).format("%H:%M:%S")
        );
        closed
    }

    pub fn end_session(&mut self) -> StoreResult<Option<WorkSession>> {
        self.end_session_at(Utc::now())
    }

    /// Closes and persists the open session, returning it.
    pub fn end_session_at(&mut self, now: DateTime<Utc>) -> StoreResult<Option<WorkSession>> {
        let Some(mut session) = self.session.take() else {
            debug!(target: "sentinel::session", "No active session to end");
            return Ok(None);
        };

        let end = now.max(session.start_time);
        let mut bad = self.bad_accumulator;
        if self.state == PostureState::Bad && self.paused_at.take().is_none() {
            bad += elapsed(self.state_since.max(session.start_time), end);
        }
        session.end_time = Some(end);
        session.bad_posture_duration = bad.min(elapsed(session.start_time, end));

        info!(
            target: "sentinel::session",
            "Session ended. Duration: {:.1}h, bad posture: {:.1}%, warnings: {}, events: {}",
            elapsed(session.start_time, end).as_secs_f64() / 3600.0,
            session.bad_posture_percent(),
            session.warning_count,
            session.events.len()
        );

        self.pending.push(session.clone());
        self.flush_pending()?;
        Ok(Some(session))
    }

    /// Retries persisting closed sessions, oldest first. Returns how many
    /// were written.
    pub fn flush_pending(&mut self) -> StoreResult<usize> {
        let mut written = 0;
        while let Some(session) = self.pending.first() {
            match self.store.append_session(session) {
                Ok(id) => {
                    debug!(target: "sentinel::session", "Saved session {}", id);
                    self.pending.remove(0);
                    written += 1;
                }
                Err(e) => {
                    warn!(
                        target: "sentinel::session",
                        "Failed to save session ({} pending): {}",
                        self.pending.len(),
                        e
                    );
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    /// Drops closed sessions that could not be persisted.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        if dropped > 0 {
            warn!(target: "sentinel::session", "Discarding {} unsaved sessions", dropped);
        }
        self.pending.clear();
        dropped
    }

    pub fn record_feedback(
        &self,
        feedback_type: &str,
        helpful: bool,
        comments: &str,
    ) -> StoreResult<()> {
        self.store.append_feedback(&FeedbackEntry {
            timestamp: Utc::now(),
            feedback_type: feedback_type.to_string(),
            helpful,
            comments: comments.to_string(),
        })
    }

    pub fn daily_summary(&self, date: NaiveDate) -> StoreResult<DailySummary> {
        store::daily_summary(self.store.as_ref(), date)
    }

    pub fn weekly_trend(&self, today: NaiveDate) -> StoreResult<Vec<DailySummary>> {
        store::weekly_trend(self.store.as_ref(), today)
    }

    pub fn export(&self, days: u32) -> StoreResult<SessionExport> {
        self.store
            .export(Utc::now() - chrono::Duration::days(i64::from(days)))
    }

    fn apply_verdict(
        &mut self,
        metrics: &PostureMetrics,
        violations: &PerMetric<bool>,
        now: DateTime<Utc>,
    ) {
        let verdict = if violations.any() {
            PostureState::Bad
        } else {
            PostureState::Good
        };
        if verdict == self.state {
            return;
        }

        let held = elapsed(self.state_since, now);
        if held >= self.settings.min_state_duration {
            if self.state == PostureState::Bad {
                self.bad_accumulator += held;
            }
            let event = PostureEvent {
                timestamp: self.state_since,
                state: self.state,
                metrics: *metrics,
                violations: *violations,
                duration: held,
            };
            if let Some(session) = self.session.as_mut() {
                session.events.push(event);
            }
            info!(
                target: "sentinel::session",
                "Posture state changed to {} (was {} for {:.1}s)",
                verdict,
                self.state,
                held.as_secs_f64()
            );
        } else {
            debug!(
                target: "sentinel::session",
                "Posture flicker {} -> {} after {:.1}s, no event",
                self.state,
                verdict,
                held.as_secs_f64()
            );
        }

        self.state = verdict;
        self.state_since = now;
    }

    fn escalate(
        &mut self,
        violations: &PerMetric<bool>,
        now: DateTime<Utc>,
    ) -> Option<PostureWarning> {
        let current = self.bad_accumulator + elapsed(self.state_since, now);
        let last = self.last_warning_level;
        let level = self
            .settings
            .warning_thresholds
            .iter()
            .enumerate()
            .find(|(i, threshold)| current >= **threshold && last.map_or(true, |l| *i > l))
            .map(|(i, _)| i)?;

        self.last_warning_level = Some(level);
        if let Some(session) = self.session.as_mut() {
            session.warning_count += 1;
        }

        let active = violations.active();
        let message = warning_message(level, current, &active);
        info!(
            target: "sentinel::session",
            "Warning level {} at {:.1}s of bad posture",
            level,
            current.as_secs_f64()
        );
        Some(PostureWarning {
            level,
            severity: PostureState::Warning,
            bad_duration: current,
            violations: active,
            message,
        })
    }

    fn recover(&mut self, now: DateTime<Utc>) {
        if self.last_warning_level.is_none() {
            return;
        }
        let good = elapsed(self.state_since, now);
        if good > self.settings.warning_reset_after {
            self.last_warning_level = None;
            self.bad_accumulator = self.bad_accumulator.saturating_sub(good);
            info!(
                target: "sentinel::session",
                "Good posture for {:.1}s, warning level reset, {:.1}s of bad posture left",
                good.as_secs_f64(),
                self.bad_accumulator.as_secs_f64()
            );
        }
    }
}

pub fn warning_message(level: usize, duration: Duration, issues: &[MetricKind]) -> String {
    let minutes = duration.as_secs_f64() / 60.0;
    let issues = issues
        .iter()
        .map(MetricKind::as_str)
        .collect::<Vec<_>>()
        .join(", ");

    match level {
        0 => format!(
            "Posture check: You've been in poor posture for {:.1} minutes. \
             Main issues: {}. Consider adjusting your position.",
            minutes, issues
        ),
        1 => format!(
            "Posture reminder: {:.1} minutes of poor posture detected. \
             Time for a quick posture reset! Focus on: {}.",
            minutes, issues
        ),
        2 => format!(
            "Break time: You've been slouching for {:.1} minutes. \
             Stand up, stretch, and reset your workspace setup.",
            minutes
        ),
        _ => format!("Extended poor posture detected: {:.1} minutes", minutes),
    }
}
