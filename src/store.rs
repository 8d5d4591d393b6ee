//! Session persistence.
//!
//! [`SessionStore`] is the append/query contract the tracker depends on.
//! Two implementations ship with the crate: an in-memory store for tests
//! and embedding, and an append-only JSON-lines file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::posture::PerMetric;
use crate::session::{PostureEvent, PostureState, WorkSession};

pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub bad_posture_secs: f64,
    pub warning_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub state: PostureState,
    pub neck_tilt: f32,
    pub head_pitch: f32,
    pub torso_lean: f32,
    pub shoulder_asymmetry: f32,
    pub violations: PerMetric<bool>,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub timestamp: DateTime<Utc>,
    pub feedback_type: String,
    pub helpful: bool,
    pub comments: String,
}

/// Aggregate over closed sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostureSummary {
    pub total_bad_secs: f64,
    pub total_warnings: u64,
    pub session_count: u64,
    pub total_work_secs: f64,
}

impl PostureSummary {
    /// 100 minus the bad-posture share of work time.
    pub fn posture_score(&self) -> f64 {
        100.0 - self.total_bad_secs / self.total_work_secs.max(1.0) * 100.0
    }

    fn add(&mut self, session: &SessionRecord) {
        let Some(end) = session.end_time else {
            return;
        };
        self.total_bad_secs += session.bad_posture_secs;
        self.total_warnings += u64::from(session.warning_count);
        self.session_count += 1;
        self.total_work_secs += (end - session.start_time)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub summary: PostureSummary,
    pub posture_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionExport {
    /// Newest first.
    pub sessions: Vec<SessionRecord>,
    /// Newest first.
    pub events: Vec<EventRecord>,
    pub export_date: DateTime<Utc>,
    pub since: DateTime<Utc>,
}

pub trait SessionStore: Send + Sync {
    /// Appends a closed session together with its events under a single
    /// writer lock and returns the id assigned to it.
    fn append_session(&self, session: &WorkSession) -> StoreResult<SessionId>;

    fn append_events(&self, session_id: SessionId, events: &[PostureEvent]) -> StoreResult<()>;

    fn append_feedback(&self, entry: &FeedbackEntry) -> StoreResult<()>;

    /// Aggregates closed sessions that started in `[from, to)`.
    fn query_summary(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> StoreResult<PostureSummary>;

    /// Sessions that started at or after `since`, with their events.
    fn export(&self, since: DateTime<Utc>) -> StoreResult<SessionExport>;
}

fn session_record(id: SessionId, session: &WorkSession) -> SessionRecord {
    SessionRecord {
        id,
        start_time: session.start_time,
        end_time: session.end_time,
        bad_posture_secs: session.bad_posture_duration.as_secs_f64(),
        warning_count: session.warning_count,
    }
}

fn event_record(session_id: SessionId, event: &PostureEvent) -> EventRecord {
    EventRecord {
        session_id,
        timestamp: event.timestamp,
        state: event.state,
        neck_tilt: event.metrics.neck_tilt_angle,
        head_pitch: event.metrics.head_pitch,
        torso_lean: event.metrics.torso_lean,
        shoulder_asymmetry: event.metrics.shoulder_asymmetry,
        violations: event.violations,
        duration_secs: event.duration.as_secs_f64(),
    }
}

fn summarize<'a>(
    sessions: impl Iterator<Item = &'a SessionRecord>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> PostureSummary {
    let mut summary = PostureSummary::default();
    for session in sessions.filter(|s| s.start_time >= from && s.start_time < to) {
        summary.add(session);
    }
    summary
}

fn export_since(
    sessions: &[SessionRecord],
    events: &[EventRecord],
    since: DateTime<Utc>,
) -> SessionExport {
    let mut sessions: Vec<SessionRecord> = sessions
        .iter()
        .filter(|s| s.start_time >= since)
        .cloned()
        .collect();
    sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));

    let mut events: Vec<EventRecord> = events
        .iter()
        .filter(|e| sessions.iter().any(|s| s.id == e.session_id))
        .cloned()
        .collect();
    events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    SessionExport {
        sessions,
        events,
        export_date: Utc::now(),
        since,
    }
}

/// Summary for one local calendar day.
pub fn daily_summary(store: &dyn SessionStore, date: NaiveDate) -> StoreResult<DailySummary> {
    let (from, to) = local_day_bounds(date);
    let summary = store.query_summary(from, to)?;
    Ok(DailySummary {
        date,
        posture_score: summary.posture_score(),
        summary,
    })
}

/// Daily summaries for the seven days ending with `today`, oldest first.
pub fn weekly_trend(store: &dyn SessionStore, today: NaiveDate) -> StoreResult<Vec<DailySummary>> {
    (0..7)
        .rev()
        .map(|back| daily_summary(store, today - ChronoDuration::days(back)))
        .collect()
}

fn local_day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start_of = |d: NaiveDate| {
        let midnight = d.and_time(chrono::NaiveTime::MIN);
        Local
            .from_local_datetime(&midnight)
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
    };
    (start_of(date), start_of(date + ChronoDuration::days(1)))
}

#[derive(Debug, Default)]
struct Tables {
    sessions: Vec<SessionRecord>,
    events: Vec<EventRecord>,
    feedback: Vec<FeedbackEntry>,
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    tables: Mutex<Tables>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.tables.lock().sessions.clone()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.tables.lock().events.clone()
    }

    pub fn feedback(&self) -> Vec<FeedbackEntry> {
        self.tables.lock().feedback.clone()
    }
}

impl SessionStore for MemorySessionStore {
    fn append_session(&self, session: &WorkSession) -> StoreResult<SessionId> {
        let mut tables = self.tables.lock();
        let id = tables.sessions.len() as SessionId + 1;
        tables.sessions.push(session_record(id, session));
        tables
            .events
            .extend(session.events.iter().map(|e| event_record(id, e)));
        Ok(id)
    }

    fn append_events(&self, session_id: SessionId, events: &[PostureEvent]) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        tables
            .events
            .extend(events.iter().map(|e| event_record(session_id, e)));
        Ok(())
    }

    fn append_feedback(&self, entry: &FeedbackEntry) -> StoreResult<()> {
        self.tables.lock().feedback.push(entry.clone());
        Ok(())
    }

    fn query_summary(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> StoreResult<PostureSummary> {
        Ok(summarize(self.tables.lock().sessions.iter(), from, to))
    }

    fn export(&self, since: DateTime<Utc>) -> StoreResult<SessionExport> {
        let tables = self.tables.lock();
        Ok(export_since(&tables.sessions, &tables.events, since))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tail {
    Clean,
    /// Last record complete but missing its newline.
    Unterminated,
    /// Last record cut off; the file is valid up to `valid_len` bytes.
    Torn { valid_len: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreRecord {
    Session(SessionRecord),
    Event(EventRecord),
    Feedback(FeedbackEntry),
}

/// Append-only JSON-lines store, one [`StoreRecord`] per line.
pub struct JsonlSessionStore {
    path: PathBuf,
    /// Next session id; the mutex also serialises every write and read.
    writer: Mutex<SessionId>,
}

impl JsonlSessionStore {
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let next_id = if path.exists() {
            let (records, tail) = Self::read_records(&path)?;
            Self::repair_tail(&path, tail)?;
            records
                .iter()
                .filter_map(|r| match r {
                    StoreRecord::Session(s) => Some(s.id),
                    _ => None,
                })
                .max()
                .unwrap_or(0)
                + 1
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            1
        };

        info!(
            target: "sentinel::store",
            "Opened session store {} (next session id {})",
            path.display(),
            next_id
        );
        Ok(Self {
            path,
            writer: Mutex::new(next_id),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(&self) -> StoreResult<Vec<StoreRecord>> {
        let _guard = self.writer.lock();
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        Ok(Self::read_records(&self.path)?.0)
    }

    /// Parses every line. A last line without its newline that fails to
    /// parse is a write cut short by a crash and is skipped; any other bad
    /// line is [`StoreError::Corrupt`].
    fn read_records(path: &Path) -> StoreResult<(Vec<StoreRecord>, Tail)> {
        // Bytes, not a string: a cut can land inside a multi-byte character.
        let content = fs::read(path)?;
        let mut records = Vec::new();
        let mut tail = Tail::Clean;
        let mut offset = 0;
        for (index, line) in content.split_inclusive(|b| *b == b'\n').enumerate() {
            let start = offset;
            offset += line.len();
            let terminated = line.ends_with(b"\n");
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice(line) {
                Ok(record) => {
                    records.push(record);
                    if !terminated {
                        tail = Tail::Unterminated;
                    }
                }
                Err(source) if !terminated => {
                    debug!(
                        target: "sentinel::store",
                        "Torn record at line {}: {}",
                        index + 1,
                        source
                    );
                    tail = Tail::Torn {
                        valid_len: start as u64,
                    };
                }
                Err(source) => {
                    return Err(StoreError::Corrupt {
                        line: index + 1,
                        source,
                    })
                }
            }
        }
        Ok((records, tail))
    }

    /// Makes the file end on a record boundary so later appends start on
    /// a fresh line.
    fn repair_tail(path: &Path, tail: Tail) -> StoreResult<()> {
        match tail {
            Tail::Clean => {}
            Tail::Unterminated => {
                OpenOptions::new().append(true).open(path)?.write_all(b"\n")?;
            }
            Tail::Torn { valid_len } => {
                warn!(
                    target: "sentinel::store",
                    "Dropping incomplete last record in {} (cut at byte {})",
                    path.display(),
                    valid_len
                );
                OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
            }
        }
        Ok(())
    }

    /// Writes all `records` with one `write_all` so a batch lands together.
    fn append(&self, records: &[StoreRecord]) -> StoreResult<()> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&buf)?;
        file.flush()?;
        Ok(())
    }

    fn tables(&self) -> StoreResult<(Vec<SessionRecord>, Vec<EventRecord>)> {
        let mut sessions = Vec::new();
        let mut events = Vec::new();
        for record in self.read_all()? {
            match record {
                StoreRecord::Session(s) => sessions.push(s),
                StoreRecord::Event(e) => events.push(e),
                StoreRecord::Feedback(_) => {}
            }
        }
        Ok((sessions, events))
    }
}

impl SessionStore for JsonlSessionStore {
    fn append_session(&self, session: &WorkSession) -> StoreResult<SessionId> {
        let mut next_id = self.writer.lock();
        let id = *next_id;

        let mut records = Vec::with_capacity(session.events.len() + 1);
        records.push(StoreRecord::Session(session_record(id, session)));
        records.extend(
            session
                .events
                .iter()
                .map(|e| StoreRecord::Event(event_record(id, e))),
        );
        self.append(&records)?;

        *next_id += 1;
        debug!(
            target: "sentinel::store",
            "Saved session {} with {} events",
            id,
            session.events.len()
        );
        Ok(id)
    }

    fn append_events(&self, session_id: SessionId, events: &[PostureEvent]) -> StoreResult<()> {
        let _guard = self.writer.lock();
        let records: Vec<_> = events
            .iter()
            .map(|e| StoreRecord::Event(event_record(session_id, e)))
            .collect();
        self.append(&records)
    }

    fn append_feedback(&self, entry: &FeedbackEntry) -> StoreResult<()> {
        let _guard = self.writer.lock();
        self.append(&[StoreRecord::Feedback(entry.clone())])
    }

    fn query_summary(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> StoreResult<PostureSummary> {
        let (sessions, _) = self.tables()?;
        Ok(summarize(sessions.iter(), from, to))
    }

    fn export(&self, since: DateTime<Utc>) -> StoreResult<SessionExport> {
        let (sessions, events) = self.tables()?;
        Ok(export_since(&sessions, &events, since))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posture::PostureMetrics;
    use std::time::Duration;

    fn at(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, hour, min, 0).unwrap()
    }

    fn event(start: DateTime<Utc>, state: PostureState, secs: u64) -> PostureEvent {
        PostureEvent {
            timestamp: start,
            state,
            metrics: PostureMetrics {
                neck_tilt_angle: 25.0,
                head_pitch: 0.0,
                torso_lean: 3.0,
                shoulder_asymmetry: 1.0,
                timestamp: start + ChronoDuration::seconds(secs as i64),
            },
            violations: PerMetric {
                neck_tilt: true,
                ..PerMetric::default()
            },
            duration: Duration::from_secs(secs),
        }
    }

    fn session(start: DateTime<Utc>, minutes: i64, bad_secs: u64, warnings: u32) -> WorkSession {
        WorkSession {
            start_time: start,
            end_time: Some(start + ChronoDuration::minutes(minutes)),
            bad_posture_duration: Duration::from_secs(bad_secs),
            warning_count: warnings,
            events: vec![
                event(start, PostureState::Bad, 30),
                event(start + ChronoDuration::seconds(30), PostureState::Good, 60),
            ],
        }
    }

    #[test]
    fn memory_store_assigns_ids_and_summarizes() {
        let store = MemorySessionStore::new();
        assert_eq!(store.append_session(&session(at(9, 0), 60, 600, 2)).unwrap(), 1);
        assert_eq!(store.append_session(&session(at(13, 0), 30, 300, 1)).unwrap(), 2);
        assert_eq!(store.events().len(), 4);

        let summary = store.query_summary(at(0, 0), at(23, 59)).unwrap();
        assert_eq!(summary.session_count, 2);
        assert_eq!(summary.total_warnings, 3);
        assert_eq!(summary.total_bad_secs, 900.0);
        assert_eq!(summary.total_work_secs, 5400.0);
        assert!((summary.posture_score() - (100.0 - 900.0 / 5400.0 * 100.0)).abs() < 1e-9);

        let morning = store.query_summary(at(0, 0), at(12, 0)).unwrap();
        assert_eq!(morning.session_count, 1);
    }

    #[test]
    fn empty_summary_scores_full_marks() {
        let store = MemorySessionStore::new();
        let summary = store.query_summary(at(0, 0), at(23, 0)).unwrap();
        assert_eq!(summary, PostureSummary::default());
        assert_eq!(summary.posture_score(), 100.0);
    }

    #[test]
    fn export_is_newest_first_and_filtered() {
        let store = MemorySessionStore::new();
        store.append_session(&session(at(8, 0), 10, 0, 0)).unwrap();
        store.append_session(&session(at(10, 0), 10, 0, 0)).unwrap();
        store.append_session(&session(at(12, 0), 10, 0, 0)).unwrap();

        let export = store.export(at(9, 0)).unwrap();
        let ids: Vec<_> = export.sessions.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3, 2]);
        assert_eq!(export.events.len(), 4);
        assert!(export.events.iter().all(|e| e.session_id != 1));
        assert!(export.events[0].timestamp >= export.events[1].timestamp);
    }

    #[test]
    fn jsonl_store_round_trips_and_resumes_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("posture.jsonl");

        {
            let store = JsonlSessionStore::open(&path).unwrap();
            assert_eq!(store.append_session(&session(at(9, 0), 60, 120, 1)).unwrap(), 1);
            store
                .append_feedback(&FeedbackEntry {
                    timestamp: at(9, 30),
                    feedback_type: "warning".into(),
                    helpful: true,
                    comments: String::new(),
                })
                .unwrap();
        }

        let store = JsonlSessionStore::open(&path).unwrap();
        assert_eq!(store.append_session(&session(at(11, 0), 30, 60, 0)).unwrap(), 2);
        store
            .append_events(2, &[event(at(11, 20), PostureState::Bad, 5)])
            .unwrap();

        let records = store.read_all().unwrap();
        assert_eq!(records.len(), 8);
        assert!(matches!(records[0], StoreRecord::Session(SessionRecord { id: 1, .. })));
        assert!(matches!(records[3], StoreRecord::Feedback(_)));

        let summary = store.query_summary(at(0, 0), at(23, 0)).unwrap();
        assert_eq!(summary.session_count, 2);
        assert_eq!(summary.total_bad_secs, 180.0);

        let export = store.export(at(10, 0)).unwrap();
        assert_eq!(export.sessions.len(), 1);
        assert_eq!(export.events.len(), 3);
    }

    #[test]
    fn corrupt_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posture.jsonl");
        fs::write(&path, "{\"kind\":\"feedback\"}\nnot json\n").unwrap();
        match JsonlSessionStore::open(&path) {
            Err(StoreError::Corrupt { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected corrupt record, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn torn_last_record_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posture.jsonl");
        {
            let store = JsonlSessionStore::open(&path).unwrap();
            store.append_session(&session(at(9, 0), 60, 120, 1)).unwrap();
        }
        let intact = fs::read_to_string(&path).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"kind":"session","id":2,"start_ti"#).unwrap();
        drop(file);

        let store = JsonlSessionStore::open(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), intact);
        assert_eq!(store.read_all().unwrap().len(), 3);

        assert_eq!(store.append_session(&session(at(11, 0), 30, 60, 0)).unwrap(), 2);
        let reopened = JsonlSessionStore::open(&path).unwrap();
        assert_eq!(reopened.read_all().unwrap().len(), 6);
        assert_eq!(reopened.query_summary(at(0, 0), at(23, 0)).unwrap().session_count, 2);
    }

    #[test]
    fn unterminated_last_record_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posture.jsonl");
        let entry = FeedbackEntry {
            timestamp: at(9, 30),
            feedback_type: "warning".into(),
            helpful: false,
            comments: String::new(),
        };
        let line = serde_json::to_string(&StoreRecord::Feedback(entry.clone())).unwrap();
        fs::write(&path, &line).unwrap();

        let store = JsonlSessionStore::open(&path).unwrap();
        store.append_feedback(&entry).unwrap();
        let records = store.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| *r == StoreRecord::Feedback(entry.clone())));
    }

    #[test]
    fn weekly_trend_covers_seven_days() {
        let store = MemorySessionStore::new();
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let noon = Local
            .from_local_datetime(&today.and_hms_opt(12, 0, 0).unwrap())
            .earliest()
            .unwrap()
            .with_timezone(&Utc);
        store.append_session(&session(noon, 60, 360, 1)).unwrap();

        let trend = weekly_trend(&store, today).unwrap();
        assert_eq!(trend.len(), 7);
        assert_eq!(trend[0].date, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        assert_eq!(trend[6].date, today);
        assert_eq!(trend[6].summary.session_count, 1);
        assert!((trend[6].posture_score - 90.0).abs() < 1e-9);
        assert!(trend[..6].iter().all(|d| d.summary.session_count == 0));
    }
}
