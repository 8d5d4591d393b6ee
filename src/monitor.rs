use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::activity::ActivityPolicy;
use crate::config::Config;
use crate::error::StoreResult;
use crate::geometry::Landmark;
use crate::notify::NotificationSink;
use crate::posture::{PerMetric, PostureClassifier, PostureMetrics};
use crate::presence::PresenceLockTimer;
use crate::session::{PostureWarning, SessionTracker, TrackerSettings};
use crate::store::SessionStore;

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub person_present: bool,
    pub active: bool,
    pub metrics: Option<PostureMetrics>,
    pub violations: PerMetric<bool>,
    /// Window violation percentages when the classifier raised an alert.
    pub alert: Option<PerMetric<f32>>,
    pub warning: Option<PostureWarning>,
}

/// Runs every frame through the classifier, the session tracker and the
/// presence timer.
pub struct PostureMonitor {
    classifier: PostureClassifier,
    tracker: SessionTracker,
    presence: Option<PresenceLockTimer>,
    policy: Box<dyn ActivityPolicy>,
    sink: Arc<dyn NotificationSink>,
    person_present: bool,
}

impl PostureMonitor {
    pub fn new(
        config: &Config,
        store: Arc<dyn SessionStore>,
        policy: Box<dyn ActivityPolicy>,
        sink: Arc<dyn NotificationSink>,
        presence: Option<PresenceLockTimer>,
    ) -> Self {
        Self {
            classifier: PostureClassifier::new(
                config.camera.window_size,
                config.camera.fps,
                config.thresholds.clone(),
            ),
            tracker: SessionTracker::new(store, TrackerSettings::from(&config.session)),
            presence,
            policy,
            sink,
            person_present: true,
        }
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut SessionTracker {
        &mut self.tracker
    }

    pub fn classifier(&self) -> &PostureClassifier {
        &self.classifier
    }

    pub fn presence(&self) -> Option<&PresenceLockTimer> {
        self.presence.as_ref()
    }

    /// Processes one frame captured at `now`. `None` or an empty slice means
    /// nobody was detected.
    pub fn process_frame(
        &mut self,
        landmarks: Option<&[Landmark]>,
        now: DateTime<Utc>,
    ) -> StoreResult<FrameOutcome> {
        let landmarks = landmarks.filter(|l| !l.is_empty());
        let person_present = landmarks.is_some();

        if person_present != self.person_present {
            debug!(
                target: "sentinel::monitor",
                "Person {}",
                if person_present { "detected" } else { "lost" }
            );
            if !person_present {
                self.classifier.clear();
                self.tracker.pause_at(now);
            }
            self.person_present = person_present;
        }
        if let Some(presence) = &self.presence {
            presence.update_presence(person_present);
        }

        let active = self.policy.is_active(now);
        let mut outcome = FrameOutcome {
            person_present,
            active,
            metrics: None,
            violations: PerMetric::default(),
            alert: None,
            warning: None,
        };

        let Some(landmarks) = landmarks else {
            if !active && self.tracker.is_active() {
                self.tracker.end_session_at(now)?;
            }
            return Ok(outcome);
        };

        let metrics = self.classifier.analyze_at(landmarks, now);
        let violations = self.classifier.violations(&metrics);
        if let (true, percentages) = self.classifier.should_alert_at(now) {
            if let Some(percentages) = percentages {
                info!(
                    target: "sentinel::monitor",
                    "Sustained poor posture: {}",
                    percentages
                        .iter()
                        .filter(|(_, pct)| *pct >= self.classifier.thresholds().alert_ratio_percent)
                        .map(|(kind, pct)| format!("{} {:.0}%", kind.label(), pct))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            outcome.alert = percentages;
        }

        let warning = self.tracker.update(&metrics, &violations, active)?;
        if let Some(warning) = &warning {
            self.sink.on_warning(warning);
        }

        outcome.metrics = Some(metrics);
        outcome.violations = violations;
        outcome.warning = warning;
        Ok(outcome)
    }

    /// Ends the open session, retrying anything still queued.
    pub fn shutdown(&mut self, now: DateTime<Utc>) -> StoreResult<()> {
        if self.tracker.pending_count() > 0 {
            if let Err(e) = self.tracker.flush_pending() {
                warn!(target: "sentinel::monitor", "Unsaved sessions remain: {}", e);
            }
        }
        self.tracker.end_session_at(now)?;
        Ok(())
    }
}
