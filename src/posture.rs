use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Thresholds;
use crate::geometry::{self, Landmark};

/// Samples averaged by [`PostureClassifier::summary`].
const SUMMARY_SAMPLES: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    NeckTilt,
    HeadPitch,
    TorsoLean,
    ShoulderAsymmetry,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::NeckTilt,
        MetricKind::HeadPitch,
        MetricKind::TorsoLean,
        MetricKind::ShoulderAsymmetry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NeckTilt => "neck_tilt",
            Self::HeadPitch => "head_pitch",
            Self::TorsoLean => "torso_lean",
            Self::ShoulderAsymmetry => "shoulder_asymmetry",
        }
    }

    /// Short description of what the violation looks like to the user.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NeckTilt => "Forward Head",
            Self::HeadPitch => "Looking Down",
            Self::TorsoLean => "Slouching",
            Self::ShoulderAsymmetry => "Uneven Shoulders",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per posture metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerMetric<T> {
    pub neck_tilt: T,
    pub head_pitch: T,
    pub torso_lean: T,
    pub shoulder_asymmetry: T,
}

impl<T: Copy> PerMetric<T> {
    pub fn get(&self, kind: MetricKind) -> T {
        match kind {
            MetricKind::NeckTilt => self.neck_tilt,
            MetricKind::HeadPitch => self.head_pitch,
            MetricKind::TorsoLean => self.torso_lean,
            MetricKind::ShoulderAsymmetry => self.shoulder_asymmetry,
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(MetricKind, T) -> U) -> PerMetric<U> {
        PerMetric {
            neck_tilt: f(MetricKind::NeckTilt, self.neck_tilt),
            head_pitch: f(MetricKind::HeadPitch, self.head_pitch),
            torso_lean: f(MetricKind::TorsoLean, self.torso_lean),
            shoulder_asymmetry: f(MetricKind::ShoulderAsymmetry, self.shoulder_asymmetry),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricKind, T)> + '_ {
        MetricKind::ALL.into_iter().map(move |k| (k, self.get(k)))
    }
}

impl PerMetric<bool> {
    pub fn any(&self) -> bool {
        self.iter().any(|(_, v)| v)
    }

    pub fn active(&self) -> Vec<MetricKind> {
        self.iter().filter(|(_, v)| *v).map(|(k, _)| k).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PostureMetrics {
    pub neck_tilt_angle: f32,
    pub head_pitch: f32,
    pub torso_lean: f32,
    pub shoulder_asymmetry: f32,
    pub timestamp: DateTime<Utc>,
}

impl PostureMetrics {
    pub fn from_landmarks(landmarks: &[Landmark], timestamp: DateTime<Utc>) -> Self {
        Self {
            neck_tilt_angle: geometry::neck_tilt(landmarks),
            head_pitch: geometry::head_pitch(landmarks),
            torso_lean: geometry::torso_lean(landmarks),
            shoulder_asymmetry: geometry::shoulder_asymmetry(landmarks),
            timestamp,
        }
    }

    pub fn values(&self) -> PerMetric<f32> {
        PerMetric {
            neck_tilt: self.neck_tilt_angle,
            head_pitch: self.head_pitch,
            torso_lean: self.torso_lean,
            shoulder_asymmetry: self.shoulder_asymmetry,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowSummary {
    pub average: PerMetric<f32>,
    pub total_samples: usize,
    pub window_duration: Duration,
}

/// Sliding-window posture classifier.
///
/// Keeps the last `window_size` samples. Alerts are edge-triggered: once
/// [`should_alert_at`](Self::should_alert_at) fires, it stays quiet for the
/// configured cooldown no matter how bad the window looks.
pub struct PostureClassifier {
    window: VecDeque<PostureMetrics>,
    window_size: usize,
    fps: u32,
    thresholds: Thresholds,
    last_alert: Option<DateTime<Utc>>,
}

impl PostureClassifier {
    pub fn new(window_size: usize, fps: u32, thresholds: Thresholds) -> Self {
        let window_size = window_size.max(1);
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            fps: fps.max(1),
            thresholds,
            last_alert: None,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }

    pub fn analyze(&mut self, landmarks: &[Landmark]) -> PostureMetrics {
        self.analyze_at(landmarks, Utc::now())
    }

    pub fn analyze_at(&mut self, landmarks: &[Landmark], now: DateTime<Utc>) -> PostureMetrics {
        let metrics = PostureMetrics::from_landmarks(landmarks, now);
        self.push(metrics);
        metrics
    }

    pub fn push(&mut self, metrics: PostureMetrics) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(metrics);
    }

    pub fn violations(&self, metrics: &PostureMetrics) -> PerMetric<bool> {
        let violations = self.check(metrics);
        if violations.any() {
            debug!(
                target: "sentinel::posture",
                "Violations {:?} (neck {:.1}, head {:.1}, torso {:.1}, shoulders {:.1})",
                violations.active(),
                metrics.neck_tilt_angle,
                metrics.head_pitch,
                metrics.torso_lean,
                metrics.shoulder_asymmetry
            );
        }
        violations
    }

    pub fn should_alert(&mut self) -> (bool, Option<PerMetric<f32>>) {
        self.should_alert_at(Utc::now())
    }

    /// Returns whether to alert now, plus the per-metric violation
    /// percentages of the recent window when there was enough data.
    pub fn should_alert_at(&mut self, now: DateTime<Utc>) -> (bool, Option<PerMetric<f32>>) {
        let Some(recent) = self.recent(now, self.thresholds.bad_posture_duration()) else {
            return (false, None);
        };

        let total = recent.len() as f32;
        let mut counts = PerMetric::<u32>::default();
        for m in &recent {
            let v = self.check(m);
            counts = counts.map(|kind, c| c + u32::from(v.get(kind)));
        }
        let percentages = counts.map(|_, c| c as f32 / total * 100.0);

        let over_ratio = percentages
            .iter()
            .any(|(_, pct)| pct >= self.thresholds.alert_ratio_percent);
        let cooled_down = match self.last_alert {
            None => true,
            Some(last) => elapsed(last, now) > self.thresholds.alert_cooldown(),
        };

        if over_ratio && cooled_down {
            self.last_alert = Some(now);
            info!(target: "sentinel::posture", "Posture alert: {:?}", percentages);
            return (true, Some(percentages));
        }
        (false, Some(percentages))
    }

    pub fn is_good_posture_sustained(&self) -> bool {
        self.is_good_posture_sustained_at(Utc::now())
    }

    pub fn is_good_posture_sustained_at(&self, now: DateTime<Utc>) -> bool {
        let Some(recent) = self.recent(now, self.thresholds.good_posture_required()) else {
            return false;
        };
        let good = recent.iter().filter(|m| !self.check(m).any()).count();
        good as f32 / recent.len() as f32 * 100.0 >= self.thresholds.good_ratio_percent
    }

    pub fn summary(&self) -> Option<WindowSummary> {
        if self.window.is_empty() {
            return None;
        }
        let take = self.window.len().min(SUMMARY_SAMPLES);
        let tail = self.window.iter().skip(self.window.len() - take);
        let mut sum = PerMetric::<f32>::default();
        for m in tail {
            let v = m.values();
            sum = sum.map(|kind, s| s + v.get(kind));
        }
        Some(WindowSummary {
            average: sum.map(|_, s| s / take as f32),
            total_samples: self.window.len(),
            window_duration: Duration::from_secs_f64(self.window.len() as f64 / f64::from(self.fps)),
        })
    }

    fn check(&self, metrics: &PostureMetrics) -> PerMetric<bool> {
        let t = &self.thresholds;
        PerMetric {
            neck_tilt: metrics.neck_tilt_angle > t.neck_tilt,
            head_pitch: metrics.head_pitch > t.head_pitch,
            torso_lean: metrics.torso_lean > t.torso_lean,
            shoulder_asymmetry: metrics.shoulder_asymmetry > t.shoulder_asymmetry,
        }
    }

    /// Samples within `span` before `now`, or `None` while fewer than two
    /// seconds' worth of frames are buffered or nothing falls in the span.
    fn recent(&self, now: DateTime<Utc>, span: Duration) -> Option<Vec<PostureMetrics>> {
        if self.window.len() < self.min_samples() {
            return None;
        }
        let recent: Vec<_> = self
            .window
            .iter()
            .filter(|m| m.timestamp <= now && elapsed(m.timestamp, now) <= span)
            .copied()
            .collect();
        if recent.is_empty() {
            None
        } else {
            Some(recent)
        }
    }

    fn min_samples(&self) -> usize {
        self.fps as usize * 2
    }
}

/// Non-negative time from `from` to `to`.
pub fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or_default()
}
