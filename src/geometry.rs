//! Posture metrics computed from a single frame of body landmarks.
//!
//! Landmarks follow the 33-point BlazePose layout in image space (y grows
//! downwards). Every metric degrades to `0.0` when a landmark it needs is
//! missing or not finite, or when a vector collapses to zero length, so a
//! partial detection never aborts classification.

use serde::Deserialize;

pub const NOSE: usize = 0;
pub const LEFT_EAR: usize = 7;
pub const RIGHT_EAR: usize = 8;
pub const LEFT_SHOULDER: usize = 11;
pub const RIGHT_SHOULDER: usize = 12;
pub const LEFT_HIP: usize = 23;
pub const RIGHT_HIP: usize = 24;

/// Number of landmarks produced by the pose model for one person.
pub const LANDMARK_COUNT: usize = 33;

/// Up direction in image coordinates.
const VERTICAL: Vec2 = Vec2 { x: 0.0, y: -1.0 };

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "Vec<f32>")]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    /// Confidence-like score from the pose model, `1.0` when not reported.
    pub visibility: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            visibility: 1.0,
        }
    }
}

impl TryFrom<Vec<f32>> for Landmark {
    type Error = String;

    fn try_from(row: Vec<f32>) -> Result<Self, Self::Error> {
        match row.as_slice() {
            [x, y] => Ok(Self::new(*x, *y)),
            [x, y, visibility, ..] => Ok(Self {
                x: *x,
                y: *y,
                visibility: *visibility,
            }),
            _ => Err(format!("landmark needs at least 2 columns, got {}", row.len())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Vec2 {
    x: f32,
    y: f32,
}

impl Vec2 {
    fn midpoint(a: Vec2, b: Vec2) -> Vec2 {
        Vec2 {
            x: (a.x + b.x) / 2.0,
            y: (a.y + b.y) / 2.0,
        }
    }

    fn sub(self, other: Vec2) -> Vec2 {
        Vec2 {
            x: self.x - other.x,
            y: self.y - other.y,
        }
    }

    fn dot(self, other: Vec2) -> f32 {
        self.x * other.x + self.y * other.y
    }

    fn norm(self) -> f32 {
        self.dot(self).sqrt()
    }
}

fn point(landmarks: &[Landmark], index: usize) -> Option<Vec2> {
    let lm = landmarks.get(index)?;
    if lm.x.is_finite() && lm.y.is_finite() {
        Some(Vec2 { x: lm.x, y: lm.y })
    } else {
        None
    }
}

fn midpoint_of(landmarks: &[Landmark], a: usize, b: usize) -> Option<Vec2> {
    Some(Vec2::midpoint(point(landmarks, a)?, point(landmarks, b)?))
}

/// Angle in degrees between `v` and the up vector, `None` for a zero-length `v`.
fn angle_from_vertical(v: Vec2) -> Option<f32> {
    let norms = v.norm() * VERTICAL.norm();
    if norms == 0.0 || !norms.is_finite() {
        return None;
    }
    // Clamp before acos: rounding can push the cosine just outside [-1, 1].
    let cos = (v.dot(VERTICAL) / norms).clamp(-1.0, 1.0);
    Some(cos.acos().to_degrees())
}

/// Forward-head angle: shoulder midpoint to ear midpoint against vertical.
pub fn neck_tilt(landmarks: &[Landmark]) -> f32 {
    let angle = || {
        let ears = midpoint_of(landmarks, LEFT_EAR, RIGHT_EAR)?;
        let shoulders = midpoint_of(landmarks, LEFT_SHOULDER, RIGHT_SHOULDER)?;
        angle_from_vertical(ears.sub(shoulders))
    };
    angle().unwrap_or(0.0)
}

/// Downward head pitch. Looking level or up is reported as `0.0`.
pub fn head_pitch(landmarks: &[Landmark]) -> f32 {
    let angle = || {
        let nose = point(landmarks, NOSE)?;
        let ears = midpoint_of(landmarks, LEFT_EAR, RIGHT_EAR)?;
        let head = nose.sub(ears);
        if head.y > 0.0 {
            Some(head.y.abs().atan2(head.x.abs()).to_degrees())
        } else {
            None
        }
    };
    angle().unwrap_or(0.0)
}

/// Torso angle: hip midpoint to shoulder midpoint against vertical.
pub fn torso_lean(landmarks: &[Landmark]) -> f32 {
    let angle = || {
        let shoulders = midpoint_of(landmarks, LEFT_SHOULDER, RIGHT_SHOULDER)?;
        let hips = midpoint_of(landmarks, LEFT_HIP, RIGHT_HIP)?;
        angle_from_vertical(shoulders.sub(hips))
    };
    angle().unwrap_or(0.0)
}

/// Vertical pixel distance between the two shoulders.
pub fn shoulder_asymmetry(landmarks: &[Landmark]) -> f32 {
    match (
        point(landmarks, LEFT_SHOULDER),
        point(landmarks, RIGHT_SHOULDER),
    ) {
        (Some(left), Some(right)) => (left.y - right.y).abs(),
        _ => 0.0,
    }
}
