//! When monitoring should run at all.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ActivityConfig;

pub trait ActivityPolicy: Send + Sync {
    fn is_active(&self, now: DateTime<Utc>) -> bool;
}

/// Reports whether the machine runs on mains power. `None` when it cannot
/// tell, e.g. a desktop without a battery.
pub trait PowerSource: Send + Sync {
    fn on_ac_power(&self) -> Option<bool>;
}

const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

/// Reads `/sys/class/power_supply/*/{type,online}`.
#[derive(Debug, Clone)]
pub struct SysfsPower {
    root: PathBuf,
}

impl Default for SysfsPower {
    fn default() -> Self {
        Self::new(POWER_SUPPLY_ROOT)
    }
}

impl SysfsPower {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PowerSource for SysfsPower {
    fn on_ac_power(&self) -> Option<bool> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(
                    target: "sentinel::activity",
                    "Power supply info unavailable at {}: {}",
                    self.root.display(),
                    e
                );
                return None;
            }
        };

        let mut has_battery = false;
        for entry in entries.flatten() {
            let dir = entry.path();
            let kind = fs::read_to_string(dir.join("type")).unwrap_or_default();
            match kind.trim() {
                "Battery" => has_battery = true,
                "Mains" | "USB" | "USB_C" | "USB_PD" => {
                    let online = fs::read_to_string(dir.join("online")).unwrap_or_default();
                    if online.trim() == "1" {
                        return Some(true);
                    }
                }
                _ => {}
            }
        }
        has_battery.then_some(false)
    }
}

/// Work hours, a manual pause, and optionally mains power.
pub struct WorkSchedule {
    start_hour: u32,
    /// Inclusive.
    end_hour: u32,
    require_ac_power: bool,
    power: Box<dyn PowerSource>,
    disabled_until: Mutex<Option<DateTime<Utc>>>,
}

impl WorkSchedule {
    pub fn new(config: &ActivityConfig, power: Box<dyn PowerSource>) -> Self {
        Self {
            start_hour: config.work_start_hour,
            end_hour: config.work_end_hour,
            require_ac_power: config.require_ac_power,
            power,
            disabled_until: Mutex::new(None),
        }
    }

    /// Pauses monitoring for `minutes` starting at `now`.
    pub fn disable_for(&self, minutes: u32, now: DateTime<Utc>) {
        let until = now + ChronoDuration::minutes(i64::from(minutes));
        info!(
            target: "sentinel::activity",
            "Posture monitoring disabled for {} minutes",
            minutes
        );
        *self.disabled_until.lock() = Some(until);
    }

    pub fn resume(&self) {
        *self.disabled_until.lock() = None;
    }

    pub fn disabled_until(&self) -> Option<DateTime<Utc>> {
        *self.disabled_until.lock()
    }

    fn within_hours(&self, hour: u32) -> bool {
        (self.start_hour..=self.end_hour).contains(&hour)
    }

    fn powered(&self) -> bool {
        !self.require_ac_power || self.power.on_ac_power().unwrap_or(true)
    }
}

impl ActivityPolicy for WorkSchedule {
    fn is_active(&self, now: DateTime<Utc>) -> bool {
        if !self.within_hours(now.with_timezone(&Local).hour()) {
            return false;
        }
        {
            let mut until = self.disabled_until.lock();
            match *until {
                Some(t) if now < t => return false,
                Some(_) => *until = None,
                None => {}
            }
        }
        self.powered()
    }
}

/// Always active; used when the schedule is managed elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysActive;

impl ActivityPolicy for AlwaysActive {
    fn is_active(&self, _now: DateTime<Utc>) -> bool {
        true
    }
}
