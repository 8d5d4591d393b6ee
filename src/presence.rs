//! Absence-triggered workstation lock.
//!
//! [`PresenceLockTimer`] is fed one presence boolean per frame. When the
//! person stays away for `absent_threshold` it asks for an acknowledgment
//! and, if nobody answers within `lock_timeout`, locks the workstation
//! through a [`LockActuator`]. The countdown runs on its own thread; every
//! piece of shared state sits behind one mutex and a timer is cancelled by
//! bumping an epoch counter under that mutex.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::notify::NotificationSink;

/// Performs the platform lock. Everything except `wake` runs with the
/// timer's state lock held: `is_locked` is polled several times a second
/// and must not block, and the lock calls must give up after a bounded wait.
pub trait LockActuator: Send + Sync {
    fn lock(&self) -> bool;
    fn lock_fallback(&self) -> bool;
    fn is_locked(&self) -> bool;
    fn wake(&self);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoLockSettings {
    pub absent_threshold: Duration,
    pub lock_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for AutoLockSettings {
    fn default() -> Self {
        Self {
            absent_threshold: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresencePhase {
    Disabled,
    Present,
    /// Absence timer running, no prompt yet.
    AbsentWaiting,
    /// Prompt shown, countdown running.
    AwaitingAck,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckResponse {
    Present,
    LockNow,
    Disable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceStatus {
    pub enabled: bool,
    pub phase: PresencePhase,
    pub person_present: bool,
    pub last_person_seen: Instant,
    pub lock_timer_active: bool,
    pub notification_shown: bool,
    pub pc_locked: bool,
    pub absent_threshold: Duration,
    pub lock_timeout: Duration,
}

struct State {
    enabled: bool,
    phase: PresencePhase,
    person_present: bool,
    last_person_seen: Instant,
    absent_since: Instant,
    countdown_started: Instant,
    /// Whole seconds of countdown already announced.
    announced: u64,
    notification_shown: bool,
    pc_locked: bool,
    epoch: u64,
    settings: AutoLockSettings,
}

impl State {
    fn resting_phase(&self) -> PresencePhase {
        if !self.enabled {
            PresencePhase::Disabled
        } else if self.pc_locked {
            PresencePhase::Locked
        } else {
            PresencePhase::Present
        }
    }

    fn timing(&self) -> bool {
        matches!(
            self.phase,
            PresencePhase::AbsentWaiting | PresencePhase::AwaitingAck
        )
    }
}

struct Shared {
    state: Mutex<State>,
    actuator: Arc<dyn LockActuator>,
    sink: Arc<dyn NotificationSink>,
}

struct Worker {
    epoch: u64,
    handle: JoinHandle<()>,
}

pub struct PresenceLockTimer {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    spawned: AtomicUsize,
}

fn whole_secs(duration: Duration) -> u64 {
    duration.as_secs_f64().ceil() as u64
}

impl Shared {
    /// Invalidates any running timer and closes the prompt. The caller
    /// picks the next phase.
    fn cancel(&self, state: &mut State) {
        state.epoch += 1;
        if state.notification_shown {
            state.notification_shown = false;
            self.sink.on_acknowledgment_dismissed();
        }
    }

    /// Brings the lock belief in line with the actuator.
    fn reconcile(&self, state: &mut State) {
        let locked = self.actuator.is_locked();
        if locked && !state.pc_locked {
            info!(target: "sentinel::presence", "Workstation locked externally");
            state.pc_locked = true;
            if state.timing() {
                self.cancel(state);
            }
            state.phase = state.resting_phase();
        } else if !locked && state.pc_locked {
            info!(target: "sentinel::presence", "Workstation unlocked");
            state.pc_locked = false;
            state.phase = state.resting_phase();
        }
    }

    /// Moves Present to AbsentWaiting when the person is away and returns
    /// the epoch the new timer must carry.
    fn arm(&self, state: &mut State, now: Instant) -> Option<u64> {
        if !state.enabled
            || state.phase != PresencePhase::Present
            || state.pc_locked
            || state.person_present
        {
            return None;
        }
        state.epoch += 1;
        state.phase = PresencePhase::AbsentWaiting;
        state.absent_since = now;
        state.announced = 0;
        debug!(
            target: "sentinel::presence",
            "Absence timer armed ({:?} threshold)",
            state.settings.absent_threshold
        );
        Some(state.epoch)
    }

    fn lock(&self, state: &mut State) {
        let locked = if self.actuator.lock() {
            true
        } else {
            warn!(target: "sentinel::presence", "Lock command failed, trying fallback");
            self.actuator.lock_fallback()
        };

        if locked {
            info!(target: "sentinel::presence", "Workstation locked");
        } else {
            error!(target: "sentinel::presence", "Failed to lock the workstation");
        }
        state.pc_locked = locked;
        state.phase = state.resting_phase();
    }

    fn run(&self, epoch: u64) {
        loop {
            let interval = self.state.lock().settings.poll_interval;
            thread::sleep(interval);
            if !self.tick(epoch) {
                break;
            }
        }
        debug!(target: "sentinel::presence", "Absence timer {} finished", epoch);
    }

    /// One poll of the timer. Returns false once the timer is done.
    fn tick(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return false;
        }
        self.reconcile(&mut state);
        if state.epoch != epoch {
            return false;
        }

        let now = Instant::now();
        match state.phase {
            PresencePhase::AbsentWaiting => {
                if now.duration_since(state.absent_since) >= state.settings.absent_threshold {
                    let seconds = whole_secs(state.settings.lock_timeout);
                    info!(
                        target: "sentinel::presence",
                        "Person absent for {:?}, locking in {}s unless acknowledged",
                        state.settings.absent_threshold,
                        seconds
                    );
                    state.phase = PresencePhase::AwaitingAck;
                    state.countdown_started = now;
                    state.announced = 0;
                    state.notification_shown = true;
                    self.sink.on_acknowledgment_request(seconds);
                }
                true
            }
            PresencePhase::AwaitingAck => {
                let elapsed = now.duration_since(state.countdown_started);
                if elapsed < state.settings.lock_timeout {
                    let ticked = elapsed.as_secs();
                    if ticked > state.announced {
                        state.announced = ticked;
                        let total = whole_secs(state.settings.lock_timeout);
                        self.sink.on_countdown(total.saturating_sub(ticked));
                    }
                    return true;
                }
                // Presence may have returned while this tick waited for the lock.
                if state.person_present {
                    return false;
                }
                info!(target: "sentinel::presence", "No acknowledgment received");
                self.cancel(&mut state);
                self.lock(&mut state);
                false
            }
            PresencePhase::Disabled | PresencePhase::Present | PresencePhase::Locked => false,
        }
    }
}

impl PresenceLockTimer {
    pub fn new(
        actuator: Arc<dyn LockActuator>,
        sink: Arc<dyn NotificationSink>,
        settings: AutoLockSettings,
        enabled: bool,
    ) -> Self {
        let now = Instant::now();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                enabled,
                phase: if enabled {
                    PresencePhase::Present
                } else {
                    PresencePhase::Disabled
                },
                person_present: true,
                last_person_seen: now,
                absent_since: now,
                countdown_started: now,
                announced: 0,
                notification_shown: false,
                pc_locked: false,
                epoch: 0,
                settings,
            }),
            actuator,
            sink,
        });
        {
            let mut state = shared.state.lock();
            shared.reconcile(&mut state);
        }
        Self {
            shared,
            worker: Mutex::new(None),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Feeds one presence reading.
    pub fn update_presence(&self, present: bool) {
        let now = Instant::now();
        let mut returned = false;
        let armed = {
            let mut state = self.shared.state.lock();
            self.shared.reconcile(&mut state);

            if present {
                state.last_person_seen = now;
                if !state.person_present {
                    state.person_present = true;
                    returned = true;
                    info!(target: "sentinel::presence", "Person returned to desk");
                }
                if state.timing() {
                    self.shared.cancel(&mut state);
                    state.phase = state.resting_phase();
                }
                None
            } else {
                if state.person_present {
                    state.person_present = false;
                    debug!(target: "sentinel::presence", "Person left the desk");
                }
                self.shared.arm(&mut state, now)
            }
        };

        if returned {
            self.shared.actuator.wake();
        }
        if let Some(epoch) = armed {
            self.start_timer(epoch);
        }
    }

    pub fn acknowledge(&self, response: AckResponse) {
        match response {
            AckResponse::Present => {
                let mut state = self.shared.state.lock();
                if state.timing() {
                    info!(target: "sentinel::presence", "Presence acknowledged");
                    self.shared.cancel(&mut state);
                    state.phase = state.resting_phase();
                }
            }
            AckResponse::LockNow => {
                let mut state = self.shared.state.lock();
                info!(target: "sentinel::presence", "Immediate lock requested");
                self.shared.cancel(&mut state);
                self.shared.lock(&mut state);
            }
            AckResponse::Disable => self.set_enabled(false),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        let armed = {
            let mut state = self.shared.state.lock();
            if state.enabled == enabled {
                return;
            }
            info!(
                target: "sentinel::presence",
                "Auto-lock {}",
                if enabled { "enabled" } else { "disabled" }
            );
            state.enabled = enabled;
            if state.timing() {
                self.shared.cancel(&mut state);
            }
            self.shared.reconcile(&mut state);
            state.phase = state.resting_phase();
            self.shared.arm(&mut state, Instant::now())
        };
        if let Some(epoch) = armed {
            self.start_timer(epoch);
        }
    }

    /// Floored at one second.
    pub fn set_absent_threshold(&self, threshold: Duration) {
        self.shared.state.lock().settings.absent_threshold = threshold.max(Duration::from_secs(1));
    }

    /// Floored at five seconds.
    pub fn set_lock_timeout(&self, timeout: Duration) {
        self.shared.state.lock().settings.lock_timeout = timeout.max(Duration::from_secs(5));
    }

    pub fn status(&self) -> PresenceStatus {
        let state = self.shared.state.lock();
        PresenceStatus {
            enabled: state.enabled,
            phase: state.phase,
            person_present: state.person_present,
            last_person_seen: state.last_person_seen,
            lock_timer_active: state.timing(),
            notification_shown: state.notification_shown,
            pc_locked: state.pc_locked,
            absent_threshold: state.settings.absent_threshold,
            lock_timeout: state.settings.lock_timeout,
        }
    }

    pub fn phase(&self) -> PresencePhase {
        self.shared.state.lock().phase
    }

    /// Number of timer threads started so far.
    pub fn timer_spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn start_timer(&self, epoch: u64) {
        let mut slot = self.worker.lock();

        if let Some(worker) = slot.as_ref() {
            if worker.epoch >= epoch && !worker.handle.is_finished() {
                return;
            }
        }
        if self.shared.state.lock().epoch != epoch {
            // Cancelled before it got here.
            return;
        }
        if let Some(stale) = slot.take() {
            if stale.handle.join().is_err() {
                error!(target: "sentinel::presence", "Absence timer {} panicked", stale.epoch);
            }
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("presence-timer".to_string())
            .spawn(move || shared.run(epoch));
        match spawned {
            Ok(handle) => {
                self.spawned.fetch_add(1, Ordering::SeqCst);
                *slot = Some(Worker { epoch, handle });
            }
            Err(e) => {
                error!(target: "sentinel::presence", "Failed to start absence timer: {}", e);
                let mut state = self.shared.state.lock();
                if state.epoch == epoch {
                    state.epoch += 1;
                    state.phase = state.resting_phase();
                }
            }
        }
    }
}

impl Drop for PresenceLockTimer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            self.shared.cancel(&mut state);
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::{Note, RecordingSink};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct MockActuator {
        locked: AtomicBool,
        lock_fails: AtomicBool,
        fallback_fails: AtomicBool,
        lock_calls: AtomicUsize,
        fallback_calls: AtomicUsize,
        wake_calls: AtomicUsize,
        /// Mirrors what the test last reported; a lock while it is set is a bug.
        reported_present: AtomicBool,
        locked_while_present: AtomicUsize,
    }

    impl LockActuator for MockActuator {
        fn lock(&self) -> bool {
            self.lock_calls.fetch_add(1, Ordering::SeqCst);
            if self.reported_present.load(Ordering::SeqCst) {
                self.locked_while_present.fetch_add(1, Ordering::SeqCst);
            }
            if self.lock_fails.load(Ordering::SeqCst) {
                return false;
            }
            self.locked.store(true, Ordering::SeqCst);
            true
        }

        fn lock_fallback(&self) -> bool {
            self.fallback_calls.fetch_add(1, Ordering::SeqCst);
            if self.fallback_fails.load(Ordering::SeqCst) {
                return false;
            }
            self.locked.store(true, Ordering::SeqCst);
            true
        }

        fn is_locked(&self) -> bool {
            self.locked.load(Ordering::SeqCst)
        }

        fn wake(&self) {
            self.wake_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings(threshold_ms: u64, timeout_ms: u64) -> AutoLockSettings {
        AutoLockSettings {
            absent_threshold: Duration::from_millis(threshold_ms),
            lock_timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn timer(
        settings: AutoLockSettings,
    ) -> (PresenceLockTimer, Arc<MockActuator>, Arc<RecordingSink>) {
        let actuator = Arc::new(MockActuator::default());
        let sink = Arc::new(RecordingSink::default());
        let timer = PresenceLockTimer::new(actuator.clone(), sink.clone(), settings, true);
        (timer, actuator, sink)
    }

    fn wait_for(timer: &PresenceLockTimer, phase: PresencePhase) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if timer.phase() == phase {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn sustained_absence_prompts_then_locks() {
        let (timer, actuator, sink) = timer(settings(30, 200));
        timer.update_presence(false);
        assert_eq!(timer.phase(), PresencePhase::AbsentWaiting);

        assert!(wait_for(&timer, PresencePhase::Locked));
        let status = timer.status();
        assert!(status.pc_locked);
        assert!(!status.lock_timer_active);
        assert!(!status.notification_shown);
        assert_eq!(actuator.lock_calls.load(Ordering::SeqCst), 1);
        assert_eq!(actuator.fallback_calls.load(Ordering::SeqCst), 0);
        assert_eq!(sink.notes(), vec![Note::Request(1), Note::Dismissed]);
    }

    #[test]
    fn return_before_threshold_cancels_silently() {
        let (timer, actuator, sink) = timer(settings(150, 5_000));
        timer.update_presence(false);
        timer.update_presence(true);
        assert_eq!(timer.phase(), PresencePhase::Present);

        thread::sleep(Duration::from_millis(300));
        assert_eq!(timer.phase(), PresencePhase::Present);
        assert!(sink.notes().is_empty());
        assert_eq!(actuator.lock_calls.load(Ordering::SeqCst), 0);
        assert_eq!(actuator.wake_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn presence_during_countdown_wins() {
        let (timer, actuator, sink) = timer(settings(10, 5_000));
        timer.update_presence(false);
        assert!(wait_for(&timer, PresencePhase::AwaitingAck));

        timer.update_presence(true);
        assert_eq!(timer.phase(), PresencePhase::Present);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(actuator.lock_calls.load(Ordering::SeqCst), 0);
        assert_eq!(sink.notes(), vec![Note::Request(5), Note::Dismissed]);
    }

    #[test]
    fn countdown_announces_each_second() {
        let (timer, _actuator, sink) = timer(settings(10, 2_300));
        timer.update_presence(false);
        assert!(wait_for(&timer, PresencePhase::Locked));

        let countdown: Vec<_> = sink
            .notes()
            .into_iter()
            .filter(|n| matches!(n, Note::Countdown(_)))
            .collect();
        assert_eq!(countdown, vec![Note::Countdown(2), Note::Countdown(1)]);
    }

    #[test]
    fn repeated_absent_readings_start_one_timer() {
        let (timer, _actuator, _sink) = timer(settings(1_000, 5_000));
        for _ in 0..20 {
            timer.update_presence(false);
        }
        assert_eq!(timer.timer_spawn_count(), 1);
        assert_eq!(timer.phase(), PresencePhase::AbsentWaiting);
    }

    #[test]
    fn leave_return_cycles_do_not_leak_timers() {
        let (timer, actuator, _sink) = timer(settings(1_000, 5_000));
        for _ in 0..10 {
            timer.update_presence(false);
            timer.update_presence(true);
        }
        assert_eq!(timer.timer_spawn_count(), 10);
        assert_eq!(timer.phase(), PresencePhase::Present);
        assert_eq!(actuator.wake_calls.load(Ordering::SeqCst), 10);

        let worker = timer.worker.lock().take();
        if let Some(worker) = worker {
            worker.handle.join().unwrap();
        }
    }

    #[test]
    fn external_lock_cancels_timer() {
        let (timer, actuator, sink) = timer(settings(10, 5_000));
        timer.update_presence(false);
        assert!(wait_for(&timer, PresencePhase::AwaitingAck));

        actuator.locked.store(true, Ordering::SeqCst);
        assert!(wait_for(&timer, PresencePhase::Locked));
        assert!(timer.status().pc_locked);
        assert_eq!(actuator.lock_calls.load(Ordering::SeqCst), 0);
        assert_eq!(sink.notes().last(), Some(&Note::Dismissed));
    }

    #[test]
    fn external_unlock_resets_belief() {
        let (timer, actuator, _sink) = timer(settings(10, 100));
        timer.update_presence(false);
        assert!(wait_for(&timer, PresencePhase::Locked));

        // Still locked: a returning person is noticed but the belief holds.
        timer.update_presence(true);
        assert_eq!(timer.phase(), PresencePhase::Locked);
        assert_eq!(actuator.wake_calls.load(Ordering::SeqCst), 1);

        actuator.locked.store(false, Ordering::SeqCst);
        timer.update_presence(true);
        let status = timer.status();
        assert_eq!(status.phase, PresencePhase::Present);
        assert!(!status.pc_locked);
        assert_eq!(actuator.wake_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn acknowledgment_paths() {
        let (timer, actuator, sink) = timer(settings(10, 5_000));

        timer.update_presence(false);
        assert!(wait_for(&timer, PresencePhase::AwaitingAck));
        timer.acknowledge(AckResponse::Present);
        assert_eq!(timer.phase(), PresencePhase::Present);
        assert_eq!(sink.count(|n| *n == Note::Dismissed), 1);

        timer.acknowledge(AckResponse::LockNow);
        assert_eq!(timer.phase(), PresencePhase::Locked);
        assert_eq!(actuator.lock_calls.load(Ordering::SeqCst), 1);

        actuator.locked.store(false, Ordering::SeqCst);
        timer.acknowledge(AckResponse::Disable);
        let status = timer.status();
        assert!(!status.enabled);
        assert_eq!(status.phase, PresencePhase::Disabled);
        assert!(!status.pc_locked);
    }

    #[test]
    fn disabled_timer_ignores_absence() {
        let (timer, actuator, _sink) = timer(settings(500, 5_000));
        timer.set_enabled(false);
        timer.update_presence(false);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(timer.phase(), PresencePhase::Disabled);
        assert_eq!(timer.timer_spawn_count(), 0);
        assert_eq!(actuator.lock_calls.load(Ordering::SeqCst), 0);

        // Re-enabling while away starts the timer.
        timer.set_enabled(true);
        assert_eq!(timer.phase(), PresencePhase::AbsentWaiting);
        assert_eq!(timer.timer_spawn_count(), 1);
    }

    #[test]
    fn disable_during_countdown_dismisses() {
        let (timer, actuator, sink) = timer(settings(10, 5_000));
        timer.update_presence(false);
        assert!(wait_for(&timer, PresencePhase::AwaitingAck));

        timer.set_enabled(false);
        assert_eq!(timer.phase(), PresencePhase::Disabled);
        assert_eq!(sink.notes().last(), Some(&Note::Dismissed));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(actuator.lock_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_lock_uses_fallback() {
        let (timer, actuator, _sink) = timer(settings(10, 50));
        actuator.lock_fails.store(true, Ordering::SeqCst);
        timer.update_presence(false);
        assert!(wait_for(&timer, PresencePhase::Locked));
        assert_eq!(actuator.fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_lock_and_fallback_keep_belief_unlocked() {
        let (timer, actuator, _sink) = timer(settings(10, 50));
        actuator.lock_fails.store(true, Ordering::SeqCst);
        actuator.fallback_fails.store(true, Ordering::SeqCst);
        timer.update_presence(false);

        let deadline = Instant::now() + Duration::from_secs(5);
        while actuator.fallback_calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(wait_for(&timer, PresencePhase::Present));
        assert!(!timer.status().pc_locked);
    }

    #[test]
    fn settings_are_floored() {
        let (timer, _actuator, _sink) = timer(settings(10, 50));
        timer.set_absent_threshold(Duration::from_millis(200));
        timer.set_lock_timeout(Duration::from_secs(2));
        let status = timer.status();
        assert_eq!(status.absent_threshold, Duration::from_secs(1));
        assert_eq!(status.lock_timeout, Duration::from_secs(5));
    }

    #[test]
    fn presence_never_loses_to_the_countdown() {
        let mut rng = StdRng::seed_from_u64(0x5e57);
        let (timer, actuator, _sink) = timer(settings(2, 8));

        for _ in 0..300 {
            let present = rng.gen_bool(0.5);
            if present {
                timer.update_presence(true);
                actuator.reported_present.store(true, Ordering::SeqCst);
            } else {
                actuator.reported_present.store(false, Ordering::SeqCst);
                timer.update_presence(false);
            }

            let status = timer.status();
            assert!(!(status.pc_locked && status.lock_timer_active));

            if status.pc_locked && rng.gen_bool(0.3) {
                actuator.locked.store(false, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(rng.gen_range(0..6)));
        }

        assert_eq!(actuator.locked_while_present.load(Ordering::SeqCst), 0);
    }
}
