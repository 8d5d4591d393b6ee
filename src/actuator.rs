use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::io::Read;
use std::process::{Child, Command, Output, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::AutoLockConfig;
use crate::presence::LockActuator;

const COMMAND_TIMEOUT_MS: u64 = 2000;
const WAIT_STEP: Duration = Duration::from_millis(10);

/// Runs `argv` and waits at most `timeout_ms` for it to finish. A command
/// that overruns is killed and reaped before the error is returned.
pub fn run_command(argv: &[String], timeout_ms: u64) -> Result<Output> {
    let Some((program, args)) = argv.split_first() else {
        bail!("Empty command");
    };
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to execute: {}", program))?;

    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if child.try_wait()?.is_some() {
            return collect(child);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            bail!("Command timeout after {}ms: {}", timeout_ms, program);
        }
        thread::sleep(WAIT_STEP);
    }
}

/// Output of an exited child. The commands used here print a line or two,
/// well below the pipe buffer, so reading after exit cannot stall.
fn collect(mut child: Child) -> Result<Output> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_end(&mut stdout)?;
    }
    if let Some(mut pipe) = child.stderr.take() {
        pipe.read_to_end(&mut stderr)?;
    }
    Ok(Output {
        status: child.wait()?,
        stdout,
        stderr,
    })
}

/// Last known lock state, refreshed off the caller's thread.
#[derive(Debug, Default)]
struct LockCache {
    locked: AtomicBool,
    refreshing: AtomicBool,
    refreshed_at: Mutex<Option<Instant>>,
    /// Bumped whenever the state is set directly, so a query that was
    /// already running cannot overwrite it.
    generation: AtomicU64,
}

impl LockCache {
    fn is_stale(&self, max_age: Duration) -> bool {
        self.refreshed_at
            .lock()
            .map_or(true, |at| at.elapsed() >= max_age)
    }

    fn store(&self, locked: bool, generation: u64) {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.locked.store(locked, Ordering::SeqCst);
            *self.refreshed_at.lock() = Some(Instant::now());
        }
    }

    fn set(&self, locked: bool) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.locked.store(locked, Ordering::SeqCst);
        *self.refreshed_at.lock() = Some(Instant::now());
    }
}

/// Locks the session with external commands. Defaults target systemd-logind.
///
/// `is_locked` answers from a cache and never blocks: when the cached value
/// is older than the poll interval, one background query is started and
/// its result is seen on a later call.
#[derive(Debug, Clone)]
pub struct CommandLockActuator {
    lock: Vec<String>,
    fallback: Vec<String>,
    state: Arc<Vec<String>>,
    locked_output: Arc<str>,
    wake: Vec<String>,
    refresh_every: Duration,
    cache: Arc<LockCache>,
}

impl CommandLockActuator {
    pub fn new(config: &AutoLockConfig) -> Self {
        Self {
            lock: config.lock_command.clone(),
            fallback: config.fallback_lock_command.clone(),
            state: Arc::new(config.lock_state_command.clone()),
            locked_output: Arc::from(config.locked_output.trim()),
            wake: config.wake_command.clone(),
            refresh_every: config.settings().poll_interval,
            cache: Arc::new(LockCache::default()),
        }
    }

    /// Runs the lock-state query now and updates the cache.
    pub fn refresh(&self) -> bool {
        let generation = self.cache.generation.load(Ordering::SeqCst);
        let locked = query_locked(&self.state, &self.locked_output);
        self.cache.store(locked, generation);
        self.cache.locked.load(Ordering::SeqCst)
    }

    fn spawn_refresh(&self) {
        if self.cache.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let state = Arc::clone(&self.state);
        let locked_output = Arc::clone(&self.locked_output);
        let spawned = thread::Builder::new()
            .name("lock-state".into())
            .spawn(move || {
                let generation = cache.generation.load(Ordering::SeqCst);
                let locked = query_locked(&state, &locked_output);
                cache.store(locked, generation);
                cache.refreshing.store(false, Ordering::SeqCst);
            });
        if let Err(e) = spawned {
            self.cache.refreshing.store(false, Ordering::SeqCst);
            tracing::warn!(target: "sentinel::presence", "Failed to query lock state: {}", e);
        }
    }

    fn succeeds(&self, argv: &[String], what: &str) -> bool {
        if argv.is_empty() {
            return false;
        }
        match run_command(argv, COMMAND_TIMEOUT_MS) {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                tracing::warn!(
                    target: "sentinel::presence",
                    "{} command exited with {}: {}",
                    what,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(e) => {
                tracing::warn!(target: "sentinel::presence", "{} command failed: {:#}", what, e);
                false
            }
        }
    }

    fn locked_by(&self, argv: &[String], what: &str) -> bool {
        let locked = self.succeeds(argv, what);
        if locked {
            self.cache.set(true);
        }
        locked
    }
}

fn query_locked(argv: &[String], locked_output: &str) -> bool {
    if argv.is_empty() {
        return false;
    }
    match run_command(argv, COMMAND_TIMEOUT_MS) {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim() == locked_output
        }
        Ok(_) => false,
        Err(e) => {
            tracing::debug!(target: "sentinel::presence", "Lock state query failed: {:#}", e);
            false
        }
    }
}

impl LockActuator for CommandLockActuator {
    fn lock(&self) -> bool {
        self.locked_by(&self.lock, "Lock")
    }

    fn lock_fallback(&self) -> bool {
        self.locked_by(&self.fallback, "Fallback lock")
    }

    fn is_locked(&self) -> bool {
        if self.state.is_empty() {
            return false;
        }
        if self.cache.is_stale(self.refresh_every) {
            self.spawn_refresh();
        }
        self.cache.locked.load(Ordering::SeqCst)
    }

    fn wake(&self) {
        if !self.wake.is_empty() {
            self.succeeds(&self.wake, "Wake");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingSink;
    use crate::presence::{AutoLockSettings, PresenceLockTimer};

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn actuator(state: &[&str], locked_output: &str) -> CommandLockActuator {
        CommandLockActuator::new(&AutoLockConfig {
            lock_command: argv(&["false"]),
            fallback_lock_command: argv(&["true"]),
            lock_state_command: argv(state),
            locked_output: locked_output.to_string(),
            wake_command: Vec::new(),
            ..AutoLockConfig::default()
        })
    }

    #[test]
    fn empty_command_is_an_error() {
        assert!(run_command(&[], 100).is_err());
    }

    #[test]
    fn overrunning_command_is_killed() {
        let started = Instant::now();
        let err = run_command(&argv(&["sleep", "5"]), 100).unwrap_err();
        assert!(err.to_string().contains("timeout"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn exit_status_decides_lock_success() {
        let actuator = actuator(&[], "yes");
        assert!(!actuator.lock());
        assert!(actuator.lock_fallback());
        assert!(!actuator.is_locked());
        actuator.wake();
    }

    #[test]
    fn successful_lock_is_cached() {
        let actuator = actuator(&["echo", "no"], "yes");
        assert!(!actuator.refresh());
        assert!(actuator.lock_fallback());
        assert!(actuator.is_locked());
    }

    #[test]
    fn lock_state_compares_trimmed_output() {
        assert!(actuator(&["echo", "yes"], " yes\n").refresh());
        assert!(!actuator(&["echo", "no"], "yes").refresh());
    }

    #[test]
    fn lock_state_is_picked_up_in_the_background() {
        let actuator = actuator(&["echo", "yes"], "yes");
        let deadline = Instant::now() + Duration::from_secs(2);
        while !actuator.is_locked() {
            assert!(Instant::now() < deadline, "lock state never refreshed");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn missing_program_is_not_locked() {
        let actuator = actuator(&["definitely-not-a-real-binary-xyz"], "yes");
        assert!(!actuator.refresh());
        assert!(!actuator.is_locked());
    }

    #[test]
    fn slow_state_query_does_not_stall_presence_updates() {
        let timer = PresenceLockTimer::new(
            Arc::new(actuator(&["sleep", "0.2"], "yes")),
            Arc::new(RecordingSink::default()),
            AutoLockSettings::default(),
            true,
        );
        let started = Instant::now();
        for _ in 0..15 {
            timer.update_presence(true);
        }
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(150), "took {:?}", elapsed);
        assert!(!timer.status().pc_locked);
    }
}
