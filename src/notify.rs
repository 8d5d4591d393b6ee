use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::session::PostureWarning;

/// Receives user-facing signals. Calls are fire-and-forget and may arrive
/// from the lock timer thread while it holds its state lock, so an
/// implementation must not call back into the timer.
pub trait NotificationSink: Send + Sync {
    fn on_warning(&self, warning: &PostureWarning);

    /// The person has been absent long enough; ask them to confirm presence
    /// within `seconds` before the workstation locks.
    fn on_acknowledgment_request(&self, seconds: u64);

    fn on_countdown(&self, seconds_remaining: u64);

    fn on_acknowledgment_dismissed(&self);
}

/// Writes every notification to the log.
#[derive(Debug, Default)]
pub struct LogNotifier {
    prompt_open: AtomicBool,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationSink for LogNotifier {
    fn on_warning(&self, warning: &PostureWarning) {
        warn!(target: "sentinel::notify", "{}", warning.message);
    }

    fn on_acknowledgment_request(&self, seconds: u64) {
        self.prompt_open.store(true, Ordering::SeqCst);
        warn!(
            target: "sentinel::notify",
            "Are you still there? Locking in {}s unless you return", seconds
        );
    }

    fn on_countdown(&self, seconds_remaining: u64) {
        info!(target: "sentinel::notify", "Locking in {}s", seconds_remaining);
    }

    fn on_acknowledgment_dismissed(&self) {
        if self.prompt_open.swap(false, Ordering::SeqCst) {
            info!(target: "sentinel::notify", "Lock prompt dismissed");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dismiss_only_closes_an_open_prompt() {
        let notifier = LogNotifier::new();
        notifier.on_acknowledgment_dismissed();
        assert!(!notifier.prompt_open.load(Ordering::SeqCst));

        notifier.on_acknowledgment_request(30);
        assert!(notifier.prompt_open.load(Ordering::SeqCst));
        notifier.on_acknowledgment_dismissed();
        assert!(!notifier.prompt_open.load(Ordering::SeqCst));
    }
}
