use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use crate::model::ProgressEvent;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Shared cooperative cancellation flag. Cloning hands out another handle
/// to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` when the
    /// wait was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
        }
    }
}

pub(crate) fn is_cancelled(token: Option<&CancelToken>) -> bool {
    token.is_some_and(CancelToken::is_cancelled)
}

/// Turns "n of total items done" into percentages that never go backwards
/// and are only reported when they change.
#[derive(Debug, Clone)]
pub(crate) struct ProgressTracker {
    total: u64,
    done: u64,
    last_percent: Option<u8>,
}

impl ProgressTracker {
    pub(crate) fn new(total: u64) -> Self {
        Self {
            total,
            done: 0,
            last_percent: None,
        }
    }

    pub(crate) fn advance(&mut self) -> Option<u8> {
        self.done = self.done.saturating_add(1);
        self.current()
    }

    pub(crate) fn finish(&mut self) -> Option<u8> {
        self.done = self.done.max(self.total);
        self.current()
    }

    fn current(&mut self) -> Option<u8> {
        let percent = if self.total == 0 {
            100
        } else {
            (self.done.min(self.total) * 100 / self.total) as u8
        };
        match self.last_percent {
            Some(last) if last >= percent => None,
            _ => {
                self.last_percent = Some(percent);
                Some(percent)
            }
        }
    }
}

pub(crate) fn emit_status<F>(on_event: &mut F, text: impl Into<String>)
where
    F: FnMut(ProgressEvent),
{
    on_event(ProgressEvent::Status { text: text.into() });
}

pub(crate) fn emit_progress<F>(on_event: &mut F, percent: Option<u8>)
where
    F: FnMut(ProgressEvent),
{
    if let Some(percent) = percent {
        on_event(ProgressEvent::Progress { percent });
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{CancelToken, ProgressTracker};

    #[test]
    fn tracker_is_monotonic_and_deduplicated() {
        let mut tracker = ProgressTracker::new(3);
        assert_eq!(tracker.advance(), Some(33));
        assert_eq!(tracker.advance(), Some(66));
        assert_eq!(tracker.advance(), Some(100));
        assert_eq!(tracker.advance(), None);
        assert_eq!(tracker.finish(), None);
    }

    #[test]
    fn empty_tracker_reports_complete_once() {
        let mut tracker = ProgressTracker::new(0);
        assert_eq!(tracker.finish(), Some(100));
        assert_eq!(tracker.finish(), None);
    }

    #[test]
    fn cancelled_sleep_returns_early() {
        let token = CancelToken::new();
        token.cancel();
        let started = Instant::now();
        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
        assert!(!token.sleep(Duration::ZERO));
    }
}
