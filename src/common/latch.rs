// Latch: the per-process wakeup primitive.
//
// A latch is a single-consumer, multi-producer event flag. `set` is sticky
// until the owner calls `reset`, so a set that races a concurrent wait is
// never lost. The required usage on the consumer side is:
//
// 1. `reset()`
// 2. re-check the shared condition
// 3. `wait()` only if the condition still does not hold
//
// Checking before resetting can miss a wakeup; this module cannot enforce
// the idiom, only make it cheap.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of a bounded latch wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchWait {
    /// The latch was set (either before or during the wait).
    Set,
    /// The timeout elapsed with the latch still unset.
    TimedOut,
}

/// A sticky wakeup flag with condvar-based blocking.
///
/// One owner waits; any number of producers set. `set` while nobody is
/// waiting leaves the flag raised, so the next `wait` returns immediately.
pub struct Latch {
    set: Mutex<bool>,
    cvar: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    /// Raises the latch and wakes the owner if it is blocked.
    pub fn set(&self) {
        let mut raised = self.set.lock();
        *raised = true;
        self.cvar.notify_one();
    }

    /// Lowers the latch. Only the owning process may call this.
    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Blocks until the latch is set or `timeout` elapses.
    ///
    /// Returns promptly if the latch is already set. Spurious condvar
    /// wakeups are absorbed internally.
    pub fn wait(&self, timeout: Duration) -> LatchWait {
        let deadline = Instant::now() + timeout;
        let mut raised = self.set.lock();
        while !*raised {
            if self.cvar.wait_until(&mut raised, deadline).timed_out() {
                return if *raised { LatchWait::Set } else { LatchWait::TimedOut };
            }
        }
        LatchWait::Set
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("set", &self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_set_before_wait_is_not_lost() {
        let latch = Latch::new();
        latch.set();
        assert_eq!(latch.wait(Duration::from_millis(1)), LatchWait::Set);
    }

    #[test]
    fn test_wait_times_out_when_unset() {
        let latch = Latch::new();
        assert_eq!(latch.wait(Duration::from_millis(5)), LatchWait::TimedOut);
    }

    #[test]
    fn test_reset_clears_the_flag() {
        let latch = Latch::new();
        latch.set();
        latch.reset();
        assert!(!latch.is_set());
        assert_eq!(latch.wait(Duration::from_millis(5)), LatchWait::TimedOut);
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let latch = Arc::new(Latch::new());
        let setter = Arc::clone(&latch);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            setter.set();
        });
        assert_eq!(latch.wait(Duration::from_secs(5)), LatchWait::Set);
        handle.join().unwrap();
    }
}
