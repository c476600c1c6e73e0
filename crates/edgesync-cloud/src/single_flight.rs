use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::Arc;

/// Try-enter-else-skip guard for the poll and report loops. Deliberately
/// not a queuing mutex: a busy lock means the caller skips this tick and
/// reschedules, so slow I/O never stacks up waiting iterations.
#[derive(Clone, Debug, Default)]
pub struct SingleFlight {
    held: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire if free. Returns `None` without waiting when already held.
    /// Not reentrant.
    pub fn try_enter(&self) -> Option<SingleFlightGuard> {
        if self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(SingleFlightGuard {
                held: self.held.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the lock on drop, so the release runs on every exit path,
/// panics included.
#[derive(Debug)]
pub struct SingleFlightGuard {
    held: Arc<AtomicBool>,
}

impl Drop for SingleFlightGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}
