use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Process-wide stop request shared by supervisor threads and async tasks.
///
/// Threads block on the condition variable with a bounded timeout, async tasks
/// await the cancellation token. Both are triggered by a single `cancel`.
#[derive(Debug, Clone)]
pub struct SignalOfStop {
    // Shared state between clones
    shared: Arc<SharedState>,
}

#[derive(Debug)]
struct SharedState {
    closing: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
    token: CancellationToken,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            shared: Arc::new(SharedState {
                closing: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.token.cancel();

        // Lock briefly to synchronize with waiting threads
        let _guard = self
            .shared
            .mutex
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.shared.condvar.notify_all();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    /// Token for async contexts, cancelled together with the flag.
    pub fn token(&self) -> CancellationToken {
        self.shared.token.clone()
    }

    /// Block for at most `timeout`. Returns `true` if stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self
            .shared
            .mutex
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while !self.cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (next, _) = self
                .shared
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
        }

        self.cancelled()
    }
}

impl Default for SignalOfStop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_times_out_without_cancel() {
        let sos = SignalOfStop::new();
        let started = Instant::now();
        assert!(!sos.wait_timeout(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let sos = SignalOfStop::new();
        let waiter = sos.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(20));
        sos.cancel();

        assert!(handle.join().unwrap());
        assert!(sos.token().is_cancelled());
    }
}
