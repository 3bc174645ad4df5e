//! Synchronization primitives for gion.
//!
//! [`Semaphore`] bounds how many git processes run at once. [`CancelToken`]
//! is the cancellation signal threaded through every git invocation and every
//! blocking wait: cancelling it kills in-flight commands and wakes waiters.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

/// A counting semaphore for limiting concurrency.
///
/// Used to prevent resource exhaustion when many parallel operations need
/// to run. Provides RAII-based permit management through [`SemaphoreGuard`].
#[derive(Clone)]
pub struct Semaphore {
    state: Arc<(Mutex<usize>, Condvar)>,
}

/// RAII guard that releases a semaphore permit on drop.
pub struct SemaphoreGuard {
    state: Arc<(Mutex<usize>, Condvar)>,
}

impl Semaphore {
    /// Create a new semaphore with the given number of permits.
    pub fn new(permits: usize) -> Self {
        Self {
            state: Arc::new((Mutex::new(permits.max(1)), Condvar::new())),
        }
    }

    /// Acquire a permit, blocking until one is available.
    pub fn acquire(&self) -> SemaphoreGuard {
        let (lock, cvar) = &*self.state;
        let mut available = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while *available == 0 {
            available = cvar
                .wait(available)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *available -= 1;

        SemaphoreGuard {
            state: Arc::clone(&self.state),
        }
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.state;
        let mut available = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *available += 1;
        cvar.notify_one();
    }
}

/// Why a [`CancelToken`] stopped allowing work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// `cancel()` was called.
    Cancelled,
    /// The token's deadline passed.
    DeadlineExceeded,
}

/// Caller-supplied cancellation signal with an optional deadline.
///
/// The signal is a channel that never carries a message: cancelling drops the
/// only sender, so every receiver observes a disconnect at once. That lets
/// waiters `select!` on cancellation alongside any other channel.
///
/// Tokens derived with [`CancelToken::with_timeout`] share the parent's
/// cancellation signal but carry their own, tighter deadline; the deadline
/// never propagates back to the parent.
#[derive(Clone)]
pub struct CancelToken {
    signal: Arc<CancelSignal>,
    deadline: Option<Instant>,
}

struct CancelSignal {
    trigger: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            signal: Arc::new(CancelSignal {
                trigger: Mutex::new(Some(tx)),
                done: rx,
            }),
            deadline: None,
        }
    }

    /// Derive a token that additionally expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            signal: Arc::clone(&self.signal),
            deadline: Some(deadline),
        }
    }

    /// Cancel every holder of this token (and of tokens derived from it).
    pub fn cancel(&self) {
        let mut trigger = self
            .signal
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        trigger.take();
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.signal.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the reason work must stop, if any.
    pub fn interrupted(&self) -> Option<Interrupt> {
        if self.is_cancelled() {
            return Some(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupt::DeadlineExceeded),
            _ => None,
        }
    }

    /// Channel that disconnects when the token is cancelled.
    pub fn done(&self) -> &Receiver<()> {
        &self.signal.done
    }

    /// Channel that fires at the deadline, or never when there is none.
    pub fn expired(&self) -> Receiver<Instant> {
        match self.deadline {
            Some(deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        }
    }
}
