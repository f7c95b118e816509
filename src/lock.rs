//! Mutual-exclusion primitives for flash requests and shared firmware calls.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::Error;

/// A binary lock with both blocking and non-blocking acquisition.
///
/// Two independent instances guard the driver: a request lock serializing
/// whole read/write/erase requests, and an API lock serializing individual
/// calls into the controller firmware (which is shared with unrelated
/// subsystems such as radio control). The non-blocking [`try_acquire`] is the
/// form safe to use from interrupt context.
///
/// The lock is not owner-tracked: acquiring an already-held lock blocks until
/// some other context releases it, which the driver relies on to wait for
/// operation completion.
///
/// [`try_acquire`]: RawLock::try_acquire
pub trait RawLock {
    /// An unlocked instance, for static or const initialization.
    const INIT: Self;

    /// Acquires the lock, waiting indefinitely for it to become available.
    fn acquire(&self);

    /// Attempts to acquire the lock without waiting.
    ///
    /// Returns [`Error::EBUSY`] if the lock is held.
    fn try_acquire(&self) -> Result<(), Error>;

    /// Releases the lock. Must only be called after a successful acquisition.
    fn release(&self);
}

/// A spinning [`RawLock`] for multi-threaded configurations.
pub struct AtomicLock {
    held: AtomicBool,
}

impl RawLock for AtomicLock {
    const INIT: Self = AtomicLock {
        held: AtomicBool::new(false),
    };

    fn acquire(&self) {
        while self.try_acquire().is_err() {
            core::hint::spin_loop();
        }
    }

    fn try_acquire(&self) -> Result<(), Error> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::EBUSY)
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// A [`RawLock`] that does nothing, for single-threaded configurations where
/// requests can never overlap and the firmware API has no other callers.
pub struct NoopLock;

impl RawLock for NoopLock {
    const INIT: Self = NoopLock;

    fn acquire(&self) {}

    fn try_acquire(&self) -> Result<(), Error> {
        Ok(())
    }

    fn release(&self) {}
}
