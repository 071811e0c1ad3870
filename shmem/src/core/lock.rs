use std::time::{Duration, Instant};

use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex};
use raw_sync::Timeout;

use crate::errors::{Result, ShmemLibError};

use super::LOCK_REGION_SIZE;

/// A process-shared mutex living inside the mapping.
///
/// If a process dies while holding it the lock stays held forever; nothing
/// here tries to recover it. With a timeout configured, every later caller
/// gets `LockTimeout` instead of hanging, and the segment has to be recreated
/// by a restarted fetcher (`ShmemConfig::recreate`).
pub struct SharedLock {
    inner: Box<dyn LockImpl>,
    timeout: Option<Duration>,
}

impl SharedLock {
    /// Initializes a fresh mutex at `lock_ptr`. Only the creating process may
    /// call this, before anyone else can see the segment as ready.
    ///
    /// # Safety
    ///
    /// `lock_ptr` must point at `LOCK_REGION_SIZE` writable mapped bytes and
    /// `data_ptr` at the region the lock protects.
    pub(crate) unsafe fn create(
        lock_ptr: *mut u8,
        data_ptr: *mut u8,
        timeout: Option<Duration>,
    ) -> Result<SharedLock> {
        check_fits(lock_ptr)?;
        let (inner, _) = Mutex::new(lock_ptr, data_ptr)
            .map_err(|e| ShmemLibError::LockAcquisition(format!("initializing mutex: {}", e)))?;
        Ok(SharedLock { inner, timeout })
    }

    /// Opens the mutex another process already initialized.
    ///
    /// # Safety
    ///
    /// Same as [`SharedLock::create`], and the creator must have finished
    /// initializing it.
    pub(crate) unsafe fn attach(
        lock_ptr: *mut u8,
        data_ptr: *mut u8,
        timeout: Option<Duration>,
    ) -> Result<SharedLock> {
        check_fits(lock_ptr)?;
        let (inner, _) = Mutex::from_existing(lock_ptr, data_ptr)
            .map_err(|e| ShmemLibError::LockAcquisition(format!("opening mutex: {}", e)))?;
        Ok(SharedLock { inner, timeout })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Blocks until this thread owns the lock, or until the timeout runs out.
    pub fn acquire(&self) -> Result<SharedLockGuard<'_>> {
        let started = Instant::now();
        let acquired = match self.timeout {
            None => self.inner.lock(),
            Some(timeout) => self.inner.try_lock(Timeout::Val(timeout)),
        };
        match acquired {
            Ok(guard) => Ok(SharedLockGuard { guard }),
            Err(e) => {
                let err = classify_failure(&e.to_string(), started.elapsed(), self.timeout);
                match err {
                    ShmemLibError::LockTimeout(timeout) => {
                        tracing::error!(?timeout, "template lock not acquired, holder may be dead")
                    }
                    _ => tracing::error!(error = %e, "template lock failed"),
                }
                Err(err)
            }
        }
    }
}

/// raw_sync reports pthread failures as "Failed to acquire mutex : <errno>".
fn lock_errno(message: &str) -> Option<i32> {
    message.rsplit(':').next()?.trim().parse().ok()
}

/// ETIMEDOUT is a timeout whenever it arrives; the timedlock deadline is on
/// the realtime clock, so the wait measured here can be shorter or longer.
/// Only a message without an errno falls back to the elapsed time.
fn classify_failure(message: &str, waited: Duration, timeout: Option<Duration>) -> ShmemLibError {
    match (lock_errno(message), timeout) {
        (Some(libc::ETIMEDOUT), Some(timeout)) => ShmemLibError::LockTimeout(timeout),
        (None, Some(timeout)) if waited >= timeout => ShmemLibError::LockTimeout(timeout),
        _ => ShmemLibError::LockAcquisition(message.to_string()),
    }
}

fn check_fits(lock_ptr: *mut u8) -> Result<()> {
    let needed = Mutex::size_of(Some(lock_ptr));
    if needed > LOCK_REGION_SIZE {
        return Err(ShmemLibError::LayoutMismatch(format!(
            "mutex needs {} bytes, lock region is {}",
            needed, LOCK_REGION_SIZE
        )));
    }
    Ok(())
}

/// Exclusive ownership of the record; released on drop.
pub struct SharedLockGuard<'a> {
    guard: LockGuard<'a>,
}

impl<'a> SharedLockGuard<'a> {
    /// Start of the protected region.
    pub fn data_ptr(&self) -> *mut u8 {
        *self.guard
    }

    pub fn release(self) {
        drop(self)
    }
}
