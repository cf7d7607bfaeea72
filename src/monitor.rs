//! The agent's single lock: a JVMTI raw monitor with a scoped guard.
//!
//! `Monitor<T>` owns the data it protects, so the state guarded by the raw
//! monitor can only be reached through a `MonitorGuard`. The lock itself is
//! abstracted behind [`RawLock`] so the guard logic runs without a VM.

use crate::env::Jvmti;
use crate::error::{fatal, Error, Result};
use crate::sys::jvmti::jrawMonitorID;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// A process-wide mutual exclusion primitive.
pub trait RawLock: Send + Sync {
    fn enter(&self) -> Result<()>;
    fn exit(&self) -> Result<()>;
}

impl<L: RawLock + ?Sized> RawLock for Arc<L> {
    fn enter(&self) -> Result<()> {
        (**self).enter()
    }

    fn exit(&self) -> Result<()> {
        (**self).exit()
    }
}

/// A JVMTI raw monitor. Recursive on the host side.
pub struct RawMonitor {
    jvmti: Jvmti,
    id: AtomicPtr<std::ffi::c_void>,
}

impl RawMonitor {
    pub fn create(jvmti: Jvmti, name: &str) -> Result<Self> {
        let id = jvmti
            .create_raw_monitor(name)
            .map_err(|code| Error::jvmti(&jvmti, "CreateRawMonitor", code))?;
        Ok(RawMonitor { jvmti, id: AtomicPtr::new(id) })
    }

    fn id(&self) -> jrawMonitorID {
        self.id.load(Ordering::Acquire)
    }

    /// Releases the host monitor. Later `enter` calls fail.
    pub fn destroy(&self) -> Result<()> {
        let id = self.id.swap(ptr::null_mut(), Ordering::AcqRel);
        if id.is_null() {
            return Ok(());
        }
        self.jvmti
            .destroy_raw_monitor(id)
            .map_err(|code| Error::jvmti(&self.jvmti, "DestroyRawMonitor", code))
    }
}

impl RawLock for RawMonitor {
    fn enter(&self) -> Result<()> {
        self.jvmti
            .raw_monitor_enter(self.id())
            .map_err(|code| Error::jvmti(&self.jvmti, "RawMonitorEnter", code))
    }

    fn exit(&self) -> Result<()> {
        self.jvmti
            .raw_monitor_exit(self.id())
            .map_err(|code| Error::jvmti(&self.jvmti, "RawMonitorExit", code))
    }
}

/// Data guarded by a raw lock.
///
/// The host monitor is recursive, so a thread may lock a `Monitor` it
/// already holds. Guards therefore only hand out `&T`; state that changes
/// under the lock lives in `Cell`s.
pub struct Monitor<T: ?Sized, L: RawLock = RawMonitor> {
    lock: L,
    data: T,
}

unsafe impl<T: ?Sized + Send, L: RawLock> Send for Monitor<T, L> {}
unsafe impl<T: ?Sized + Send, L: RawLock> Sync for Monitor<T, L> {}

impl<T, L: RawLock> Monitor<T, L> {
    pub fn new(lock: L, data: T) -> Self {
        Monitor { lock, data }
    }
}

impl<T: ?Sized, L: RawLock> Monitor<T, L> {
    /// Enters the lock. Failing to enter is fatal.
    pub fn lock(&self) -> MonitorGuard<'_, T, L> {
        if let Err(err) = self.lock.enter() {
            fatal(&err);
        }
        MonitorGuard { monitor: self, _owner: PhantomData }
    }

    pub fn raw(&self) -> &L {
        &self.lock
    }
}

/// Holds the lock until dropped. Stays on the thread that entered.
pub struct MonitorGuard<'a, T: ?Sized, L: RawLock = RawMonitor> {
    monitor: &'a Monitor<T, L>,
    _owner: PhantomData<*const ()>,
}

impl<T: ?Sized, L: RawLock> Deref for MonitorGuard<'_, T, L> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.monitor.data
    }
}

impl<T: ?Sized, L: RawLock> Drop for MonitorGuard<'_, T, L> {
    fn drop(&mut self) {
        if let Err(err) = self.monitor.lock.exit() {
            fatal(&err);
        }
    }
}
