//! Class-file load interception.
//!
//! Every class the host loads passes through [`ClassFileInterceptor`]. It
//! numbers the class, decides whether it loaded before or after VM start,
//! and hands it to the rewriter. Numbering and the VM-started flag share the
//! agent's monitor with native registration, so a class can never be marked
//! user-side before the bridge is bound.

use crate::classfile;
use crate::error::{Error, Result};
use crate::monitor::{Monitor, RawLock, RawMonitor};
use crate::rewrite::{ClassRewriter, RewriteRequest, SiteOffsets};
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::ffi::CStr;

/// State shared by every class load; only reachable under the monitor.
///
/// The monitor is recursive, so a class load on a thread already inside
/// it (registering natives can load classes) sees the same state. Fields
/// are cells so that nested access never needs a second `&mut`.
#[derive(Debug, Default)]
struct LoadState {
    class_count: Cell<u32>,
    vm_started: Cell<bool>,
    offsets: RefCell<SiteOffsets>,
}

pub struct ClassFileInterceptor<R: ClassRewriter, L: RawLock = RawMonitor> {
    state: Monitor<LoadState, L>,
    rewriter: R,
    helper_class: String,
}

impl<R: ClassRewriter, L: RawLock> ClassFileInterceptor<R, L> {
    pub fn new(lock: L, rewriter: R, helper_class: impl Into<String>) -> Self {
        ClassFileInterceptor {
            state: Monitor::new(lock, LoadState::default()),
            rewriter,
            helper_class: helper_class.into(),
        }
    }

    /// Handles one class. `name` is null for classes defined without a
    /// name, in which case it is read from the class bytes.
    pub fn on_class_file_load(&self, name: Option<&CStr>, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        let name: Cow<'_, str> = match name {
            Some(name) => classfile::decode_modified_utf8(name.to_bytes()),
            None => Cow::Owned(classfile::class_name(bytes).map_err(Error::ClassName)?),
        };

        if *name == self.helper_class {
            return Ok(None);
        }

        let (index, is_system) = {
            let state = self.state.lock();
            let index = state.class_count.get();
            state.class_count.set(index + 1);
            (index, !state.vm_started.get())
        };

        let request = RewriteRequest { index, name: &name, is_system, bytes };
        let Some(instrumented) = self.rewriter.rewrite(&request)? else {
            return Ok(None);
        };
        if instrumented.image.is_empty() {
            return Ok(None);
        }
        if !instrumented.methods.is_empty() {
            let state = self.state.lock();
            state.offsets.borrow_mut().register(&name, &instrumented.methods);
        }
        Ok(Some(instrumented.image))
    }

    /// Flips the VM-started flag and runs `register` in the same critical
    /// section. Classes numbered afterwards are user classes, including
    /// any that `register` itself causes to load on this thread.
    pub fn mark_vm_started<T>(&self, register: impl FnOnce() -> Result<T>) -> Result<T> {
        let state = self.state.lock();
        state.vm_started.set(true);
        register()
    }

    pub fn classes_seen(&self) -> u32 {
        self.state.lock().class_count.get()
    }

    pub fn vm_started(&self) -> bool {
        self.state.lock().vm_started.get()
    }

    /// Moves out the call offsets of every class rewritten so far.
    pub fn take_site_offsets(&self) -> SiteOffsets {
        self.state.lock().offsets.take()
    }

    pub fn rewriter(&self) -> &R {
        &self.rewriter
    }
}
