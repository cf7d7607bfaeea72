//! The native half of `HeapsterHelper._newObject`.
//!
//! Instrumented code calls `HeapsterHelper.newObject(obj)`, which calls the
//! native registered here with the current thread. The native does no
//! managed allocation and no I/O; it forwards to the agent, which counts
//! the allocation.

use crate::sys::jni::{self, jclass, jobject, jthread, JNINativeMethod};
use crate::GLOBAL_AGENT;
use std::ffi::CStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const NATIVE_NAME: &CStr = c"_newObject";
pub const NATIVE_SIGNATURE: &CStr = c"(Ljava/lang/Object;Ljava/lang/Object;)V";

/// Registration table for `RegisterNatives` on the helper class.
pub fn native_methods() -> [JNINativeMethod; 1] {
    [JNINativeMethod {
        name: NATIVE_NAME.as_ptr(),
        signature: NATIVE_SIGNATURE.as_ptr(),
        fnPtr: new_object as *mut std::ffi::c_void,
    }]
}

/// `private static native void _newObject(Object thread, Object obj)`.
pub unsafe extern "system" fn new_object(env: *mut jni::JNIEnv, _klass: jclass, thread: jthread, object: jobject) {
    if let Some(agent) = GLOBAL_AGENT.get() {
        agent.new_object(env, thread, object);
    }
}

/// Admission control for callbacks that must not outlive a phase.
///
/// Callers [`enter`](CallGate::enter) and hold the returned [`InFlight`]
/// for the duration of the call. [`close_and_drain`](CallGate::close_and_drain)
/// refuses new callers and waits for the admitted ones to leave.
#[derive(Debug, Default)]
pub struct CallGate {
    open: AtomicBool,
    in_flight: AtomicUsize,
}

impl CallGate {
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn enter(&self) -> Option<InFlight<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if !self.open.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(InFlight { gate: self })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Closes the gate and spins until every admitted caller has left.
    pub fn close_and_drain(&self) {
        self.open.store(false, Ordering::SeqCst);
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
    }
}

/// One admitted call; leaving the scope releases it.
pub struct InFlight<'a> {
    gate: &'a CallGate,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
