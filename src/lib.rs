//! # heapster
//!
//! A heap allocation profiler for the JVM, loaded as a native JVMTI agent.
//!
//! heapster rewrites every class as it loads so that each `new`, `newarray`,
//! `anewarray` and `multianewarray` hands its result to a small managed
//! helper, `HeapsterHelper.newObject`. The helper calls back into the agent,
//! which counts the allocation against the bytecode site that made it. At VM
//! death the per-site counters are written out as a text or JSON report.
//!
//! ## Usage
//!
//! ```bash
//! javac -d helper java/HeapsterHelper.java
//! (cd helper && jar cf ../heapster-helper.jar HeapsterHelper.class)
//! cargo build --release
//! java -agentpath:./target/release/libheapster.so=bootclasspath=heapster-helper.jar,top=20 MyApp
//! ```
//!
//! Options are described in [`config`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │             Agent_OnLoad / JVMTI trampolines            │
//! │          export_agent!, Agent, GLOBAL_AGENT             │
//! ├─────────────────────────────────────────────────────────┤
//! │     agent::Heapster (lifecycle, phases, VM start/death) │
//! ├──────────────────────────┬──────────────────────────────┤
//! │  interceptor → rewrite   │   bridge → recorder          │
//! │  (class load, bytecode)  │   (_newObject, site table)   │
//! ├──────────────────────────┴──────────────────────────────┤
//! │        monitor (raw monitor)   env (Jvmti, JniEnv)      │
//! ├─────────────────────────────────────────────────────────┤
//! │              Raw FFI bindings (sys module)              │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`agent`] | The agent singleton and its lifecycle |
//! | [`interceptor`] | Class-file load hook: numbering, system/user split |
//! | [`rewrite`] | Bytecode injection of the helper call |
//! | [`classfile`] | Lossless class file reader and writer |
//! | [`bridge`] | The `_newObject` native and its call gate |
//! | [`recorder`] | Per-site counters |
//! | [`monitor`] | Raw monitor with a scoped guard |
//! | [`report`] | Text and JSON report |
//! | [`sys::jni`], [`sys::jvmti`] | Raw FFI types and function tables |
//! | [`env`] | Safe wrappers over the FFI tables |

pub mod sys;
pub mod env;

// Implementation modules (use `env` module for the public API)
#[doc(hidden)]
pub mod jvmti_wrapper;
#[doc(hidden)]
pub mod jni_wrapper;

pub mod agent;
pub mod bridge;
pub mod classfile;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod logging;
pub mod monitor;
pub mod recorder;
pub mod report;
pub mod rewrite;

use std::os::raw::{c_char, c_uchar};
use std::sync::OnceLock;
pub use crate::sys::jni as jni;
use crate::sys::jvmti as jvmti;

/// The events a JVMTI agent built on this crate receives.
///
/// Only `on_load` is required; every event defaults to a no-op. Events fire
/// on arbitrary VM threads, so implementations must be `Sync + Send`.
pub trait Agent: Sync + Send {
    /// Called from `Agent_OnLoad` with the options string.
    ///
    /// Return `JNI_OK` (0) on success, or `JNI_ERR` (-1) to abort VM startup.
    fn on_load(&self, vm: *mut jni::JavaVM, options: &str) -> jni::jint;

    /// Called from `Agent_OnUnload`, after VM death.
    fn on_unload(&self) {}

    /// The VM can run Java code but has not finished initializing.
    fn vm_start(&self, _jni: *mut jni::JNIEnv) {}

    /// Last event before the VM terminates; JNI is still usable.
    fn vm_death(&self, _jni: *mut jni::JNIEnv) {}

    /// Called with the bytes of every class as it loads. To replace the
    /// class, store a buffer from `Jvmti::allocate` in `new_class_data`
    /// and its length in `new_class_data_len`.
    #[allow(clippy::too_many_arguments)]
    fn class_file_load_hook(&self, _jni: *mut jni::JNIEnv, _class_being_redefined: jni::jclass,
                            _loader: jni::jobject, _name: *const c_char,
                            _protection_domain: jni::jobject, _class_data_len: jni::jint,
                            _class_data: *const c_uchar,
                            _new_class_data_len: *mut jni::jint,
                            _new_class_data: *mut *mut c_uchar) {}

    /// A tagged object was reclaimed. Requires `can_generate_object_free_events`.
    fn object_free(&self, _tag: jni::jlong) {}

    /// The helper's native reported a freshly allocated object.
    fn new_object(&self, _jni: *mut jni::JNIEnv, _thread: jni::jthread, _object: jni::jobject) {}
}

/// The process-wide agent instance, set once by `Agent_OnLoad`.
pub static GLOBAL_AGENT: OnceLock<Box<dyn Agent>> = OnceLock::new();

/// Helper to initialize the global agent (called by the macro)
pub fn set_global_agent(agent: Box<dyn Agent>) -> Result<(), ()> {
    GLOBAL_AGENT.set(agent).map_err(|_| ())
}

unsafe extern "system" fn trampoline_vm_start(_env: *mut jvmti::jvmtiEnv, jni: *mut jni::JNIEnv) {
    if let Some(agent) = GLOBAL_AGENT.get() { agent.vm_start(jni); }
}
unsafe extern "system" fn trampoline_vm_death(_env: *mut jvmti::jvmtiEnv, jni: *mut jni::JNIEnv) {
    if let Some(agent) = GLOBAL_AGENT.get() { agent.vm_death(jni); }
}
#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn trampoline_class_file_load_hook(
    _env: *mut jvmti::jvmtiEnv, jni: *mut jni::JNIEnv,
    class_being_redefined: jni::jclass, loader: jni::jobject, name: *const c_char,
    protection_domain: jni::jobject, class_data_len: jni::jint, class_data: *const c_uchar,
    new_class_data_len: *mut jni::jint, new_class_data: *mut *mut c_uchar,
) {
    if let Some(agent) = GLOBAL_AGENT.get() {
        agent.class_file_load_hook(jni, class_being_redefined, loader, name, protection_domain,
                                   class_data_len, class_data, new_class_data_len, new_class_data);
    }
}
unsafe extern "system" fn trampoline_object_free(_env: *mut jvmti::jvmtiEnv, tag: jni::jlong) {
    if let Some(agent) = GLOBAL_AGENT.get() { agent.object_free(tag); }
}

/// Returns a `jvmtiEventCallbacks` with the four events heapster consumes
/// routed to [`GLOBAL_AGENT`]. Events still have to be enabled with
/// `Jvmti::set_event_notification_mode`.
pub fn event_callbacks() -> jvmti::jvmtiEventCallbacks {
    let mut callbacks = jvmti::jvmtiEventCallbacks::default();
    callbacks.VMStart = Some(trampoline_vm_start);
    callbacks.VMDeath = Some(trampoline_vm_death);
    callbacks.ClassFileLoadHook = Some(trampoline_class_file_load_hook);
    callbacks.ObjectFree = Some(trampoline_object_free);
    callbacks
}

/// Exports an agent type as a loadable JVMTI agent library.
///
/// Generates `Agent_OnLoad`, which creates the agent with `Default`, stores
/// it in [`GLOBAL_AGENT`] and calls [`Agent::on_load`] with the options
/// string, and `Agent_OnUnload`, which calls [`Agent::on_unload`].
///
/// ```rust,ignore
/// #[derive(Default)]
/// struct MyAgent;
///
/// impl heapster::Agent for MyAgent {
///     fn on_load(&self, _vm: *mut heapster::jni::JavaVM, _options: &str) -> heapster::jni::jint {
///         heapster::jni::JNI_OK
///     }
/// }
///
/// heapster::export_agent!(MyAgent);
/// ```
///
/// Only one agent instance exists per process; a second `Agent_OnLoad` in
/// the same process returns `JNI_ERR`.
#[macro_export]
macro_rules! export_agent {
    ($agent_type:ty) => {
        #[no_mangle]
        pub unsafe extern "system" fn Agent_OnLoad(
            vm: *mut $crate::sys::jni::JavaVM,
            options: *mut std::ffi::c_char,
            _reserved: *mut std::ffi::c_void,
        ) -> $crate::sys::jni::jint {
            let agent = Box::new(<$agent_type>::default());
            if $crate::set_global_agent(agent).is_err() {
                return $crate::sys::jni::JNI_ERR;
            }

            let options_str = if options.is_null() {
                std::borrow::Cow::Borrowed("")
            } else {
                std::ffi::CStr::from_ptr(options).to_string_lossy()
            };

            if let Some(global_agent) = $crate::GLOBAL_AGENT.get() {
                return global_agent.on_load(vm, &options_str);
            }

            $crate::sys::jni::JNI_ERR
        }

        #[no_mangle]
        pub unsafe extern "system" fn Agent_OnUnload(_vm: *mut $crate::sys::jni::JavaVM) {
            if let Some(agent) = $crate::GLOBAL_AGENT.get() {
                agent.on_unload();
            }
        }
    };
}

export_agent!(agent::Heapster);
