//! The heapster agent: lifecycle and event handling.
//!
//! ```text
//! Loaded ──Agent_OnLoad──► RunningSystem ──VMStart──► RunningUser ──VMDeath──► Dying ──► Dead
//! ```
//!
//! Classes that load before `VMStart` are system classes and get the
//! bootstrap-safe rewrite. At `VMStart` the helper's native is registered
//! and `HeapsterHelper.isReady` is raised, after which allocations reach the
//! recorder. At `VMDeath` the helper is switched off, in-flight callbacks
//! drain, and the report is written.

use crate::bridge::{self, CallGate};
use crate::config::Config;
use crate::env::{JniEnv, Jvmti, LocalRef};
use crate::error::{fatal, Error, Result};
use crate::interceptor::ClassFileInterceptor;
use crate::logging;
use crate::monitor::{RawLock, RawMonitor};
use crate::recorder::{HelperMethods, Recorder};
use crate::report::{JvmtiSymbolizer, Report, ReportTotals};
use crate::rewrite::{self, AllocationInjector, ClassRewriter, HelperSpec};
use crate::sys::jni::{self, jclass, jfieldID, jobject};
use crate::sys::jvmti::{
    jvmtiCapabilities, JVMTI_EVENT_CLASS_FILE_LOAD_HOOK, JVMTI_EVENT_OBJECT_FREE, JVMTI_EVENT_VM_DEATH,
    JVMTI_EVENT_VM_START,
};
use crate::Agent;
use log::{debug, info, warn};
use std::ffi::CStr;
use std::os::raw::{c_char, c_uchar};
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

pub const MONITOR_NAME: &str = "heapster";
pub const READY_FIELD: &str = "isReady";

const EVENTS: [u32; 4] = [
    JVMTI_EVENT_VM_START,
    JVMTI_EVENT_VM_DEATH,
    JVMTI_EVENT_CLASS_FILE_LOAD_HOOK,
    JVMTI_EVENT_OBJECT_FREE,
];

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Loaded = 0,
    RunningSystem = 1,
    RunningUser = 2,
    Dying = 3,
    Dead = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Phase {
        match value {
            0 => Phase::Loaded,
            1 => Phase::RunningSystem,
            2 => Phase::RunningUser,
            3 => Phase::Dying,
            _ => Phase::Dead,
        }
    }
}

/// The helper as seen from the thread delivering VM start or VM death.
pub trait HelperBinding {
    /// Binds the bridge natives on the helper class.
    fn register_natives(&self) -> Result<()>;

    /// The helper's own frames, skipped when finding the allocating one.
    fn helper_methods(&self) -> Result<HelperMethods>;

    /// Writes the helper's readiness flag.
    fn set_ready(&self, ready: bool);
}

/// The work of VM death once the helper is off and callbacks have drained.
pub trait Teardown {
    fn write_report(&self);
    fn disable_events(&self);
    /// Frees host resources. Nothing may use the monitor afterwards.
    fn release(&self) -> Result<()>;
}

/// Phase plus the gates that admit callbacks, and the order in which VM
/// start and VM death move them.
#[derive(Debug, Default)]
pub struct Lifecycle {
    phase: AtomicU8,
    class_hooks: CallGate,
    allocations: CallGate,
}

impl Lifecycle {
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: Phase) {
        debug!("phase {:?} -> {:?}", self.phase(), phase);
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    pub fn class_hooks(&self) -> &CallGate {
        &self.class_hooks
    }

    pub fn allocations(&self) -> &CallGate {
        &self.allocations
    }

    /// Setup is complete: classes are rewritten, allocations are not yet
    /// counted.
    pub fn loaded(&self) {
        self.class_hooks.open();
        self.set_phase(Phase::RunningSystem);
    }

    /// VM start. Natives are registered inside the interceptor's critical
    /// section, then allocations are admitted, and only then is the helper
    /// switched on. Returns false when not in `RunningSystem`.
    pub fn start<R, L, M, H>(
        &self,
        interceptor: &ClassFileInterceptor<R, L>,
        recorder: &Recorder<M>,
        helper: &H,
    ) -> Result<bool>
    where
        R: ClassRewriter,
        L: RawLock,
        M: RawLock,
        H: HelperBinding + ?Sized,
    {
        let phase = self.phase();
        if phase != Phase::RunningSystem {
            warn!("VM start in phase {phase:?} ignored");
            return Ok(false);
        }
        interceptor.mark_vm_started(|| helper.register_natives())?;
        recorder.set_helper_methods(helper.helper_methods()?);
        self.allocations.open();
        self.set_phase(Phase::RunningUser);
        helper.set_ready(true);
        Ok(true)
    }

    /// VM death: helper off, drain, report, events off, release. Runs
    /// once; returns false if there was nothing to shut down.
    pub fn shutdown<H, T>(&self, helper: Option<&H>, teardown: &T) -> Result<bool>
    where
        H: HelperBinding + ?Sized,
        T: Teardown + ?Sized,
    {
        let phase = self.phase();
        if phase == Phase::Loaded || phase >= Phase::Dying {
            return Ok(false);
        }
        if let Some(helper) = helper {
            helper.set_ready(false);
        }
        self.set_phase(Phase::Dying);
        self.allocations.close_and_drain();
        self.class_hooks.close_and_drain();

        teardown.write_report();
        teardown.disable_events();
        teardown.release()?;
        self.set_phase(Phase::Dead);
        Ok(true)
    }
}

/// The helper class as bound at VM start.
struct BoundHelper {
    class: jobject,
    ready: jfieldID,
}

// Global reference and field ID, both valid on any thread.
unsafe impl Send for BoundHelper {}
unsafe impl Sync for BoundHelper {}

/// [`HelperBinding`] over JNI.
struct JniHelper<'a> {
    env: &'a JniEnv,
    class: jclass,
    ready: jfieldID,
    spec: &'a HelperSpec,
}

impl<'a> JniHelper<'a> {
    fn bind(env: &'a JniEnv, class: jclass, spec: &'a HelperSpec) -> Result<Self> {
        let helper = JniHelper { env, class, ready: ptr::null_mut(), spec };
        let ready = env
            .get_static_field_id(class, READY_FIELD, "I")
            .ok_or_else(|| helper.missing(READY_FIELD))?;
        Ok(JniHelper { ready, ..helper })
    }

    fn missing(&self, member: &str) -> Error {
        self.env.take_exception();
        Error::HelperMissing(format!("{}.{member}", self.spec.class_name))
    }
}

impl HelperBinding for JniHelper<'_> {
    fn register_natives(&self) -> Result<()> {
        self.env
            .register_natives(self.class, &bridge::native_methods())
            .map_err(|code| Error::Jni { op: "RegisterNatives", code })
    }

    fn helper_methods(&self) -> Result<HelperMethods> {
        let native_name = bridge::NATIVE_NAME.to_string_lossy();
        let native_signature = bridge::NATIVE_SIGNATURE.to_string_lossy();
        let managed = self
            .env
            .get_static_method_id(self.class, &self.spec.method_name, &self.spec.method_signature)
            .ok_or_else(|| self.missing(&self.spec.method_name))?;
        let native = self
            .env
            .get_static_method_id(self.class, &native_name, &native_signature)
            .ok_or_else(|| self.missing(&native_name))?;
        Ok(HelperMethods::new(managed, native))
    }

    fn set_ready(&self, ready: bool) {
        self.env.set_static_int_field(self.class, self.ready, jni::jint::from(ready));
    }
}

/// [`Teardown`] for the running agent, on the VM death thread.
struct Death<'a> {
    running: &'a Running,
    env: &'a JniEnv,
}

impl Teardown for Death<'_> {
    fn write_report(&self) {
        let running = self.running;
        let totals = ReportTotals {
            classes_seen: running.interceptor.classes_seen(),
            overflow: running.recorder.table().overflow(),
            track_live: running.recorder.track_live(),
        };
        let symbolizer =
            JvmtiSymbolizer::new(running.jvmti, running.line_numbers, running.interceptor.take_site_offsets());
        let report = Report::build(running.recorder.snapshot(), &symbolizer, totals, running.config.top);
        if let Err(err) = report.emit(&running.config) {
            warn!("cannot write report: {err}");
        }
        if running.recorder.unattributed() > 0 {
            warn!("{} allocations had no frame outside the helper", running.recorder.unattributed());
        }
        info!("{} sites, {} allocations recorded", report.sites.len(), report.total_count);
    }

    fn disable_events(&self) {
        let jvmti = &self.running.jvmti;
        for event in EVENTS {
            if let Err(code) = jvmti.set_event_notification_mode(false, event, ptr::null_mut()) {
                warn!("{}", Error::jvmti(jvmti, "SetEventNotificationMode", code));
            }
        }
    }

    fn release(&self) -> Result<()> {
        if let Some(helper) = self.running.helper.get() {
            self.env.delete_global_ref(helper.class);
        }
        self.running.monitor.destroy()
    }
}

struct Running {
    jvmti: Jvmti,
    config: Config,
    monitor: Arc<RawMonitor>,
    interceptor: ClassFileInterceptor<AllocationInjector, Arc<RawMonitor>>,
    recorder: Recorder<Arc<RawMonitor>>,
    helper: OnceLock<BoundHelper>,
    line_numbers: bool,
}

/// The agent singleton. Empty until `Agent_OnLoad` fills it in.
#[derive(Default)]
pub struct Heapster {
    lifecycle: Lifecycle,
    running: OnceLock<Running>,
}

impl Heapster {
    pub fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    fn load(&self, vm: *mut jni::JavaVM, options: &str) -> Result<()> {
        let config = Config::parse(options)?;
        logging::init(config.log_level);

        let jvmti = Jvmti::new(vm).map_err(Error::Env)?;
        if let Some(segment) = &config.bootclasspath {
            jvmti
                .add_to_bootstrap_class_loader_search(segment)
                .map_err(|code| Error::jvmti(&jvmti, "AddToBootstrapClassLoaderSearch", code))?;
        }

        let potential = jvmti
            .get_potential_capabilities()
            .map_err(|code| Error::jvmti(&jvmti, "GetPotentialCapabilities", code))?;
        let line_numbers = potential.can_get_line_numbers();
        let mut caps = jvmtiCapabilities::default();
        caps.set_can_generate_all_class_hook_events(true);
        caps.set_can_tag_objects(true);
        caps.set_can_generate_object_free_events(true);
        caps.set_can_get_line_numbers(line_numbers);
        jvmti
            .add_capabilities(&caps)
            .map_err(|code| Error::jvmti(&jvmti, "AddCapabilities", code))?;

        jvmti
            .set_event_callbacks(crate::event_callbacks())
            .map_err(|code| Error::jvmti(&jvmti, "SetEventCallbacks", code))?;

        let monitor = Arc::new(RawMonitor::create(jvmti, MONITOR_NAME)?);
        let helper = HelperSpec::default();
        let running = Running {
            jvmti,
            interceptor: ClassFileInterceptor::new(
                Arc::clone(&monitor),
                AllocationInjector::new(helper.clone()),
                helper.class_name,
            ),
            recorder: Recorder::new(Arc::clone(&monitor), config.max_sites, config.track_live),
            monitor,
            helper: OnceLock::new(),
            line_numbers,
            config,
        };
        if self.running.set(running).is_err() {
            return Err(Error::AlreadyLoaded);
        }

        self.lifecycle.loaded();

        for event in EVENTS {
            jvmti
                .set_event_notification_mode(true, event, ptr::null_mut())
                .map_err(|code| Error::jvmti(&jvmti, "SetEventNotificationMode", code))?;
        }

        info!("loaded (line numbers: {})", if line_numbers { "yes" } else { "no" });
        Ok(())
    }

    fn start(&self, jni: *mut jni::JNIEnv) -> Result<()> {
        let Some(running) = self.running.get() else {
            return Ok(());
        };
        let env = unsafe { JniEnv::from_raw(jni) };
        let spec = running.interceptor.rewriter().helper();

        let class = env.find_class(&spec.class_name).ok_or_else(|| {
            env.take_exception();
            Error::HelperMissing(spec.class_name.clone())
        })?;
        let class = LocalRef::new(&env, class);
        let helper = JniHelper::bind(&env, class.get(), spec)?;

        if !self.lifecycle.start(&running.interceptor, &running.recorder, &helper)? {
            return Ok(());
        }
        let bound = BoundHelper { class: env.new_global_ref(class.get()), ready: helper.ready };
        if let Err(duplicate) = running.helper.set(bound) {
            warn!("{} already bound; keeping the first binding", spec.class_name);
            env.delete_global_ref(duplicate.class);
        }

        info!(
            "{} bound; {} classes loaded before VM start",
            spec.class_name,
            running.interceptor.classes_seen()
        );
        Ok(())
    }

    fn shutdown(&self, jni: *mut jni::JNIEnv) -> Result<()> {
        let Some(running) = self.running.get() else {
            return Ok(());
        };
        let env = unsafe { JniEnv::from_raw(jni) };
        let spec = running.interceptor.rewriter().helper();
        let helper = running
            .helper
            .get()
            .map(|bound| JniHelper { env: &env, class: bound.class, ready: bound.ready, spec });
        self.lifecycle.shutdown(helper.as_ref(), &Death { running, env: &env })?;
        Ok(())
    }
}

impl Agent for Heapster {
    fn on_load(&self, vm: *mut jni::JavaVM, options: &str) -> jni::jint {
        match self.load(vm, options) {
            Ok(()) => jni::JNI_OK,
            Err(err) => fatal(&err),
        }
    }

    fn on_unload(&self) {
        debug!("unloaded in phase {:?}", self.phase());
    }

    fn vm_start(&self, jni: *mut jni::JNIEnv) {
        if let Err(err) = self.start(jni) {
            fatal(&err);
        }
    }

    fn vm_death(&self, jni: *mut jni::JNIEnv) {
        if let Err(err) = self.shutdown(jni) {
            fatal(&err);
        }
    }

    fn class_file_load_hook(&self, _jni: *mut jni::JNIEnv, _class_being_redefined: jni::jclass,
                            _loader: jni::jobject, name: *const c_char,
                            _protection_domain: jni::jobject, class_data_len: jni::jint,
                            class_data: *const c_uchar,
                            new_class_data_len: *mut jni::jint,
                            new_class_data: *mut *mut c_uchar) {
        let Some(running) = self.running.get() else {
            return;
        };
        let Some(_call) = self.lifecycle.class_hooks().enter() else {
            return;
        };
        if class_data.is_null() || class_data_len <= 0 {
            return;
        }
        let bytes = unsafe { std::slice::from_raw_parts(class_data, class_data_len as usize) };
        let name = (!name.is_null()).then(|| unsafe { CStr::from_ptr(name) });

        let published = running
            .interceptor
            .on_class_file_load(name, bytes)
            .and_then(|image| match image {
                Some(image) => unsafe { rewrite::publish(&image, &running.jvmti, new_class_data_len, new_class_data) },
                None => Ok(()),
            });
        if let Err(err) = published {
            fatal(&err);
        }
    }

    fn object_free(&self, tag: jni::jlong) {
        if let Some(running) = self.running.get() {
            running.recorder.object_freed(tag);
        }
    }

    fn new_object(&self, _jni: *mut jni::JNIEnv, thread: jni::jthread, object: jni::jobject) {
        let Some(_call) = self.lifecycle.allocations().enter() else {
            return;
        };
        if self.phase() != Phase::RunningUser {
            return;
        }
        let Some(running) = self.running.get() else {
            return;
        };
        if let Err(err) = running.recorder.record(&running.jvmti, thread, object) {
            fatal(&err);
        }
    }
}
