// heapster/src/sys/jvmti.rs
//
// JVMTI bindings for the subset of the tool interface the agent calls.
//
// Function numbers in the vtable comments are the 1-based numbers from
// jvmti.h. Unused functions are opaque padding.
//
// Reserved slots: 1, 105, 113, 117, 141

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use std::os::raw::{c_char, c_uchar, c_void};
use crate::sys::jni::{jclass, jint, jlong, jmethodID, jobject, jthread, JNIEnv};

// --- Constants ---
pub const JVMTI_VERSION_1_0: jint = 0x30010000;
pub const JVMTI_VERSION_1_2: jint = 0x30010200;

pub const JVMTI_EVENT_VM_INIT: u32 = 50;
pub const JVMTI_EVENT_VM_DEATH: u32 = 51;
pub const JVMTI_EVENT_CLASS_FILE_LOAD_HOOK: u32 = 54;
pub const JVMTI_EVENT_VM_START: u32 = 57;
pub const JVMTI_EVENT_OBJECT_FREE: u32 = 83;

pub const JVMTI_ENABLE: jint = 1;
pub const JVMTI_DISABLE: jint = 0;

// --- Error Codes ---
//
// The VM can return any code from the JVMTI error space, so the type is a
// transparent integer rather than a Rust enum.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct jvmtiError(pub u32);

impl jvmtiError {
    pub const NONE: jvmtiError = jvmtiError(0);
    pub const INVALID_THREAD: jvmtiError = jvmtiError(10);
    pub const INVALID_OBJECT: jvmtiError = jvmtiError(20);
    pub const INVALID_CLASS: jvmtiError = jvmtiError(21);
    pub const INVALID_METHODID: jvmtiError = jvmtiError(23);
    pub const NOT_AVAILABLE: jvmtiError = jvmtiError(98);
    pub const MUST_POSSESS_CAPABILITY: jvmtiError = jvmtiError(99);
    pub const NULL_POINTER: jvmtiError = jvmtiError(100);
    pub const ABSENT_INFORMATION: jvmtiError = jvmtiError(101);
    pub const INVALID_EVENT_TYPE: jvmtiError = jvmtiError(102);
    pub const ILLEGAL_ARGUMENT: jvmtiError = jvmtiError(103);
    pub const OUT_OF_MEMORY: jvmtiError = jvmtiError(110);
    pub const WRONG_PHASE: jvmtiError = jvmtiError(112);
    pub const INTERNAL: jvmtiError = jvmtiError(113);
}

pub type jlocation = jlong;
pub type jrawMonitorID = *mut c_void;

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct jvmtiLineNumberEntry {
    pub start_location: jlocation,
    pub line_number: jint,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct jvmtiFrameInfo {
    pub method: jmethodID,
    pub location: jlocation,
}

impl Default for jvmtiFrameInfo {
    fn default() -> Self {
        Self { method: std::ptr::null_mut(), location: -1 }
    }
}

// --- Capabilities ---
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct jvmtiCapabilities {
    bits: [u32; 4],
}

impl jvmtiCapabilities {
    fn set_bit(&mut self, bit_offset: usize, value: bool) {
        let word_index = bit_offset / 32;
        let bit_index = bit_offset % 32;
        if value {
            self.bits[word_index] |= 1 << bit_index;
        } else {
            self.bits[word_index] &= !(1 << bit_index);
        }
    }

    fn get_bit(&self, bit_offset: usize) -> bool {
        let word_index = bit_offset / 32;
        let bit_index = bit_offset % 32;
        (self.bits[word_index] & (1 << bit_index)) != 0
    }

    // [0]
    pub fn set_can_tag_objects(&mut self, v: bool) { self.set_bit(0, v); }
    pub fn can_tag_objects(&self) -> bool { self.get_bit(0) }

    // [12]
    pub fn set_can_get_line_numbers(&mut self, v: bool) { self.set_bit(12, v); }
    pub fn can_get_line_numbers(&self) -> bool { self.get_bit(12) }

    // [26]
    pub fn set_can_generate_all_class_hook_events(&mut self, v: bool) { self.set_bit(26, v); }
    pub fn can_generate_all_class_hook_events(&self) -> bool { self.get_bit(26) }

    // [32]
    pub fn set_can_generate_object_free_events(&mut self, v: bool) { self.set_bit(32, v); }
    pub fn can_generate_object_free_events(&self) -> bool { self.get_bit(32) }
}

// --- Function Typedefs ---

// SetEventNotificationMode is variadic in jvmti.h.
pub type JvmtiSetEventNotificationModeFn = unsafe extern "C" fn(env: *mut jvmtiEnv, mode: jint, event_type: u32, event_thread: jthread, ...) -> jvmtiError;
pub type JvmtiCreateRawMonitorFn = unsafe extern "system" fn(env: *mut jvmtiEnv, name: *const c_char, monitor_ptr: *mut jrawMonitorID) -> jvmtiError;
pub type JvmtiDestroyRawMonitorFn = unsafe extern "system" fn(env: *mut jvmtiEnv, monitor: jrawMonitorID) -> jvmtiError;
pub type JvmtiRawMonitorEnterFn = unsafe extern "system" fn(env: *mut jvmtiEnv, monitor: jrawMonitorID) -> jvmtiError;
pub type JvmtiRawMonitorExitFn = unsafe extern "system" fn(env: *mut jvmtiEnv, monitor: jrawMonitorID) -> jvmtiError;
pub type JvmtiAllocateFn = unsafe extern "system" fn(env: *mut jvmtiEnv, size: jlong, mem_ptr: *mut *mut c_uchar) -> jvmtiError;
pub type JvmtiDeallocateFn = unsafe extern "system" fn(env: *mut jvmtiEnv, mem: *mut c_uchar) -> jvmtiError;
pub type JvmtiGetClassSignatureFn = unsafe extern "system" fn(env: *mut jvmtiEnv, klass: jclass, signature_ptr: *mut *mut c_char, generic_ptr: *mut *mut c_char) -> jvmtiError;
pub type JvmtiGetMethodNameFn = unsafe extern "system" fn(env: *mut jvmtiEnv, method: jmethodID, name_ptr: *mut *mut c_char, signature_ptr: *mut *mut c_char, generic_ptr: *mut *mut c_char) -> jvmtiError;
pub type JvmtiGetMethodDeclaringClassFn = unsafe extern "system" fn(env: *mut jvmtiEnv, method: jmethodID, declaring_class_ptr: *mut jclass) -> jvmtiError;
pub type JvmtiGetLineNumberTableFn = unsafe extern "system" fn(env: *mut jvmtiEnv, method: jmethodID, entry_count_ptr: *mut jint, table_ptr: *mut *mut jvmtiLineNumberEntry) -> jvmtiError;
pub type JvmtiGetStackTraceFn = unsafe extern "system" fn(env: *mut jvmtiEnv, thread: jthread, start_depth: jint, max_frame_count: jint, frame_buffer: *mut jvmtiFrameInfo, count_ptr: *mut jint) -> jvmtiError;
pub type JvmtiGetTagFn = unsafe extern "system" fn(env: *mut jvmtiEnv, object: jobject, tag_ptr: *mut jlong) -> jvmtiError;
pub type JvmtiSetTagFn = unsafe extern "system" fn(env: *mut jvmtiEnv, object: jobject, tag: jlong) -> jvmtiError;
pub type JvmtiSetEventCallbacksFn = unsafe extern "system" fn(env: *mut jvmtiEnv, callbacks: *const jvmtiEventCallbacks, size_of_callbacks: jint) -> jvmtiError;
pub type JvmtiGetErrorNameFn = unsafe extern "system" fn(env: *mut jvmtiEnv, error: jvmtiError, name_ptr: *mut *mut c_char) -> jvmtiError;
pub type JvmtiGetPotentialCapabilitiesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, capabilities_ptr: *mut jvmtiCapabilities) -> jvmtiError;
pub type JvmtiAddCapabilitiesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, capabilities_ptr: *const jvmtiCapabilities) -> jvmtiError;
pub type JvmtiAddToBootstrapClassLoaderSearchFn = unsafe extern "system" fn(env: *mut jvmtiEnv, segment: *const c_char) -> jvmtiError;
pub type JvmtiGetObjectSizeFn = unsafe extern "system" fn(env: *mut jvmtiEnv, object: jobject, size_ptr: *mut jlong) -> jvmtiError;

// --- Function Table ---

#[repr(C)]
pub struct jvmtiInterface_1_ {
    /*   1: RESERVED */
    pub reserved1: *mut c_void,
    /*   2: Set Event Notification Mode */
    pub SetEventNotificationMode: Option<JvmtiSetEventNotificationModeFn>,
    /*   3-30: modules, threads, thread groups, frames, locals */
    _fns_3_30: [*mut c_void; 28],
    /*   31: Create Raw Monitor */
    pub CreateRawMonitor: Option<JvmtiCreateRawMonitorFn>,
    /*   32: Destroy Raw Monitor */
    pub DestroyRawMonitor: Option<JvmtiDestroyRawMonitorFn>,
    /*   33: Raw Monitor Enter */
    pub RawMonitorEnter: Option<JvmtiRawMonitorEnterFn>,
    /*   34: Raw Monitor Exit */
    pub RawMonitorExit: Option<JvmtiRawMonitorExitFn>,
    /*   35-45: monitor wait/notify, breakpoints, watches, IsModifiableClass */
    _fns_35_45: [*mut c_void; 11],
    /*   46: Allocate */
    pub Allocate: Option<JvmtiAllocateFn>,
    /*   47: Deallocate */
    pub Deallocate: Option<JvmtiDeallocateFn>,
    /*   48: Get Class Signature */
    pub GetClassSignature: Option<JvmtiGetClassSignatureFn>,
    /*   49-63: class and field queries */
    _fns_49_63: [*mut c_void; 15],
    /*   64: Get Method Name (and Signature) */
    pub GetMethodName: Option<JvmtiGetMethodNameFn>,
    /*   65: Get Method Declaring Class */
    pub GetMethodDeclaringClass: Option<JvmtiGetMethodDeclaringClassFn>,
    /*   66-69: GetMethodModifiers, ClearAllFramePops, GetMaxLocals, GetArgumentsSize */
    _fns_66_69: [*mut c_void; 4],
    /*   70: Get Line Number Table */
    pub GetLineNumberTable: Option<JvmtiGetLineNumberTableFn>,
    /*   71-103: method queries, redefinition, modules, thread stack traces */
    _fns_71_103: [*mut c_void; 33],
    /*   104: Get Stack Trace */
    pub GetStackTrace: Option<JvmtiGetStackTraceFn>,
    /*   105: RESERVED */
    pub reserved105: *mut c_void,
    /*   106: Get Tag */
    pub GetTag: Option<JvmtiGetTagFn>,
    /*   107: Set Tag */
    pub SetTag: Option<JvmtiSetTagFn>,
    /*   108-121: heap iteration, virtual threads, JNI function table */
    _fns_108_121: [*mut c_void; 14],
    /*   122: Set Event Callbacks */
    pub SetEventCallbacks: Option<JvmtiSetEventCallbacksFn>,
    /*   123-127: GenerateEvents, extensions, DisposeEnvironment */
    _fns_123_127: [*mut c_void; 5],
    /*   128: Get Error Name */
    pub GetErrorName: Option<JvmtiGetErrorNameFn>,
    /*   129-139: properties, phase, timers */
    _fns_129_139: [*mut c_void; 11],
    /*   140: Get Potential Capabilities */
    pub GetPotentialCapabilities: Option<JvmtiGetPotentialCapabilitiesFn>,
    /*   141: RESERVED */
    pub reserved141: *mut c_void,
    /*   142: Add Capabilities */
    pub AddCapabilities: Option<JvmtiAddCapabilitiesFn>,
    /*   143-148: RelinquishCapabilities .. SetEnvironmentLocalStorage */
    _fns_143_148: [*mut c_void; 6],
    /*   149: Add To Bootstrap Class Loader Search */
    pub AddToBootstrapClassLoaderSearch: Option<JvmtiAddToBootstrapClassLoaderSearchFn>,
    /*   150-153: SetVerboseFlag .. GetOwnedMonitorStackDepthInfo */
    _fns_150_153: [*mut c_void; 4],
    /*   154: Get Object Size */
    pub GetObjectSize: Option<JvmtiGetObjectSizeFn>,
    /*   155-156: GetLocalInstance, SetHeapSamplingInterval */
    _fns_155_156: [*mut c_void; 2],
}

#[repr(C)]
pub struct jvmtiEnv {
    pub functions: *const jvmtiInterface_1_,
}

// --- Event Callbacks ---

pub type JvmtiVMDeathFn = unsafe extern "system" fn(jvmti_env: *mut jvmtiEnv, jni_env: *mut JNIEnv);
pub type JvmtiVMStartFn = unsafe extern "system" fn(jvmti_env: *mut jvmtiEnv, jni_env: *mut JNIEnv);
pub type JvmtiClassFileLoadHookFn = unsafe extern "system" fn(
    jvmti_env: *mut jvmtiEnv,
    jni_env: *mut JNIEnv,
    class_being_redefined: jclass,
    loader: jobject,
    name: *const c_char,
    protection_domain: jobject,
    class_data_len: jint,
    class_data: *const c_uchar,
    new_class_data_len: *mut jint,
    new_class_data: *mut *mut c_uchar,
);
pub type JvmtiObjectFreeFn = unsafe extern "system" fn(jvmti_env: *mut jvmtiEnv, tag: jlong);

/// Callback table indexed by `event - JVMTI_EVENT_VM_INIT`. Events the agent
/// never enables stay as null slots.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct jvmtiEventCallbacks {
    /* 50 */ pub VMInit: *mut c_void,
    /* 51 */ pub VMDeath: Option<JvmtiVMDeathFn>,
    /* 52-53: ThreadStart, ThreadEnd */
    _events_52_53: [*mut c_void; 2],
    /* 54 */ pub ClassFileLoadHook: Option<JvmtiClassFileLoadHookFn>,
    /* 55-56: ClassLoad, ClassPrepare */
    _events_55_56: [*mut c_void; 2],
    /* 57 */ pub VMStart: Option<JvmtiVMStartFn>,
    /* 58-82: exceptions, stepping, fields, methods, compiled code, monitors, GC */
    _events_58_82: [*mut c_void; 25],
    /* 83 */ pub ObjectFree: Option<JvmtiObjectFreeFn>,
    /* 84-86: VMObjectAlloc, reserved, SampledObjectAlloc */
    _events_84_86: [*mut c_void; 3],
}

impl Default for jvmtiEventCallbacks {
    fn default() -> Self {
        Self {
            VMInit: std::ptr::null_mut(),
            VMDeath: None,
            _events_52_53: [std::ptr::null_mut(); 2],
            ClassFileLoadHook: None,
            _events_55_56: [std::ptr::null_mut(); 2],
            VMStart: None,
            _events_58_82: [std::ptr::null_mut(); 25],
            ObjectFree: None,
            _events_84_86: [std::ptr::null_mut(); 3],
        }
    }
}
