// heapster/src/jvmti_wrapper.rs
use crate::classfile::decode_modified_utf8;
use crate::sys::jni;
use crate::sys::jvmti;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

/// Looks up a function in the JVMTI vtable, failing with `NOT_AVAILABLE`
/// when the VM left the slot empty.
macro_rules! jvmti_fn {
    ($env:expr, $name:ident) => {
        match (*(*$env).functions).$name {
            Some(f) => f,
            None => return Err(jvmti::jvmtiError::NOT_AVAILABLE),
        }
    };
}

fn check(err: jvmti::jvmtiError) -> Result<(), jvmti::jvmtiError> {
    if err != jvmti::jvmtiError::NONE {
        return Err(err);
    }
    Ok(())
}

fn c_string(value: &str) -> Result<CString, jvmti::jvmtiError> {
    CString::new(value).map_err(|_| jvmti::jvmtiError::ILLEGAL_ARGUMENT)
}

/// A safe wrapper around the raw JVMTI Environment pointer.
///
/// The environment is valid on every thread for the life of the VM, so the
/// wrapper is `Copy` and may be shared freely.
#[derive(Debug, Clone, Copy)]
pub struct Jvmti {
    env: *mut jvmti::jvmtiEnv,
}

unsafe impl Send for Jvmti {}
unsafe impl Sync for Jvmti {}

impl Jvmti {
    /// Connects to the JVM and retrieves the JVMTI environment.
    pub fn new(vm: *mut jni::JavaVM) -> Result<Self, jni::jint> {
        let mut env_ptr: *mut std::ffi::c_void = ptr::null_mut();

        unsafe {
            // vm: *mut JavaVM = *mut *const JNIInvokeInterface_
            let get_env_fn = (**vm).GetEnv;
            let res = get_env_fn(vm, &mut env_ptr, jvmti::JVMTI_VERSION_1_2);
            if res != jni::JNI_OK {
                return Err(res);
            }
        }

        if env_ptr.is_null() {
            return Err(jni::JNI_ERR);
        }
        Ok(Jvmti { env: env_ptr as *mut jvmti::jvmtiEnv })
    }

    // =========================================================================
    // Capabilities & events
    // =========================================================================

    pub fn get_potential_capabilities(&self) -> Result<jvmti::jvmtiCapabilities, jvmti::jvmtiError> {
        let mut caps = jvmti::jvmtiCapabilities::default();
        unsafe {
            let get_pot_caps_fn = jvmti_fn!(self.env, GetPotentialCapabilities);
            check(get_pot_caps_fn(self.env, &mut caps))?;
        }
        Ok(caps)
    }

    pub fn add_capabilities(&self, new_caps: &jvmti::jvmtiCapabilities) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let add_caps_fn = jvmti_fn!(self.env, AddCapabilities);
            check(add_caps_fn(self.env, new_caps))
        }
    }

    pub fn set_event_callbacks(&self, callbacks: jvmti::jvmtiEventCallbacks) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let set_callbacks_fn = jvmti_fn!(self.env, SetEventCallbacks);
            let size = std::mem::size_of::<jvmti::jvmtiEventCallbacks>() as jni::jint;
            check(set_callbacks_fn(self.env, &callbacks, size))
        }
    }

    pub fn set_event_notification_mode(&self, enable: bool, event_type: u32, thread: jni::jthread) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let set_mode_fn = jvmti_fn!(self.env, SetEventNotificationMode);
            let mode = if enable { jvmti::JVMTI_ENABLE } else { jvmti::JVMTI_DISABLE };
            // thread can be null (all threads)
            check(set_mode_fn(self.env, mode, event_type, thread))
        }
    }

    // =========================================================================
    // Raw monitors
    // =========================================================================

    pub fn create_raw_monitor(&self, name: &str) -> Result<jvmti::jrawMonitorID, jvmti::jvmtiError> {
        let c_name = c_string(name)?;
        let mut monitor: jvmti::jrawMonitorID = ptr::null_mut();
        unsafe {
            let create_fn = jvmti_fn!(self.env, CreateRawMonitor);
            check(create_fn(self.env, c_name.as_ptr(), &mut monitor))?;
        }
        Ok(monitor)
    }

    pub fn destroy_raw_monitor(&self, monitor: jvmti::jrawMonitorID) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let destroy_fn = jvmti_fn!(self.env, DestroyRawMonitor);
            check(destroy_fn(self.env, monitor))
        }
    }

    pub fn raw_monitor_enter(&self, monitor: jvmti::jrawMonitorID) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let enter_fn = jvmti_fn!(self.env, RawMonitorEnter);
            check(enter_fn(self.env, monitor))
        }
    }

    pub fn raw_monitor_exit(&self, monitor: jvmti::jrawMonitorID) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let exit_fn = jvmti_fn!(self.env, RawMonitorExit);
            check(exit_fn(self.env, monitor))
        }
    }

    // =========================================================================
    // Memory
    // =========================================================================

    pub fn allocate(&self, size: jni::jlong) -> Result<*mut u8, jvmti::jvmtiError> {
        let mut mem_ptr: *mut u8 = ptr::null_mut();
        unsafe {
            let allocate_fn = jvmti_fn!(self.env, Allocate);
            check(allocate_fn(self.env, size, &mut mem_ptr))?;
        }
        Ok(mem_ptr)
    }

    pub fn deallocate(&self, mem: *mut u8) -> Result<(), jvmti::jvmtiError> {
        if mem.is_null() {
            return Ok(());
        }
        unsafe {
            let deallocate_fn = jvmti_fn!(self.env, Deallocate);
            check(deallocate_fn(self.env, mem))
        }
    }

    /// Copies a VM-allocated modified UTF-8 string and releases the VM buffer.
    unsafe fn take_string(&self, raw: *mut c_char) -> Result<Option<String>, jvmti::jvmtiError> {
        if raw.is_null() {
            return Ok(None);
        }
        let value = decode_modified_utf8(CStr::from_ptr(raw).to_bytes()).into_owned();
        self.deallocate(raw as *mut u8)?;
        Ok(Some(value))
    }

    // =========================================================================
    // Classes & methods
    // =========================================================================

    pub fn get_class_signature(&self, klass: jni::jclass) -> Result<(String, Option<String>), jvmti::jvmtiError> {
        let mut sig_ptr: *mut c_char = ptr::null_mut();
        let mut gen_ptr: *mut c_char = ptr::null_mut();
        unsafe {
            let get_class_sig_fn = jvmti_fn!(self.env, GetClassSignature);
            check(get_class_sig_fn(self.env, klass, &mut sig_ptr, &mut gen_ptr))?;

            let signature = self.take_string(sig_ptr)?.unwrap_or_default();
            let generic = self.take_string(gen_ptr)?;
            Ok((signature, generic))
        }
    }

    pub fn get_method_name(&self, method: jni::jmethodID) -> Result<(String, String, Option<String>), jvmti::jvmtiError> {
        let mut name_ptr: *mut c_char = ptr::null_mut();
        let mut sig_ptr: *mut c_char = ptr::null_mut();
        let mut gen_ptr: *mut c_char = ptr::null_mut();
        unsafe {
            let get_method_name_fn = jvmti_fn!(self.env, GetMethodName);
            check(get_method_name_fn(self.env, method, &mut name_ptr, &mut sig_ptr, &mut gen_ptr))?;

            let name = self.take_string(name_ptr)?.unwrap_or_default();
            let signature = self.take_string(sig_ptr)?.unwrap_or_default();
            let generic = self.take_string(gen_ptr)?;
            Ok((name, signature, generic))
        }
    }

    pub fn get_method_declaring_class(&self, method: jni::jmethodID) -> Result<jni::jclass, jvmti::jvmtiError> {
        let mut klass: jni::jclass = ptr::null_mut();
        unsafe {
            let get_fn = jvmti_fn!(self.env, GetMethodDeclaringClass);
            check(get_fn(self.env, method, &mut klass))?;
        }
        Ok(klass)
    }

    pub fn get_line_number_table(&self, method: jni::jmethodID) -> Result<Vec<jvmti::jvmtiLineNumberEntry>, jvmti::jvmtiError> {
        let mut entry_count: jni::jint = 0;
        let mut table_ptr: *mut jvmti::jvmtiLineNumberEntry = ptr::null_mut();
        unsafe {
            let get_fn = jvmti_fn!(self.env, GetLineNumberTable);
            check(get_fn(self.env, method, &mut entry_count, &mut table_ptr))?;
            if table_ptr.is_null() {
                return Ok(Vec::new());
            }
            let table = std::slice::from_raw_parts(table_ptr, entry_count.max(0) as usize).to_vec();
            self.deallocate(table_ptr as *mut u8)?;
            Ok(table)
        }
    }

    pub fn add_to_bootstrap_class_loader_search(&self, segment: &str) -> Result<(), jvmti::jvmtiError> {
        let c_segment = c_string(segment)?;
        unsafe {
            let add_fn = jvmti_fn!(self.env, AddToBootstrapClassLoaderSearch);
            check(add_fn(self.env, c_segment.as_ptr()))
        }
    }

    // =========================================================================
    // Stacks & objects
    // =========================================================================

    /// Fills `frames` with the top of `thread`'s stack starting at
    /// `start_depth` and returns the number of frames written. Does not
    /// allocate.
    pub fn get_stack_trace_into(&self, thread: jni::jthread, start_depth: jni::jint, frames: &mut [jvmti::jvmtiFrameInfo]) -> Result<usize, jvmti::jvmtiError> {
        let mut count: jni::jint = 0;
        unsafe {
            let get_stack_fn = jvmti_fn!(self.env, GetStackTrace);
            check(get_stack_fn(self.env, thread, start_depth, frames.len() as jni::jint, frames.as_mut_ptr(), &mut count))?;
        }
        Ok((count.max(0) as usize).min(frames.len()))
    }

    pub fn set_tag(&self, object: jni::jobject, tag: jni::jlong) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let set_fn = jvmti_fn!(self.env, SetTag);
            check(set_fn(self.env, object, tag))
        }
    }

    pub fn get_object_size(&self, object: jni::jobject) -> Result<jni::jlong, jvmti::jvmtiError> {
        let mut size: jni::jlong = 0;
        unsafe {
            let get_fn = jvmti_fn!(self.env, GetObjectSize);
            check(get_fn(self.env, object, &mut size))?;
        }
        Ok(size)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub fn get_error_name(&self, error: jvmti::jvmtiError) -> Result<String, jvmti::jvmtiError> {
        let mut name_ptr: *mut c_char = ptr::null_mut();
        unsafe {
            let get_fn = jvmti_fn!(self.env, GetErrorName);
            check(get_fn(self.env, error, &mut name_ptr))?;
            Ok(self.take_string(name_ptr)?.unwrap_or_default())
        }
    }
}
