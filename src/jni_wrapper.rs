//! Safe wrapper around the JNI environment.
//!
//! Only the calls the agent makes at VM start and VM death are wrapped:
//! class lookup, static field and method IDs, native registration and
//! exception handling.
//!
//! ```rust,ignore
//! let env = unsafe { JniEnv::from_raw(jni) };
//! let helper = LocalRef::new(&env, env.find_class("HeapsterHelper")?);
//! env.register_natives(helper.get(), &methods)?;
//! ```

use crate::sys::jni;
use std::ffi::CString;

/// Safe wrapper around a JNI environment pointer.
///
/// # Thread Safety
///
/// A `JniEnv` is tied to a specific thread and cannot be sent across threads.
/// Each JVM thread has its own JNI environment.
pub struct JniEnv {
    env: *mut jni::JNIEnv,
}

impl JniEnv {
    /// Creates a JniEnv wrapper from a raw pointer.
    ///
    /// # Safety
    ///
    /// The caller must ensure the pointer is valid and comes from the current thread.
    pub unsafe fn from_raw(env: *mut jni::JNIEnv) -> Self {
        JniEnv { env }
    }

    // =========================================================================
    // Class Operations
    // =========================================================================

    /// Finds a class by its fully qualified name.
    ///
    /// The name should use '/' as package separator (e.g., "java/lang/String").
    /// A failed lookup leaves `NoClassDefFoundError` pending.
    pub fn find_class(&self, name: &str) -> Option<jni::jclass> {
        let c_name = CString::new(name).ok()?;
        unsafe {
            let vtable = *self.env;
            let cls = ((*vtable).FindClass)(self.env, c_name.as_ptr());
            if cls.is_null() { None } else { Some(cls) }
        }
    }

    // =========================================================================
    // Exception Handling
    // =========================================================================

    /// Checks if an exception is pending.
    pub fn exception_check(&self) -> bool {
        unsafe {
            let vtable = *self.env;
            ((*vtable).ExceptionCheck)(self.env) != 0
        }
    }

    /// Clears any pending exception.
    pub fn exception_clear(&self) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).ExceptionClear)(self.env);
        }
    }

    /// Prints the pending exception and stack trace to stderr.
    pub fn exception_describe(&self) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).ExceptionDescribe)(self.env);
        }
    }

    /// Describes and clears a pending exception, returning whether one was set.
    pub fn take_exception(&self) -> bool {
        if !self.exception_check() {
            return false;
        }
        self.exception_describe();
        self.exception_clear();
        true
    }

    // =========================================================================
    // Method & Field IDs
    // =========================================================================

    /// Gets the method ID for a static method.
    pub fn get_static_method_id(&self, cls: jni::jclass, name: &str, sig: &str) -> Option<jni::jmethodID> {
        let c_name = CString::new(name).ok()?;
        let c_sig = CString::new(sig).ok()?;
        unsafe {
            let vtable = *self.env;
            let mid = ((*vtable).GetStaticMethodID)(self.env, cls, c_name.as_ptr(), c_sig.as_ptr());
            if mid.is_null() { None } else { Some(mid) }
        }
    }

    /// Gets the field ID for a static field.
    pub fn get_static_field_id(&self, cls: jni::jclass, name: &str, sig: &str) -> Option<jni::jfieldID> {
        let c_name = CString::new(name).ok()?;
        let c_sig = CString::new(sig).ok()?;
        unsafe {
            let vtable = *self.env;
            let fid = ((*vtable).GetStaticFieldID)(self.env, cls, c_name.as_ptr(), c_sig.as_ptr());
            if fid.is_null() { None } else { Some(fid) }
        }
    }

    /// Sets a static int field.
    pub fn set_static_int_field(&self, cls: jni::jclass, field_id: jni::jfieldID, value: jni::jint) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).SetStaticIntField)(self.env, cls, field_id, value);
        }
    }

    // =========================================================================
    // References
    // =========================================================================

    pub fn new_global_ref(&self, obj: jni::jobject) -> jni::jobject {
        unsafe {
            let vtable = *self.env;
            ((*vtable).NewGlobalRef)(self.env, obj)
        }
    }

    pub fn delete_global_ref(&self, obj: jni::jobject) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).DeleteGlobalRef)(self.env, obj);
        }
    }

    pub fn delete_local_ref(&self, obj: jni::jobject) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).DeleteLocalRef)(self.env, obj);
        }
    }

    // =========================================================================
    // Native Method Registration
    // =========================================================================

    /// Registers native methods for a class.
    pub fn register_natives(&self, cls: jni::jclass, methods: &[jni::JNINativeMethod]) -> Result<(), jni::jint> {
        unsafe {
            let vtable = *self.env;
            let result = ((*vtable).RegisterNatives)(self.env, cls, methods.as_ptr(), methods.len() as jni::jint);
            if result == jni::JNI_OK { Ok(()) } else { Err(result) }
        }
    }
}

// =========================================================================
// Reference Guards (RAII wrappers)
// =========================================================================

/// A guard that automatically deletes a local reference when dropped.
pub struct LocalRef<'a> {
    env: &'a JniEnv,
    obj: jni::jobject,
}

impl<'a> LocalRef<'a> {
    /// Creates a new LocalRef guard.
    pub fn new(env: &'a JniEnv, obj: jni::jobject) -> Self {
        LocalRef { env, obj }
    }

    /// Returns the underlying jobject.
    pub fn get(&self) -> jni::jobject {
        self.obj
    }
}

impl<'a> Drop for LocalRef<'a> {
    fn drop(&mut self) {
        if !self.obj.is_null() {
            self.env.delete_local_ref(self.obj);
        }
    }
}
