// heapster/src/sys/jni.rs
//
// JNI bindings for the subset of the interface the agent calls.
//
// The function table keeps the exact JDK slot layout; slots heapster never
// calls are kept as opaque padding so the named entries land on the right
// offsets. Indices below are 0-based positions in JNINativeInterface_.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use std::ffi::c_void;
use std::os::raw::c_char;

// =============================================================================
// Primitive Types
// =============================================================================

pub type jint = i32;
pub type jlong = i64;
pub type jbyte = i8;
pub type jboolean = u8;
pub type jsize = jint;

// =============================================================================
// Reference Types (opaque pointers)
// =============================================================================

pub type jobject = *mut c_void;
pub type jclass = jobject;
pub type jthread = jobject;

pub type jmethodID = *mut c_void;
pub type jfieldID = *mut c_void;

// =============================================================================
// Constants
// =============================================================================

pub const JNI_OK: jint = 0;
pub const JNI_ERR: jint = -1;
pub const JNI_EVERSION: jint = -3;

pub const JNI_TRUE: jboolean = 1;
pub const JNI_FALSE: jboolean = 0;

// =============================================================================
// JNINativeMethod for RegisterNatives
// =============================================================================

#[repr(C)]
pub struct JNINativeMethod {
    pub name: *const c_char,
    pub signature: *const c_char,
    pub fnPtr: *mut c_void,
}

// =============================================================================
// JNINativeInterface_ - The JNI function table (vtable)
// =============================================================================
//
// 236 slots total. Order must exactly match the JDK header.

#[repr(C)]
pub struct JNINativeInterface_ {
    // 0-3: reserved
    pub reserved: [*mut c_void; 4],
    // 4-5: GetVersion, DefineClass
    _slots_4_5: [*mut c_void; 2],

    // 6: FindClass
    pub FindClass: unsafe extern "system" fn(env: *mut JNIEnv, name: *const c_char) -> jclass,

    // 7-15: reflection, hierarchy, Throw, ThrowNew, ExceptionOccurred
    _slots_7_15: [*mut c_void; 9],

    // 16-17: ExceptionDescribe, ExceptionClear
    pub ExceptionDescribe: unsafe extern "system" fn(env: *mut JNIEnv),
    pub ExceptionClear: unsafe extern "system" fn(env: *mut JNIEnv),

    // 18-20: FatalError, PushLocalFrame, PopLocalFrame
    _slots_18_20: [*mut c_void; 3],

    // 21-22: NewGlobalRef, DeleteGlobalRef
    pub NewGlobalRef: unsafe extern "system" fn(env: *mut JNIEnv, lobj: jobject) -> jobject,
    pub DeleteGlobalRef: unsafe extern "system" fn(env: *mut JNIEnv, gref: jobject),

    // 23: DeleteLocalRef
    pub DeleteLocalRef: unsafe extern "system" fn(env: *mut JNIEnv, obj: jobject),

    // 24-112: object operations, instance method calls, instance fields
    _slots_24_112: [*mut c_void; 89],

    // 113: GetStaticMethodID
    pub GetStaticMethodID: unsafe extern "system" fn(
        env: *mut JNIEnv,
        clazz: jclass,
        name: *const c_char,
        sig: *const c_char,
    ) -> jmethodID,

    // 114-143: CallStatic<Type>Method{,V,A}
    _slots_114_143: [*mut c_void; 30],

    // 144: GetStaticFieldID
    pub GetStaticFieldID: unsafe extern "system" fn(
        env: *mut JNIEnv,
        clazz: jclass,
        name: *const c_char,
        sig: *const c_char,
    ) -> jfieldID,

    // 145-149: GetStatic{Object,Boolean,Byte,Char,Short}Field
    _slots_145_149: [*mut c_void; 5],

    // 150: GetStaticIntField
    pub GetStaticIntField:
        unsafe extern "system" fn(env: *mut JNIEnv, clazz: jclass, fieldID: jfieldID) -> jint,

    // 151-158: GetStatic{Long,Float,Double}Field, SetStatic{Object..Short}Field
    _slots_151_158: [*mut c_void; 8],

    // 159: SetStaticIntField
    pub SetStaticIntField:
        unsafe extern "system" fn(env: *mut JNIEnv, clazz: jclass, fieldID: jfieldID, value: jint),

    // 160-214: remaining static setters, strings, arrays
    _slots_160_214: [*mut c_void; 55],

    // 215: RegisterNatives
    pub RegisterNatives: unsafe extern "system" fn(
        env: *mut JNIEnv,
        clazz: jclass,
        methods: *const JNINativeMethod,
        nMethods: jint,
    ) -> jint,

    // 216-227: UnregisterNatives, monitors, GetJavaVM, regions, critical, weak refs
    _slots_216_227: [*mut c_void; 12],

    // 228: ExceptionCheck (JNI 1.2)
    pub ExceptionCheck: unsafe extern "system" fn(env: *mut JNIEnv) -> jboolean,

    // 229-235: direct buffers, GetObjectRefType, GetModule, IsVirtualThread,
    // GetStringUTFLengthAsLong
    _slots_229_235: [*mut c_void; 7],
}

/// JNIEnv is a pointer to the function table pointer.
pub type JNIEnv = *const JNINativeInterface_;

// =============================================================================
// JNIInvokeInterface_ - The JavaVM function table
// =============================================================================

#[repr(C)]
pub struct JNIInvokeInterface_ {
    pub reserved0: *mut c_void,
    pub reserved1: *mut c_void,
    pub reserved2: *mut c_void,

    // DestroyJavaVM, AttachCurrentThread, DetachCurrentThread
    _slots_3_5: [*mut c_void; 3],

    pub GetEnv:
        unsafe extern "system" fn(vm: *mut JavaVM, penv: *mut *mut c_void, version: jint) -> jint,

    // AttachCurrentThreadAsDaemon
    _slot_7: *mut c_void,
}

/// JavaVM is directly the vtable pointer (C ABI definition)
pub type JavaVM = *const JNIInvokeInterface_;
