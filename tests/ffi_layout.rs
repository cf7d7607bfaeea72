use heapster::sys::jni::{JNIInvokeInterface_, JNINativeInterface_, JNINativeMethod};
use heapster::sys::jvmti::{jvmtiEventCallbacks, jvmtiFrameInfo, jvmtiInterface_1_, jvmtiLineNumberEntry};
use std::mem::{offset_of, size_of};

const PTR: usize = size_of::<*const ()>();

#[test]
fn jvmti_function_table_slots() {
    assert_eq!(offset_of!(jvmtiInterface_1_, SetEventNotificationMode), PTR);
    assert_eq!(offset_of!(jvmtiInterface_1_, CreateRawMonitor), 30 * PTR);
    assert_eq!(offset_of!(jvmtiInterface_1_, RawMonitorExit), 33 * PTR);
    assert_eq!(offset_of!(jvmtiInterface_1_, Allocate), 45 * PTR);
    assert_eq!(offset_of!(jvmtiInterface_1_, GetClassSignature), 47 * PTR);
    assert_eq!(offset_of!(jvmtiInterface_1_, GetMethodName), 63 * PTR);
    assert_eq!(offset_of!(jvmtiInterface_1_, GetLineNumberTable), 69 * PTR);
    assert_eq!(offset_of!(jvmtiInterface_1_, GetStackTrace), 103 * PTR);
    assert_eq!(offset_of!(jvmtiInterface_1_, SetTag), 106 * PTR);
    assert_eq!(offset_of!(jvmtiInterface_1_, SetEventCallbacks), 121 * PTR);
    assert_eq!(offset_of!(jvmtiInterface_1_, GetErrorName), 127 * PTR);
    assert_eq!(offset_of!(jvmtiInterface_1_, GetPotentialCapabilities), 139 * PTR);
    assert_eq!(offset_of!(jvmtiInterface_1_, AddCapabilities), 141 * PTR);
    assert_eq!(offset_of!(jvmtiInterface_1_, AddToBootstrapClassLoaderSearch), 148 * PTR);
    assert_eq!(offset_of!(jvmtiInterface_1_, GetObjectSize), 153 * PTR);
    assert_eq!(size_of::<jvmtiInterface_1_>(), 156 * PTR);
}

#[test]
fn event_callback_slots() {
    assert_eq!(offset_of!(jvmtiEventCallbacks, VMDeath), PTR);
    assert_eq!(offset_of!(jvmtiEventCallbacks, ClassFileLoadHook), 4 * PTR);
    assert_eq!(offset_of!(jvmtiEventCallbacks, VMStart), 7 * PTR);
    assert_eq!(offset_of!(jvmtiEventCallbacks, ObjectFree), 33 * PTR);
    assert_eq!(size_of::<jvmtiEventCallbacks>(), 37 * PTR);

    let callbacks = heapster::event_callbacks();
    assert!(callbacks.VMStart.is_some());
    assert!(callbacks.VMDeath.is_some());
    assert!(callbacks.ClassFileLoadHook.is_some());
    assert!(callbacks.ObjectFree.is_some());
}

#[test]
fn jni_function_table_slots() {
    assert_eq!(offset_of!(JNINativeInterface_, FindClass), 6 * PTR);
    assert_eq!(offset_of!(JNINativeInterface_, ExceptionClear), 17 * PTR);
    assert_eq!(offset_of!(JNINativeInterface_, NewGlobalRef), 21 * PTR);
    assert_eq!(offset_of!(JNINativeInterface_, DeleteLocalRef), 23 * PTR);
    assert_eq!(offset_of!(JNINativeInterface_, GetStaticMethodID), 113 * PTR);
    assert_eq!(offset_of!(JNINativeInterface_, GetStaticFieldID), 144 * PTR);
    assert_eq!(offset_of!(JNINativeInterface_, SetStaticIntField), 159 * PTR);
    assert_eq!(offset_of!(JNINativeInterface_, RegisterNatives), 215 * PTR);
    assert_eq!(offset_of!(JNINativeInterface_, ExceptionCheck), 228 * PTR);
    assert_eq!(size_of::<JNINativeInterface_>(), 236 * PTR);
    assert_eq!(offset_of!(JNIInvokeInterface_, GetEnv), 6 * PTR);
}

#[test]
fn plain_structs() {
    assert_eq!(size_of::<JNINativeMethod>(), 3 * PTR);
    assert_eq!(size_of::<jvmtiFrameInfo>(), PTR + 8);
    assert_eq!(offset_of!(jvmtiFrameInfo, location), PTR);
    assert_eq!(offset_of!(jvmtiLineNumberEntry, line_number), 8);
}

#[test]
fn helper_native_matches_its_java_declaration() {
    use heapster::bridge::{native_methods, NATIVE_NAME, NATIVE_SIGNATURE};

    let [method] = native_methods();
    assert_eq!(method.name, NATIVE_NAME.as_ptr());
    assert_eq!(method.signature, NATIVE_SIGNATURE.as_ptr());
    assert!(!method.fnPtr.is_null());
    assert_eq!(NATIVE_SIGNATURE.to_str().unwrap(), "(Ljava/lang/Object;Ljava/lang/Object;)V");
}
