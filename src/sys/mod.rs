//! Raw FFI bindings. Layouts follow `jni.h` and `jvmti.h`.

pub mod jni;
pub mod jvmti;
