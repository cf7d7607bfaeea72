//! Environment wrappers for JVMTI and JNI.
//!
//! [`Jvmti`] wraps the tool interface (capabilities, events, raw monitors,
//! allocation, stack traces, tagging and method symbolization). [`JniEnv`]
//! wraps the per-thread JNI environment used at VM start and VM death, and
//! [`LocalRef`] deletes a local reference when it goes out of scope.
//!
//! ```rust,ignore
//! use heapster::env::{JniEnv, LocalRef};
//!
//! fn bind(jni: &JniEnv) -> Option<()> {
//!     let class = LocalRef::new(jni, jni.find_class("HeapsterHelper")?);
//!     let ready = jni.get_static_field_id(class.get(), "isReady", "I")?;
//!     jni.set_static_int_field(class.get(), ready, 1);
//!     Some(())
//! }
//! ```

pub use crate::jni_wrapper::{JniEnv, LocalRef};
pub use crate::jvmti_wrapper::Jvmti;
