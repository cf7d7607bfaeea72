//! The class rewriter seam and the allocation injector behind it.
//!
//! The interceptor hands each loaded class to a [`ClassRewriter`]; the
//! production implementation is [`AllocationInjector`], which routes every
//! `new`, `newarray`, `anewarray` and `multianewarray` result through
//! `HeapsterHelper.newObject`. [`publish`] moves a rewritten image into
//! host memory for the class file load hook.

pub mod bytecode;
pub mod inject;
pub mod offsets;
pub mod stackmap;

pub use inject::{instrument_class, Instrumented, MethodSites, RewriteStats, SiteOffset};
pub use offsets::SiteOffsets;

use crate::env::Jvmti;
use crate::error::{Error, Result};
use crate::sys::jni::jint;
use log::debug;
use std::ptr;

pub const HELPER_CLASS: &str = "HeapsterHelper";
pub const HELPER_METHOD: &str = "newObject";
pub const HELPER_SIGNATURE: &str = "(Ljava/lang/Object;)V";

/// One class, as seen by the load hook.
#[derive(Debug, Clone, Copy)]
pub struct RewriteRequest<'a> {
    /// Order in which the interceptor saw the class, starting at 0.
    pub index: u32,
    /// Internal name, `a/b/C`.
    pub name: &'a str,
    /// Loaded before VM start; selects the bootstrap-safe rewrite.
    pub is_system: bool,
    pub bytes: &'a [u8],
}

pub trait ClassRewriter: Send + Sync {
    /// `Ok(None)` leaves the class as loaded.
    fn rewrite(&self, request: &RewriteRequest<'_>) -> Result<Option<Instrumented>>;
}

/// The managed method every allocation is reported to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperSpec {
    pub class_name: String,
    pub descriptor: String,
    pub method_name: String,
    pub method_signature: String,
}

impl Default for HelperSpec {
    fn default() -> Self {
        HelperSpec {
            class_name: HELPER_CLASS.to_owned(),
            descriptor: format!("L{HELPER_CLASS};"),
            method_name: HELPER_METHOD.to_owned(),
            method_signature: HELPER_SIGNATURE.to_owned(),
        }
    }
}

/// Classes the bootstrap-safe rewrite leaves alone: they run before the
/// helper can be resolved, or resolving it depends on them.
pub fn is_bootstrap_exempt(name: &str) -> bool {
    matches!(
        name,
        "java/lang/Object"
            | "java/lang/Thread"
            | "java/lang/Class"
            | "java/lang/String"
            | "java/lang/System"
            | "java/lang/ClassLoader"
    ) || name.starts_with("java/lang/ref/")
}

#[derive(Debug, Default, Clone)]
pub struct AllocationInjector {
    helper: HelperSpec,
}

impl AllocationInjector {
    pub fn new(helper: HelperSpec) -> Self {
        AllocationInjector { helper }
    }

    pub fn helper(&self) -> &HelperSpec {
        &self.helper
    }
}

impl ClassRewriter for AllocationInjector {
    fn rewrite(&self, request: &RewriteRequest<'_>) -> Result<Option<Instrumented>> {
        if request.is_system && is_bootstrap_exempt(request.name) {
            return Ok(None);
        }
        match instrument_class(request.bytes, request.is_system, &self.helper) {
            Ok(Some(instrumented)) => {
                debug!(
                    "#{} {}{}: {} sites in {} methods",
                    request.index,
                    request.name,
                    if request.is_system { " (system)" } else { "" },
                    instrumented.stats.sites,
                    instrumented.stats.methods
                );
                Ok(Some(instrumented))
            }
            Ok(None) => Ok(None),
            Err(source) => Err(Error::Rewrite { class: request.name.to_owned(), source }),
        }
    }
}

/// Memory the host takes ownership of.
pub trait HostAllocator {
    fn allocate(&self, len: usize) -> Result<*mut u8>;
}

impl HostAllocator for Jvmti {
    fn allocate(&self, len: usize) -> Result<*mut u8> {
        Jvmti::allocate(self, len as i64).map_err(|code| Error::jvmti(self, "Allocate", code))
    }
}

/// Copies `image` into host memory and fills the hook's out-parameters.
/// An empty image writes nothing, which tells the host the class is
/// unchanged.
///
/// # Safety
///
/// `new_len` and `new_data` must be valid for writes.
pub unsafe fn publish<A: HostAllocator + ?Sized>(
    image: &[u8],
    allocator: &A,
    new_len: *mut jint,
    new_data: *mut *mut u8,
) -> Result<()> {
    if image.is_empty() {
        return Ok(());
    }
    let len = jint::try_from(image.len()).map_err(|_| Error::ImageTooLarge(image.len()))?;
    let buffer = allocator.allocate(image.len())?;
    ptr::copy_nonoverlapping(image.as_ptr(), buffer, image.len());
    *new_len = len;
    *new_data = buffer;
    Ok(())
}
