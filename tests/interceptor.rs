mod common;

use common::{Body, ClassBuilder, FakeAllocator, RecursiveLock, SpinLock};
use heapster::error::{Error, Result};
use heapster::interceptor::ClassFileInterceptor;
use heapster::jni::jint;
use heapster::rewrite::{
    publish, AllocationInjector, ClassRewriter, HelperSpec, Instrumented, RewriteRequest, RewriteStats, HELPER_CLASS,
};
use std::sync::atomic::Ordering;
use std::ptr;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Seen {
    index: u32,
    name: String,
    is_system: bool,
}

#[derive(Clone, Copy)]
enum Reply {
    Unchanged,
    Image,
    Empty,
    Fail,
}

struct Recording {
    reply: Reply,
    seen: Mutex<Vec<Seen>>,
}

impl Recording {
    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

impl ClassRewriter for Recording {
    fn rewrite(&self, request: &RewriteRequest<'_>) -> Result<Option<Instrumented>> {
        self.seen.lock().unwrap().push(Seen {
            index: request.index,
            name: request.name.to_owned(),
            is_system: request.is_system,
        });
        match self.reply {
            Reply::Unchanged => Ok(None),
            Reply::Image => Ok(Some(image(request.bytes.iter().rev().copied().collect()))),
            Reply::Empty => Ok(Some(image(Vec::new()))),
            Reply::Fail => Err(Error::Config("rewriter refused".into())),
        }
    }
}

fn image(image: Vec<u8>) -> Instrumented {
    Instrumented { image, stats: RewriteStats::default(), methods: Vec::new() }
}

fn interceptor(reply: Reply) -> (ClassFileInterceptor<Recording, Arc<SpinLock>>, Arc<SpinLock>) {
    let lock = Arc::new(SpinLock::default());
    let rewriter = Recording { reply, seen: Mutex::new(Vec::new()) };
    (ClassFileInterceptor::new(Arc::clone(&lock), rewriter, HELPER_CLASS), lock)
}

fn named_class(name: &str) -> Vec<u8> {
    let mut class = ClassBuilder::new(name);
    class.method(0x0008, "make", "()[I", Some(Body::new(1, &[0x04, 0xbc, 10, 0xb0])));
    class.build()
}

#[test]
fn never_rewrites_the_helper() {
    let (interceptor, lock) = interceptor(Reply::Image);
    let bytes = named_class(HELPER_CLASS);

    assert_eq!(interceptor.on_class_file_load(Some(c"HeapsterHelper"), &bytes).unwrap(), None);
    assert_eq!(interceptor.on_class_file_load(None, &bytes).unwrap(), None);
    assert!(interceptor.rewriter().seen().is_empty());
    assert_eq!(interceptor.classes_seen(), 0);
    assert!(lock.balanced());
}

#[test]
fn reads_missing_names_from_the_class_bytes() {
    let (interceptor, _) = interceptor(Reply::Unchanged);
    let bytes = named_class("demo/Anonymous");

    assert_eq!(interceptor.on_class_file_load(None, &bytes).unwrap(), None);
    assert_eq!(
        interceptor.rewriter().seen(),
        vec![Seen { index: 0, name: "demo/Anonymous".into(), is_system: true }]
    );
}

#[test]
fn unreadable_unnamed_class_is_an_error() {
    let (interceptor, _) = interceptor(Reply::Unchanged);
    let result = interceptor.on_class_file_load(None, &[0xde, 0xad, 0xbe, 0xef]);
    assert!(matches!(result, Err(Error::ClassName(_))));
    assert_eq!(interceptor.classes_seen(), 0);
    assert!(interceptor.rewriter().seen().is_empty());
}

#[test]
fn splits_system_and_user_classes_at_vm_start() {
    let (interceptor, lock) = interceptor(Reply::Unchanged);
    let bytes = named_class("demo/Any");

    for name in [c"java/lang/Object", c"java/lang/String", c"java/util/List"] {
        interceptor.on_class_file_load(Some(name), &bytes).unwrap();
    }
    assert!(!interceptor.vm_started());

    let held = interceptor
        .mark_vm_started(|| Ok(lock.is_held()))
        .unwrap();
    assert!(held, "registration runs inside the critical section");
    assert!(interceptor.vm_started());

    for name in [c"demo/Main", c"demo/Worker"] {
        interceptor.on_class_file_load(Some(name), &bytes).unwrap();
    }

    let split: Vec<(u32, bool)> = interceptor
        .rewriter()
        .seen()
        .iter()
        .map(|seen| (seen.index, seen.is_system))
        .collect();
    assert_eq!(split, vec![(0, true), (1, true), (2, true), (3, false), (4, false)]);
    assert_eq!(interceptor.classes_seen(), 5);
    assert!(lock.balanced());
    assert!(!lock.is_held());
}

#[test]
fn registration_errors_propagate() {
    let (interceptor, lock) = interceptor(Reply::Unchanged);
    let result: Result<()> = interceptor.mark_vm_started(|| Err(Error::Jni { op: "RegisterNatives", code: -1 }));
    assert!(matches!(result, Err(Error::Jni { op: "RegisterNatives", code: -1 })));
    assert!(lock.balanced());
}

#[test]
fn rewriter_runs_outside_the_lock() {
    struct Unlocked(Arc<SpinLock>);

    impl ClassRewriter for Unlocked {
        fn rewrite(&self, _request: &RewriteRequest<'_>) -> Result<Option<Instrumented>> {
            assert!(!self.0.is_held());
            Ok(None)
        }
    }

    let lock = Arc::new(SpinLock::default());
    let interceptor = ClassFileInterceptor::new(Arc::clone(&lock), Unlocked(Arc::clone(&lock)), HELPER_CLASS);
    interceptor.on_class_file_load(Some(c"demo/A"), &named_class("demo/A")).unwrap();
}

#[test]
fn classes_loaded_during_registration_are_user_classes() {
    let lock = Arc::new(RecursiveLock::default());
    let rewriter = Recording { reply: Reply::Unchanged, seen: Mutex::new(Vec::new()) };
    let interceptor = ClassFileInterceptor::new(Arc::clone(&lock), rewriter, HELPER_CLASS);
    let bytes = named_class("demo/Nested");

    // Registering natives can load classes on the registering thread,
    // which re-enters the monitor it already holds.
    interceptor
        .mark_vm_started(|| interceptor.on_class_file_load(Some(c"demo/Nested"), &bytes))
        .unwrap();

    assert_eq!(
        interceptor.rewriter().seen(),
        vec![Seen { index: 0, name: "demo/Nested".into(), is_system: false }]
    );
    assert_eq!(lock.deepest.load(Ordering::SeqCst), 2);
    assert!(!lock.is_held());
    assert_eq!(interceptor.classes_seen(), 1);
}

#[test]
fn keeps_call_offsets_of_rewritten_classes() {
    let lock = Arc::new(SpinLock::default());
    let interceptor =
        ClassFileInterceptor::new(Arc::clone(&lock), AllocationInjector::new(HelperSpec::default()), HELPER_CLASS);
    let bytes = named_class("demo/Sites");

    let image = interceptor.on_class_file_load(Some(c"demo/Sites"), &bytes).unwrap();
    assert!(image.is_some());

    // iconst_1; newarray int at 1; the helper call lands at 4.
    let offsets = interceptor.take_site_offsets();
    assert_eq!(offsets.len(), 1);
    assert_eq!(offsets.original_bci("demo/Sites", "make", "()[I", 4), Some(1));
    assert_eq!(offsets.original_bci("demo/Sites", "make", "()[I", 1), None);
    assert!(interceptor.take_site_offsets().is_empty());
    assert!(lock.balanced());
}

#[test]
fn numbers_classes_without_gaps_across_threads() {
    const THREADS: u32 = 8;
    const PER_THREAD: u32 = 100;

    let (interceptor, lock) = interceptor(Reply::Unchanged);
    let bytes = named_class("demo/Concurrent");

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..PER_THREAD {
                    interceptor.on_class_file_load(None, &bytes).unwrap();
                }
            });
        }
    });

    let mut indices: Vec<u32> = interceptor.rewriter().seen().iter().map(|seen| seen.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..THREADS * PER_THREAD).collect::<Vec<_>>());
    assert_eq!(interceptor.classes_seen(), THREADS * PER_THREAD);
    assert!(lock.balanced());
}

#[test]
fn passes_rewritten_images_through() {
    let (interceptor, _) = interceptor(Reply::Image);
    let bytes = named_class("demo/A");
    let image = interceptor.on_class_file_load(Some(c"demo/A"), &bytes).unwrap();
    assert_eq!(image, Some(bytes.iter().rev().copied().collect()));
}

#[test]
fn empty_image_means_unchanged() {
    let (interceptor, _) = interceptor(Reply::Empty);
    let image = interceptor.on_class_file_load(Some(c"demo/A"), &named_class("demo/A")).unwrap();
    assert_eq!(image, None);
    assert_eq!(interceptor.classes_seen(), 1);
}

#[test]
fn rewriter_errors_propagate() {
    let (interceptor, lock) = interceptor(Reply::Fail);
    let result = interceptor.on_class_file_load(Some(c"demo/A"), &named_class("demo/A"));
    assert!(matches!(result, Err(Error::Config(_))));
    assert!(lock.balanced());
}

#[test]
fn publish_fills_out_parameters() {
    let allocator = FakeAllocator::default();
    let image = named_class("demo/Published");
    let mut len: jint = -1;
    let mut data: *mut u8 = ptr::null_mut();

    unsafe { publish(&image, &allocator, &mut len, &mut data) }.unwrap();

    assert_eq!(len as usize, image.len());
    assert!(!data.is_null());
    let published = unsafe { std::slice::from_raw_parts(data, len as usize) };
    assert_eq!(published, image.as_slice());
    assert_eq!(allocator.buffers.borrow().len(), 1);
}

#[test]
fn publishing_nothing_leaves_out_parameters_alone() {
    let allocator = FakeAllocator::default();
    let mut len: jint = -1;
    let mut data: *mut u8 = ptr::null_mut();

    unsafe { publish(&[], &allocator, &mut len, &mut data) }.unwrap();

    assert_eq!(len, -1);
    assert!(data.is_null());
    assert!(allocator.buffers.borrow().is_empty());
}
