//! Per-site allocation counters.
//!
//! A site is the `(method, bci)` of the frame that executed the allocation.
//! Counters live in a fixed-size open-addressing table: bumping an existing
//! site is a pair of atomic adds, and only the first allocation at a new
//! site takes the monitor to claim a slot.

use crate::env::Jvmti;
use crate::error::{Error, Result};
use crate::monitor::{Monitor, RawLock, RawMonitor};
use crate::sys::jni::{jlong, jmethodID, jobject, jthread};
use crate::sys::jvmti::{jlocation, jvmtiFrameInfo};
use log::warn;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Frames fetched per allocation: the native, the managed helper, the
/// allocating frame and one spare.
pub const STACK_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SiteKey {
    /// `jmethodID` as an integer; 0 never names a method.
    pub method: u64,
    pub location: jlocation,
}

impl SiteKey {
    pub fn from_frame(frame: &jvmtiFrameInfo) -> Self {
        SiteKey { method: frame.method as u64, location: frame.location }
    }

    pub fn method_id(&self) -> jmethodID {
        self.method as jmethodID
    }

    fn hash(&self) -> u64 {
        let h = self.method.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (self.location as u64);
        h.wrapping_mul(0xC2B2_AE3D_27D4_EB4F) ^ (h >> 29)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteSnapshot {
    pub key: SiteKey,
    pub count: u64,
    pub bytes: u64,
    /// Allocations not yet freed; only meaningful with object tagging.
    pub live: i64,
}

#[derive(Default)]
struct Slot {
    method: AtomicU64,
    location: AtomicI64,
    count: AtomicU64,
    bytes: AtomicU64,
    live: AtomicI64,
}

/// Fixed-capacity site table. Never resized, never shrinks.
pub struct SiteTable<L: RawLock = RawMonitor> {
    slots: Box<[Slot]>,
    mask: usize,
    limit: usize,
    len: AtomicUsize,
    overflow: AtomicU64,
    insert: Monitor<(), L>,
}

impl<L: RawLock> SiteTable<L> {
    /// A table holding up to `max_sites` sites. Slots are allocated at
    /// twice that, rounded up to a power of two, to keep probes short.
    pub fn new(lock: L, max_sites: usize) -> Self {
        let max_sites = max_sites.max(1);
        let capacity = (max_sites * 2).next_power_of_two();
        let slots = (0..capacity).map(|_| Slot::default()).collect::<Vec<_>>().into_boxed_slice();
        SiteTable {
            slots,
            mask: capacity - 1,
            limit: max_sites,
            len: AtomicUsize::new(0),
            overflow: AtomicU64::new(0),
            insert: Monitor::new(lock, ()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocations that found the table full.
    pub fn overflow(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    fn probe(&self, key: &SiteKey) -> std::result::Result<usize, usize> {
        let mut index = key.hash() as usize & self.mask;
        loop {
            let slot = &self.slots[index];
            let method = slot.method.load(Ordering::Acquire);
            if method == 0 {
                return Err(index);
            }
            if method == key.method && slot.location.load(Ordering::Relaxed) == key.location {
                return Ok(index);
            }
            index = (index + 1) & self.mask;
        }
    }

    fn bump(&self, index: usize, bytes: u64) {
        let slot = &self.slots[index];
        slot.count.fetch_add(1, Ordering::Relaxed);
        slot.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Counts one allocation of `bytes` at `key` and returns its slot, or
    /// `None` when the table is full (counted as overflow).
    pub fn increment(&self, key: SiteKey, bytes: u64) -> Option<usize> {
        if key.method == 0 {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if let Ok(index) = self.probe(&key) {
            self.bump(index, bytes);
            return Some(index);
        }

        let _guard = self.insert.lock();
        let index = match self.probe(&key) {
            Ok(index) => index,
            Err(_) if self.len.load(Ordering::Relaxed) >= self.limit => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(empty) => {
                let slot = &self.slots[empty];
                slot.location.store(key.location, Ordering::Relaxed);
                slot.method.store(key.method, Ordering::Release);
                self.len.fetch_add(1, Ordering::Release);
                empty
            }
        };
        self.bump(index, bytes);
        Some(index)
    }

    pub fn get(&self, key: &SiteKey) -> Option<SiteSnapshot> {
        self.probe(key).ok().map(|index| self.read(index))
    }

    pub fn add_live(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            slot.live.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns false if `index` does not hold a site.
    pub fn sub_live(&self, index: usize) -> bool {
        match self.slots.get(index) {
            Some(slot) if slot.method.load(Ordering::Acquire) != 0 => {
                slot.live.fetch_sub(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    fn read(&self, index: usize) -> SiteSnapshot {
        let slot = &self.slots[index];
        SiteSnapshot {
            key: SiteKey { method: slot.method.load(Ordering::Acquire), location: slot.location.load(Ordering::Relaxed) },
            count: slot.count.load(Ordering::Relaxed),
            bytes: slot.bytes.load(Ordering::Relaxed),
            live: slot.live.load(Ordering::Relaxed),
        }
    }

    /// Every occupied slot, read under the monitor.
    pub fn snapshot(&self) -> Vec<SiteSnapshot> {
        let _guard = self.insert.lock();
        (0..self.slots.len())
            .filter(|&index| self.slots[index].method.load(Ordering::Acquire) != 0)
            .map(|index| self.read(index))
            .collect()
    }
}

/// The `jmethodID`s of the helper's own frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperMethods {
    ids: [u64; 2],
}

impl HelperMethods {
    pub fn new(managed: jmethodID, native: jmethodID) -> Self {
        HelperMethods { ids: [managed as u64, native as u64] }
    }

    pub fn contains(&self, method: jmethodID) -> bool {
        self.ids.contains(&(method as u64))
    }
}

/// The allocating frame: the first one that is not part of the helper.
pub fn site_frame<'a>(frames: &'a [jvmtiFrameInfo], helpers: &HelperMethods) -> Option<&'a jvmtiFrameInfo> {
    frames.iter().find(|frame| !frame.method.is_null() && !helpers.contains(frame.method))
}

/// Host services the recorder needs on the allocating thread.
pub trait AllocationHost {
    fn stack_frames(&self, thread: jthread, frames: &mut [jvmtiFrameInfo]) -> Result<usize>;
    fn object_size(&self, object: jobject) -> Result<jlong>;
    fn set_tag(&self, object: jobject, tag: jlong) -> Result<()>;
}

impl AllocationHost for Jvmti {
    fn stack_frames(&self, thread: jthread, frames: &mut [jvmtiFrameInfo]) -> Result<usize> {
        self.get_stack_trace_into(thread, 0, frames)
            .map_err(|code| Error::jvmti(self, "GetStackTrace", code))
    }

    fn object_size(&self, object: jobject) -> Result<jlong> {
        self.get_object_size(object)
            .map_err(|code| Error::jvmti(self, "GetObjectSize", code))
    }

    fn set_tag(&self, object: jobject, tag: jlong) -> Result<()> {
        Jvmti::set_tag(self, object, tag).map_err(|code| Error::jvmti(self, "SetTag", code))
    }
}

pub struct Recorder<L: RawLock = RawMonitor> {
    table: SiteTable<L>,
    helpers: OnceLock<HelperMethods>,
    track_live: bool,
    unattributed: AtomicU64,
}

impl<L: RawLock> Recorder<L> {
    pub fn new(lock: L, max_sites: usize, track_live: bool) -> Self {
        Recorder {
            table: SiteTable::new(lock, max_sites),
            helpers: OnceLock::new(),
            track_live,
            unattributed: AtomicU64::new(0),
        }
    }

    /// Binds the helper frames to skip. Must happen before the first call
    /// to [`record`](Recorder::record). Only the first binding counts;
    /// returns false for a later one.
    pub fn set_helper_methods(&self, helpers: HelperMethods) -> bool {
        match self.helpers.set(helpers) {
            Ok(()) => true,
            Err(rejected) => {
                warn!("helper methods already bound; ignoring {rejected:?}");
                false
            }
        }
    }

    pub fn track_live(&self) -> bool {
        self.track_live
    }

    pub fn table(&self) -> &SiteTable<L> {
        &self.table
    }

    /// Allocations whose stack had no frame outside the helper.
    pub fn unattributed(&self) -> u64 {
        self.unattributed.load(Ordering::Relaxed)
    }

    /// Counts `object`, allocated by the code running on `thread`.
    pub fn record<H: AllocationHost + ?Sized>(&self, host: &H, thread: jthread, object: jobject) -> Result<()> {
        let Some(helpers) = self.helpers.get() else {
            return Ok(());
        };
        let mut frames = [jvmtiFrameInfo::default(); STACK_DEPTH];
        let depth = host.stack_frames(thread, &mut frames)?;
        let Some(frame) = site_frame(&frames[..depth], helpers) else {
            self.unattributed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        let size = host.object_size(object)?;
        let Some(slot) = self.table.increment(SiteKey::from_frame(frame), size.max(0) as u64) else {
            return Ok(());
        };
        if self.track_live {
            host.set_tag(object, slot as jlong + 1)?;
            self.table.add_live(slot);
        }
        Ok(())
    }

    /// Handles an `ObjectFree` event for an object tagged by `record`.
    pub fn object_freed(&self, tag: jlong) {
        if !self.track_live || tag <= 0 {
            return;
        }
        self.table.sub_live(tag as usize - 1);
    }

    pub fn snapshot(&self) -> Vec<SiteSnapshot> {
        self.table.snapshot()
    }
}
