#![allow(dead_code)]

use heapster::error::{Error, Result};
use heapster::monitor::RawLock;
use heapster::rewrite::HostAllocator;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::{self, ThreadId};

pub struct CpBuilder {
    pub entries: Vec<Vec<u8>>,
    slots: u16,
}

impl CpBuilder {
    pub fn new() -> Self {
        Self { entries: Vec::new(), slots: 0 }
    }

    pub fn push(&mut self, entry: Vec<u8>, width: u16) -> u16 {
        self.entries.push(entry);
        let index = self.slots + 1;
        self.slots += width;
        index
    }

    /// The `constant_pool_count` field for the entries pushed so far.
    pub fn count(&self) -> u16 {
        self.slots + 1
    }

    pub fn utf8(&mut self, s: &str) -> u16 {
        self.utf8_bytes(s.as_bytes())
    }

    /// A `CONSTANT_Utf8` holding `bytes` as they would appear in a class
    /// file (modified UTF-8).
    pub fn utf8_bytes(&mut self, bytes: &[u8]) -> u16 {
        let mut entry = vec![1];
        entry.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        entry.extend_from_slice(bytes);
        self.push(entry, 1)
    }

    pub fn class(&mut self, name_index: u16) -> u16 {
        let mut entry = vec![7];
        entry.extend_from_slice(&name_index.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn class_named(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        self.class(name_index)
    }

    pub fn name_and_type(&mut self, name_index: u16, descriptor_index: u16) -> u16 {
        let mut entry = vec![12];
        entry.extend_from_slice(&name_index.to_be_bytes());
        entry.extend_from_slice(&descriptor_index.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn methodref(&mut self, class_index: u16, name_and_type_index: u16) -> u16 {
        let mut entry = vec![10];
        entry.extend_from_slice(&class_index.to_be_bytes());
        entry.extend_from_slice(&name_and_type_index.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn method(&mut self, class_index: u16, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let nat = self.name_and_type(name_index, descriptor_index);
        self.methodref(class_index, nat)
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        let mut entry = vec![3];
        entry.extend_from_slice(&value.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn float_bits(&mut self, bits: u32) -> u16 {
        let mut entry = vec![4];
        entry.extend_from_slice(&bits.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn long(&mut self, value: i64) -> u16 {
        let mut entry = vec![5];
        entry.extend_from_slice(&value.to_be_bytes());
        self.push(entry, 2)
    }

    pub fn double_bits(&mut self, bits: u64) -> u16 {
        let mut entry = vec![6];
        entry.extend_from_slice(&bits.to_be_bytes());
        self.push(entry, 2)
    }

    pub fn string(&mut self, utf8_index: u16) -> u16 {
        let mut entry = vec![8];
        entry.extend_from_slice(&utf8_index.to_be_bytes());
        self.push(entry, 1)
    }
}

pub fn u1(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn push_attr(out: &mut Vec<u8>, name_index: u16, info: &[u8]) {
    u2(out, name_index);
    u4(out, info.len() as u32);
    out.extend_from_slice(info);
}

/// A method body to be wrapped in a `Code` attribute.
#[derive(Default, Clone)]
pub struct Body {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    /// `[start_pc, end_pc, handler_pc, catch_type]`
    pub exception_table: Vec<[u16; 4]>,
    /// `(name_index, info)`
    pub attributes: Vec<(u16, Vec<u8>)>,
}

impl Body {
    pub fn new(max_stack: u16, code: &[u8]) -> Self {
        Body { max_stack, max_locals: 1, code: code.to_vec(), ..Body::default() }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut info = Vec::new();
        u2(&mut info, self.max_stack);
        u2(&mut info, self.max_locals);
        u4(&mut info, self.code.len() as u32);
        info.extend_from_slice(&self.code);
        u2(&mut info, self.exception_table.len() as u16);
        for entry in &self.exception_table {
            for field in entry {
                u2(&mut info, *field);
            }
        }
        u2(&mut info, self.attributes.len() as u16);
        for (name, attr) in &self.attributes {
            push_attr(&mut info, *name, attr);
        }
        info
    }
}

struct MethodDef {
    access: u16,
    name: u16,
    descriptor: u16,
    body: Option<Body>,
}

/// Builds small class files: `this_class` extends `java/lang/Object`.
pub struct ClassBuilder {
    pub cp: CpBuilder,
    pub this_class: u16,
    pub object_class: u16,
    code_name: u16,
    methods: Vec<MethodDef>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        let mut cp = CpBuilder::new();
        let this_class = cp.class_named(name);
        let object_class = cp.class_named("java/lang/Object");
        let code_name = cp.utf8("Code");
        ClassBuilder { cp, this_class, object_class, code_name, methods: Vec::new() }
    }

    pub fn method(&mut self, access: u16, name: &str, descriptor: &str, body: Option<Body>) -> &mut Self {
        let name = self.cp.utf8(name);
        let descriptor = self.cp.utf8(descriptor);
        self.methods.push(MethodDef { access, name, descriptor, body });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        u4(&mut bytes, 0xCAFEBABE);
        u2(&mut bytes, 0);
        u2(&mut bytes, 52);
        u2(&mut bytes, self.cp.count());
        for entry in &self.cp.entries {
            bytes.extend_from_slice(entry);
        }
        u2(&mut bytes, 0x0021);
        u2(&mut bytes, self.this_class);
        u2(&mut bytes, self.object_class);
        u2(&mut bytes, 0); // interfaces
        u2(&mut bytes, 0); // fields
        u2(&mut bytes, self.methods.len() as u16);
        for method in &self.methods {
            u2(&mut bytes, method.access);
            u2(&mut bytes, method.name);
            u2(&mut bytes, method.descriptor);
            match &method.body {
                Some(body) => {
                    u2(&mut bytes, 1);
                    push_attr(&mut bytes, self.code_name, &body.encode());
                }
                None => u2(&mut bytes, 0),
            }
        }
        u2(&mut bytes, 0); // class attributes
        bytes
    }
}

/// A spin lock that counts how often it was entered and left.
#[derive(Default)]
pub struct SpinLock {
    held: AtomicBool,
    pub enters: AtomicUsize,
    pub exits: AtomicUsize,
}

impl SpinLock {
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn balanced(&self) -> bool {
        self.enters.load(Ordering::SeqCst) == self.exits.load(Ordering::SeqCst)
    }
}

impl RawLock for SpinLock {
    fn enter(&self) -> Result<()> {
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        self.enters.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn exit(&self) -> Result<()> {
        self.exits.fetch_add(1, Ordering::SeqCst);
        self.held.store(false, Ordering::Release);
        Ok(())
    }
}

/// A lock the owning thread may enter again, like a host raw monitor.
#[derive(Default)]
pub struct RecursiveLock {
    owner: Mutex<Option<(ThreadId, usize)>>,
    /// Highest nesting depth reached.
    pub deepest: AtomicUsize,
}

impl RecursiveLock {
    pub fn is_held(&self) -> bool {
        self.owner.lock().unwrap().is_some()
    }
}

impl RawLock for RecursiveLock {
    fn enter(&self) -> Result<()> {
        let me = thread::current().id();
        loop {
            let mut owner = self.owner.lock().unwrap();
            let current = *owner;
            match current {
                None => {
                    *owner = Some((me, 1));
                    self.deepest.fetch_max(1, Ordering::SeqCst);
                    return Ok(());
                }
                Some((id, depth)) if id == me => {
                    *owner = Some((me, depth + 1));
                    self.deepest.fetch_max(depth + 1, Ordering::SeqCst);
                    return Ok(());
                }
                Some(_) => {
                    drop(owner);
                    thread::yield_now();
                }
            }
        }
    }

    fn exit(&self) -> Result<()> {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap();
        let current = *owner;
        match current {
            Some((id, 1)) if id == me => *owner = None,
            Some((id, depth)) if id == me => *owner = Some((me, depth - 1)),
            _ => return Err(Error::Config("exit by a thread that does not own the lock".into())),
        }
        Ok(())
    }
}

/// Hands out `Vec`-backed buffers and keeps them alive.
#[derive(Default)]
pub struct FakeAllocator {
    pub buffers: RefCell<Vec<Vec<u8>>>,
}

impl HostAllocator for FakeAllocator {
    fn allocate(&self, len: usize) -> Result<*mut u8> {
        let mut buffer = vec![0u8; len];
        let ptr = buffer.as_mut_ptr();
        self.buffers.borrow_mut().push(buffer);
        Ok(ptr)
    }
}
