//! Lossless class file reader and writer.
//!
//! Only the pieces the allocation rewriter touches are decoded: the constant
//! pool, method headers and the `Code` attribute with the tables that carry
//! bytecode offsets. Everything else travels as raw attribute bytes, so
//! `ClassImage::parse(b)?.write()` reproduces `b` exactly.

use std::borrow::Cow;
use std::fmt;

/// Largest constant pool index a class file can address.
pub const MAX_CONSTANT_POOL: usize = 65535;

pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_ABSTRACT: u16 = 0x0400;

#[derive(Debug, Clone)]
pub struct ClassImage {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<MemberInfo>,
    pub methods: Vec<MemberInfo>,
    pub attributes: Vec<RawAttribute>,
}

/// A field or method: header plus undecoded attributes.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<Option<CpInfo>>,
}

/// A constant pool entry. Utf8 keeps the modified UTF-8 bytes and floating
/// point constants keep their bit patterns so writing is exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpInfo {
    Utf8(Vec<u8>),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

impl CpInfo {
    fn is_wide(&self) -> bool {
        matches!(self, CpInfo::Long(_) | CpInfo::Double(_))
    }
}

impl ConstantPool {
    /// The `constant_pool_count` value: highest usable index plus one.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: u16) -> Result<&CpInfo, ClassFileError> {
        if index == 0 {
            return Err(ClassFileError::InvalidConstantPoolIndex(index));
        }
        self.entries
            .get(index as usize)
            .and_then(|e| e.as_ref())
            .ok_or(ClassFileError::InvalidConstantPoolIndex(index))
    }

    /// The raw modified UTF-8 bytes of a `Utf8` entry.
    pub fn utf8_bytes(&self, index: u16) -> Result<&[u8], ClassFileError> {
        match self.get(index)? {
            CpInfo::Utf8(bytes) => Ok(bytes),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    pub fn get_utf8(&self, index: u16) -> Result<Cow<'_, str>, ClassFileError> {
        Ok(decode_modified_utf8(self.utf8_bytes(index)?))
    }

    /// Raw name bytes of a `CONSTANT_Class` entry.
    pub fn class_name_bytes(&self, index: u16) -> Result<&[u8], ClassFileError> {
        match self.get(index)? {
            CpInfo::Class { name_index } => self.utf8_bytes(*name_index),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    /// Resolves a `CONSTANT_Class` entry to its internal name.
    pub fn class_name(&self, index: u16) -> Result<Cow<'_, str>, ClassFileError> {
        Ok(decode_modified_utf8(self.class_name_bytes(index)?))
    }

    /// Raw `(name, descriptor)` bytes of a field, method or interface
    /// method reference.
    pub fn member_name_and_type_bytes(&self, index: u16) -> Result<(&[u8], &[u8]), ClassFileError> {
        let nat = match self.get(index)? {
            CpInfo::Methodref { name_and_type_index, .. }
            | CpInfo::InterfaceMethodref { name_and_type_index, .. }
            | CpInfo::Fieldref { name_and_type_index, .. } => *name_and_type_index,
            _ => return Err(ClassFileError::InvalidConstantPoolIndex(index)),
        };
        match self.get(nat)? {
            CpInfo::NameAndType { name_index, descriptor_index } => {
                Ok((self.utf8_bytes(*name_index)?, self.utf8_bytes(*descriptor_index)?))
            }
            _ => Err(ClassFileError::InvalidConstantPoolIndex(nat)),
        }
    }

    /// Resolves a member reference to `(name, descriptor)`.
    pub fn member_name_and_type(&self, index: u16) -> Result<(Cow<'_, str>, Cow<'_, str>), ClassFileError> {
        let (name, descriptor) = self.member_name_and_type_bytes(index)?;
        Ok((decode_modified_utf8(name), decode_modified_utf8(descriptor)))
    }

    fn find(&self, entry: &CpInfo) -> Option<u16> {
        self.entries
            .iter()
            .position(|e| e.as_ref() == Some(entry))
            .map(|i| i as u16)
    }

    /// Appends `entry` unless an identical one exists, returning its index.
    pub fn add(&mut self, entry: CpInfo) -> Result<u16, ClassFileError> {
        if let Some(index) = self.find(&entry) {
            return Ok(index);
        }
        let slots = if entry.is_wide() { 2 } else { 1 };
        let index = self.entries.len();
        if index + slots > MAX_CONSTANT_POOL {
            return Err(ClassFileError::ConstantPoolFull);
        }
        let wide = entry.is_wide();
        self.entries.push(Some(entry));
        if wide {
            self.entries.push(None);
        }
        Ok(index as u16)
    }

    pub fn add_utf8(&mut self, value: &str) -> Result<u16, ClassFileError> {
        self.add(CpInfo::Utf8(encode_modified_utf8(value)))
    }

    pub fn add_class(&mut self, name: &str) -> Result<u16, ClassFileError> {
        let name_index = self.add_utf8(name)?;
        self.add(CpInfo::Class { name_index })
    }

    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.add(CpInfo::NameAndType { name_index, descriptor_index })
    }

    pub fn add_methodref(&mut self, class: &str, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let class_index = self.add_class(class)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.add(CpInfo::Methodref { class_index, name_and_type_index })
    }

    fn write(&self, w: &mut Writer) {
        w.u2(self.entries.len() as u16);
        for entry in self.entries.iter().skip(1).flatten() {
            match entry {
                CpInfo::Utf8(bytes) => {
                    w.u1(1);
                    w.u2(bytes.len() as u16);
                    w.bytes(bytes);
                }
                CpInfo::Integer(v) => {
                    w.u1(3);
                    w.u4(*v as u32);
                }
                CpInfo::Float(bits) => {
                    w.u1(4);
                    w.u4(*bits);
                }
                CpInfo::Long(v) => {
                    w.u1(5);
                    w.u8(*v as u64);
                }
                CpInfo::Double(bits) => {
                    w.u1(6);
                    w.u8(*bits);
                }
                CpInfo::Class { name_index } => {
                    w.u1(7);
                    w.u2(*name_index);
                }
                CpInfo::String { string_index } => {
                    w.u1(8);
                    w.u2(*string_index);
                }
                CpInfo::Fieldref { class_index, name_and_type_index } => {
                    w.u1(9);
                    w.u2(*class_index);
                    w.u2(*name_and_type_index);
                }
                CpInfo::Methodref { class_index, name_and_type_index } => {
                    w.u1(10);
                    w.u2(*class_index);
                    w.u2(*name_and_type_index);
                }
                CpInfo::InterfaceMethodref { class_index, name_and_type_index } => {
                    w.u1(11);
                    w.u2(*class_index);
                    w.u2(*name_and_type_index);
                }
                CpInfo::NameAndType { name_index, descriptor_index } => {
                    w.u1(12);
                    w.u2(*name_index);
                    w.u2(*descriptor_index);
                }
                CpInfo::MethodHandle { reference_kind, reference_index } => {
                    w.u1(15);
                    w.u1(*reference_kind);
                    w.u2(*reference_index);
                }
                CpInfo::MethodType { descriptor_index } => {
                    w.u1(16);
                    w.u2(*descriptor_index);
                }
                CpInfo::Dynamic { bootstrap_method_attr_index, name_and_type_index } => {
                    w.u1(17);
                    w.u2(*bootstrap_method_attr_index);
                    w.u2(*name_and_type_index);
                }
                CpInfo::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
                    w.u1(18);
                    w.u2(*bootstrap_method_attr_index);
                    w.u2(*name_and_type_index);
                }
                CpInfo::Module { name_index } => {
                    w.u1(19);
                    w.u2(*name_index);
                }
                CpInfo::Package { name_index } => {
                    w.u1(20);
                    w.u2(*name_index);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackMapFrame {
    Same { offset_delta: u16 },
    SameLocals1StackItem { offset_delta: u16, stack: VerificationTypeInfo },
    SameLocals1StackItemExtended { offset_delta: u16, stack: VerificationTypeInfo },
    Chop { offset_delta: u16, k: u8 },
    SameExtended { offset_delta: u16 },
    Append { offset_delta: u16, locals: Vec<VerificationTypeInfo> },
    Full { offset_delta: u16, locals: Vec<VerificationTypeInfo>, stack: Vec<VerificationTypeInfo> },
}

impl StackMapFrame {
    pub fn offset_delta(&self) -> u16 {
        match self {
            StackMapFrame::Same { offset_delta }
            | StackMapFrame::SameLocals1StackItem { offset_delta, .. }
            | StackMapFrame::SameLocals1StackItemExtended { offset_delta, .. }
            | StackMapFrame::Chop { offset_delta, .. }
            | StackMapFrame::SameExtended { offset_delta }
            | StackMapFrame::Append { offset_delta, .. }
            | StackMapFrame::Full { offset_delta, .. } => *offset_delta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationTypeInfo {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    /// Offset of the `new` instruction that created the value.
    Uninitialized(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line_number: u16,
}

/// An entry of `LocalVariableTable` or `LocalVariableTypeTable`; the two
/// share a layout, `descriptor_index` holds the signature for the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVariableEntry {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassFileError {
    UnexpectedEof,
    InvalidMagic(u32),
    InvalidConstantPoolIndex(u16),
    InvalidConstantPoolTag(u8),
    InvalidAttribute(String),
    TrailingBytes(usize),
    ConstantPoolFull,
}

impl fmt::Display for ClassFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassFileError::UnexpectedEof => write!(f, "unexpected end of file"),
            ClassFileError::InvalidMagic(m) => write!(f, "invalid magic: {m:#x}"),
            ClassFileError::InvalidConstantPoolIndex(i) => write!(f, "invalid constant pool index: {i}"),
            ClassFileError::InvalidConstantPoolTag(t) => write!(f, "invalid constant pool tag: {t}"),
            ClassFileError::InvalidAttribute(name) => write!(f, "invalid attribute: {name}"),
            ClassFileError::TrailingBytes(n) => write!(f, "{n} trailing bytes after class file"),
            ClassFileError::ConstantPoolFull => write!(f, "constant pool is full"),
        }
    }
}

impl std::error::Error for ClassFileError {}

pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub(crate) fn read_u1(&mut self) -> Result<u8, ClassFileError> {
        if self.remaining() < 1 {
            return Err(ClassFileError::UnexpectedEof);
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub(crate) fn read_u2(&mut self) -> Result<u16, ClassFileError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u4(&mut self) -> Result<u32, ClassFileError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ClassFileError> {
        if self.remaining() < len {
            return Err(ClassFileError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

/// Big-endian byte sink mirroring `Reader`.
#[derive(Default)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    pub(crate) fn u1(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn u2(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn u4(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn u8(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Decodes a class file `Utf8` entry. Class files use modified UTF-8: NUL
/// is `C0 80` and characters outside the BMP are a pair of three-byte
/// surrogates. Malformed sequences become U+FFFD.
pub fn decode_modified_utf8(bytes: &[u8]) -> Cow<'_, str> {
    if let Ok(plain) = std::str::from_utf8(bytes) {
        return Cow::Borrowed(plain);
    }
    let continuation = |at: usize| bytes.get(at).is_some_and(|b| b & 0xc0 == 0x80);
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let (unit, len) = match b {
            0x00..=0x7f => (b as u16, 1),
            0xc0..=0xdf if continuation(i + 1) => (((b & 0x1f) as u16) << 6 | (bytes[i + 1] & 0x3f) as u16, 2),
            0xe0..=0xef if continuation(i + 1) && continuation(i + 2) => (
                ((b & 0x0f) as u16) << 12 | ((bytes[i + 1] & 0x3f) as u16) << 6 | (bytes[i + 2] & 0x3f) as u16,
                3,
            ),
            _ => (0xfffd, 1),
        };
        units.push(unit);
        i += len;
    }
    Cow::Owned(
        char::decode_utf16(units)
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect(),
    )
}

/// Encodes `value` the way a class file stores it. See
/// [`decode_modified_utf8`].
pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}

/// Reads the internal name of the class defined by `bytes` (`a/b/C`)
/// without decoding anything past `this_class`.
pub fn class_name(bytes: &[u8]) -> Result<String, ClassFileError> {
    let mut r = Reader::new(bytes);
    read_magic(&mut r)?;
    r.read_u2()?;
    r.read_u2()?;
    let constant_pool = parse_constant_pool(&mut r)?;
    r.read_u2()?;
    let this_class = r.read_u2()?;
    Ok(constant_pool.class_name(this_class)?.into_owned())
}

fn read_magic(r: &mut Reader) -> Result<(), ClassFileError> {
    let magic = r.read_u4()?;
    if magic != 0xCAFEBABE {
        return Err(ClassFileError::InvalidMagic(magic));
    }
    Ok(())
}

impl ClassImage {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(bytes);
        read_magic(&mut r)?;

        let minor_version = r.read_u2()?;
        let major_version = r.read_u2()?;

        let constant_pool = parse_constant_pool(&mut r)?;

        let access_flags = r.read_u2()?;
        let this_class = r.read_u2()?;
        let super_class = r.read_u2()?;

        let interfaces_count = r.read_u2()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(r.read_u2()?);
        }

        let fields = parse_members(&mut r)?;
        let methods = parse_members(&mut r)?;
        let attributes = parse_attributes(&mut r)?;

        if r.remaining() != 0 {
            return Err(ClassFileError::TrailingBytes(r.remaining()));
        }

        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn write(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(4096);
        w.u4(0xCAFEBABE);
        w.u2(self.minor_version);
        w.u2(self.major_version);
        self.constant_pool.write(&mut w);
        w.u2(self.access_flags);
        w.u2(self.this_class);
        w.u2(self.super_class);
        w.u2(self.interfaces.len() as u16);
        for interface in &self.interfaces {
            w.u2(*interface);
        }
        write_members(&mut w, &self.fields);
        write_members(&mut w, &self.methods);
        write_attributes(&mut w, &self.attributes);
        w.into_inner()
    }

    pub fn name(&self) -> Result<Cow<'_, str>, ClassFileError> {
        self.constant_pool.class_name(self.this_class)
    }
}

impl MemberInfo {
    /// Position of the attribute called `name` in `attributes`.
    pub fn attribute_position(&self, cp: &ConstantPool, name: &str) -> Option<usize> {
        self.attributes
            .iter()
            .position(|a| cp.utf8_bytes(a.name_index).is_ok_and(|n| n == name.as_bytes()))
    }
}

fn parse_constant_pool(r: &mut Reader) -> Result<ConstantPool, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut entries: Vec<Option<CpInfo>> = Vec::with_capacity(count);
    entries.push(None); // index 0 is unused

    let mut i = 1;
    while i < count {
        let tag = r.read_u1()?;
        let entry = match tag {
            1 => {
                let len = r.read_u2()? as usize;
                CpInfo::Utf8(r.read_bytes(len)?.to_vec())
            }
            3 => CpInfo::Integer(r.read_u4()? as i32),
            4 => CpInfo::Float(r.read_u4()?),
            5 | 6 => {
                let high = r.read_u4()? as u64;
                let low = r.read_u4()? as u64;
                let bits = (high << 32) | low;
                let entry = if tag == 5 { CpInfo::Long(bits as i64) } else { CpInfo::Double(bits) };
                entries.push(Some(entry));
                entries.push(None);
                i += 2;
                continue;
            }
            7 => CpInfo::Class { name_index: r.read_u2()? },
            8 => CpInfo::String { string_index: r.read_u2()? },
            9 => CpInfo::Fieldref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            10 => CpInfo::Methodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            11 => CpInfo::InterfaceMethodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            12 => CpInfo::NameAndType { name_index: r.read_u2()?, descriptor_index: r.read_u2()? },
            15 => CpInfo::MethodHandle { reference_kind: r.read_u1()?, reference_index: r.read_u2()? },
            16 => CpInfo::MethodType { descriptor_index: r.read_u2()? },
            17 => CpInfo::Dynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            18 => CpInfo::InvokeDynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            19 => CpInfo::Module { name_index: r.read_u2()? },
            20 => CpInfo::Package { name_index: r.read_u2()? },
            _ => return Err(ClassFileError::InvalidConstantPoolTag(tag)),
        };

        entries.push(Some(entry));
        i += 1;
    }

    // A trailing Long/Double can push the table one past the declared count.
    if entries.len() != count.max(1) {
        return Err(ClassFileError::InvalidConstantPoolIndex(count as u16));
    }

    Ok(ConstantPool { entries })
}

fn parse_members(r: &mut Reader) -> Result<Vec<MemberInfo>, ClassFileError> {
    let count = r.read_u2()?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access_flags = r.read_u2()?;
        let name_index = r.read_u2()?;
        let descriptor_index = r.read_u2()?;
        let attributes = parse_attributes(r)?;
        members.push(MemberInfo { access_flags, name_index, descriptor_index, attributes });
    }
    Ok(members)
}

fn write_members(w: &mut Writer, members: &[MemberInfo]) {
    w.u2(members.len() as u16);
    for member in members {
        w.u2(member.access_flags);
        w.u2(member.name_index);
        w.u2(member.descriptor_index);
        write_attributes(w, &member.attributes);
    }
}

fn parse_attributes(r: &mut Reader) -> Result<Vec<RawAttribute>, ClassFileError> {
    let count = r.read_u2()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = r.read_u2()?;
        let length = r.read_u4()? as usize;
        let info = r.read_bytes(length)?.to_vec();
        attributes.push(RawAttribute { name_index, info });
    }
    Ok(attributes)
}

fn write_attributes(w: &mut Writer, attributes: &[RawAttribute]) {
    w.u2(attributes.len() as u16);
    for attribute in attributes {
        w.u2(attribute.name_index);
        w.u4(attribute.info.len() as u32);
        w.bytes(&attribute.info);
    }
}

impl CodeAttribute {
    pub fn parse(info: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(info);
        let max_stack = r.read_u2()?;
        let max_locals = r.read_u2()?;
        let code_length = r.read_u4()? as usize;
        let code = r.read_bytes(code_length)?.to_vec();

        let exception_table_length = r.read_u2()?;
        let mut exception_table = Vec::with_capacity(exception_table_length as usize);
        for _ in 0..exception_table_length {
            exception_table.push(ExceptionTableEntry {
                start_pc: r.read_u2()?,
                end_pc: r.read_u2()?,
                handler_pc: r.read_u2()?,
                catch_type: r.read_u2()?,
            });
        }

        let attributes = parse_attributes(&mut r)?;
        if r.remaining() != 0 {
            return Err(ClassFileError::InvalidAttribute("Code".into()));
        }

        Ok(Self { max_stack, max_locals, code, exception_table, attributes })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(self.code.len() + 64);
        w.u2(self.max_stack);
        w.u2(self.max_locals);
        w.u4(self.code.len() as u32);
        w.bytes(&self.code);
        w.u2(self.exception_table.len() as u16);
        for entry in &self.exception_table {
            w.u2(entry.start_pc);
            w.u2(entry.end_pc);
            w.u2(entry.handler_pc);
            w.u2(entry.catch_type);
        }
        write_attributes(&mut w, &self.attributes);
        w.into_inner()
    }
}

pub fn parse_stack_map_table(info: &[u8]) -> Result<Vec<StackMapFrame>, ClassFileError> {
    let mut r = Reader::new(info);
    let count = r.read_u2()?;
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let frame_type = r.read_u1()?;
        let frame = match frame_type {
            0..=63 => StackMapFrame::Same { offset_delta: frame_type as u16 },
            64..=127 => StackMapFrame::SameLocals1StackItem {
                offset_delta: (frame_type - 64) as u16,
                stack: parse_verification_type_info(&mut r)?,
            },
            247 => StackMapFrame::SameLocals1StackItemExtended {
                offset_delta: r.read_u2()?,
                stack: parse_verification_type_info(&mut r)?,
            },
            248..=250 => StackMapFrame::Chop { offset_delta: r.read_u2()?, k: 251 - frame_type },
            251 => StackMapFrame::SameExtended { offset_delta: r.read_u2()? },
            252..=254 => {
                let offset_delta = r.read_u2()?;
                let mut locals = Vec::with_capacity((frame_type - 251) as usize);
                for _ in 0..(frame_type - 251) {
                    locals.push(parse_verification_type_info(&mut r)?);
                }
                StackMapFrame::Append { offset_delta, locals }
            }
            255 => {
                let offset_delta = r.read_u2()?;
                let locals = parse_verification_types(&mut r)?;
                let stack = parse_verification_types(&mut r)?;
                StackMapFrame::Full { offset_delta, locals, stack }
            }
            _ => return Err(ClassFileError::InvalidAttribute(format!("StackMapTable frame type {frame_type}"))),
        };
        frames.push(frame);
    }
    if r.remaining() != 0 {
        return Err(ClassFileError::InvalidAttribute("StackMapTable".into()));
    }
    Ok(frames)
}

/// Encodes frames, using the compact forms only where the delta still fits.
pub fn write_stack_map_table(frames: &[StackMapFrame]) -> Vec<u8> {
    let mut w = Writer::default();
    w.u2(frames.len() as u16);
    for frame in frames {
        match frame {
            StackMapFrame::Same { offset_delta } if *offset_delta <= 63 => w.u1(*offset_delta as u8),
            StackMapFrame::Same { offset_delta } | StackMapFrame::SameExtended { offset_delta } => {
                w.u1(251);
                w.u2(*offset_delta);
            }
            StackMapFrame::SameLocals1StackItem { offset_delta, stack } if *offset_delta <= 63 => {
                w.u1(64 + *offset_delta as u8);
                write_verification_type_info(&mut w, stack);
            }
            StackMapFrame::SameLocals1StackItem { offset_delta, stack }
            | StackMapFrame::SameLocals1StackItemExtended { offset_delta, stack } => {
                w.u1(247);
                w.u2(*offset_delta);
                write_verification_type_info(&mut w, stack);
            }
            StackMapFrame::Chop { offset_delta, k } => {
                w.u1(251 - k);
                w.u2(*offset_delta);
            }
            StackMapFrame::Append { offset_delta, locals } => {
                w.u1(251 + locals.len() as u8);
                w.u2(*offset_delta);
                for local in locals {
                    write_verification_type_info(&mut w, local);
                }
            }
            StackMapFrame::Full { offset_delta, locals, stack } => {
                w.u1(255);
                w.u2(*offset_delta);
                write_verification_types(&mut w, locals);
                write_verification_types(&mut w, stack);
            }
        }
    }
    w.into_inner()
}

fn parse_verification_types(r: &mut Reader) -> Result<Vec<VerificationTypeInfo>, ClassFileError> {
    let count = r.read_u2()?;
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        types.push(parse_verification_type_info(r)?);
    }
    Ok(types)
}

fn parse_verification_type_info(r: &mut Reader) -> Result<VerificationTypeInfo, ClassFileError> {
    let tag = r.read_u1()?;
    Ok(match tag {
        0 => VerificationTypeInfo::Top,
        1 => VerificationTypeInfo::Integer,
        2 => VerificationTypeInfo::Float,
        3 => VerificationTypeInfo::Double,
        4 => VerificationTypeInfo::Long,
        5 => VerificationTypeInfo::Null,
        6 => VerificationTypeInfo::UninitializedThis,
        7 => VerificationTypeInfo::Object(r.read_u2()?),
        8 => VerificationTypeInfo::Uninitialized(r.read_u2()?),
        _ => return Err(ClassFileError::InvalidAttribute(format!("verification type tag {tag}"))),
    })
}

fn write_verification_types(w: &mut Writer, types: &[VerificationTypeInfo]) {
    w.u2(types.len() as u16);
    for ty in types {
        write_verification_type_info(w, ty);
    }
}

fn write_verification_type_info(w: &mut Writer, ty: &VerificationTypeInfo) {
    match ty {
        VerificationTypeInfo::Top => w.u1(0),
        VerificationTypeInfo::Integer => w.u1(1),
        VerificationTypeInfo::Float => w.u1(2),
        VerificationTypeInfo::Double => w.u1(3),
        VerificationTypeInfo::Long => w.u1(4),
        VerificationTypeInfo::Null => w.u1(5),
        VerificationTypeInfo::UninitializedThis => w.u1(6),
        VerificationTypeInfo::Object(index) => {
            w.u1(7);
            w.u2(*index);
        }
        VerificationTypeInfo::Uninitialized(offset) => {
            w.u1(8);
            w.u2(*offset);
        }
    }
}

pub fn parse_line_number_table(info: &[u8]) -> Result<Vec<LineNumberEntry>, ClassFileError> {
    let mut r = Reader::new(info);
    let count = r.read_u2()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(LineNumberEntry { start_pc: r.read_u2()?, line_number: r.read_u2()? });
    }
    Ok(entries)
}

pub fn write_line_number_table(entries: &[LineNumberEntry]) -> Vec<u8> {
    let mut w = Writer::with_capacity(2 + entries.len() * 4);
    w.u2(entries.len() as u16);
    for entry in entries {
        w.u2(entry.start_pc);
        w.u2(entry.line_number);
    }
    w.into_inner()
}

pub fn parse_local_variable_table(info: &[u8]) -> Result<Vec<LocalVariableEntry>, ClassFileError> {
    let mut r = Reader::new(info);
    let count = r.read_u2()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(LocalVariableEntry {
            start_pc: r.read_u2()?,
            length: r.read_u2()?,
            name_index: r.read_u2()?,
            descriptor_index: r.read_u2()?,
            index: r.read_u2()?,
        });
    }
    Ok(entries)
}

pub fn write_local_variable_table(entries: &[LocalVariableEntry]) -> Vec<u8> {
    let mut w = Writer::with_capacity(2 + entries.len() * 10);
    w.u2(entries.len() as u16);
    for entry in entries {
        w.u2(entry.start_pc);
        w.u2(entry.length);
        w.u2(entry.name_index);
        w.u2(entry.descriptor_index);
        w.u2(entry.index);
    }
    w.into_inner()
}
