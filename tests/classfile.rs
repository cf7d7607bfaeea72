mod common;

use common::{push_attr, u1, u2, u4, ClassBuilder, CpBuilder};
use heapster::classfile::{
    class_name, decode_modified_utf8, encode_modified_utf8, parse_stack_map_table, write_stack_map_table,
    ClassFileError, ClassImage, CodeAttribute, CpInfo, StackMapFrame, VerificationTypeInfo,
};
use std::borrow::Cow;

const NAN_BITS: u32 = 0x7fc0_0001;
const DOUBLE_BITS: u64 = 0x7ff8_0000_0000_0abc;

/// Offset of the first byte after `this_class`.
struct Rich {
    bytes: Vec<u8>,
    header_len: usize,
}

fn build_rich_class() -> Rich {
    let mut cp = CpBuilder::new();
    let this_name = cp.utf8("demo/Rich");
    let this_class = cp.class(this_name);
    let object_class = cp.class_named("java/lang/Object");
    let code = cp.utf8("Code");
    let stack_map = cp.utf8("StackMapTable");
    let line_numbers = cp.utf8("LineNumberTable");
    let source_file = cp.utf8("SourceFile");
    let source_name = cp.utf8("Rich.java");
    let answer = cp.integer(42);
    assert_eq!(cp.float_bits(NAN_BITS), 11);
    assert_eq!(cp.long(-7), 12);
    assert_eq!(cp.double_bits(DOUBLE_BITS), 14);
    let hi = cp.utf8("hi");
    cp.string(hi);
    let count_name = cp.utf8("count");
    let int_desc = cp.utf8("I");
    let count_nat = cp.name_and_type(count_name, int_desc);
    let mut fieldref = vec![9];
    fieldref.extend_from_slice(&this_class.to_be_bytes());
    fieldref.extend_from_slice(&count_nat.to_be_bytes());
    let count_field = cp.push(fieldref, 1);
    let object_init = cp.method(object_class, "<init>", "()V");
    cp.push(vec![15, 1, (count_field >> 8) as u8, count_field as u8], 1);
    let void_desc = cp.utf8("()V");
    cp.push(vec![16, (void_desc >> 8) as u8, void_desc as u8], 1);
    let constant_value = cp.utf8("ConstantValue");
    let deprecated = cp.utf8("Deprecated");
    let custom = cp.utf8("Custom");
    let init_name = cp.utf8("<init>");
    let run_name = cp.utf8("run");
    let run_desc = cp.utf8("(I)I");

    let mut bytes = Vec::new();
    u4(&mut bytes, 0xCAFEBABE);
    u2(&mut bytes, 0);
    u2(&mut bytes, 61);
    u2(&mut bytes, cp.count());
    for entry in &cp.entries {
        bytes.extend_from_slice(entry);
    }
    u2(&mut bytes, 0x0031);
    u2(&mut bytes, this_class);
    let header_len = bytes.len();
    u2(&mut bytes, object_class);
    u2(&mut bytes, 0);

    // public static final int count = 42;
    u2(&mut bytes, 1);
    u2(&mut bytes, 0x0019);
    u2(&mut bytes, count_name);
    u2(&mut bytes, int_desc);
    u2(&mut bytes, 1);
    let mut value = Vec::new();
    u2(&mut value, answer);
    push_attr(&mut bytes, constant_value, &value);

    u2(&mut bytes, 2);

    // <init>: aload_0; invokespecial Object.<init>; return
    u2(&mut bytes, 0x0001);
    u2(&mut bytes, init_name);
    u2(&mut bytes, void_desc);
    u2(&mut bytes, 1);
    let mut info = Vec::new();
    u2(&mut info, 1);
    u2(&mut info, 1);
    let body = [0x2a, 0xb7, (object_init >> 8) as u8, object_init as u8, 0xb1];
    u4(&mut info, body.len() as u32);
    info.extend_from_slice(&body);
    u2(&mut info, 0);
    u2(&mut info, 1);
    let mut lines = Vec::new();
    u2(&mut lines, 1);
    u2(&mut lines, 0);
    u2(&mut lines, 3);
    push_attr(&mut info, line_numbers, &lines);
    push_attr(&mut bytes, code, &info);

    // static int run(int x) { return x != 0 ? 1 : 0; }
    u2(&mut bytes, 0x0008);
    u2(&mut bytes, run_name);
    u2(&mut bytes, run_desc);
    u2(&mut bytes, 1);
    let mut info = Vec::new();
    u2(&mut info, 1);
    u2(&mut info, 1);
    let body = [0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac];
    u4(&mut info, body.len() as u32);
    info.extend_from_slice(&body);
    u2(&mut info, 0);
    u2(&mut info, 1);
    let mut frames = Vec::new();
    u2(&mut frames, 1);
    u1(&mut frames, 6);
    push_attr(&mut info, stack_map, &frames);
    push_attr(&mut bytes, code, &info);

    u2(&mut bytes, 3);
    let mut source = Vec::new();
    u2(&mut source, source_name);
    push_attr(&mut bytes, source_file, &source);
    push_attr(&mut bytes, deprecated, &[]);
    push_attr(&mut bytes, custom, &[1, 2, 3, 0xff]);

    Rich { bytes, header_len }
}

#[test]
fn round_trips_byte_identical() {
    let rich = build_rich_class();
    let image = ClassImage::parse(&rich.bytes).expect("parse rich class");

    assert_eq!(image.name().unwrap(), "demo/Rich");
    assert_eq!(image.major_version, 61);
    assert_eq!(image.fields.len(), 1);
    assert_eq!(image.methods.len(), 2);
    assert_eq!(image.attributes.len(), 3);
    assert_eq!(image.attributes[2].info, vec![1, 2, 3, 0xff]);

    assert_eq!(image.write(), rich.bytes);
}

#[test]
fn keeps_constant_bits_and_wide_slots() {
    let rich = build_rich_class();
    let image = ClassImage::parse(&rich.bytes).unwrap();
    let cp = &image.constant_pool;

    assert_eq!(cp.get(10).unwrap(), &CpInfo::Integer(42));
    assert_eq!(cp.get(11).unwrap(), &CpInfo::Float(NAN_BITS));
    assert_eq!(cp.get(12).unwrap(), &CpInfo::Long(-7));
    assert!(matches!(cp.get(13), Err(ClassFileError::InvalidConstantPoolIndex(13))));
    assert_eq!(cp.get(14).unwrap(), &CpInfo::Double(DOUBLE_BITS));
    assert!(cp.get(15).is_err());
    assert!(cp.get(0).is_err());
}

#[test]
fn code_attribute_reencodes() {
    let rich = build_rich_class();
    let image = ClassImage::parse(&rich.bytes).unwrap();
    let cp = &image.constant_pool;
    let run = &image.methods[1];

    let position = run.attribute_position(cp, "Code").expect("run has code");
    let info = &run.attributes[position].info;
    let code = CodeAttribute::parse(info).unwrap();
    assert_eq!(code.code, vec![0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac]);
    assert_eq!(code.attributes.len(), 1);
    assert_eq!(cp.get_utf8(code.attributes[0].name_index).unwrap(), "StackMapTable");
    assert_eq!(
        parse_stack_map_table(&code.attributes[0].info).unwrap(),
        vec![StackMapFrame::Same { offset_delta: 6 }]
    );
    assert_eq!(&code.to_bytes(), info);
}

#[test]
fn reads_class_name_from_header_only() {
    let rich = build_rich_class();
    assert_eq!(class_name(&rich.bytes).unwrap(), "demo/Rich");
    assert_eq!(class_name(&rich.bytes[..rich.header_len]).unwrap(), "demo/Rich");
    assert_eq!(
        class_name(&rich.bytes[..rich.header_len - 1]),
        Err(ClassFileError::UnexpectedEof)
    );
}

#[test]
fn reads_class_names_stored_as_surrogate_pairs() {
    let mut cp = CpBuilder::new();
    let this_name = cp.utf8_bytes(b"demo/\xed\xa0\xb5\xed\xb4\xb8");
    let this_class = cp.class(this_name);
    let mut bytes = Vec::new();
    u4(&mut bytes, 0xCAFEBABE);
    u2(&mut bytes, 0);
    u2(&mut bytes, 52);
    u2(&mut bytes, cp.count());
    for entry in &cp.entries {
        bytes.extend_from_slice(entry);
    }
    u2(&mut bytes, 0x0021);
    u2(&mut bytes, this_class);

    assert_eq!(class_name(&bytes).unwrap(), "demo/\u{1d538}");
}

#[test]
fn decodes_modified_utf8() {
    assert!(matches!(decode_modified_utf8(b"java/lang/Object"), Cow::Borrowed("java/lang/Object")));
    assert_eq!(decode_modified_utf8(b"a\xc0\x80b"), "a\0b");
    assert_eq!(decode_modified_utf8(b"\xc3\xa9"), "\u{e9}");
    assert_eq!(decode_modified_utf8(b"x\xed\xa0\xb5\xed\xb4\xb8"), "x\u{1d538}");
}

#[test]
fn malformed_modified_utf8_decodes_lossily() {
    assert_eq!(decode_modified_utf8(b"a\xff"), "a\u{fffd}");
    // unpaired high surrogate
    assert_eq!(decode_modified_utf8(b"\xed\xa0\xb5z"), "\u{fffd}z");
    // truncated three-byte sequence
    assert_eq!(decode_modified_utf8(b"\xe2\x82"), "\u{fffd}\u{fffd}");
}

#[test]
fn encodes_nul_and_supplementary_characters() {
    assert_eq!(encode_modified_utf8("plain"), b"plain");
    assert_eq!(
        encode_modified_utf8("a\0\u{1d538}"),
        [0x61u8, 0xc0, 0x80, 0xed, 0xa0, 0xb5, 0xed, 0xb4, 0xb8]
    );

    let rich = build_rich_class();
    let mut image = ClassImage::parse(&rich.bytes).unwrap();
    let index = image.constant_pool.add_utf8("a\0\u{1d538}").unwrap();
    let reparsed = ClassImage::parse(&image.write()).unwrap();
    assert_eq!(reparsed.constant_pool.get_utf8(index).unwrap(), "a\0\u{1d538}");
}

#[test]
fn rejects_bad_magic() {
    let mut bytes = build_rich_class().bytes;
    bytes[0] = 0;
    assert_eq!(ClassImage::parse(&bytes).unwrap_err(), ClassFileError::InvalidMagic(0x00FE_BABE));
    assert!(matches!(class_name(&bytes), Err(ClassFileError::InvalidMagic(_))));
}

#[test]
fn rejects_every_truncation() {
    let bytes = build_rich_class().bytes;
    for len in 0..bytes.len() {
        assert!(ClassImage::parse(&bytes[..len]).is_err(), "prefix of {len} bytes parsed");
    }
    assert_eq!(
        ClassImage::parse(&bytes[..bytes.len() - 1]).unwrap_err(),
        ClassFileError::UnexpectedEof
    );
}

#[test]
fn rejects_trailing_bytes() {
    let mut bytes = build_rich_class().bytes;
    bytes.extend_from_slice(&[0, 0]);
    assert_eq!(ClassImage::parse(&bytes).unwrap_err(), ClassFileError::TrailingBytes(2));
}

#[test]
fn rejects_unknown_constant_tag() {
    let mut bytes = build_rich_class().bytes;
    bytes[10] = 2;
    assert_eq!(ClassImage::parse(&bytes).unwrap_err(), ClassFileError::InvalidConstantPoolTag(2));
}

#[test]
fn rejects_wide_constant_past_declared_count() {
    let mut bytes = Vec::new();
    u4(&mut bytes, 0xCAFEBABE);
    u2(&mut bytes, 0);
    u2(&mut bytes, 52);
    u2(&mut bytes, 2);
    u1(&mut bytes, 5);
    bytes.extend_from_slice(&1i64.to_be_bytes());
    assert!(matches!(
        ClassImage::parse(&bytes),
        Err(ClassFileError::InvalidConstantPoolIndex(2))
    ));
}

#[test]
fn add_reuses_existing_entries() {
    let rich = build_rich_class();
    let mut image = ClassImage::parse(&rich.bytes).unwrap();
    let before = image.constant_pool.count();

    let cp = &mut image.constant_pool;
    assert_eq!(cp.add_utf8("Code").unwrap(), 5);
    assert_eq!(cp.add(CpInfo::Integer(42)).unwrap(), 10);
    let object_init = cp.add_methodref("java/lang/Object", "<init>", "()V").unwrap();
    let (name, descriptor) = cp.member_name_and_type(object_init).unwrap();
    assert_eq!((name.as_ref(), descriptor.as_ref()), ("<init>", "()V"));
    assert_eq!(cp.count(), before);
    assert_eq!(image.write(), rich.bytes);
}

#[test]
fn add_methodref_appends_and_survives_reparse() {
    let rich = build_rich_class();
    let mut image = ClassImage::parse(&rich.bytes).unwrap();
    let before = image.constant_pool.count();

    let helper = image
        .constant_pool
        .add_methodref("HeapsterHelper", "newObject", "(Ljava/lang/Object;)V")
        .unwrap();
    // utf8 + class, two utf8 + name_and_type, methodref
    assert_eq!(image.constant_pool.count(), before + 6);
    assert_eq!(helper as usize, before + 5);

    let reparsed = ClassImage::parse(&image.write()).unwrap();
    let cp = &reparsed.constant_pool;
    let (name, descriptor) = cp.member_name_and_type(helper).unwrap();
    assert_eq!((name.as_ref(), descriptor.as_ref()), ("newObject", "(Ljava/lang/Object;)V"));
    let CpInfo::Methodref { class_index, .. } = cp.get(helper).unwrap() else {
        panic!("helper is not a methodref");
    };
    assert_eq!(cp.class_name(*class_index).unwrap(), "HeapsterHelper");
}

#[test]
fn wide_constants_take_two_slots() {
    let rich = build_rich_class();
    let mut image = ClassImage::parse(&rich.bytes).unwrap();
    let before = image.constant_pool.count();

    let index = image.constant_pool.add(CpInfo::Long(1 << 40)).unwrap();
    assert_eq!(index as usize, before);
    assert_eq!(image.constant_pool.count(), before + 2);
    let next = image.constant_pool.add_utf8("after").unwrap();
    assert_eq!(next as usize, before + 2);

    let reparsed = ClassImage::parse(&image.write()).unwrap();
    assert_eq!(reparsed.constant_pool.get(index).unwrap(), &CpInfo::Long(1 << 40));
    assert_eq!(reparsed.constant_pool.get_utf8(next).unwrap(), "after");
}

#[test]
fn refuses_to_grow_a_full_pool() {
    let mut class = ClassBuilder::new("demo/Full");
    let mut i = 0;
    while class.cp.count() < 65534 {
        class.cp.utf8(&format!("c{i}"));
        i += 1;
    }
    let mut image = ClassImage::parse(&class.build()).unwrap();
    assert_eq!(image.constant_pool.count(), 65534);

    assert_eq!(image.constant_pool.add_utf8("last").unwrap(), 65534);
    assert_eq!(image.constant_pool.add_utf8("one more"), Err(ClassFileError::ConstantPoolFull));
    assert_eq!(image.constant_pool.add_utf8("last").unwrap(), 65534);
    assert_eq!(image.constant_pool.count(), 65535);
    assert_eq!(image.name().unwrap(), "demo/Full");
}

#[test]
fn stack_map_frames_widen_when_delta_grows() {
    let frames = vec![
        StackMapFrame::Same { offset_delta: 3 },
        StackMapFrame::Same { offset_delta: 100 },
        StackMapFrame::SameLocals1StackItem { offset_delta: 5, stack: VerificationTypeInfo::Integer },
        StackMapFrame::SameLocals1StackItem { offset_delta: 200, stack: VerificationTypeInfo::Object(4) },
        StackMapFrame::Chop { offset_delta: 10, k: 2 },
        StackMapFrame::Append {
            offset_delta: 1,
            locals: vec![VerificationTypeInfo::Integer, VerificationTypeInfo::Long],
        },
        StackMapFrame::Full {
            offset_delta: 2,
            locals: vec![VerificationTypeInfo::Object(2), VerificationTypeInfo::Uninitialized(7)],
            stack: vec![VerificationTypeInfo::Null, VerificationTypeInfo::Top],
        },
    ];

    let bytes = write_stack_map_table(&frames);
    assert_eq!(&bytes[..6], &[0, 7, 3, 251, 0, 100]);

    let parsed = parse_stack_map_table(&bytes).unwrap();
    assert_eq!(parsed[1], StackMapFrame::SameExtended { offset_delta: 100 });
    assert_eq!(
        parsed[3],
        StackMapFrame::SameLocals1StackItemExtended { offset_delta: 200, stack: VerificationTypeInfo::Object(4) }
    );
    assert_eq!(parsed[4], frames[4]);
    assert_eq!(parsed[6], frames[6]);
    let deltas: Vec<u16> = parsed.iter().map(StackMapFrame::offset_delta).collect();
    assert_eq!(deltas, vec![3, 100, 5, 200, 10, 1, 2]);
}

#[test]
fn rejects_reserved_frame_type() {
    assert!(matches!(
        parse_stack_map_table(&[0, 1, 128]),
        Err(ClassFileError::InvalidAttribute(_))
    ));
}
