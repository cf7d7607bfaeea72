//! Splices `dup; invokestatic <helper>` after every allocation.
//!
//! Array allocations are instrumented right after the allocating
//! instruction. For `new` the call goes after the matching constructor call,
//! so the helper only ever sees initialized objects. Every splice is four
//! bytes long, which keeps switch padding valid without re-layout.

use super::bytecode::{self, Branch, Instruction};
use super::stackmap::relocate_stack_map;
use super::HelperSpec;
use crate::classfile::{
    parse_line_number_table, parse_local_variable_table, write_line_number_table, write_local_variable_table,
    ClassImage, CodeAttribute, ConstantPool, CpInfo, ACC_ABSTRACT, ACC_NATIVE,
};
use crate::error::RewriteError;

/// Length of the spliced `dup; invokestatic #index` sequence.
pub const CALL_LEN: usize = 4;

const MAX_CODE_LEN: usize = 65535;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RewriteStats {
    pub methods: usize,
    pub sites: usize,
}

/// Maps pre-rewrite offsets to post-rewrite offsets.
///
/// `sites` holds the pcs of the instructions a call is spliced after. An
/// offset moves by one call for every site that starts before it, so a
/// branch to the instruction following a site lands past the call.
#[derive(Debug, Clone)]
pub struct Relocation {
    sites: Vec<usize>,
}

impl Relocation {
    pub fn new(mut sites: Vec<usize>) -> Self {
        sites.sort_unstable();
        Relocation { sites }
    }

    pub fn map(&self, old: usize) -> usize {
        old + CALL_LEN * self.sites.partition_point(|&site| site < old)
    }
}

/// One allocation to instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Site {
    /// The instruction the call is spliced after: the allocation itself,
    /// or the constructor call for `new`.
    pub after: usize,
    /// The allocating `new*` instruction.
    pub bci: usize,
}

/// Where one helper call ended up in a rewritten method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SiteOffset {
    /// Location of the injected `invokestatic`, as a stack walk reports it.
    pub call_pc: u32,
    /// Offset of the `new*` instruction in the method as loaded.
    pub bci: u32,
}

/// The helper calls of one rewritten method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSites {
    pub name: String,
    pub descriptor: String,
    pub sites: Vec<SiteOffset>,
}

/// A rewritten class and the offsets of its helper calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrumented {
    pub image: Vec<u8>,
    pub stats: RewriteStats,
    pub methods: Vec<MethodSites>,
}

/// Returns the allocations to instrument, ordered by splice point.
pub fn find_sites(code: &[u8], instructions: &[Instruction], cp: &ConstantPool) -> Result<Vec<Site>, RewriteError> {
    let mut pending_news: Vec<usize> = Vec::new();
    let mut sites = Vec::new();

    for insn in instructions {
        match insn.opcode {
            bytecode::NEWARRAY | bytecode::ANEWARRAY | bytecode::MULTIANEWARRAY => {
                sites.push(Site { after: insn.pc, bci: insn.pc })
            }
            bytecode::NEW => pending_news.push(insn.pc),
            bytecode::INVOKESPECIAL => {
                let method = insn.u2_operand(code);
                let (name, _) = cp.member_name_and_type_bytes(method)?;
                if name != b"<init>" {
                    continue;
                }
                let Some(&new_pc) = pending_news.last() else {
                    // super() or this() inside a constructor
                    continue;
                };
                let created = cp.class_name_bytes(u16::from_be_bytes([code[new_pc + 1], code[new_pc + 2]]))?;
                if owner_class(cp, method)? != created {
                    continue;
                }
                pending_news.pop();
                // Without the dup the reference is gone once <init> returns.
                if code.get(new_pc + 3) == Some(&bytecode::DUP) {
                    sites.push(Site { after: insn.pc, bci: new_pc });
                }
            }
            _ => {}
        }
    }
    Ok(sites)
}

fn owner_class(cp: &ConstantPool, method: u16) -> Result<&[u8], RewriteError> {
    match cp.get(method)? {
        CpInfo::Methodref { class_index, .. } | CpInfo::InterfaceMethodref { class_index, .. } => {
            Ok(cp.class_name_bytes(*class_index)?)
        }
        _ => Err(crate::classfile::ClassFileError::InvalidConstantPoolIndex(method).into()),
    }
}

struct MethodPlan {
    method: usize,
    attribute: usize,
    code: CodeAttribute,
    instructions: Vec<Instruction>,
    sites: Vec<Site>,
}

/// Instruments every allocation in `bytes`. Returns `None` when the class
/// allocates nothing (or nothing eligible), leaving the original untouched.
pub fn instrument_class(
    bytes: &[u8],
    is_system: bool,
    helper: &HelperSpec,
) -> Result<Option<Instrumented>, RewriteError> {
    let mut image = ClassImage::parse(bytes)?;
    let mut plans = Vec::new();

    {
        let cp = &image.constant_pool;
        for (index, method) in image.methods.iter().enumerate() {
            if method.access_flags & (ACC_NATIVE | ACC_ABSTRACT) != 0 {
                continue;
            }
            if is_system && cp.utf8_bytes(method.name_index)? == b"<clinit>" {
                continue;
            }
            let Some(attribute) = method.attribute_position(cp, "Code") else {
                continue;
            };
            let code = CodeAttribute::parse(&method.attributes[attribute].info)?;
            let instructions = bytecode::decode(&code.code)?;
            let sites = find_sites(&code.code, &instructions, cp)?;
            if !sites.is_empty() {
                plans.push(MethodPlan { method: index, attribute, code, instructions, sites });
            }
        }
    }

    if plans.is_empty() {
        return Ok(None);
    }

    let helper_index =
        image
            .constant_pool
            .add_methodref(&helper.class_name, &helper.method_name, &helper.method_signature)?;

    let mut stats = RewriteStats::default();
    let mut methods = Vec::with_capacity(plans.len());
    for plan in plans {
        stats.methods += 1;
        stats.sites += plan.sites.len();
        let (info, sites) = rewrite_method(plan.code, &plan.instructions, &plan.sites, &image.constant_pool, helper_index)?;
        let cp = &image.constant_pool;
        let method = &image.methods[plan.method];
        methods.push(MethodSites {
            name: cp.get_utf8(method.name_index)?.into_owned(),
            descriptor: cp.get_utf8(method.descriptor_index)?.into_owned(),
            sites,
        });
        image.methods[plan.method].attributes[plan.attribute].info = info;
    }

    Ok(Some(Instrumented { image: image.write(), stats, methods }))
}

/// Rebuilds one `Code` attribute with calls spliced after `sites`, and
/// returns it with the location of each call.
pub fn rewrite_method(
    mut code: CodeAttribute,
    instructions: &[Instruction],
    sites: &[Site],
    cp: &ConstantPool,
    helper_index: u16,
) -> Result<(Vec<u8>, Vec<SiteOffset>), RewriteError> {
    let new_len = code.code.len() + CALL_LEN * sites.len();
    if new_len > MAX_CODE_LEN {
        return Err(RewriteError::CodeTooLarge { len: new_len });
    }

    let relocation = Relocation::new(sites.iter().map(|site| site.after).collect());
    let old = &code.code;
    let [index_hi, index_lo] = helper_index.to_be_bytes();
    let mut out = Vec::with_capacity(new_len);
    let mut offsets = Vec::with_capacity(sites.len());
    let mut next_site = sites.iter().peekable();

    for insn in instructions {
        let start = out.len();
        out.extend_from_slice(&old[insn.pc..insn.pc + insn.len]);

        match &insn.branch {
            Branch::None => {}
            Branch::Short => {
                let offset = i16::from_be_bytes([old[insn.pc + 1], old[insn.pc + 2]]) as i64;
                let moved = relocate_branch(&relocation, old.len(), insn.pc, offset)?;
                let moved = i16::try_from(moved).map_err(|_| RewriteError::BranchOverflow { pc: insn.pc })?;
                out[start + 1..start + 3].copy_from_slice(&moved.to_be_bytes());
            }
            Branch::Wide => {
                let offset = bytecode::read_i32(old, insn.pc + 1)? as i64;
                let moved = relocate_branch(&relocation, old.len(), insn.pc, offset)?;
                out[start + 1..start + 5].copy_from_slice(&(moved as i32).to_be_bytes());
            }
            Branch::Switch(positions) => {
                debug_assert_eq!(start % 4, insn.pc % 4);
                for &at in positions {
                    let offset = bytecode::read_i32(old, insn.pc + at)? as i64;
                    let moved = relocate_branch(&relocation, old.len(), insn.pc, offset)?;
                    out[start + at..start + at + 4].copy_from_slice(&(moved as i32).to_be_bytes());
                }
            }
        }

        if let Some(site) = next_site.next_if(|site| site.after == insn.pc) {
            // dup, then the invokestatic a stack walk will report
            offsets.push(SiteOffset { call_pc: (out.len() + 1) as u32, bci: site.bci as u32 });
            out.extend_from_slice(&[bytecode::DUP, bytecode::INVOKESTATIC, index_hi, index_lo]);
        }
    }

    for entry in &mut code.exception_table {
        entry.start_pc = relocation.map(entry.start_pc as usize) as u16;
        entry.end_pc = relocation.map(entry.end_pc as usize) as u16;
        entry.handler_pc = relocation.map(entry.handler_pc as usize) as u16;
    }

    let mut attributes = Vec::with_capacity(code.attributes.len());
    for mut attribute in std::mem::take(&mut code.attributes) {
        match cp.utf8_bytes(attribute.name_index)? {
            b"StackMapTable" => attribute.info = relocate_stack_map(&attribute.info, &relocation)?,
            b"LineNumberTable" => {
                let mut lines = parse_line_number_table(&attribute.info)?;
                for line in &mut lines {
                    line.start_pc = relocation.map(line.start_pc as usize) as u16;
                }
                attribute.info = write_line_number_table(&lines);
            }
            b"LocalVariableTable" | b"LocalVariableTypeTable" => {
                let mut locals = parse_local_variable_table(&attribute.info)?;
                for local in &mut locals {
                    let start = relocation.map(local.start_pc as usize);
                    let end = relocation.map(local.start_pc as usize + local.length as usize);
                    local.start_pc = start as u16;
                    local.length = (end - start) as u16;
                }
                attribute.info = write_local_variable_table(&locals);
            }
            b"RuntimeVisibleTypeAnnotations" | b"RuntimeInvisibleTypeAnnotations" => continue,
            _ => {}
        }
        attributes.push(attribute);
    }

    code.code = out;
    code.attributes = attributes;
    code.max_stack = code.max_stack.saturating_add(1);
    Ok((code.to_bytes(), offsets))
}

fn relocate_branch(relocation: &Relocation, code_len: usize, pc: usize, offset: i64) -> Result<i64, RewriteError> {
    let target = pc as i64 + offset;
    if target < 0 || target as usize >= code_len {
        return Err(RewriteError::BadOffset { offset: target.max(0) as usize });
    }
    Ok(relocation.map(target as usize) as i64 - relocation.map(pc) as i64)
}
