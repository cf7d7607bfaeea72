//! JVM instruction decoding: just enough to walk a method body, find
//! allocation sites and rewrite branch offsets.

use crate::error::RewriteError;

pub const DUP: u8 = 0x59;
pub const IFEQ: u8 = 0x99;
pub const JSR: u8 = 0xa8;
pub const RET: u8 = 0xa9;
pub const TABLESWITCH: u8 = 0xaa;
pub const LOOKUPSWITCH: u8 = 0xab;
pub const INVOKESPECIAL: u8 = 0xb7;
pub const INVOKESTATIC: u8 = 0xb8;
pub const NEW: u8 = 0xbb;
pub const NEWARRAY: u8 = 0xbc;
pub const ANEWARRAY: u8 = 0xbd;
pub const WIDE: u8 = 0xc4;
pub const MULTIANEWARRAY: u8 = 0xc5;
pub const IFNULL: u8 = 0xc6;
pub const IFNONNULL: u8 = 0xc7;
pub const GOTO_W: u8 = 0xc8;
pub const JSR_W: u8 = 0xc9;

/// How an instruction transfers control, if at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Branch {
    None,
    /// `if*`, `goto`, `jsr`: signed 16-bit offset at pc + 1.
    Short,
    /// `goto_w`, `jsr_w`: signed 32-bit offset at pc + 1.
    Wide,
    /// `tableswitch` / `lookupswitch`: positions of every 32-bit offset
    /// (default first) relative to the start of the instruction.
    Switch(Vec<usize>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub pc: usize,
    pub opcode: u8,
    pub len: usize,
    pub branch: Branch,
}

impl Instruction {
    /// The 16-bit operand following the opcode (constant pool index for
    /// `new`, `anewarray`, `invoke*`).
    pub fn u2_operand(&self, code: &[u8]) -> u16 {
        u16::from_be_bytes([code[self.pc + 1], code[self.pc + 2]])
    }
}

pub(crate) fn read_i32(code: &[u8], at: usize) -> Result<i32, RewriteError> {
    code.get(at..at + 4)
        .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(RewriteError::Truncated { pc: at })
}

fn fixed_len(opcode: u8) -> Option<usize> {
    Some(match opcode {
        0x00..=0x0f => 1,                          // nop, constants
        0x10 => 2,                                 // bipush
        0x11 => 3,                                 // sipush
        0x12 => 2,                                 // ldc
        0x13 | 0x14 => 3,                          // ldc_w, ldc2_w
        0x15..=0x19 => 2,                          // loads with index
        0x1a..=0x35 => 1,                          // short loads, array loads
        0x36..=0x3a => 2,                          // stores with index
        0x3b..=0x83 => 1,                          // short stores, stack, arithmetic
        0x84 => 3,                                 // iinc
        0x85..=0x98 => 1,                          // conversions, compares
        0x99..=0xa8 => 3,                          // if*, goto, jsr
        RET => 2,
        0xac..=0xb1 => 1,                          // returns
        0xb2..=0xb8 => 3,                          // field access, invokes
        0xb9 | 0xba => 5,                          // invokeinterface, invokedynamic
        NEW => 3,
        NEWARRAY => 2,
        ANEWARRAY => 3,
        0xbe | 0xbf => 1,                          // arraylength, athrow
        0xc0 | 0xc1 => 3,                          // checkcast, instanceof
        0xc2 | 0xc3 => 1,                          // monitorenter, monitorexit
        MULTIANEWARRAY => 4,
        IFNULL | IFNONNULL => 3,
        GOTO_W | JSR_W => 5,
        _ => return None,
    })
}

fn decode_one(code: &[u8], pc: usize) -> Result<Instruction, RewriteError> {
    let opcode = code[pc];
    let (len, branch) = match opcode {
        TABLESWITCH => {
            let base = pc + 1 + padding(pc);
            let low = read_i32(code, base + 4)?;
            let high = read_i32(code, base + 8)?;
            if high < low {
                return Err(RewriteError::Truncated { pc });
            }
            let count = (high as i64 - low as i64 + 1) as usize;
            if base + 12 + count * 4 > code.len() {
                return Err(RewriteError::Truncated { pc });
            }
            let mut offsets = vec![base - pc];
            offsets.extend((0..count).map(|i| base + 12 + i * 4 - pc));
            (base + 12 + count * 4 - pc, Branch::Switch(offsets))
        }
        LOOKUPSWITCH => {
            let base = pc + 1 + padding(pc);
            let npairs = read_i32(code, base + 4)?;
            if npairs < 0 {
                return Err(RewriteError::Truncated { pc });
            }
            let npairs = npairs as usize;
            if base + 8 + npairs * 8 > code.len() {
                return Err(RewriteError::Truncated { pc });
            }
            let mut offsets = vec![base - pc];
            offsets.extend((0..npairs).map(|i| base + 8 + i * 8 + 4 - pc));
            (base + 8 + npairs * 8 - pc, Branch::Switch(offsets))
        }
        WIDE => {
            let modified = *code.get(pc + 1).ok_or(RewriteError::Truncated { pc })?;
            (if modified == 0x84 { 6 } else { 4 }, Branch::None)
        }
        IFEQ..=JSR | IFNULL | IFNONNULL => (3, Branch::Short),
        GOTO_W | JSR_W => (5, Branch::Wide),
        _ => {
            let len = fixed_len(opcode).ok_or(RewriteError::InvalidOpcode { pc, opcode })?;
            (len, Branch::None)
        }
    };
    if pc + len > code.len() {
        return Err(RewriteError::Truncated { pc });
    }
    Ok(Instruction { pc, opcode, len, branch })
}

/// Bytes of alignment after a switch opcode at `pc`.
pub fn padding(pc: usize) -> usize {
    (4 - (pc + 1) % 4) % 4
}

/// Splits a method body into instructions in pc order.
pub fn decode(code: &[u8]) -> Result<Vec<Instruction>, RewriteError> {
    let mut instructions = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let insn = decode_one(code, pc)?;
        pc += insn.len;
        instructions.push(insn);
    }
    Ok(instructions)
}
