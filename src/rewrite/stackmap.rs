//! StackMapTable relocation.
//!
//! Frames are stored as deltas from the previous frame, so every frame is
//! moved to its absolute position, remapped, and re-encoded. Deltas only
//! grow; a compact frame whose delta no longer fits is written in its
//! extended form.

use super::inject::Relocation;
use crate::classfile::{parse_stack_map_table, write_stack_map_table, StackMapFrame, VerificationTypeInfo};
use crate::error::RewriteError;

pub fn relocate_stack_map(info: &[u8], relocation: &Relocation) -> Result<Vec<u8>, RewriteError> {
    let frames = parse_stack_map_table(info)?;
    let mut relocated = Vec::with_capacity(frames.len());
    let mut previous: Option<(usize, usize)> = None;

    for frame in frames {
        let delta = frame.offset_delta() as usize;
        let old_pos = match previous {
            None => delta,
            Some((old_prev, _)) => old_prev + delta + 1,
        };
        let new_pos = relocation.map(old_pos);
        let new_delta = match previous {
            None => new_pos,
            Some((_, new_prev)) => new_pos - new_prev - 1,
        };
        let new_delta = u16::try_from(new_delta).map_err(|_| RewriteError::CodeTooLarge { len: new_pos })?;
        relocated.push(rebase(frame, new_delta, relocation)?);
        previous = Some((old_pos, new_pos));
    }

    Ok(write_stack_map_table(&relocated))
}

fn rebase(frame: StackMapFrame, offset_delta: u16, relocation: &Relocation) -> Result<StackMapFrame, RewriteError> {
    let types = |types: Vec<VerificationTypeInfo>| -> Result<Vec<VerificationTypeInfo>, RewriteError> {
        types.into_iter().map(|ty| retarget(ty, relocation)).collect()
    };
    Ok(match frame {
        StackMapFrame::Same { .. } => StackMapFrame::Same { offset_delta },
        StackMapFrame::SameExtended { .. } => StackMapFrame::SameExtended { offset_delta },
        StackMapFrame::SameLocals1StackItem { stack, .. } => {
            StackMapFrame::SameLocals1StackItem { offset_delta, stack: retarget(stack, relocation)? }
        }
        StackMapFrame::SameLocals1StackItemExtended { stack, .. } => {
            StackMapFrame::SameLocals1StackItemExtended { offset_delta, stack: retarget(stack, relocation)? }
        }
        StackMapFrame::Chop { k, .. } => StackMapFrame::Chop { offset_delta, k },
        StackMapFrame::Append { locals, .. } => StackMapFrame::Append { offset_delta, locals: types(locals)? },
        StackMapFrame::Full { locals, stack, .. } => {
            StackMapFrame::Full { offset_delta, locals: types(locals)?, stack: types(stack)? }
        }
    })
}

/// `Uninitialized` carries the offset of its `new` instruction.
fn retarget(ty: VerificationTypeInfo, relocation: &Relocation) -> Result<VerificationTypeInfo, RewriteError> {
    match ty {
        VerificationTypeInfo::Uninitialized(offset) => {
            let moved = relocation.map(offset as usize);
            let moved = u16::try_from(moved).map_err(|_| RewriteError::CodeTooLarge { len: moved })?;
            Ok(VerificationTypeInfo::Uninitialized(moved))
        }
        other => Ok(other),
    }
}
