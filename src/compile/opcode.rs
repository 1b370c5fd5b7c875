//! Instruction encoding and line-table assembly.
//!
//! Opcodes below `HAVE_ARGUMENT` are one byte; the rest carry a two-byte
//! little-endian argument, widened with `EXTENDED_ARG` when it does not fit.

use anyhow::{Result, bail};

pub const POP_TOP: u8 = 1;
pub const DUP_TOP: u8 = 4;
pub const UNARY_POSITIVE: u8 = 10;
pub const UNARY_NEGATIVE: u8 = 11;
pub const UNARY_NOT: u8 = 12;
pub const UNARY_INVERT: u8 = 15;
pub const BINARY_POWER: u8 = 19;
pub const BINARY_MULTIPLY: u8 = 20;
pub const BINARY_DIVIDE: u8 = 21;
pub const BINARY_MODULO: u8 = 22;
pub const BINARY_ADD: u8 = 23;
pub const BINARY_SUBTRACT: u8 = 24;
pub const BINARY_SUBSCR: u8 = 25;
pub const BINARY_FLOOR_DIVIDE: u8 = 26;
pub const STORE_MAP: u8 = 54;
pub const INPLACE_ADD: u8 = 55;
pub const STORE_SUBSCR: u8 = 60;
pub const DELETE_SUBSCR: u8 = 61;
pub const BINARY_LSHIFT: u8 = 62;
pub const BINARY_RSHIFT: u8 = 63;
pub const BINARY_AND: u8 = 64;
pub const BINARY_XOR: u8 = 65;
pub const BINARY_OR: u8 = 66;
pub const GET_ITER: u8 = 68;
pub const PRINT_ITEM: u8 = 71;
pub const PRINT_NEWLINE: u8 = 72;
pub const BREAK_LOOP: u8 = 80;
pub const WITH_CLEANUP: u8 = 81;
pub const LOAD_LOCALS: u8 = 82;
pub const RETURN_VALUE: u8 = 83;
pub const IMPORT_STAR: u8 = 84;
pub const EXEC_STMT: u8 = 85;
pub const YIELD_VALUE: u8 = 86;
pub const POP_BLOCK: u8 = 87;
pub const END_FINALLY: u8 = 88;
pub const BUILD_CLASS: u8 = 89;

pub const HAVE_ARGUMENT: u8 = 90;

pub const STORE_NAME: u8 = 90;
pub const DELETE_NAME: u8 = 91;
pub const UNPACK_SEQUENCE: u8 = 92;
pub const FOR_ITER: u8 = 93;
pub const STORE_ATTR: u8 = 95;
pub const DELETE_ATTR: u8 = 96;
pub const STORE_GLOBAL: u8 = 97;
pub const DELETE_GLOBAL: u8 = 98;
pub const LOAD_CONST: u8 = 100;
pub const LOAD_NAME: u8 = 101;
pub const BUILD_TUPLE: u8 = 102;
pub const BUILD_LIST: u8 = 103;
pub const BUILD_SET: u8 = 104;
pub const BUILD_MAP: u8 = 105;
pub const LOAD_ATTR: u8 = 106;
pub const COMPARE_OP: u8 = 107;
pub const IMPORT_NAME: u8 = 108;
pub const IMPORT_FROM: u8 = 109;
pub const JUMP_FORWARD: u8 = 110;
pub const JUMP_IF_FALSE_OR_POP: u8 = 111;
pub const JUMP_IF_TRUE_OR_POP: u8 = 112;
pub const JUMP_ABSOLUTE: u8 = 113;
pub const POP_JUMP_IF_FALSE: u8 = 114;
pub const POP_JUMP_IF_TRUE: u8 = 115;
pub const LOAD_GLOBAL: u8 = 116;
pub const CONTINUE_LOOP: u8 = 119;
pub const SETUP_LOOP: u8 = 120;
pub const SETUP_EXCEPT: u8 = 121;
pub const SETUP_FINALLY: u8 = 122;
pub const LOAD_FAST: u8 = 124;
pub const STORE_FAST: u8 = 125;
pub const DELETE_FAST: u8 = 126;
pub const RAISE_VARARGS: u8 = 130;
pub const CALL_FUNCTION: u8 = 131;
pub const MAKE_FUNCTION: u8 = 132;
pub const SETUP_WITH: u8 = 143;
pub const EXTENDED_ARG: u8 = 145;

pub fn has_arg(op: u8) -> bool {
    op >= HAVE_ARGUMENT
}

fn is_relative_jump(op: u8) -> bool {
    matches!(
        op,
        JUMP_FORWARD | FOR_ITER | SETUP_LOOP | SETUP_EXCEPT | SETUP_FINALLY | SETUP_WITH
    )
}

/// Position of a jump whose target is filled in later.
#[derive(Debug, Clone, Copy)]
pub struct JumpSlot {
    op: u8,
    at: usize,
}

#[derive(Debug)]
pub struct Assembler {
    code: Vec<u8>,
    lnotab: Vec<u8>,
    line: u32,
    table_line: u32,
    table_offset: usize,
    overflowed: bool,
}

impl Assembler {
    pub fn new(first_line: u32) -> Self {
        Self {
            code: Vec::new(),
            lnotab: Vec::new(),
            line: first_line,
            table_line: first_line,
            table_offset: 0,
            overflowed: false,
        }
    }

    /// Line attributed to the instructions emitted from now on. A line lower
    /// than the last recorded one leaves the table untouched.
    pub fn set_line(&mut self, line: u32) {
        self.line = line;
    }

    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit(&mut self, op: u8) {
        debug_assert!(!has_arg(op));
        self.mark_line();
        self.code.push(op);
    }

    pub fn emit_arg(&mut self, op: u8, arg: u32) {
        debug_assert!(has_arg(op));
        self.mark_line();
        if arg > 0xFFFF {
            let [_, _, hi0, hi1] = arg.to_le_bytes();
            self.code.extend_from_slice(&[EXTENDED_ARG, hi0, hi1]);
        }
        let [lo0, lo1, _, _] = arg.to_le_bytes();
        self.code.extend_from_slice(&[op, lo0, lo1]);
    }

    pub fn emit_jump(&mut self, op: u8) -> JumpSlot {
        let at = self.offset();
        self.emit_arg(op, 0);
        JumpSlot { op, at }
    }

    /// Backward jump to an already known absolute target.
    pub fn emit_jump_to(&mut self, op: u8, target: usize) {
        let slot = self.emit_jump(op);
        self.patch_to(slot, target);
    }

    pub fn patch(&mut self, slot: JumpSlot) {
        let target = self.offset();
        self.patch_to(slot, target);
    }

    fn patch_to(&mut self, slot: JumpSlot, target: usize) {
        let arg = if is_relative_jump(slot.op) {
            target.saturating_sub(slot.at + 3)
        } else {
            target
        };
        match u16::try_from(arg) {
            Ok(arg) => {
                let [lo, hi] = arg.to_le_bytes();
                self.code[slot.at + 1] = lo;
                self.code[slot.at + 2] = hi;
            }
            Err(_) => self.overflowed = true,
        }
    }

    fn mark_line(&mut self) {
        if self.line <= self.table_line {
            return;
        }
        let mut byte_delta = self.offset() - self.table_offset;
        let mut line_delta = self.line - self.table_line;
        while byte_delta > 255 {
            self.lnotab.extend_from_slice(&[255, 0]);
            byte_delta -= 255;
        }
        while line_delta > 255 {
            self.lnotab.extend_from_slice(&[byte_delta as u8, 255]);
            byte_delta = 0;
            line_delta -= 255;
        }
        self.lnotab.extend_from_slice(&[byte_delta as u8, line_delta as u8]);
        self.table_offset = self.offset();
        self.table_line = self.line;
    }

    /// `(instructions, line table)`.
    pub fn finish(self) -> Result<(Vec<u8>, Vec<u8>)> {
        if self.overflowed {
            bail!("jump target does not fit in a 16-bit argument");
        }
        Ok((self.code, self.lnotab))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_are_little_endian() {
        let mut asm = Assembler::new(1);
        asm.emit_arg(LOAD_CONST, 0x0102);
        asm.emit(RETURN_VALUE);
        let (code, table) = asm.finish().unwrap();
        assert_eq!(code, vec![LOAD_CONST, 0x02, 0x01, RETURN_VALUE]);
        assert!(table.is_empty());
    }

    #[test]
    fn wide_arguments_get_a_prefix() {
        let mut asm = Assembler::new(1);
        asm.emit_arg(LOAD_NAME, 0x0001_0002);
        let (code, _) = asm.finish().unwrap();
        assert_eq!(code, vec![EXTENDED_ARG, 0x01, 0x00, LOAD_NAME, 0x02, 0x00]);
    }

    #[test]
    fn line_increases_become_delta_pairs() {
        let mut asm = Assembler::new(1);
        asm.emit_arg(LOAD_CONST, 0);
        asm.set_line(3);
        asm.emit(POP_TOP);
        asm.set_line(2);
        asm.emit(POP_TOP);
        asm.set_line(4);
        asm.emit(POP_TOP);
        let (_, table) = asm.finish().unwrap();
        assert_eq!(table, vec![3, 2, 2, 1]);
    }

    #[test]
    fn large_deltas_are_split() {
        let mut asm = Assembler::new(1);
        for _ in 0..100 {
            asm.emit_arg(LOAD_CONST, 0);
        }
        asm.set_line(400);
        asm.emit(POP_TOP);
        let (_, table) = asm.finish().unwrap();
        assert_eq!(table, vec![255, 0, 45, 255, 0, 144]);
    }

    #[test]
    fn forward_jumps_are_relative() {
        let mut asm = Assembler::new(1);
        let slot = asm.emit_jump(JUMP_FORWARD);
        asm.emit(POP_TOP);
        asm.patch(slot);
        let back = asm.offset();
        asm.emit_jump_to(JUMP_ABSOLUTE, 0);
        let (code, _) = asm.finish().unwrap();
        assert_eq!(&code[..3], &[JUMP_FORWARD, 1, 0]);
        assert_eq!(&code[back..], &[JUMP_ABSOLUTE, 0, 0]);
    }
}
