// Instruction set & chunks (spec §4.2).
//
// The in-memory representation is a strongly-typed `Instr` enum, in
// the same spirit as `udashboard::vm::Opcode`'s comment: "designed to
// make illegal operations impossible to represent". The packed
// 32-bit-word-plus-payload wire encoding the spec describes (opcode
// in the low byte, 24-bit argument, multi-word payloads for strings /
// doubles / absolute integers) is produced and consumed only by
// `crate::serializer`; the VM interprets `Instr` directly.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Relational operators shared by `CMP` and factset selector filters.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RelOp {
    pub fn from_tag(tag: u8) -> Option<RelOp> {
        match tag {
            0 => Some(RelOp::Eq),
            1 => Some(RelOp::Ne),
            2 => Some(RelOp::Lt),
            3 => Some(RelOp::Le),
            4 => Some(RelOp::Gt),
            5 => Some(RelOp::Ge),
            _ => None,
        }
    }

    pub fn to_tag(self) -> u8 {
        match self {
            RelOp::Eq => 0,
            RelOp::Ne => 1,
            RelOp::Lt => 2,
            RelOp::Le => 3,
            RelOp::Gt => 4,
            RelOp::Ge => 5,
        }
    }
}

/// `CMP`'s operator set: the six relationals plus unary boolean `NOT`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Rel(RelOp),
    Not,
}

/// Sub-mode of `PUSH`.
#[derive(Clone, Debug, PartialEq)]
pub enum PushArg {
    Integer(i32),
    Double(f64),
    Str(Rc<str>),
    /// `PUSH GLOBAL name`: resolved against the fact store at runtime.
    /// Yields a name-only handle when nothing matches yet, which is
    /// exactly what a `FullAssign` lvalue needs.
    Global(Rc<str>),
    /// `PUSH LOCAL n`: opens a new scope, popping `n` (value, id) pairs.
    Local(u16),
    /// Push the current value of dresvar `id`.
    DresVar(u32),
}

/// Sub-mode of `POP`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PopMode {
    /// Pop and destroy the current scope.
    Locals,
    /// Pop one value, releasing factset references.
    Discard,
}

/// Sub-mode of `SET`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetMode {
    /// Pop destination then source factset.
    Plain,
    /// Pop a field name, a single-fact destination, and a value.
    Field,
    /// Pop a scalar value and store it into local slot `n`.
    Local(u16),
    /// Pop a scalar value and store it into dresvar `id`.
    DresVar(u32),
}

/// Sub-mode of `GET`.
#[derive(Clone, Debug, PartialEq)]
pub enum GetMode {
    /// Pop a field name and a single-fact factset, push the field value.
    Field,
    /// Push the local's value (NIL if unset). Index is an immediate.
    Local(u16),
    /// Push the current value of dresvar `id`.
    DresVar(u32),
}

/// `BRANCH`'s condition, consulting the popped top-of-stack integer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BranchMode {
    Unconditional,
    /// Branch when top-of-stack != 0.
    IfTrue,
    /// Branch when top-of-stack == 0.
    IfFalse,
}

/// A single VM instruction, as laid out in a compiled `Chunk`.
#[derive(Clone, Debug, PartialEq)]
pub enum Instr {
    Push(PushArg),
    Pop(PopMode),
    /// `FILTER n`: retains only facts matching all `n` selectors
    /// already on the stack above the factset being filtered.
    Filter(u8),
    /// `UPDATE n partial`: cross-factset field transfer.
    Update(u8, bool),
    /// `CREATE n`: build a fresh orphan factset from `n` field pairs.
    Create(u8),
    Set(SetMode),
    Get(GetMode),
    /// `CALL narg`.
    Call(u8),
    Cmp(CmpOp),
    /// `BRANCH [cond] disp`, displacement relative to the next instruction.
    Branch(BranchMode, i32),
    /// `DEBUG "text"`: attaches a source-level descriptor.
    Debug(Rc<str>),
    Halt,
}

/// Byte tags used by the packed wire encoding (spec §4.2), also used
/// as the opcode discriminant in `crate::serializer`.
pub mod opcode_byte {
    pub const PUSH: u8 = 1;
    pub const POP: u8 = 2;
    pub const FILTER: u8 = 3;
    pub const UPDATE: u8 = 4;
    pub const CREATE: u8 = 5;
    pub const SET: u8 = 6;
    pub const GET: u8 = 7;
    pub const CALL: u8 = 8;
    pub const CMP: u8 = 9;
    pub const BRANCH: u8 = 10;
    pub const DEBUG: u8 = 11;
    pub const HALT: u8 = 12;
}

/// A compiled target body: straight-line instructions terminated by
/// `HALT`, plus the string pool its `Push`/`Debug`/selector payloads
/// were interned from. The pool exists so the serializer can dedup
/// strings by offset; instructions hold `Rc<str>` clones directly.
#[derive(Clone, Debug, Default)]
pub struct Chunk {
    pub instrs: Vec<Instr>,
    pub strings: Vec<Rc<str>>,
}

impl Chunk {
    pub fn new() -> Chunk {
        Chunk {
            instrs: Vec::new(),
            strings: Vec::new(),
        }
    }

    /// Intern a string into the pool, returning a shared handle.
    /// Zero-length strings share one canonical entry (spec §4.7).
    pub fn intern(&mut self, s: &str) -> Rc<str> {
        if let Some(existing) = self.strings.iter().find(|p| p.as_ref() == s) {
            return existing.clone();
        }
        let rc: Rc<str> = Rc::from(s);
        self.strings.push(rc.clone());
        rc
    }

    pub fn push(&mut self, instr: Instr) -> usize {
        self.instrs.push(instr);
        self.instrs.len() - 1
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Patch a `Branch`'s displacement once its target address is known.
    /// `at` is the branch's own index; the displacement is relative to
    /// the instruction following it.
    pub fn patch_branch(&mut self, at: usize, target: usize) {
        match &mut self.instrs[at] {
            Instr::Branch(_, disp) => {
                *disp = target as i32 - (at as i32 + 1);
            }
            other => panic!("patch_branch called on non-branch instruction {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups_equal_strings() {
        let mut chunk = Chunk::new();
        let a = chunk.intern("hello");
        let b = chunk.intern("hello");
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(chunk.strings.len(), 1);
    }

    #[test]
    fn patch_branch_computes_relative_displacement() {
        let mut chunk = Chunk::new();
        chunk.push(Instr::Branch(BranchMode::IfFalse, 0));
        chunk.push(Instr::Push(PushArg::Integer(1)));
        chunk.push(Instr::Halt);
        chunk.patch_branch(0, 2);
        match chunk.instrs[0] {
            Instr::Branch(BranchMode::IfFalse, disp) => assert_eq!(disp, 1),
            _ => panic!("expected branch"),
        }
    }
}
