//! Opcodes and their static descriptors.
//!
//! The enum discriminants are the wire encoding: emitted code stores
//! `op as u16` in the instruction stream, so reordering variants is a
//! bytecode format change.

/// Descriptor flag bits.
pub mod flags {
    /// Instruction carries an owned constant (pool index when emitted).
    pub const HAS_CONSTANT: u8 = 1 << 0;
    /// Instruction addresses a local variable (level + frame index).
    pub const HAS_VARIABLE: u8 = 1 << 1;
    /// Instruction carries a forward branch target.
    pub const HAS_BRANCH: u8 = 1 << 2;
    /// Instruction participates in name binding (variable or call).
    pub const HAS_BINDING: u8 = 1 << 3;
    /// Placeholder opcode: valid only inside call arglists or as a binder.
    pub const IS_CALL_PSEUDO: u8 = 1 << 4;
}

use self::flags::*;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // Program structure
    Top, // start of the main body
    Return,
    Dep, // import declaration, stripped by take_imports before emission

    // Stack & constants
    Dup,
    Pop,
    Const, // u16 pool index

    // Backtracking control flow (all branches are forward)
    Fork,        // u16 offset: push a backtrack point, resume there on exhaustion
    ForkOpt,     // u16 offset: like Fork, but resumed only on error
    Jump,        // u16 offset
    JumpIfFalse, // u16 offset
    Backtrack,

    // Locals (u16 nesting level + u16 frame index)
    StoreVar,
    LoadVar,
    TakeVar, // load, then reset the slot to null
    Append,  // append TOS to the addressed array variable

    // Path-expression bracketing
    SubexpBegin,
    SubexpEnd,

    // Calls
    Call,       // u16 argc, u16 level, u16 index(+NEW_CLOSURE), then argc * (level, index)
    CallNative, // u16 argc (incl. implicit input), u16 native index

    // Pseudo-ops: never emitted as standalone bytecode
    MakeClosure,  // function definition; body in subfn, formals in arglist
    MakeNative,   // native-function binder
    ClosureParam, // formal parameter placeholder
    ClosureRef,   // pass an existing closure at a call site
}

/// Static description of an opcode: mnemonic, encoded length in 16-bit
/// words (including the opcode word; 0 for pseudo-ops, which are skipped
/// by the emitter), and flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpDesc {
    pub name: &'static str,
    pub length: u16,
    pub flags: u8,
}

const fn desc(name: &'static str, length: u16, flags: u8) -> OpDesc {
    OpDesc {
        name,
        length,
        flags,
    }
}

impl Op {
    pub const COUNT: usize = Op::ClosureRef as usize + 1;

    pub fn describe(self) -> &'static OpDesc {
        static DESCS: [OpDesc; Op::COUNT] = [
            desc("TOP", 1, 0),
            desc("RET", 1, 0),
            desc("DEP", 2, HAS_CONSTANT),
            desc("DUP", 1, 0),
            desc("POP", 1, 0),
            desc("LOADK", 2, HAS_CONSTANT),
            desc("FORK", 2, HAS_BRANCH),
            desc("FORK_OPT", 2, HAS_BRANCH),
            desc("JUMP", 2, HAS_BRANCH),
            desc("JUMP_F", 2, HAS_BRANCH),
            desc("BACKTRACK", 1, 0),
            desc("STOREV", 3, HAS_VARIABLE | HAS_BINDING),
            desc("LOADV", 3, HAS_VARIABLE | HAS_BINDING),
            desc("LOADVN", 3, HAS_VARIABLE | HAS_BINDING),
            desc("APPEND", 3, HAS_VARIABLE | HAS_BINDING),
            desc("SUBEXP_BEGIN", 1, 0),
            desc("SUBEXP_END", 1, 0),
            desc("CALL", 4, HAS_BINDING | IS_CALL_PSEUDO),
            desc("CALL_NATIVE", 3, 0),
            desc("MAKE_CLOSURE", 0, HAS_BINDING | IS_CALL_PSEUDO),
            desc("MAKE_NATIVE", 0, HAS_BINDING | IS_CALL_PSEUDO),
            desc("CLOSURE_PARAM", 0, HAS_BINDING | IS_CALL_PSEUDO),
            desc("CLOSURE_REF", 0, HAS_BINDING | IS_CALL_PSEUDO),
        ];
        &DESCS[self as usize]
    }

    /// Convert a raw word back to an Op. Valid because the enum is
    /// `#[repr(u16)]` with dense variants from 0 through `ClosureRef`.
    pub fn from_u16(word: u16) -> Option<Op> {
        if word <= Op::ClosureRef as u16 {
            // SAFETY: Op is #[repr(u16)] with dense, contiguous variants
            // 0..=ClosureRef.
            Some(unsafe { std::mem::transmute::<u16, Op>(word) })
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        self.describe().name
    }

    pub fn has_constant(self) -> bool {
        self.describe().flags & HAS_CONSTANT != 0
    }

    pub fn has_variable(self) -> bool {
        self.describe().flags & HAS_VARIABLE != 0
    }

    pub fn has_branch(self) -> bool {
        self.describe().flags & HAS_BRANCH != 0
    }

    pub fn has_binding(self) -> bool {
        self.describe().flags & HAS_BINDING != 0
    }

    pub fn is_call_pseudo(self) -> bool {
        self.describe().flags & IS_CALL_PSEUDO != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Op; Op::COUNT] = [
        Op::Top,
        Op::Return,
        Op::Dep,
        Op::Dup,
        Op::Pop,
        Op::Const,
        Op::Fork,
        Op::ForkOpt,
        Op::Jump,
        Op::JumpIfFalse,
        Op::Backtrack,
        Op::StoreVar,
        Op::LoadVar,
        Op::TakeVar,
        Op::Append,
        Op::SubexpBegin,
        Op::SubexpEnd,
        Op::Call,
        Op::CallNative,
        Op::MakeClosure,
        Op::MakeNative,
        Op::ClosureParam,
        Op::ClosureRef,
    ];

    #[test]
    fn test_from_u16_roundtrip() {
        for op in ALL {
            assert_eq!(Op::from_u16(op as u16), Some(op));
        }
        assert_eq!(Op::from_u16(Op::ClosureRef as u16 + 1), None);
    }

    #[test]
    fn test_descriptor_consistency() {
        for op in ALL {
            let d = op.describe();
            // Operand-carrying flags imply room for the operand words.
            if op.has_constant() {
                assert!(d.length >= 2, "{} too short for a constant", d.name);
            }
            if op.has_branch() {
                assert_eq!(d.length, 2, "{} branch encoding", d.name);
            }
            if op.has_variable() {
                assert_eq!(d.length, 3, "{} variable encoding", d.name);
            }
            // Pseudo-ops are never emitted standalone.
            if op.is_call_pseudo() && op != Op::Call {
                assert_eq!(d.length, 0, "{} must not occupy code words", d.name);
            }
        }
    }

    #[test]
    fn test_binding_flags() {
        // HAS_BINDING subsumes both variable and call bindings.
        assert!(Op::LoadVar.has_binding());
        assert!(Op::Call.has_binding());
        assert!(Op::MakeClosure.has_binding());
        assert!(!Op::Dup.has_binding());
    }
}
