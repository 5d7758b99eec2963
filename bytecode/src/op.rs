/// Maximum length in bytes of a function's instructions. Keeps every
/// branch displacement within a signed 32-bit integer.
pub const MAX_FUNCTION_SIZE: usize = 0x7FFF_FFFF;

/// Instruction opcodes.
///
/// Each instruction starts with an opcode byte, optionally followed by
/// little-endian immediate operands. The numeric values are serialized
/// into package files, so changing them invalidates stored bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    // System
    Nop = 0,
    /// Operands: `code:u8` — one of the [`Sys`] sub-codes.
    Sys,

    // Control flow
    Ret,
    /// Operands: `function:u32` — index into the package function table.
    Call,
    /// Operands: `rel:i32` — displacement from the first byte of this
    /// instruction.
    B,
    /// Operands: `rel:i32`. Pops a bool and branches when it is true.
    Bif,

    // Memory
    /// Operands: `index:u16`
    LoadArg,
    /// Operands: `index:u16`
    LoadLocal,
    /// Operands: `index:u16`
    StoreArg,
    /// Operands: `index:u16`
    StoreLocal,

    // Constants
    Unit,
    True,
    False,
    /// Operands: `value:i64`
    Int64,

    // Math
    Neg,
    Not,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    Asr,
    And,
    Or,
    Xor,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    pub const COUNT: usize = Op::Ne as usize + 1;

    /// Convert a raw byte to an opcode without a bounds check.
    ///
    /// # Safety
    ///
    /// `byte` must be a valid opcode value (`< Op::COUNT`).
    #[inline(always)]
    pub unsafe fn from_u8_unchecked(byte: u8) -> Self {
        debug_assert!(
            (byte as usize) < Self::COUNT,
            "invalid opcode: 0x{byte:02x}"
        );
        core::mem::transmute::<u8, Op>(byte)
    }

    /// Total encoded size in bytes, opcode byte included.
    pub const fn size(self) -> usize {
        match self {
            Op::Nop
            | Op::Ret
            | Op::Unit
            | Op::True
            | Op::False
            | Op::Neg
            | Op::Not
            | Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Shl
            | Op::Shr
            | Op::Asr
            | Op::And
            | Op::Or
            | Op::Xor
            | Op::Lt
            | Op::Le
            | Op::Gt
            | Op::Ge
            | Op::Eq
            | Op::Ne => 1,
            Op::Sys => 2,
            Op::LoadArg | Op::LoadLocal | Op::StoreArg | Op::StoreLocal => 3,
            Op::Call | Op::B | Op::Bif => 5,
            Op::Int64 => 9,
        }
    }

    pub const fn mnemonic(self) -> &'static str {
        match self {
            Op::Nop => "nop",
            Op::Sys => "sys",
            Op::Ret => "ret",
            Op::Call => "call",
            Op::B => "b",
            Op::Bif => "bif",
            Op::LoadArg => "loadarg",
            Op::LoadLocal => "loadlocal",
            Op::StoreArg => "storearg",
            Op::StoreLocal => "storelocal",
            Op::Unit => "unit",
            Op::True => "true",
            Op::False => "false",
            Op::Int64 => "int64",
            Op::Neg => "neg",
            Op::Not => "not",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Mod => "mod",
            Op::Shl => "shl",
            Op::Shr => "shr",
            Op::Asr => "asr",
            Op::And => "and",
            Op::Or => "or",
            Op::Xor => "xor",
            Op::Lt => "lt",
            Op::Le => "le",
            Op::Gt => "gt",
            Op::Ge => "ge",
            Op::Eq => "eq",
            Op::Ne => "ne",
        }
    }

    /// Whether executing this instruction may allocate and therefore
    /// needs a safepoint at its return offset. `Sys` depends on its
    /// sub-code; see [`Sys::may_allocate`].
    pub const fn may_allocate(self) -> bool {
        matches!(self, Op::Call)
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Op is repr(u8) with contiguous variants from 0.
            Ok(unsafe { Op::from_u8_unchecked(byte) })
        } else {
            Err(byte)
        }
    }
}

/// Codes for VM intrinsic functions, loosely based on Linux amd64 system
/// call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Sys {
    /// Pops an int64 and halts with that status.
    Exit = 60,
    /// Pops an int64 and writes it as decimal plus newline to the
    /// configured output stream.
    Println = 127,
}

impl Sys {
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Sys::Exit => "exit",
            Sys::Println => "println",
        }
    }

    /// `Println` counts as allocating: its sink may box the value.
    pub const fn may_allocate(self) -> bool {
        matches!(self, Sys::Println)
    }
}

impl TryFrom<u8> for Sys {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            60 => Ok(Sys::Exit),
            127 => Ok(Sys::Println),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_round_trip() {
        for byte in 0..Op::COUNT as u8 {
            let op = Op::try_from(byte).expect("valid opcode");
            assert_eq!(op as u8, byte);
        }
        assert_eq!(Op::try_from(Op::COUNT as u8), Err(Op::COUNT as u8));
        assert_eq!(Op::try_from(0xFF), Err(0xFF));
    }

    #[test]
    fn sizes_match_the_encoding_table() {
        assert_eq!(Op::Nop.size(), 1);
        assert_eq!(Op::Sys.size(), 2);
        assert_eq!(Op::Ret.size(), 1);
        assert_eq!(Op::Call.size(), 5);
        assert_eq!(Op::B.size(), 5);
        assert_eq!(Op::Bif.size(), 5);
        assert_eq!(Op::LoadArg.size(), 3);
        assert_eq!(Op::StoreLocal.size(), 3);
        assert_eq!(Op::Int64.size(), 9);
        assert_eq!(Op::Add.size(), 1);
        assert_eq!(Op::Ne.size(), 1);
    }

    #[test]
    fn only_calls_and_println_allocate() {
        for byte in 0..Op::COUNT as u8 {
            let op = Op::try_from(byte).expect("valid opcode");
            assert_eq!(op.may_allocate(), op == Op::Call);
        }
        assert!(!Sys::Exit.may_allocate());
        assert!(Sys::Println.may_allocate());
    }

    #[test]
    fn sys_codes_match_the_abi() {
        assert_eq!(Sys::Exit as u8, 60);
        assert_eq!(Sys::Println as u8, 127);
        assert_eq!(Sys::try_from(60), Ok(Sys::Exit));
        assert_eq!(Sys::try_from(127), Ok(Sys::Println));
        assert_eq!(Sys::try_from(0), Err(0));
    }

    #[test]
    fn mnemonics_are_lowercase_names() {
        assert_eq!(Op::LoadArg.mnemonic(), "loadarg");
        assert_eq!(Op::Bif.mnemonic(), "bif");
        assert_eq!(Sys::Println.mnemonic(), "println");
    }
}
