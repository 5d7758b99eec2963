//! Instruction encoding and the function assembler.
//!
//! [`Op`] is the closed opcode table: one byte per opcode, little-endian
//! immediates, sizes fixed per opcode. [`Assembler`] builds a function's
//! instruction blob from labeled instructions; the verifier and the
//! interpreter both consume the raw bytes.

mod asm;
mod op;

pub use asm::{Assembler, Label};
pub use op::{Op, Sys, MAX_FUNCTION_SIZE};
