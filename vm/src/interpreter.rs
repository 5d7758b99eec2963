use std::error::Error;
use std::fmt;
use std::io::Write;
use std::ptr;
use std::sync::Arc;

use bytecode::{Op, Sys};
use heap::{FRAME_WORDS, WORD_SIZE};
use package::{Function, Package, PackageError};

use crate::Vm;

/// Runtime failures of the stack machine. Verified code only hits
/// [`StackOverflow`](RuntimeError::StackOverflow) and
/// [`DivideByZero`](RuntimeError::DivideByZero); the remaining variants
/// guard execution of unvalidated packages.
#[derive(Debug)]
pub enum RuntimeError {
    EntrySignature { function: String },
    StackOverflow,
    DivideByZero { offset: usize },
    BranchOutOfRange { offset: usize },
    IpOutOfRange { offset: usize },
    TruncatedInstruction { offset: usize },
    UnknownOpcode { offset: usize, byte: u8 },
    UnknownSys { offset: usize, code: u8 },
    Package(PackageError),
    Io(std::io::Error),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::EntrySignature { function } => write!(
                f,
                "entry function {function} must take no parameters and \
                 return nothing"
            ),
            RuntimeError::StackOverflow => write!(f, "stack overflow"),
            RuntimeError::DivideByZero { offset } => {
                write!(f, "at offset {offset}, division by zero")
            }
            RuntimeError::BranchOutOfRange { offset } => {
                write!(f, "at offset {offset}, branch target out of range")
            }
            RuntimeError::IpOutOfRange { offset } => {
                write!(f, "instruction pointer {offset} out of range")
            }
            RuntimeError::TruncatedInstruction { offset } => {
                write!(f, "at offset {offset}, truncated instruction")
            }
            RuntimeError::UnknownOpcode { offset, byte } => {
                write!(f, "at offset {offset}, unknown opcode 0x{byte:02x}")
            }
            RuntimeError::UnknownSys { offset, code } => {
                write!(f, "at offset {offset}, unknown system function {code}")
            }
            RuntimeError::Package(err) => err.fmt(f),
            RuntimeError::Io(err) => err.fmt(f),
        }
    }
}

impl Error for RuntimeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RuntimeError::Package(err) => Some(err),
            RuntimeError::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// How execution ended: the entry function returned, or `sys exit` asked
/// for the process to stop with a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Exit(i64),
}

/// Run `entry`, which must take no parameters and return nothing.
///
/// The stack is checked out of the VM's pool for the duration. A
/// sentinel frame with a null saved frame pointer marks the bottom of
/// the frame chain; `ret` unwinding it ends execution. `sys println`
/// writes to `out`.
pub fn interpret(
    package: &Arc<Package>,
    entry: &Arc<Function>,
    vm: &Vm,
    out: &mut dyn Write,
) -> Result<Outcome, RuntimeError> {
    if !entry.param_types().is_empty() || !entry.return_types().is_empty() {
        return Err(RuntimeError::EntrySignature {
            function: entry.name().to_string(),
        });
    }

    let mut stack = vm.stack_pool().get();
    stack
        .check((FRAME_WORDS + entry.frame_size() as usize) * WORD_SIZE)
        .map_err(|_| RuntimeError::StackOverflow)?;

    // The sentinel frame: restoring its null fp halts the machine. The
    // frame chain additionally keeps the materialized callees alive.
    let mut frames: Vec<(Arc<Function>, Arc<Package>)> =
        vec![(entry.clone(), package.clone())];
    stack.push(Arc::as_ptr(package) as u64);
    stack.push(Arc::as_ptr(entry) as u64);
    stack.push(0); // ip
    stack.push(0); // fp
    stack.fp = stack.sp;

    let mut cur_fn = entry.clone();
    let mut cur_pp = package.clone();
    let mut ip = 0usize;

    loop {
        let insts = cur_fn.insts();
        let byte = match insts.get(ip) {
            Some(&byte) => byte,
            None => return Err(RuntimeError::IpOutOfRange { offset: ip }),
        };
        let op = Op::try_from(byte)
            .map_err(|byte| RuntimeError::UnknownOpcode { offset: ip, byte })?;
        if ip + op.size() > insts.len() {
            return Err(RuntimeError::TruncatedInstruction { offset: ip });
        }

        match op {
            Op::Nop => {}

            Op::Unit | Op::False => stack.push(0),
            Op::True => stack.push(1),
            Op::Int64 => {
                let value = imm_i64(insts, ip);
                stack.push(value as u64);
            }

            Op::Neg => {
                let a = stack.pop() as i64;
                stack.push(a.wrapping_neg() as u64);
            }
            Op::Not => {
                // Logical negation for both operand types; booleans stay
                // canonical zero-or-one.
                let a = stack.pop();
                stack.push(u64::from(a == 0));
            }

            Op::Add | Op::Sub | Op::Mul => {
                let b = stack.pop() as i64;
                let a = stack.pop() as i64;
                let result = match op {
                    Op::Add => a.wrapping_add(b),
                    Op::Sub => a.wrapping_sub(b),
                    _ => a.wrapping_mul(b),
                };
                stack.push(result as u64);
            }
            Op::Div | Op::Mod => {
                let b = stack.pop() as i64;
                let a = stack.pop() as i64;
                if b == 0 {
                    return Err(RuntimeError::DivideByZero { offset: ip });
                }
                let result = if op == Op::Div {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                };
                stack.push(result as u64);
            }
            Op::Shl | Op::Shr | Op::Asr => {
                // Shift counts are masked to the low six bits.
                let count = (stack.pop() & 63) as u32;
                let a = stack.pop();
                let result = match op {
                    Op::Shl => a << count,
                    Op::Shr => a >> count,
                    _ => ((a as i64) >> count) as u64,
                };
                stack.push(result);
            }
            Op::And | Op::Or | Op::Xor => {
                let b = stack.pop();
                let a = stack.pop();
                let result = match op {
                    Op::And => a & b,
                    Op::Or => a | b,
                    _ => a ^ b,
                };
                stack.push(result);
            }

            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let b = stack.pop() as i64;
                let a = stack.pop() as i64;
                let result = match op {
                    Op::Lt => a < b,
                    Op::Le => a <= b,
                    Op::Gt => a > b,
                    _ => a >= b,
                };
                stack.push(u64::from(result));
            }
            Op::Eq | Op::Ne => {
                let b = stack.pop();
                let a = stack.pop();
                stack.push(u64::from((a == b) == (op == Op::Eq)));
            }

            Op::LoadArg => {
                let index = imm_u16(insts, ip) as usize;
                let addr = arg_slot(&stack, cur_fn.param_word_count(), index);
                let value = unsafe { ptr::read(addr as *const u64) };
                stack.push(value);
            }
            Op::StoreArg => {
                let index = imm_u16(insts, ip) as usize;
                let value = stack.pop();
                let addr = arg_slot(&stack, cur_fn.param_word_count(), index);
                unsafe { ptr::write(addr as *mut u64, value) };
            }
            Op::LoadLocal => {
                let index = imm_u16(insts, ip) as usize;
                let addr = stack.fp - (index + 1) * WORD_SIZE;
                let value = unsafe { ptr::read(addr as *const u64) };
                stack.push(value);
            }
            Op::StoreLocal => {
                let index = imm_u16(insts, ip) as usize;
                let value = stack.pop();
                let addr = stack.fp - (index + 1) * WORD_SIZE;
                unsafe { ptr::write(addr as *mut u64, value) };
            }

            Op::B => {
                ip = branch_target(ip, imm_i32(insts, ip), insts.len())?;
                continue;
            }
            Op::Bif => {
                let cond = stack.pop();
                if cond != 0 {
                    ip = branch_target(ip, imm_i32(insts, ip), insts.len())?;
                    continue;
                }
            }

            Op::Sys => match Sys::try_from(insts[ip + 1]) {
                Ok(Sys::Exit) => {
                    return Ok(Outcome::Exit(stack.pop() as i64));
                }
                Ok(Sys::Println) => {
                    let value = stack.pop() as i64;
                    writeln!(out, "{value}").map_err(RuntimeError::Io)?;
                }
                Err(code) => {
                    return Err(RuntimeError::UnknownSys { offset: ip, code });
                }
            },

            Op::Call => {
                let index = imm_u32(insts, ip) as usize;
                let callee = cur_pp
                    .function_by_index(index)
                    .map_err(RuntimeError::Package)?;
                stack
                    .check(
                        (FRAME_WORDS + callee.frame_size() as usize)
                            * WORD_SIZE,
                    )
                    .map_err(|_| RuntimeError::StackOverflow)?;
                let return_ip = ip + op.size();
                stack.push(Arc::as_ptr(&cur_pp) as u64);
                stack.push(Arc::as_ptr(&callee) as u64);
                stack.push(return_ip as u64);
                let saved_fp = stack.fp;
                stack.push(saved_fp as u64);
                stack.fp = stack.sp;
                frames.push((callee.clone(), cur_pp.clone()));
                cur_fn = callee;
                ip = 0;
                continue;
            }

            Op::Ret => {
                let frame = stack.frame();
                let ret_words = cur_fn.return_word_count();
                let param_words = cur_fn.param_word_count();
                // Slide the return values over the consumed arguments.
                let src = stack.sp;
                let dst = (stack.fp as i64
                    + ((FRAME_WORDS + param_words) as i64 - ret_words as i64)
                        * WORD_SIZE as i64) as usize;
                unsafe {
                    ptr::copy(src as *const u64, dst as *mut u64, ret_words)
                };
                stack.sp = dst;
                if frame.fp == 0 {
                    return Ok(Outcome::Finished);
                }
                stack.fp = frame.fp;
                ip = frame.ip;
                frames.pop();
                let (function, pkg) = match frames.last() {
                    Some(top) => top.clone(),
                    None => unreachable!("sentinel frame was unwound above"),
                };
                cur_fn = function;
                cur_pp = pkg;
                continue;
            }
        }

        ip += op.size();
    }
}

/// Address of argument `index` above the frame record: arguments were
/// pushed left to right, so argument 0 is the deepest.
fn arg_slot(stack: &heap::Stack, param_words: usize, index: usize) -> usize {
    stack.fp + (FRAME_WORDS + param_words - 1 - index) * WORD_SIZE
}

fn branch_target(
    ip: usize,
    rel: i32,
    len: usize,
) -> Result<usize, RuntimeError> {
    let target = ip as i64 + i64::from(rel);
    if target < 0 || target >= len as i64 {
        return Err(RuntimeError::BranchOutOfRange { offset: ip });
    }
    Ok(target as usize)
}

fn imm_u16(insts: &[u8], ip: usize) -> u16 {
    u16::from_le_bytes([insts[ip + 1], insts[ip + 2]])
}

fn imm_u32(insts: &[u8], ip: usize) -> u32 {
    u32::from_le_bytes([
        insts[ip + 1],
        insts[ip + 2],
        insts[ip + 3],
        insts[ip + 4],
    ])
}

fn imm_i32(insts: &[u8], ip: usize) -> i32 {
    imm_u32(insts, ip) as i32
}

fn imm_i64(insts: &[u8], ip: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&insts[ip + 1..ip + 9]);
    i64::from_le_bytes(bytes)
}
