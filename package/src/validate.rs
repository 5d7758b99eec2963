use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytecode::{Op, Sys};

use crate::function::{Function, Safepoints};
use crate::roots::Roots;
use crate::ty::{Type, TypeKind};

/// A semantic error inside one function.
#[derive(Debug)]
pub struct ValidateError {
    /// Package file, filled in by the caller that knows it.
    pub file: PathBuf,
    pub function: String,
    pub message: String,
}

impl ValidateError {
    fn new(function: &str, message: String) -> ValidateError {
        ValidateError {
            file: PathBuf::new(),
            function: function.to_string(),
            message,
        }
    }
}

impl fmt::Display for ValidateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.file.as_os_str().is_empty() {
            write!(f, "{}: ", self.file.display())?;
        }
        if !self.function.is_empty() {
            write!(f, "{}: ", self.function)?;
        }
        f.write_str(&self.message)
    }
}

impl Error for ValidateError {}

/// Supplies callee signatures for `call` checking. Implemented by the
/// package's populated function table and by the in-memory builder's
/// definitions.
pub trait CalleeResolver {
    fn callee_types(&self, index: u32) -> Option<(&[Type], &[Type])>;
}

impl CalleeResolver for Vec<Arc<Function>> {
    fn callee_types(&self, index: u32) -> Option<(&[Type], &[Type])> {
        self.get(index as usize)
            .map(|f| (f.param_types(), f.return_types()))
    }
}

/// One basic block discovered by abstract interpretation, keyed by entry
/// offset. `types` is the operand stack at entry; the frame depth is its
/// length since every operand occupies one word.
struct BlockState {
    begin: usize,
    end: usize,
    types: Vec<Type>,
    live: bool,
}

struct Verifier<'a> {
    function: &'a str,
    param_types: &'a [Type],
    return_types: &'a [Type],
    insts: &'a [u8],
    resolver: &'a dyn CalleeResolver,
    roots: &'a Roots,
    blocks: Vec<BlockState>,
    work: Vec<usize>,
    /// Offsets where a block must begin: every branch target and every
    /// conditional fallthrough, collected by a linear pre-scan.
    leaders: HashSet<usize>,
    /// (return offset, operand stack there) of every may-allocate
    /// instruction seen.
    safepoints: Vec<(u32, Vec<Type>)>,
    max_depth: usize,
}

/// Verify one function body and construct its safepoint table.
///
/// Interprets the instruction stream abstractly from offset 0, splitting
/// at branches, checking every operand type against the instruction
/// table, and requiring that control-flow merges agree exactly on the
/// entry stack. The maximum observed stack depth becomes the function's
/// frame size; every `call` and allocating `sys` contributes a safepoint
/// at its return offset.
pub fn verify(
    function: &str,
    param_types: &[Type],
    return_types: &[Type],
    insts: &[u8],
    resolver: &dyn CalleeResolver,
    roots: &Roots,
) -> Result<Safepoints, ValidateError> {
    let mut verifier = Verifier {
        function,
        param_types,
        return_types,
        insts,
        resolver,
        roots,
        blocks: vec![BlockState {
            begin: 0,
            end: 0,
            types: Vec::new(),
            live: true,
        }],
        work: vec![0],
        leaders: HashSet::new(),
        safepoints: Vec::new(),
        max_depth: 0,
    };
    verifier.run()
}

impl<'a> Verifier<'a> {
    fn run(&mut self) -> Result<Safepoints, ValidateError> {
        self.leaders = self.scan_leaders()?;
        while let Some(begin) = self.work.pop() {
            let index = match self.block_index(begin) {
                Some(index) => index,
                None => unreachable!("worklist offset without a block"),
            };
            if self.blocks[index].end > 0 {
                continue;
            }
            let types = self.blocks[index].types.clone();
            self.interpret(begin, types)?;
        }

        // No dead bytes inside or after the function.
        let mut prev_end = 0;
        for block in &self.blocks {
            debug_assert!(block.live, "unreachable block was recorded");
            if block.begin != prev_end {
                return Err(self.error(format!(
                    "block starting at {} does not start immediately after \
                     previous block",
                    block.begin
                )));
            }
            prev_end = block.end;
        }
        if prev_end != self.insts.len() {
            return Err(self.error(format!(
                "dead bytes after last block ending at {prev_end}"
            )));
        }

        let frame_size = u16::try_from(self.max_depth).map_err(|_| {
            self.error(format!("frame size {} too large", self.max_depth))
        })?;

        // Emit entries sorted by instruction offset. Bit `i` covers frame
        // slot `i`, counted from the bottom of the frame.
        self.safepoints.sort_by_key(|&(offset, _)| offset);
        let entry_size = Safepoints::bytes_per_entry(frame_size);
        let bits_len = (frame_size as usize).div_ceil(8);
        let mut data = Vec::with_capacity(self.safepoints.len() * entry_size);
        for (offset, stack) in &self.safepoints {
            let base = data.len();
            data.extend_from_slice(&offset.to_le_bytes());
            let mut bits = vec![0u8; bits_len];
            for (slot, ty) in stack.iter().enumerate() {
                if ty.is_reference() {
                    bits[slot / 8] |= 1 << (slot % 8);
                }
            }
            data.extend_from_slice(&bits);
            data.resize(base + entry_size, 0);
        }
        Ok(Safepoints::new(frame_size, data))
    }

    /// Linearly decode the instruction stream, checking opcodes, sizes,
    /// and branch target ranges, and collect the offsets where blocks
    /// must begin. Branch targets must land on instruction boundaries.
    fn scan_leaders(&self) -> Result<HashSet<usize>, ValidateError> {
        let mut boundaries = HashSet::new();
        let mut branch_edges = Vec::new();
        let mut leaders = HashSet::new();
        let mut offset = 0;
        while offset < self.insts.len() {
            boundaries.insert(offset);
            let op = Op::try_from(self.insts[offset]).map_err(|byte| {
                self.error(format!(
                    "unknown opcode 0x{byte:02x} at offset {offset}"
                ))
            })?;
            if offset + op.size() > self.insts.len() {
                return Err(self.error(format!(
                    "at offset {offset}, truncated {} instruction",
                    op.mnemonic()
                )));
            }
            if matches!(op, Op::B | Op::Bif) {
                let rel = self.imm_i32(offset);
                let target = offset as i64 + i64::from(rel);
                if target < 0 || target >= self.insts.len() as i64 {
                    return Err(self.error(format!(
                        "at offset {offset}, branch has target offset {rel} \
                         out of range"
                    )));
                }
                branch_edges.push((offset, target as usize));
                if op == Op::Bif && offset + op.size() < self.insts.len() {
                    leaders.insert(offset + op.size());
                }
            }
            offset += op.size();
        }
        for (inst_offset, target) in branch_edges {
            if !boundaries.contains(&target) {
                return Err(self.error(format!(
                    "at offset {inst_offset}, branch target {target} is not \
                     an instruction boundary"
                )));
            }
            leaders.insert(target);
        }
        Ok(leaders)
    }

    fn interpret(
        &mut self,
        begin: usize,
        mut types: Vec<Type>,
    ) -> Result<(), ValidateError> {
        self.note_depth(&types);
        let mut offset = begin;
        loop {
            if offset >= self.insts.len() {
                return Err(self.error(format!(
                    "at offset {offset}, function ends without a terminator"
                )));
            }
            if offset != begin && self.leaders.contains(&offset) {
                // Fell through into a block that starts here: end this
                // block and merge into the next one.
                self.set_block_end(begin, offset);
                return self.merge_block(offset, offset, types);
            }
            let op = Op::try_from(self.insts[offset]).map_err(|byte| {
                self.error(format!(
                    "unknown opcode 0x{byte:02x} at offset {offset}"
                ))
            })?;
            if offset + op.size() > self.insts.len() {
                return Err(self.error(format!(
                    "at offset {offset}, truncated {} instruction",
                    op.mnemonic()
                )));
            }

            match op {
                Op::Nop => {}

                Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Mod
                | Op::Shl
                | Op::Shr
                | Op::Asr => {
                    let int64 = self.roots.int64_type();
                    self.check_operand(offset, op, &types, int64, 0, 2)?;
                    self.check_operand(offset, op, &types, int64, 1, 2)?;
                    types.pop();
                }

                Op::And | Op::Or | Op::Xor => {
                    let mut want = self.roots.int64_type();
                    if types
                        .last()
                        .map(|t| t.kind() == TypeKind::Bool)
                        .unwrap_or(false)
                    {
                        want = self.roots.bool_type();
                    }
                    self.check_operand(offset, op, &types, want, 0, 2)?;
                    self.check_operand(offset, op, &types, want, 1, 2)?;
                    types.pop();
                }

                Op::Neg => {
                    let int64 = self.roots.int64_type();
                    self.check_operand(offset, op, &types, int64, 0, 1)?;
                }

                Op::Not => {
                    let mut want = self.roots.bool_type();
                    if types
                        .last()
                        .map(|t| t.kind() == TypeKind::Int64)
                        .unwrap_or(false)
                    {
                        want = self.roots.int64_type();
                    }
                    self.check_operand(offset, op, &types, want, 0, 1)?;
                }

                Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                    let int64 = self.roots.int64_type();
                    self.check_operand(offset, op, &types, int64, 0, 2)?;
                    self.check_operand(offset, op, &types, int64, 1, 2)?;
                    types.pop();
                    types.pop();
                    types.push(self.roots.bool_type());
                }

                Op::Eq | Op::Ne => {
                    if types.len() < 2 {
                        return Err(self.error(format!(
                            "at offset {offset}, {} needs 2 operands on the \
                             stack",
                            op.mnemonic()
                        )));
                    }
                    let r = types[types.len() - 1];
                    let l = types[types.len() - 2];
                    if l != r {
                        return Err(self.error(format!(
                            "at offset {offset}, {} instruction requires two \
                             operands of the same type; got {l} and {r}",
                            op.mnemonic()
                        )));
                    }
                    types.pop();
                    types.pop();
                    types.push(self.roots.bool_type());
                }

                Op::Unit => types.push(self.roots.unit_type()),
                Op::True | Op::False => types.push(self.roots.bool_type()),
                Op::Int64 => types.push(self.roots.int64_type()),

                Op::LoadArg => {
                    let index = self.imm_u16(offset) as usize;
                    if index >= self.param_types.len() {
                        return Err(self.error(format!(
                            "at offset {offset}, loadarg instruction loads \
                             argument {index} but there are {} parameter(s)",
                            self.param_types.len()
                        )));
                    }
                    types.push(self.param_types[index]);
                }

                Op::LoadLocal => {
                    let index = self.imm_u16(offset) as usize;
                    if index >= types.len() {
                        return Err(self.error(format!(
                            "at offset {offset}, loadlocal instruction loads \
                             local {index} but there are {} locals",
                            types.len()
                        )));
                    }
                    types.push(types[index]);
                }

                Op::StoreArg => {
                    let index = self.imm_u16(offset) as usize;
                    let ty = match types.pop() {
                        Some(ty) => ty,
                        None => {
                            return Err(self.error(format!(
                                "at offset {offset}, storearg instruction \
                                 with empty stack"
                            )))
                        }
                    };
                    if index >= self.param_types.len() {
                        return Err(self.error(format!(
                            "at offset {offset}, storearg instruction stores \
                             argument {index} but there are {} parameter(s)",
                            self.param_types.len()
                        )));
                    }
                    if self.param_types[index] != ty {
                        return Err(self.error(format!(
                            "at offset {offset}, storearg instruction stores \
                             argument {index} with type {} but operand has \
                             type {ty}",
                            self.param_types[index]
                        )));
                    }
                }

                Op::StoreLocal => {
                    let index = self.imm_u16(offset) as usize;
                    if types.is_empty() {
                        return Err(self.error(format!(
                            "at offset {offset}, storelocal instruction with \
                             empty stack"
                        )));
                    }
                    if index >= types.len() - 1 {
                        return Err(self.error(format!(
                            "at offset {offset}, storelocal instruction \
                             stores local {index} but there are {} locals",
                            types.len() - 1
                        )));
                    }
                    let ty = match types.pop() {
                        Some(ty) => ty,
                        None => unreachable!("checked non-empty above"),
                    };
                    types[index] = ty;
                }

                Op::B => {
                    let rel = self.imm_i32(offset);
                    self.set_block_end(begin, offset + op.size());
                    return self.check_branch(offset, rel, types);
                }

                Op::Bif => {
                    let bool_type = self.roots.bool_type();
                    self.check_operand(offset, op, &types, bool_type, 0, 1)?;
                    types.pop();
                    let rel = self.imm_i32(offset);
                    self.set_block_end(begin, offset + op.size());
                    let fallthrough = types.clone();
                    self.check_branch(offset, rel, types)?;
                    return self
                        .check_branch(offset, op.size() as i32, fallthrough);
                }

                Op::Ret => {
                    let n = self.return_types.len();
                    for i in 0..n {
                        self.check_operand(
                            offset,
                            op,
                            &types,
                            self.return_types[i],
                            n - i - 1,
                            n,
                        )?;
                    }
                    self.set_block_end(begin, offset + op.size());
                    return Ok(());
                }

                Op::Call => {
                    let index = self.imm_u32(offset);
                    let (callee_params, callee_returns) =
                        match self.resolver.callee_types(index) {
                            Some((params, returns)) => {
                                (params.to_vec(), returns.to_vec())
                            }
                            None => {
                                return Err(self.error(format!(
                                    "at offset {offset}, call instruction \
                                     has invalid function index {index}"
                                )))
                            }
                        };
                    let n = callee_params.len();
                    for i in 0..n {
                        self.check_operand(
                            offset,
                            op,
                            &types,
                            callee_params[i],
                            n - i - 1,
                            n,
                        )?;
                    }
                    types.truncate(types.len() - n);
                    types.extend_from_slice(&callee_returns);
                    self.safepoints
                        .push(((offset + op.size()) as u32, types.clone()));
                }

                Op::Sys => {
                    let code = self.insts[offset + 1];
                    match Sys::try_from(code) {
                        Ok(Sys::Exit) => {
                            let int64 = self.roots.int64_type();
                            self.check_operand(
                                offset, op, &types, int64, 0, 1,
                            )?;
                            self.set_block_end(begin, offset + op.size());
                            return Ok(());
                        }
                        Ok(Sys::Println) => {
                            let int64 = self.roots.int64_type();
                            self.check_operand(
                                offset, op, &types, int64, 0, 1,
                            )?;
                            types.pop();
                            self.safepoints.push((
                                (offset + op.size()) as u32,
                                types.clone(),
                            ));
                        }
                        Err(code) => {
                            return Err(self.error(format!(
                                "at offset {offset}, sys instruction with \
                                 unknown system function {code}"
                            )))
                        }
                    }
                }
            }

            self.note_depth(&types);
            offset += op.size();
        }
    }

    /// Check the branch target range and merge the incoming stack into
    /// the target block.
    fn check_branch(
        &mut self,
        inst_offset: usize,
        rel: i32,
        types: Vec<Type>,
    ) -> Result<(), ValidateError> {
        let target = inst_offset as i64 + i64::from(rel);
        if target < 0 || target >= self.insts.len() as i64 {
            return Err(self.error(format!(
                "at offset {inst_offset}, branch has target offset {rel} out \
                 of range"
            )));
        }
        self.merge_block(inst_offset, target as usize, types)
    }

    /// Merge an incoming stack into the block at `target`, creating the
    /// block when it is new. A known block must agree exactly: same
    /// depth, same type in every slot.
    fn merge_block(
        &mut self,
        inst_offset: usize,
        target: usize,
        types: Vec<Type>,
    ) -> Result<(), ValidateError> {
        match self.block_index(target) {
            Some(index) => {
                let block = &self.blocks[index];
                if block.types.len() != types.len() {
                    return Err(self.error(format!(
                        "at offset {inst_offset}, branch to block at \
                         {target} with stack depth {} but another branch to \
                         the same block has stack depth {}",
                        types.len(),
                        block.types.len()
                    )));
                }
                for (slot, (have, want)) in
                    types.iter().zip(block.types.iter()).enumerate()
                {
                    if have != want {
                        return Err(self.error(format!(
                            "at offset {inst_offset}, branch to block at \
                             {target} with type {have} in stack slot \
                             {} but another branch to the same block has \
                             type {want}",
                            types.len() - slot - 1
                        )));
                    }
                }
                if block.end == 0 {
                    self.work.push(target);
                }
            }
            None => {
                let index = self
                    .blocks
                    .partition_point(|block| block.begin < target);
                self.blocks.insert(
                    index,
                    BlockState {
                        begin: target,
                        end: 0,
                        types,
                        live: true,
                    },
                );
                self.work.push(target);
            }
        }
        Ok(())
    }

    fn check_operand(
        &self,
        offset: usize,
        op: Op,
        types: &[Type],
        want: Type,
        position: usize,
        needed: usize,
    ) -> Result<(), ValidateError> {
        if types.len() < needed {
            return Err(self.error(format!(
                "at offset {offset}, {} instruction needs {needed} \
                 operand(s) on the stack",
                op.mnemonic()
            )));
        }
        let got = types[types.len() - position - 1];
        if got != want {
            return Err(self.error(format!(
                "at offset {offset}, {} instruction expects operand \
                 {position} to have type {want} but found {got}",
                op.mnemonic()
            )));
        }
        Ok(())
    }

    fn block_index(&self, begin: usize) -> Option<usize> {
        self.blocks
            .binary_search_by_key(&begin, |block| block.begin)
            .ok()
    }

    fn set_block_end(&mut self, begin: usize, end: usize) {
        if let Some(index) = self.block_index(begin) {
            self.blocks[index].end = end;
        }
    }

    fn note_depth(&mut self, types: &[Type]) {
        let depth: usize = types.iter().map(Type::stack_slot_size).sum();
        self.max_depth = self.max_depth.max(depth);
    }

    fn imm_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.insts[offset + 1], self.insts[offset + 2]])
    }

    fn imm_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.insts[offset + 1],
            self.insts[offset + 2],
            self.insts[offset + 3],
            self.insts[offset + 4],
        ])
    }

    fn imm_i32(&self, offset: usize) -> i32 {
        self.imm_u32(offset) as i32
    }

    fn error(&self, message: String) -> ValidateError {
        ValidateError::new(self.function, message)
    }
}
