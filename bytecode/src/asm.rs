use crate::op::{Op, Sys, MAX_FUNCTION_SIZE};

/// Bytes per assembler fragment. Fragments avoid reallocation copies
/// while a function grows; `finish` concatenates them once.
const FRAGMENT_SIZE: usize = 4088;

struct Fragment {
    len: usize,
    bytes: [u8; FRAGMENT_SIZE],
}

impl Fragment {
    fn new() -> Box<Fragment> {
        Box::new(Fragment {
            len: 0,
            bytes: [0; FRAGMENT_SIZE],
        })
    }
}

/// Tracks an instruction offset for branches.
///
/// A bound label (after [`Assembler::bind`]) stores the absolute offset
/// it was bound at; later references emit negative displacements
/// directly. An unbound label stores the absolute offset of the
/// displacement immediate of its most recent use; the prior link is
/// stored in that immediate, forming a chain that `bind` walks and
/// rewrites to `label offset − instruction offset`.
#[derive(Debug, Default)]
pub struct Label {
    offset: i32,
    bound: bool,
}

impl Label {
    pub fn new() -> Label {
        Label::default()
    }

    pub fn bound(&self) -> bool {
        self.bound
    }
}

/// Assembles one function's instruction bytes.
///
/// One method per mnemonic; branches take a [`Label`]. The finished byte
/// blob is what a [`Function`] carries and what the verifier consumes.
pub struct Assembler {
    fragments: Vec<Box<Fragment>>,
    size: usize,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler {
            fragments: vec![Fragment::new()],
            size: 0,
        }
    }

    /// Current byte offset in the instruction stream.
    pub fn offset(&self) -> usize {
        self.size
    }

    /// Concatenate the fragments into the final instruction blob.
    pub fn finish(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size);
        for fragment in &self.fragments {
            bytes.extend_from_slice(&fragment.bytes[..fragment.len]);
        }
        bytes
    }

    /// Bind `label` to the current offset, resolving every earlier
    /// reference by walking the chain threaded through the immediates.
    pub fn bind(&mut self, label: &mut Label) {
        assert!(!label.bound, "label bound twice");
        let label_offset = self.size as i32;
        let mut use_offset = label.offset;
        while use_offset != 0 {
            let inst_offset = use_offset - 1;
            let next = self.read_i32_at(use_offset as usize);
            self.write_i32_at(use_offset as usize, label_offset - inst_offset);
            use_offset = next;
        }
        label.bound = true;
        label.offset = label_offset;
    }

    pub fn add(&mut self) {
        self.op(Op::Add);
    }

    pub fn and(&mut self) {
        self.op(Op::And);
    }

    pub fn asr(&mut self) {
        self.op(Op::Asr);
    }

    pub fn b(&mut self, label: &mut Label) {
        self.op_label(Op::B, label);
    }

    pub fn bif(&mut self, label: &mut Label) {
        self.op_label(Op::Bif, label);
    }

    pub fn call(&mut self, index: u32) {
        self.op1_32(Op::Call, index);
    }

    pub fn div(&mut self) {
        self.op(Op::Div);
    }

    pub fn eq(&mut self) {
        self.op(Op::Eq);
    }

    pub fn false_(&mut self) {
        self.op(Op::False);
    }

    pub fn ge(&mut self) {
        self.op(Op::Ge);
    }

    pub fn gt(&mut self) {
        self.op(Op::Gt);
    }

    pub fn int64(&mut self, value: i64) {
        self.op1_64(Op::Int64, value as u64);
    }

    pub fn le(&mut self) {
        self.op(Op::Le);
    }

    pub fn loadarg(&mut self, index: u16) {
        self.op1_16(Op::LoadArg, index);
    }

    pub fn loadlocal(&mut self, index: u16) {
        self.op1_16(Op::LoadLocal, index);
    }

    pub fn lt(&mut self) {
        self.op(Op::Lt);
    }

    pub fn mod_(&mut self) {
        self.op(Op::Mod);
    }

    pub fn mul(&mut self) {
        self.op(Op::Mul);
    }

    pub fn ne(&mut self) {
        self.op(Op::Ne);
    }

    pub fn neg(&mut self) {
        self.op(Op::Neg);
    }

    pub fn nop(&mut self) {
        self.op(Op::Nop);
    }

    pub fn not(&mut self) {
        self.op(Op::Not);
    }

    pub fn or(&mut self) {
        self.op(Op::Or);
    }

    pub fn ret(&mut self) {
        self.op(Op::Ret);
    }

    pub fn shl(&mut self) {
        self.op(Op::Shl);
    }

    pub fn shr(&mut self) {
        self.op(Op::Shr);
    }

    pub fn storearg(&mut self, index: u16) {
        self.op1_16(Op::StoreArg, index);
    }

    pub fn storelocal(&mut self, index: u16) {
        self.op1_16(Op::StoreLocal, index);
    }

    pub fn sub(&mut self) {
        self.op(Op::Sub);
    }

    pub fn sys(&mut self, sys: Sys) {
        self.op1_8(Op::Sys, sys as u8);
    }

    pub fn true_(&mut self) {
        self.op(Op::True);
    }

    pub fn unit(&mut self) {
        self.op(Op::Unit);
    }

    pub fn xor(&mut self) {
        self.op(Op::Xor);
    }

    // ── emit helpers ───────────────────────────────────────────────

    /// Reserve `n` contiguous bytes, starting a new fragment if the
    /// current one cannot hold a whole instruction.
    fn ensure_space(&mut self, n: usize) {
        assert!(
            self.size + n <= MAX_FUNCTION_SIZE,
            "maximum function size exceeded"
        );
        self.size += n;
        let last = self.fragments.last().map(|f| f.len).unwrap_or(0);
        if last + n > FRAGMENT_SIZE {
            self.fragments.push(Fragment::new());
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let fragment = self
            .fragments
            .last_mut()
            .unwrap_or_else(|| unreachable!("assembler has a fragment"));
        fragment.bytes[fragment.len..fragment.len + bytes.len()]
            .copy_from_slice(bytes);
        fragment.len += bytes.len();
    }

    fn op(&mut self, op: Op) {
        self.ensure_space(1);
        self.push(&[op as u8]);
    }

    fn op1_8(&mut self, op: Op, a: u8) {
        self.ensure_space(2);
        self.push(&[op as u8, a]);
    }

    fn op1_16(&mut self, op: Op, a: u16) {
        self.ensure_space(3);
        self.push(&[op as u8]);
        self.push(&a.to_le_bytes());
    }

    fn op1_32(&mut self, op: Op, a: u32) {
        self.ensure_space(5);
        self.push(&[op as u8]);
        self.push(&a.to_le_bytes());
    }

    fn op1_64(&mut self, op: Op, a: u64) {
        self.ensure_space(9);
        self.push(&[op as u8]);
        self.push(&a.to_le_bytes());
    }

    fn op_label(&mut self, op: Op, label: &mut Label) {
        let inst_offset = self.size as i32;
        self.ensure_space(5);
        self.push(&[op as u8]);
        if label.bound {
            // Bound: emit the displacement to the known offset.
            self.push(&(label.offset - inst_offset).to_le_bytes());
        } else {
            // Unbound: thread the previous use through the immediate and
            // remember the offset of this displacement, not the opcode.
            self.push(&label.offset.to_le_bytes());
            label.offset = inst_offset + 1;
        }
    }

    fn read_i32_at(&self, offset: usize) -> i32 {
        let (fragment, local) = self.locate(offset);
        let bytes = &self.fragments[fragment].bytes[local..local + 4];
        i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn write_i32_at(&mut self, offset: usize, value: i32) {
        let (fragment, local) = self.locate(offset);
        self.fragments[fragment].bytes[local..local + 4]
            .copy_from_slice(&value.to_le_bytes());
    }

    /// Map an absolute byte offset to (fragment index, offset within).
    /// Immediates never straddle fragments: `ensure_space` keeps whole
    /// instructions contiguous.
    fn locate(&self, offset: usize) -> (usize, usize) {
        debug_assert!(offset < self.size);
        let mut base = 0;
        for (index, fragment) in self.fragments.iter().enumerate() {
            if offset < base + fragment.len {
                return (index, offset - base);
            }
            base += fragment.len;
        }
        unreachable!("offset {offset} outside assembled bytes");
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straight_line_bytes() {
        let mut asm = Assembler::new();
        asm.int64(42);
        asm.int64(1);
        asm.add();
        asm.sys(Sys::Println);
        asm.ret();
        let bytes = asm.finish();
        let mut want = vec![Op::Int64 as u8];
        want.extend_from_slice(&42i64.to_le_bytes());
        want.push(Op::Int64 as u8);
        want.extend_from_slice(&1i64.to_le_bytes());
        want.push(Op::Add as u8);
        want.push(Op::Sys as u8);
        want.push(Sys::Println as u8);
        want.push(Op::Ret as u8);
        assert_eq!(bytes, want);
    }

    #[test]
    fn immediates_are_little_endian() {
        let mut asm = Assembler::new();
        asm.loadarg(0x0102);
        asm.call(0x0304_0506);
        let bytes = asm.finish();
        assert_eq!(bytes[1..3], [0x02, 0x01]);
        assert_eq!(bytes[4..8], [0x06, 0x05, 0x04, 0x03]);
    }

    #[test]
    fn forward_branch_resolves_on_bind() {
        let mut asm = Assembler::new();
        let mut label = Label::new();
        asm.b(&mut label); // offset 0
        asm.nop(); // offset 5
        asm.bind(&mut label); // offset 6
        asm.ret();
        assert!(label.bound());
        let bytes = asm.finish();
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), 6);
    }

    #[test]
    fn backward_branch_emits_negative_displacement() {
        let mut asm = Assembler::new();
        asm.int64(0); // offsets 0..9
        let mut top = Label::new();
        asm.bind(&mut top); // offset 9
        asm.nop(); // offset 9
        asm.b(&mut top); // offset 10, target 9
        let bytes = asm.finish();
        assert_eq!(i32::from_le_bytes(bytes[11..15].try_into().unwrap()), -1);
    }

    #[test]
    fn multiple_forward_references_share_one_label() {
        let mut asm = Assembler::new();
        let mut label = Label::new();
        asm.b(&mut label); // offset 0
        asm.b(&mut label); // offset 5
        asm.bif(&mut label); // offset 10
        asm.bind(&mut label); // offset 15
        asm.ret();
        let bytes = asm.finish();
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), 15);
        assert_eq!(i32::from_le_bytes(bytes[6..10].try_into().unwrap()), 10);
        assert_eq!(i32::from_le_bytes(bytes[11..15].try_into().unwrap()), 5);
    }

    #[test]
    fn fragments_concatenate_in_order() {
        let mut asm = Assembler::new();
        let count = 1000; // 9000 bytes, three fragments
        for i in 0..count {
            asm.int64(i as i64);
        }
        asm.ret();
        assert_eq!(asm.offset(), count * 9 + 1);
        let bytes = asm.finish();
        assert_eq!(bytes.len(), count * 9 + 1);
        for i in 0..count {
            assert_eq!(bytes[i * 9], Op::Int64 as u8);
            let imm =
                i64::from_le_bytes(bytes[i * 9 + 1..i * 9 + 9].try_into().unwrap());
            assert_eq!(imm, i as i64);
        }
        assert_eq!(bytes[count * 9], Op::Ret as u8);
    }

    #[test]
    fn labels_resolve_across_fragments() {
        let mut asm = Assembler::new();
        let mut label = Label::new();
        asm.b(&mut label); // offset 0, in the first fragment
        for _ in 0..600 {
            asm.int64(7); // pushes past the first fragment
        }
        asm.bind(&mut label);
        asm.ret();
        let target = 5 + 600 * 9;
        let bytes = asm.finish();
        assert_eq!(
            i32::from_le_bytes(bytes[1..5].try_into().unwrap()),
            target as i32
        );
        assert_eq!(bytes[target], Op::Ret as u8);
    }

    #[test]
    #[should_panic(expected = "label bound twice")]
    fn rebinding_a_label_panics() {
        let mut asm = Assembler::new();
        let mut label = Label::new();
        asm.bind(&mut label);
        asm.bind(&mut label);
    }
}
