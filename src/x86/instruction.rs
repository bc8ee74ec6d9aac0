//! Decoded instruction model.
//!
//! [`Insn`] wraps an iced-x86 [`Instruction`] together with everything the devirtualization
//! passes need to know about it without consulting the decoder again: typed operands with
//! access flags, the canonical registers it reads and writes, whether it writes memory, and
//! its control-flow class.

use std::{cell::RefCell, fmt};

use bitflags::bitflags;
use iced_x86::{
    Code, FlowControl, Formatter, Instruction, InstructionInfo, IntelFormatter, Mnemonic,
    OpAccess, OpKind, Register,
};

use crate::x86::register::{is_partial_write, RegisterId};

bitflags! {
    /// How an operand is accessed by its instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        /// The operand is (possibly conditionally) read
        const READ = 0x01;
        /// The operand is (possibly conditionally) written
        const WRITE = 0x02;
    }
}

impl Access {
    fn from_op_access(access: OpAccess) -> Access {
        match access {
            OpAccess::Read | OpAccess::CondRead => Access::READ,
            OpAccess::Write => Access::WRITE,
            // A conditional write may leave the previous value in place
            OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite => {
                Access::READ | Access::WRITE
            }
            OpAccess::None | OpAccess::NoMemAccess => Access::empty(),
        }
    }
}

/// A memory operand `segment:[base + index * scale + displacement]`.
///
/// For instruction-pointer relative operands `base` is `RIP`/`EIP` and `displacement` is the
/// encoded displacement relative to the next instruction, not the resolved address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryOperand {
    /// Base register or `Register::None`
    pub base: Register,
    /// Index register or `Register::None`
    pub index: Register,
    /// Index scale (1, 2, 4 or 8)
    pub scale: u32,
    /// Signed displacement
    pub displacement: i64,
    /// Effective segment register
    pub segment: Register,
    /// Accessed size in bytes (0 for `lea` and other non-accessing forms)
    pub size: usize,
}

impl MemoryOperand {
    /// Returns `true` if `register` takes part in the address computation.
    #[must_use]
    pub fn uses_register(&self, register: RegisterId) -> bool {
        !register.is_none()
            && (RegisterId::canonicalize(self.base) == register
                || RegisterId::canonicalize(self.index) == register)
    }

    /// Returns `true` for instruction-pointer relative operands.
    #[must_use]
    pub fn is_ip_relative(&self) -> bool {
        matches!(self.base, Register::RIP | Register::EIP)
    }
}

/// The typed value of an [`Operand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// A register operand
    Register(Register),
    /// A memory operand
    Memory(MemoryOperand),
    /// An immediate value, sign- or zero-extended to 64 bits as the instruction defines
    Immediate(u64),
    /// A resolved near branch target
    Branch(u64),
    /// Far branches and implicit string memory operands
    Other,
}

/// One explicit operand of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    /// Operand value
    pub kind: OperandKind,
    /// Read/write access performed by the instruction
    pub access: Access,
}

impl Operand {
    /// Returns the register for register operands.
    #[must_use]
    pub fn as_register(&self) -> Option<Register> {
        match self.kind {
            OperandKind::Register(register) => Some(register),
            _ => None,
        }
    }

    /// Returns the memory operand for memory operands.
    #[must_use]
    pub fn as_memory(&self) -> Option<&MemoryOperand> {
        match &self.kind {
            OperandKind::Memory(memory) => Some(memory),
            _ => None,
        }
    }

    /// Returns the value for immediate operands.
    #[must_use]
    pub fn as_immediate(&self) -> Option<u64> {
        match self.kind {
            OperandKind::Immediate(value) => Some(value),
            _ => None,
        }
    }
}

/// A decoded x86/x64 instruction with derived def-use information.
///
/// Identity for def-use purposes is the position of an `Insn` within an
/// [`InstructionSequence`](crate::x86::InstructionSequence), never its address: duplicated
/// sequences contain independent copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    raw: Instruction,
    operands: Vec<Operand>,
    reads: Vec<RegisterId>,
    writes: Vec<RegisterId>,
    writes_memory: bool,
}

impl Insn {
    /// Builds an `Insn` from an iced instruction and the info computed for it.
    #[must_use]
    pub fn new(raw: Instruction, info: &InstructionInfo) -> Insn {
        let operands = (0..raw.op_count())
            .map(|index| Operand {
                kind: convert_operand(&raw, index),
                access: Access::from_op_access(op_access(info, index)),
            })
            .collect();

        let mut reads = Vec::new();
        let mut writes = Vec::new();
        for used in info.used_registers() {
            let id = RegisterId::canonicalize(used.register());
            if id.is_none() {
                continue;
            }

            let access = Access::from_op_access(used.access());
            if access.contains(Access::READ) {
                reads.push(id);
            }
            if access.contains(Access::WRITE) {
                writes.push(id);
                if is_partial_write(used.register()) {
                    reads.push(id);
                }
            }
        }

        if raw.rflags_read() != 0 {
            reads.push(RegisterId::FLAGS);
        }
        if raw.rflags_modified() != 0 {
            writes.push(RegisterId::FLAGS);
        }

        reads.sort_unstable();
        reads.dedup();
        writes.sort_unstable();
        writes.dedup();

        let writes_memory = info
            .used_memory()
            .iter()
            .any(|memory| Access::from_op_access(memory.access()).contains(Access::WRITE));

        Insn {
            raw,
            operands,
            reads,
            writes,
            writes_memory,
        }
    }

    /// Returns the underlying iced instruction.
    #[must_use]
    pub fn raw(&self) -> &Instruction {
        &self.raw
    }

    /// Returns the address of the instruction.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.raw.ip()
    }

    /// Returns the encoded length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns `true` for a zero-length (invalid) instruction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.len() == 0
    }

    /// Returns the address of the following instruction.
    #[must_use]
    pub fn next_address(&self) -> u64 {
        self.raw.next_ip()
    }

    /// Returns the opcode identity.
    #[must_use]
    pub fn code(&self) -> Code {
        self.raw.code()
    }

    /// Returns the mnemonic.
    #[must_use]
    pub fn mnemonic(&self) -> Mnemonic {
        self.raw.mnemonic()
    }

    /// Returns the explicit operands in encoding order.
    #[must_use]
    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    /// Returns the canonical registers read, including implicit and address registers.
    #[must_use]
    pub fn reads(&self) -> &[RegisterId] {
        &self.reads
    }

    /// Returns the canonical registers written, including implicit ones.
    #[must_use]
    pub fn writes(&self) -> &[RegisterId] {
        &self.writes
    }

    /// Returns `true` if the instruction reads `register` through any alias.
    #[must_use]
    pub fn reads_register(&self, register: RegisterId) -> bool {
        self.reads.contains(&register)
    }

    /// Returns `true` if the instruction writes `register` through any alias.
    #[must_use]
    pub fn writes_register(&self, register: RegisterId) -> bool {
        self.writes.contains(&register)
    }

    /// Returns `true` if the instruction writes memory, explicitly or implicitly (`push`).
    #[must_use]
    pub fn writes_memory(&self) -> bool {
        self.writes_memory
    }

    /// Returns the first explicit memory operand.
    #[must_use]
    pub fn memory_operand(&self) -> Option<&MemoryOperand> {
        self.operands.iter().find_map(Operand::as_memory)
    }

    /// Returns the control-flow class of the instruction.
    #[must_use]
    pub fn flow_control(&self) -> FlowControl {
        self.raw.flow_control()
    }

    /// Returns the target of a branch or call with an immediate near target.
    #[must_use]
    pub fn direct_target(&self) -> Option<u64> {
        match self.raw.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Some(self.raw.near_branch_target())
            }
            _ => None,
        }
    }

    /// Returns the target if this is an unconditional `jmp`/`call` with an immediate target.
    ///
    /// These are the trampolines the flattener follows instead of recording.
    #[must_use]
    pub fn trampoline_target(&self) -> Option<u64> {
        match self.flow_control() {
            FlowControl::UnconditionalBranch | FlowControl::Call => self.direct_target(),
            _ => None,
        }
    }

    /// Returns `true` for returns and jumps/calls whose target is computed at runtime.
    #[must_use]
    pub fn is_indirect_exit(&self) -> bool {
        match self.flow_control() {
            FlowControl::IndirectBranch | FlowControl::IndirectCall | FlowControl::Return => true,
            // far jmp/call with an absolute pointer
            FlowControl::UnconditionalBranch | FlowControl::Call => self.direct_target().is_none(),
            _ => false,
        }
    }

    /// Returns `true` for any no-operation encoding (`nop`, `nop r/m`).
    #[must_use]
    pub fn is_nop(&self) -> bool {
        self.raw.mnemonic() == Mnemonic::Nop
    }
}

thread_local! {
    static FORMATTER: RefCell<(IntelFormatter, String)> =
        RefCell::new((IntelFormatter::new(), String::new()));
}

/// Renders Intel syntax through one formatter per thread.
impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        FORMATTER.with(|cell| {
            let mut guard = cell.borrow_mut();
            let (formatter, output) = &mut *guard;
            output.clear();
            formatter.format(&self.raw, output);
            f.write_str(output)
        })
    }
}

fn op_access(info: &InstructionInfo, index: u32) -> OpAccess {
    match index {
        0 => info.op0_access(),
        1 => info.op1_access(),
        2 => info.op2_access(),
        3 => info.op3_access(),
        4 => info.op4_access(),
        _ => OpAccess::None,
    }
}

fn convert_operand(instr: &Instruction, index: u32) -> OperandKind {
    match instr.op_kind(index) {
        OpKind::Register => OperandKind::Register(instr.op_register(index)),
        OpKind::Memory => OperandKind::Memory(convert_memory(instr)),
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            OperandKind::Branch(instr.near_branch_target())
        }
        OpKind::Immediate8
        | OpKind::Immediate8_2nd
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate64
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => OperandKind::Immediate(instr.immediate(index)),
        _ => OperandKind::Other,
    }
}

fn convert_memory(instr: &Instruction) -> MemoryOperand {
    let base = instr.memory_base();
    let index = instr.memory_index();
    let raw_displacement = instr.memory_displacement64();

    // iced resolves ip-relative operands to absolute addresses
    #[allow(clippy::cast_possible_wrap)]
    let displacement = if matches!(base, Register::RIP | Register::EIP) {
        raw_displacement.wrapping_sub(instr.next_ip()) as i64
    } else if base.is_gpr32() || index.is_gpr32() {
        i64::from(raw_displacement as u32 as i32)
    } else {
        raw_displacement as i64
    };

    MemoryOperand {
        base,
        index,
        scale: instr.memory_index_scale(),
        displacement,
        segment: instr.memory_segment(),
        size: instr.memory_size().size(),
    }
}

#[cfg(test)]
mod tests {
    use crate::x86::{Codec, IcedCodec, OperandKind, RegisterId};
    use iced_x86::{FlowControl, Mnemonic, Register};

    fn decode(bytes: &[u8]) -> super::Insn {
        let mut codec = IcedCodec::new(64).unwrap();
        codec.decode_one(bytes, 0x1000).unwrap()
    }

    #[test]
    fn mov_reg_reg() {
        // mov rcx, rax
        let insn = decode(&[0x48, 0x89, 0xC1]);

        assert_eq!(insn.mnemonic(), Mnemonic::Mov);
        assert_eq!(insn.len(), 3);
        assert_eq!(insn.reads(), &[RegisterId::canonicalize(Register::RAX)]);
        assert_eq!(insn.writes(), &[RegisterId::canonicalize(Register::RCX)]);
        assert!(!insn.writes_memory());
        assert_eq!(insn.operands()[0].as_register(), Some(Register::RCX));
        assert_eq!(insn.to_string(), "mov rcx,rax");
    }

    #[test]
    fn load_from_stack() {
        // mov rax, [rsp]
        let insn = decode(&[0x48, 0x8B, 0x04, 0x24]);

        assert!(insn.reads_register(RegisterId::stack_pointer()));
        assert!(insn.writes_register(RegisterId::canonicalize(Register::RAX)));
        let memory = insn.memory_operand().unwrap();
        assert_eq!(memory.base, Register::RSP);
        assert_eq!(memory.size, 8);
        assert!(memory.uses_register(RegisterId::stack_pointer()));
    }

    #[test]
    fn push_writes_memory_and_stack_pointer() {
        // push rax
        let insn = decode(&[0x50]);

        assert!(insn.writes_memory());
        assert!(insn.writes_register(RegisterId::stack_pointer()));
        assert!(insn.reads_register(RegisterId::canonicalize(Register::RAX)));
    }

    #[test]
    fn partial_write_reads_canonical_register() {
        // mov al, 1
        let insn = decode(&[0xB0, 0x01]);

        assert!(insn.writes_register(RegisterId::canonicalize(Register::RAX)));
        assert!(insn.reads_register(RegisterId::canonicalize(Register::RAX)));
    }

    #[test]
    fn flags_tracking() {
        // add rax, rbx
        let add = decode(&[0x48, 0x01, 0xD8]);
        assert!(add.writes_register(RegisterId::FLAGS));

        // pushfq
        let pushfq = decode(&[0x9C]);
        assert!(pushfq.reads_register(RegisterId::FLAGS));
    }

    #[test]
    fn rip_relative_displacement() {
        // lea rax, [rip - 7]
        let insn = decode(&[0x48, 0x8D, 0x05, 0xF9, 0xFF, 0xFF, 0xFF]);
        let memory = insn.memory_operand().unwrap();

        assert!(memory.is_ip_relative());
        assert_eq!(memory.displacement, -7);
        assert_eq!(memory.index, Register::None);
        assert_eq!(memory.scale, 1);
        assert!(!insn.writes_memory());
    }

    #[test]
    fn branch_classification() {
        // jmp rel32 +0x10
        let jmp = decode(&[0xE9, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(jmp.trampoline_target(), Some(0x1015));
        assert!(!jmp.is_indirect_exit());

        // call rel32 -0x5
        let call = decode(&[0xE8, 0xFB, 0xFF, 0xFF, 0xFF]);
        assert_eq!(call.trampoline_target(), Some(0x1000));

        // jmp rax
        let jmp_reg = decode(&[0xFF, 0xE0]);
        assert_eq!(jmp_reg.flow_control(), FlowControl::IndirectBranch);
        assert!(jmp_reg.is_indirect_exit());
        assert_eq!(jmp_reg.trampoline_target(), None);

        // ret
        assert!(decode(&[0xC3]).is_indirect_exit());

        // ja rel8 is not a trampoline
        let ja = decode(&[0x77, 0x02]);
        assert_eq!(ja.direct_target(), Some(0x1004));
        assert_eq!(ja.trampoline_target(), None);
        assert!(!ja.is_indirect_exit());
    }

    #[test]
    fn nop_forms() {
        assert!(decode(&[0x90]).is_nop());
        // nop dword ptr [rax+rax*1+0x0]
        assert!(decode(&[0x0F, 0x1F, 0x44, 0x00, 0x00]).is_nop());
        assert!(!decode(&[0xC3]).is_nop());
    }

    #[test]
    fn immediate_operand() {
        // xor rax, 0x1234
        let insn = decode(&[0x48, 0x35, 0x34, 0x12, 0x00, 0x00]);
        assert!(matches!(
            insn.operands()[1].kind,
            OperandKind::Immediate(0x1234)
        ));
    }
}
