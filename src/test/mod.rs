//! Shared helpers for unit tests.
//!
//! Code snippets are hand-assembled; every helper producing bytes documents the encoding
//! it emits so tests stay readable.

use iced_x86::Register;
use rustc_hash::FxHashMap;

use crate::{
    devirt::{EntryParser, HandlerParser, VmHandler, VmState},
    file::{Image, RawImage},
    x86::{Codec, IcedCodec, InstructionSequence, RegisterId},
    Error, Result,
};

/// Filler for gaps between snippets (`int3`).
pub const FILL: u8 = 0xCC;

/// Assembles byte snippets at fixed RVAs into a single executable section.
pub struct CodeBuilder {
    name: String,
    base: u64,
    code: Vec<u8>,
}

impl CodeBuilder {
    /// A `.text` section starting at `base`.
    pub fn new(base: u64) -> Self {
        Self::named(".text", base)
    }

    /// A section called `name` starting at `base`.
    pub fn named(name: &str, base: u64) -> Self {
        CodeBuilder {
            name: name.to_string(),
            base,
            code: Vec::new(),
        }
    }

    /// Places `bytes` at `rva`, padding any gap with `int3`.
    pub fn at(mut self, rva: u64, bytes: &[u8]) -> Self {
        let offset = usize::try_from(rva - self.base).unwrap();
        let end = offset + bytes.len();
        if self.code.len() < end {
            self.code.resize(end, FILL);
        }
        self.code[offset..end].copy_from_slice(bytes);
        self
    }

    /// Builds a 64-bit image holding only this section.
    pub fn build(self) -> RawImage {
        self.append_to(RawImage::new(64))
    }

    /// Appends this section to an existing image.
    pub fn append_to(self, image: RawImage) -> RawImage {
        image.with_section(&self.name, self.base, self.code)
    }
}

/// `jmp rel32` located at `from` targeting `to`.
pub fn jmp_rel32(from: u64, to: u64) -> [u8; 5] {
    rel32(0xE9, from, to)
}

/// `call rel32` located at `from` targeting `to`.
pub fn call_rel32(from: u64, to: u64) -> [u8; 5] {
    rel32(0xE8, from, to)
}

fn rel32(opcode: u8, from: u64, to: u64) -> [u8; 5] {
    let displacement = (to.wrapping_sub(from + 5) as i64) as i32;
    let bytes = displacement.to_le_bytes();
    [opcode, bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// A VM entry stub at `at`: `push imm32; call rel32 target`.
pub fn entry_stub(at: u64, imm: u32, call_target: u64) -> Vec<u8> {
    let mut stub = vec![0x68];
    stub.extend_from_slice(&imm.to_le_bytes());
    stub.extend_from_slice(&call_rel32(at + 5, call_target));
    stub
}

/// Decodes `bytes` linearly at `base` as 64-bit code.
pub fn decode_all(bytes: &[u8], base: u64) -> InstructionSequence {
    let mut codec = IcedCodec::new(64).unwrap();
    let mut sequence = InstructionSequence::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let insn = codec
            .decode_one(&bytes[offset..], base + offset as u64)
            .unwrap();
        offset += insn.len();
        sequence.push(insn);
    }
    sequence
}

/// Canonical identity of `register`.
pub fn reg(register: Register) -> RegisterId {
    RegisterId::canonicalize(register)
}

/// The state used throughout the tests: `vsp = rbp`, `vip = rsi`.
pub fn test_state() -> VmState {
    VmState::new(reg(Register::RBP), reg(Register::RSI))
}

/// Entry parser returning a fixed state and first handler.
pub struct ScriptedEntryParser {
    pub state: VmState,
    pub first_handler: u64,
    /// Length of every sequence the parser was given
    pub seen: Vec<usize>,
}

impl ScriptedEntryParser {
    pub fn new(state: VmState, first_handler: u64) -> Self {
        ScriptedEntryParser {
            state,
            first_handler,
            seen: Vec::new(),
        }
    }
}

impl EntryParser for ScriptedEntryParser {
    fn parse(
        &mut self,
        _image: &dyn Image,
        sequence: &InstructionSequence,
    ) -> Result<(VmState, u64)> {
        self.seen.push(sequence.len());
        Ok((self.state, self.first_handler))
    }
}

/// Handler parser answering from a table of known handlers.
///
/// Advances the rolling key by `key_step` for every parsed handler.
#[derive(Default)]
pub struct ScriptedHandlerParser {
    handlers: FxHashMap<u64, VmHandler>,
    pub key_step: u64,
    /// `(address, sequence length)` for every parse call
    pub seen: Vec<(u64, usize)>,
}

impl ScriptedHandlerParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: VmHandler) -> Self {
        self.handlers.insert(handler.address, handler);
        self
    }

    pub fn with_key_step(mut self, key_step: u64) -> Self {
        self.key_step = key_step;
        self
    }
}

impl HandlerParser for ScriptedHandlerParser {
    fn parse(
        &mut self,
        address: u64,
        state: &mut VmState,
        sequence: &InstructionSequence,
    ) -> Result<VmHandler> {
        self.seen.push((address, sequence.len()));
        state.rolling_key = state.rolling_key.wrapping_add(self.key_step);
        self.handlers
            .get(&address)
            .cloned()
            .ok_or_else(|| Error::Parser(format!("Unknown handler at 0x{address:x}")))
    }
}
