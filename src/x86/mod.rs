//! x86/x64 instruction layer.
//!
//! Everything the devirtualization passes know about machine code goes through this
//! module: canonical register identities, the decoded instruction model with its def-use
//! sets, the codec service and the ordered instruction container.
//!
//! # Key Components
//!
//! - [`RegisterId`] - Alias-insensitive register identity (`al` == `eax` == `rax`)
//! - [`Insn`] - Decoded instruction with typed operands and read/write sets
//! - [`Codec`] / [`IcedCodec`] - Decoding, `mov reg, imm` encoding and formatting
//! - [`InstructionSequence`] - Ordered, duplicable instruction list
//!
//! # Examples
//!
//! ```rust
//! use iced_x86::Register;
//! use vmscope::x86::{Codec, IcedCodec, RegisterId};
//!
//! let mut codec = IcedCodec::new(64)?;
//! // mov al, 1
//! let insn = codec.decode_one(&[0xB0, 0x01], 0x1000)?;
//! assert!(insn.writes_register(RegisterId::canonicalize(Register::RAX)));
//! # Ok::<(), vmscope::Error>(())
//! ```

mod codec;
mod instruction;
mod register;
mod sequence;

pub use codec::{Codec, IcedCodec, MAX_INSTRUCTION_LENGTH};
pub use instruction::{Access, Insn, MemoryOperand, Operand, OperandKind};
pub use register::{is_partial_write, RegisterId};
pub use sequence::InstructionSequence;
