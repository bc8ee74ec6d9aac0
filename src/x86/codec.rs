//! Instruction decoding and encoding service.
//!
//! Components never reach for a global decoder. They receive a [`Codec`] explicitly, which
//! keeps decoding deterministic under test and lets every worker thread own its own
//! instance. [`IcedCodec`] is the production implementation backed by iced-x86.

use iced_x86::{
    Code, Decoder, DecoderError, DecoderOptions, Encoder, Instruction, InstructionInfoFactory,
    Register,
};

use crate::{
    x86::{Insn, RegisterId},
    Error, Result,
};

/// Longest possible x86 instruction encoding in bytes.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Decoder/encoder service used by the flattener and the optimizer.
///
/// Methods take `&mut self` so implementations can reuse internal buffers. A codec is
/// never shared between threads; create one per worker instead.
pub trait Codec {
    /// Returns the code bitness (32 or 64) this codec decodes and encodes for.
    fn bitness(&self) -> u32;

    /// Decodes the first instruction in `bytes`, labelling it with address `ip`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if `bytes` is empty, truncated or starts with an invalid
    /// encoding.
    fn decode_one(&mut self, bytes: &[u8], ip: u64) -> Result<Insn>;

    /// Encodes `mov register, value` at address `ip` and returns it decoded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encode`] if `register` is not a loadable register or the value
    /// cannot be encoded.
    fn encode_load_immediate(&mut self, register: RegisterId, value: u64, ip: u64)
        -> Result<Insn>;
}

/// [`Codec`] backed by the iced-x86 decoder and encoder.
///
/// # Examples
///
/// ```rust
/// use vmscope::x86::{Codec, IcedCodec};
///
/// let mut codec = IcedCodec::new(64)?;
/// // mov rax, rbx
/// let insn = codec.decode_one(&[0x48, 0x89, 0xD8], 0x1000)?;
/// assert_eq!(insn.to_string(), "mov rax,rbx");
/// # Ok::<(), vmscope::Error>(())
/// ```
pub struct IcedCodec {
    bitness: u32,
    info_factory: InstructionInfoFactory,
}

impl IcedCodec {
    /// Creates a codec for 32- or 64-bit code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] for any other bitness.
    pub fn new(bitness: u32) -> Result<Self> {
        if bitness != 32 && bitness != 64 {
            return Err(Error::NotSupported);
        }

        Ok(IcedCodec {
            bitness,
            info_factory: InstructionInfoFactory::new(),
        })
    }

    fn load_instruction(&self, register: Register, value: u64, ip: u64) -> Result<Instruction> {
        let encode_error = |error: iced_x86::IcedError| Error::Encode {
            address: ip,
            message: error.to_string(),
        };

        // mov r32, imm32 zero-extends into the full register
        if self.bitness == 32 || value <= u64::from(u32::MAX) {
            #[allow(clippy::cast_possible_truncation)]
            let imm = value as u32;
            Instruction::with2(Code::Mov_r32_imm32, register.full_register32(), imm)
                .map_err(encode_error)
        } else {
            Instruction::with2(Code::Mov_r64_imm64, register, value).map_err(encode_error)
        }
    }
}

impl Codec for IcedCodec {
    fn bitness(&self) -> u32 {
        self.bitness
    }

    fn decode_one(&mut self, bytes: &[u8], ip: u64) -> Result<Insn> {
        if bytes.is_empty() {
            return Err(decode_error!(ip, "No bytes available"));
        }

        let mut decoder = Decoder::with_ip(self.bitness, bytes, ip, DecoderOptions::NONE);
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(match decoder.last_error() {
                DecoderError::NoMoreBytes => decode_error!(ip, "Truncated instruction"),
                _ => decode_error!(ip, "Invalid instruction"),
            });
        }

        let info = self.info_factory.info(&instruction);
        Ok(Insn::new(instruction, info))
    }

    fn encode_load_immediate(
        &mut self,
        register: RegisterId,
        value: u64,
        ip: u64,
    ) -> Result<Insn> {
        let Some(destination) = register.register_for(self.bitness) else {
            return Err(Error::Encode {
                address: ip,
                message: format!("Cannot load an immediate into {register}"),
            });
        };
        if !destination.is_gpr() {
            return Err(Error::Encode {
                address: ip,
                message: format!("Cannot load an immediate into {register}"),
            });
        }

        let instruction = self.load_instruction(destination, value, ip)?;

        let mut encoder = Encoder::new(self.bitness);
        encoder
            .encode(&instruction, ip)
            .map_err(|error| Error::Encode {
                address: ip,
                message: error.to_string(),
            })?;
        let bytes = encoder.take_buffer();

        self.decode_one(&bytes, ip)
    }
}
