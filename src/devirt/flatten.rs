//! Trampoline flattening.
//!
//! Protected code is cut into tiny fragments chained together by unconditional `jmp` and
//! `call` instructions. The [`Flattener`] follows those trampolines while decoding and emits
//! only the instructions that actually compute something, producing one linear
//! [`InstructionSequence`] per entry or handler.

use log::debug;
use rustc_hash::FxHashSet;

use crate::{
    devirt::config::FlattenConfig,
    file::Image,
    x86::{Codec, InstructionSequence, MAX_INSTRUCTION_LENGTH},
    Error, Result,
};

/// Decodes code reachable from an address while following direct trampolines.
///
/// The output never contains unconditional `jmp`/`call` instructions, returns or no-ops.
/// Flattening stops at the first jump, call or return whose target is computed at runtime,
/// or when the fetched bytes leave the section the walk started in.
///
/// # Examples
///
/// ```rust
/// use vmscope::{devirt::{FlattenConfig, Flattener}, file::RawImage, x86::IcedCodec};
///
/// let image = RawImage::from_flat(
///     vec![
///         0xEB, 0x01,             // jmp 0x1003
///         0xCC,                   // int3
///         0x48, 0x89, 0xD8,       // mov rax, rbx
///         0x90,                   // nop
///         0xFF, 0xE0,             // jmp rax
///     ],
///     0x1000,
///     64,
/// );
/// let mut codec = IcedCodec::new(64)?;
/// let sequence = Flattener::new(&image, FlattenConfig::default()).flatten_at(&mut codec, 0x1000)?;
///
/// assert_eq!(sequence.len(), 1);
/// assert_eq!(sequence[0].address(), 0x1003);
/// # Ok::<(), vmscope::Error>(())
/// ```
pub struct Flattener<'a, I: Image + ?Sized> {
    image: &'a I,
    config: FlattenConfig,
}

impl<'a, I: Image + ?Sized> Flattener<'a, I> {
    /// Creates a flattener reading from `image`.
    pub fn new(image: &'a I, config: FlattenConfig) -> Self {
        Flattener { image, config }
    }

    /// Returns the image this flattener reads from.
    pub fn image(&self) -> &'a I {
        self.image
    }

    /// Flattens the code at `start`, labelling instructions with their own addresses.
    ///
    /// # Errors
    ///
    /// See [`Flattener::flatten`].
    pub fn flatten_at(&self, codec: &mut dyn Codec, start: u64) -> Result<InstructionSequence> {
        self.flatten(codec, start, start)
    }

    /// Flattens the code whose bytes start at `start`.
    ///
    /// Decoded instructions are labelled starting from `initial_ip` until the first
    /// trampoline is followed; from then on bytes and labels come from the same address.
    /// This allows decoding a relocated copy of a fragment with its original addresses:
    /// the walk is bounded by the section holding the fetched bytes, and `initial_ip`
    /// may lie anywhere.
    ///
    /// # Errors
    ///
    /// - [`Error::SectionNotFound`] if `start` is outside every section
    /// - [`Error::Decode`] if bytes are missing, truncated or invalid
    /// - [`Error::TrampolineCycle`] if a trampoline target repeats
    /// - [`Error::StepLimit`] if more than [`FlattenConfig::max_steps`] instructions are decoded
    pub fn flatten(
        &self,
        codec: &mut dyn Codec,
        start: u64,
        initial_ip: u64,
    ) -> Result<InstructionSequence> {
        let section = self.image.section_containing(start)?;

        let mut sequence = InstructionSequence::new();
        let mut visited = FxHashSet::default();
        let mut fetch = start;
        let mut ip = initial_ip;
        let mut steps = 0_usize;

        while section.contains(fetch) {
            steps += 1;
            if steps > self.config.max_steps {
                return Err(Error::StepLimit(self.config.max_steps));
            }

            let window = section.window(fetch, MAX_INSTRUCTION_LENGTH);
            let insn = codec.decode_one(window, ip)?;

            if let Some(target) = insn.trampoline_target() {
                if !visited.insert(target) {
                    return Err(Error::TrampolineCycle(target));
                }

                fetch = target;
                ip = target;
                continue;
            }

            if insn.is_indirect_exit() {
                debug!("Flatten of 0x{start:x} ends at 0x{ip:x} ({insn})");
                break;
            }

            let length = insn.len() as u64;
            if !insn.is_nop() {
                sequence.push(insn);
            }

            fetch += length;
            ip += length;
        }

        Ok(sequence)
    }
}
