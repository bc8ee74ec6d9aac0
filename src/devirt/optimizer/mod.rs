//! Handler instruction optimizer.
//!
//! Simplifies a flattened handler sequence in three strictly ordered stages:
//!
//! 1. **Dispatch-tail truncation** - the first `ja` (the dispatcher's bounds check) and
//!    everything after it are dropped
//! 2. **Encryption-block lowering** - resolved [`ConstantRange`]s become single immediate
//!    loads (see [`lower_constant_ranges`])
//! 3. **Dead-code elimination** - definitions nothing reads are removed (see
//!    [`eliminate_dead_code`])
//!
//! The optimizer never mutates its input; every call works on a duplicate.

mod defuse;
mod lowering;

pub use defuse::{eliminate_dead_code, has_side_effects, is_sink, DefUseGraph};
pub use lowering::lower_constant_ranges;

use iced_x86::Mnemonic;
use log::debug;

use crate::{
    devirt::{config::OptimizerConfig, vm::ConstantRange, vm::VmState},
    x86::{Codec, InstructionSequence},
    Result,
};

/// The handler optimizer.
///
/// # Examples
///
/// ```rust
/// use iced_x86::Register;
/// use vmscope::{
///     devirt::{Optimizer, VmState},
///     x86::{Codec, IcedCodec, InstructionSequence, RegisterId},
/// };
///
/// let mut codec = IcedCodec::new(64)?;
/// let mut sequence = InstructionSequence::new();
/// sequence.push(codec.decode_one(&[0x48, 0x89, 0xD8], 0x1000)?);       // mov rax, rbx
/// sequence.push(codec.decode_one(&[0x48, 0x89, 0x45, 0x00], 0x1003)?); // mov [rbp], rax
/// sequence.push(codec.decode_one(&[0x48, 0x89, 0xC1], 0x1007)?);       // mov rcx, rax
///
/// let state = VmState::new(RegisterId::from(Register::RBP), RegisterId::from(Register::RSI));
/// let optimized = Optimizer::default().optimize(&mut codec, &state, &[], &sequence)?;
/// assert_eq!(optimized.len(), 2);
/// # Ok::<(), vmscope::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct Optimizer {
    config: OptimizerConfig,
}

impl Optimizer {
    /// Creates an optimizer with the given configuration.
    #[must_use]
    pub fn new(config: OptimizerConfig) -> Self {
        Optimizer { config }
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Optimizes `sequence` and returns the result; the input is left untouched.
    ///
    /// `ranges` index `sequence` as given.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedRange`] for ranges that do not fit the (truncated)
    /// sequence and [`crate::Error::Encode`] if a lowered load cannot be encoded.
    pub fn optimize(
        &self,
        codec: &mut dyn Codec,
        state: &VmState,
        ranges: &[ConstantRange],
        sequence: &InstructionSequence,
    ) -> Result<InstructionSequence> {
        let mut output = sequence.duplicate();

        if self.config.truncate_dispatch_tail {
            if let Some(index) = output.find_next(0, Mnemonic::Ja) {
                output.truncate_before(index);
            }
        }

        let output = lower_constant_ranges(codec, ranges, output)?;
        let output = eliminate_dead_code(state, &self.config, output);

        debug!(
            "Optimized {} instructions down to {}",
            sequence.len(),
            output.len()
        );
        Ok(output)
    }
}
