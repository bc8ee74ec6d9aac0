//! Ordered instruction container.

use std::{fmt, ops::Index};

use iced_x86::Mnemonic;

use crate::{x86::Insn, Error, Result};

/// An ordered list of decoded instructions describing one linear execution path.
///
/// Sequences produced by the flattener never contain unconditional jumps, calls, returns or
/// no-ops. All operations preserve the relative order of the instructions they do not
/// touch.
///
/// # Examples
///
/// ```rust
/// use iced_x86::Mnemonic;
/// use vmscope::x86::{Codec, IcedCodec, InstructionSequence};
///
/// let mut codec = IcedCodec::new(64)?;
/// let mut sequence = InstructionSequence::new();
/// sequence.push(codec.decode_one(&[0x48, 0x89, 0xD8], 0x1000)?); // mov rax, rbx
/// sequence.push(codec.decode_one(&[0x77, 0x00], 0x1003)?);       // ja
///
/// assert_eq!(sequence.find_next(0, Mnemonic::Ja), Some(1));
/// sequence.truncate_before(1);
/// assert_eq!(sequence.len(), 1);
/// # Ok::<(), vmscope::Error>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionSequence {
    instructions: Vec<Insn>,
}

impl InstructionSequence {
    /// Creates an empty sequence.
    #[must_use]
    pub fn new() -> Self {
        InstructionSequence {
            instructions: Vec::new(),
        }
    }

    /// Returns an independent deep copy; mutating either side never affects the other.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Appends an instruction.
    pub fn push(&mut self, insn: Insn) {
        self.instructions.push(insn);
    }

    /// Returns the number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns `true` if the sequence holds no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Returns the instruction at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Insn> {
        self.instructions.get(index)
    }

    /// Returns an iterator over the instructions in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Insn> {
        self.instructions.iter()
    }

    /// Returns the instructions as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[Insn] {
        &self.instructions
    }

    /// Discards the instruction at `index` and everything after it.
    ///
    /// Indices at or past the end leave the sequence unchanged.
    pub fn truncate_before(&mut self, index: usize) {
        self.instructions.truncate(index);
    }

    /// Returns the index of the first instruction at or after `from` with `mnemonic`.
    #[must_use]
    pub fn find_next(&self, from: usize, mnemonic: Mnemonic) -> Option<usize> {
        self.instructions
            .get(from..)?
            .iter()
            .position(|insn| insn.mnemonic() == mnemonic)
            .map(|offset| from + offset)
    }

    /// Replaces the instructions in `[begin, end)` with `replacement`.
    ///
    /// Returns the change in length, `replacement.len() - (end - begin)`, which callers use
    /// to shift indices that refer to positions after the replaced range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedRange`] if `begin > end` or `end > len()`.
    pub fn replace_range(
        &mut self,
        begin: usize,
        end: usize,
        replacement: Vec<Insn>,
    ) -> Result<isize> {
        if begin > end || end > self.instructions.len() {
            return Err(Error::MalformedRange {
                begin: isize::try_from(begin).unwrap_or(isize::MAX),
                end: isize::try_from(end).unwrap_or(isize::MAX),
                len: self.instructions.len(),
            });
        }

        let removed = end - begin;
        let added = replacement.len();
        self.instructions.splice(begin..end, replacement);

        #[allow(clippy::cast_possible_wrap)]
        Ok(added as isize - removed as isize)
    }

    /// Keeps only the instructions whose index is in `keep`, which must be sorted ascending.
    pub fn retain_indices(&mut self, keep: &[usize]) {
        let mut wanted = keep.iter().copied().peekable();
        let mut index = 0;
        self.instructions.retain(|_| {
            let retained = wanted.next_if_eq(&index).is_some();
            index += 1;
            retained
        });
    }

    /// Consumes the sequence and returns its instructions.
    #[must_use]
    pub fn into_vec(self) -> Vec<Insn> {
        self.instructions
    }
}

impl From<Vec<Insn>> for InstructionSequence {
    fn from(instructions: Vec<Insn>) -> Self {
        InstructionSequence { instructions }
    }
}

impl FromIterator<Insn> for InstructionSequence {
    fn from_iter<T: IntoIterator<Item = Insn>>(iter: T) -> Self {
        InstructionSequence {
            instructions: iter.into_iter().collect(),
        }
    }
}

impl Index<usize> for InstructionSequence {
    type Output = Insn;

    fn index(&self, index: usize) -> &Self::Output {
        &self.instructions[index]
    }
}

impl<'a> IntoIterator for &'a InstructionSequence {
    type Item = &'a Insn;
    type IntoIter = std::slice::Iter<'a, Insn>;

    fn into_iter(self) -> Self::IntoIter {
        self.instructions.iter()
    }
}

impl fmt::Display for InstructionSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, insn) in self.instructions.iter().enumerate() {
            writeln!(f, "[{index:04}] 0x{:08x} {insn}", insn.address())?;
        }
        Ok(())
    }
}
