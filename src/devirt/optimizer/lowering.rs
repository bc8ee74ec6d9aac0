//! Encryption block lowering.
//!
//! Handlers decrypt their operands with long chains of arithmetic on constants. Once a
//! handler parser has resolved such a chain to its result, the whole range is replaced by
//! a single `mov register, value`.

use crate::{
    devirt::vm::ConstantRange,
    x86::{Codec, InstructionSequence},
    Error, Result,
};

/// Replaces every constant range in `sequence` by one immediate load.
///
/// Ranges index the sequence as given. They are applied in ascending order of `begin`, and
/// every later range is shifted by the length change of the replacements before it. The
/// load is encoded at the address of the last instruction of the range it replaces.
///
/// # Errors
///
/// - [`Error::MalformedRange`] if a shifted range is empty, overlaps its predecessor or
///   extends past the sequence
/// - [`Error::Encode`] if the load cannot be encoded
pub fn lower_constant_ranges(
    codec: &mut dyn Codec,
    ranges: &[ConstantRange],
    mut sequence: InstructionSequence,
) -> Result<InstructionSequence> {
    if ranges.is_empty() {
        return Ok(sequence);
    }

    let mut ordered: Vec<&ConstantRange> = ranges.iter().collect();
    ordered.sort_by_key(|range| (range.begin, range.end));

    let mut delta: isize = 0;
    let mut previous_end = 0_usize;
    for range in ordered {
        let begin = shifted(range.begin, delta);
        let end = shifted(range.end, delta);
        let malformed = Error::MalformedRange {
            begin,
            end,
            len: sequence.len(),
        };

        if range.is_empty() || range.begin < previous_end {
            return Err(malformed);
        }
        let (Ok(begin), Ok(end)) = (usize::try_from(begin), usize::try_from(end)) else {
            return Err(malformed);
        };
        if end > sequence.len() {
            return Err(malformed);
        }

        let address = sequence[end - 1].address();
        let load = codec.encode_load_immediate(range.register, range.value, address)?;

        delta += sequence.replace_range(begin, end, vec![load])?;
        previous_end = range.end;
    }

    Ok(sequence)
}

fn shifted(index: usize, delta: isize) -> isize {
    isize::try_from(index).map_or(isize::MAX, |index| index.saturating_add(delta))
}
