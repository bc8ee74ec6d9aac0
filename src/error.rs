use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! decode_error {
    ($address:expr, $($arg:tt)*) => {
        crate::Error::Decode {
            address: $address,
            message: format!($($arg)*),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Image Errors
/// - [`Error::SectionNotFound`] - An address maps outside every section of the image
/// - [`Error::Malformed`] - Corrupted or invalid file structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond the image data
/// - [`Error::NotSupported`] - Unsupported file format or architecture
/// - [`Error::Empty`] - Empty input provided
/// - [`Error::FileError`] / [`Error::GoblinErr`] - I/O and PE parsing failures
///
/// ## Instruction Errors
/// - [`Error::Decode`] - A byte window does not decode to a valid instruction
/// - [`Error::Encode`] - A synthesized instruction could not be encoded
///
/// ## Pipeline Errors
/// - [`Error::MalformedRange`] - A constant range does not fit the sequence it targets
/// - [`Error::TrampolineCycle`] / [`Error::HandlerCycle`] / [`Error::StepLimit`] - Termination guards
/// - [`Error::Parser`] - Failure reported by an entry or handler parser
///
/// Errors raised while processing one VM entry are isolated to that entry by
/// [`crate::devirt::Devirtualizer::process`]; the remaining entries are still processed.
#[derive(Error, Debug)]
pub enum Error {
    /// The address is not contained in any section of the image.
    ///
    /// Fatal to the entry or handler being processed.
    #[error("RVA 0x{0:x} is not contained in any section")]
    SectionNotFound(u64),

    /// The bytes at `address` could not be decoded as a valid instruction.
    ///
    /// Raised for truncated windows and invalid opcodes. Fatal to the current
    /// flatten or scan operation.
    #[error("Failed to decode instruction at 0x{address:x} - {message}")]
    Decode {
        /// Address of the undecodable instruction
        address: u64,
        /// Reason reported by the decoder
        message: String,
    },

    /// A synthesized instruction could not be encoded.
    #[error("Failed to encode instruction at 0x{address:x} - {message}")]
    Encode {
        /// Address the instruction was being encoded for
        address: u64,
        /// Reason reported by the encoder
        message: String,
    },

    /// A constant-computation range references indices outside the sequence.
    ///
    /// The indices are reported after shifting by earlier replacements. This is a
    /// contract violation by the producer of the range and is never tolerated.
    #[error("Malformed constant range [{begin}, {end}) for a sequence of {len} instructions")]
    MalformedRange {
        /// Shifted start index (inclusive)
        begin: isize,
        /// Shifted end index (exclusive)
        end: isize,
        /// Length of the sequence at the time of the replacement
        len: usize,
    },

    /// The trampoline chain jumped back to an address it already followed.
    #[error("Trampoline cycle detected at 0x{0:x}")]
    TrampolineCycle(u64),

    /// The handler chain returned to a handler with an identical state.
    #[error("Handler chain revisited 0x{0:x} with an unchanged state")]
    HandlerCycle(u64),

    /// A bounded loop exhausted its step budget.
    #[error("Reached the maximum number of steps allowed - {0}")]
    StepLimit(usize),

    /// An entry or handler parser rejected its input.
    #[error("{0}")]
    Parser(String),

    /// The file is damaged and could not be parsed.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This file type or architecture is not supported.
    #[error("This file type is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the goblin crate during PE parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),
}
