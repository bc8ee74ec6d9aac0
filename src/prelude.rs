//! # vmscope Prelude
//!
//! Re-exports the types needed by most devirtualization runs.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all vmscope operations
pub use crate::Error;

/// The result type used throughout vmscope
pub use crate::Result;

// ================================================================================================
// Images
// ================================================================================================

/// Image abstraction and implementations
pub use crate::file::{Image, PeImage, RawImage, Section};

// ================================================================================================
// Instructions
// ================================================================================================

/// Instruction model and codec
pub use crate::x86::{Codec, IcedCodec, Insn, InstructionSequence, RegisterId};

// ================================================================================================
// Devirtualization
// ================================================================================================

/// Pipeline stages
pub use crate::devirt::{EntryScanner, Flattener, Optimizer, Unroller};

/// VM model and parser contracts
pub use crate::devirt::{
    ConstantRange, EntryParser, HandlerParameter, HandlerParser, VmHandler, VmState,
};

/// Configuration
pub use crate::devirt::{
    DevirtConfig, FlattenConfig, OptimizerConfig, ScanConfig, UnrollConfig,
};

/// Driver and tracing
pub use crate::devirt::{
    Devirtualizer, EntryReport, LogSink, ProcessSummary, TraceEvent, TraceLog, TraceSink,
};
