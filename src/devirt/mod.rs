//! VM devirtualization pipeline.
//!
//! This module recovers the native semantics hidden behind a code-virtualizing protector.
//! Protected functions are replaced by a jump into a VM entry stub; the VM then executes a
//! chain of handlers, each of which is buried under trampolines, junk computation and
//! encrypted constants.
//!
//! # Pipeline
//!
//! ```text
//! EntryScanner ──► Flattener ──► EntryParser ──► Unroller
//!                                                 │  per handler:
//!                                                 │  Flattener ─► HandlerParser ─► Optimizer
//!                                                 ▼
//!                                            TraceSink
//! ```
//!
//! # Key Components
//!
//! - [`EntryScanner`] / [`is_vm_entry`] - Finds `jmp`s into `push imm32; call rel32` stubs
//! - [`Flattener`] - Follows trampolines and produces linear [`InstructionSequence`](crate::x86::InstructionSequence)s
//! - [`EntryParser`] / [`HandlerParser`] - Protector-specific extraction, supplied by the caller
//! - [`Unroller`] - Walks the handler chain of one entry
//! - [`Optimizer`] - Dispatch-tail truncation, constant lowering and dead-code elimination
//! - [`TraceSink`] - Structured event output
//! - [`Devirtualizer`] - Ties everything together for one image
//!
//! # Scope
//!
//! The unroller follows exactly one successor per handler. Handlers that can continue at
//! several successors are not reconstructed into a control-flow graph.

mod config;
mod engine;
mod flatten;
mod optimizer;
mod scanner;
mod trace;
mod unroll;
mod vm;

pub use config::{DevirtConfig, FlattenConfig, OptimizerConfig, ScanConfig, UnrollConfig};
pub use engine::{
    distinct_entries, process_parallel, Devirtualizer, EntryFailure, EntryReport, ProcessSummary,
};
pub use flatten::Flattener;
pub use optimizer::{
    eliminate_dead_code, has_side_effects, is_sink, lower_constant_ranges, DefUseGraph, Optimizer,
};
pub use scanner::{
    is_vm_entry, EntryReference, EntryScanner, ENTRY_CALL_OFFSET, ENTRY_CALL_OPCODE,
    ENTRY_PUSH_OPCODE,
};
pub use trace::{
    HandlerTrace, LogSink, NullSink, TraceEvent, TraceEventKind, TraceLog, TraceSink,
};
pub use unroll::Unroller;
pub use vm::{ConstantRange, EntryParser, HandlerParameter, HandlerParser, VmHandler, VmState};
