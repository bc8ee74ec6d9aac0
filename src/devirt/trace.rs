//! Structured trace of a devirtualization run.
//!
//! The analysis code never prints. It reports what it finds to a [`TraceSink`], and the
//! caller decides whether to collect ([`TraceLog`]), forward to the `log` facade
//! ([`LogSink`]) or drop ([`NullSink`]) the events.
//!
//! # Example
//!
//! ```rust
//! use vmscope::devirt::{TraceEvent, TraceEventKind, TraceLog, TraceSink};
//!
//! let mut log = TraceLog::new();
//! log.record(&TraceEvent::EntryStarted { entry: 0x1000 });
//! log.record(&TraceEvent::EntryCompleted { entry: 0x1000, handlers: 0 });
//!
//! assert_eq!(log.count(TraceEventKind::EntryStarted), 1);
//! println!("{}", log.summary());
//! ```

use std::fmt;

use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::{
    devirt::{scanner::EntryReference, vm::HandlerParameter},
    x86::InstructionSequence,
};

/// Categories of trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum TraceEventKind {
    /// A VM entry was found by the scanner.
    EntryFound,
    /// Processing of a VM entry started.
    EntryStarted,
    /// One handler of a chain was flattened, parsed and optimized.
    HandlerUnrolled,
    /// A VM entry was fully unrolled.
    EntryCompleted,
    /// Processing of a VM entry failed.
    EntryFailed,
}

impl TraceEventKind {
    /// Returns a human-readable description of this event kind.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::EntryFound => "entries found",
            Self::EntryStarted => "entries started",
            Self::HandlerUnrolled => "handlers unrolled",
            Self::EntryCompleted => "entries completed",
            Self::EntryFailed => "entries failed",
        }
    }
}

/// Result of unrolling one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerTrace {
    /// RVA of the handler
    pub address: u64,
    /// RVA of the next handler, `None` for the last handler of the chain
    pub successor: Option<u64>,
    /// Parameters decoded by the handler parser
    pub parameters: Vec<HandlerParameter>,
    /// Length of the flattened handler before optimization
    pub original_len: usize,
    /// The optimized handler
    pub optimized: InstructionSequence,
}

impl fmt::Display for HandlerTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unroll 0x{:x}, next: ", self.address)?;
        match self.successor {
            Some(successor) => writeln!(f, "0x{successor:x}")?,
            None => writeln!(f, "-")?,
        }
        for parameter in &self.parameters {
            writeln!(f, "  {parameter}")?;
        }
        write!(f, "{}", self.optimized)
    }
}

/// A single trace event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// A direct jump into a VM entry stub.
    EntryFound(EntryReference),
    /// Processing of the entry at `entry` started.
    EntryStarted {
        /// RVA of the VM entry
        entry: u64,
    },
    /// A handler was unrolled.
    HandlerUnrolled(HandlerTrace),
    /// The entry was fully unrolled.
    EntryCompleted {
        /// RVA of the VM entry
        entry: u64,
        /// Number of handlers in the chain
        handlers: usize,
    },
    /// Processing of the entry failed; other entries are unaffected.
    EntryFailed {
        /// RVA of the VM entry
        entry: u64,
        /// Rendered error
        error: String,
    },
}

impl TraceEvent {
    /// Returns the category of this event.
    #[must_use]
    pub fn kind(&self) -> TraceEventKind {
        match self {
            TraceEvent::EntryFound(_) => TraceEventKind::EntryFound,
            TraceEvent::EntryStarted { .. } => TraceEventKind::EntryStarted,
            TraceEvent::HandlerUnrolled(_) => TraceEventKind::HandlerUnrolled,
            TraceEvent::EntryCompleted { .. } => TraceEventKind::EntryCompleted,
            TraceEvent::EntryFailed { .. } => TraceEventKind::EntryFailed,
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::EntryFound(reference) => write!(
                f,
                "Found VMEntry at 0x{:x} (jmp at 0x{:x})",
                reference.entry, reference.site
            ),
            TraceEvent::EntryStarted { entry } => write!(f, "Processing VMEntry at 0x{entry:x}"),
            TraceEvent::HandlerUnrolled(handler) => {
                write!(f, "Unroll 0x{:x}, next: ", handler.address)?;
                match handler.successor {
                    Some(successor) => write!(f, "0x{successor:x}"),
                    None => write!(f, "-"),
                }
            }
            TraceEvent::EntryCompleted { entry, handlers } => {
                write!(f, "VMEntry 0x{entry:x} unrolled ({handlers} handlers)")
            }
            TraceEvent::EntryFailed { entry, error } => {
                write!(f, "VMEntry 0x{entry:x} failed - {error}")
            }
        }
    }
}

/// Receiver of trace events.
pub trait TraceSink {
    /// Records one event.
    fn record(&mut self, event: &TraceEvent);
}

/// Sink discarding every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TraceSink for NullSink {
    fn record(&mut self, _event: &TraceEvent) {}
}

/// Sink forwarding events to the `log` facade.
///
/// Failures are logged at `warn`, handler details at `debug`, everything else at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl TraceSink for LogSink {
    fn record(&mut self, event: &TraceEvent) {
        match event {
            TraceEvent::EntryFailed { .. } => log::warn!("{event}"),
            TraceEvent::HandlerUnrolled(handler) => {
                log::debug!("{event}");
                for parameter in &handler.parameters {
                    log::debug!("  {parameter}");
                }
            }
            _ => log::info!("{event}"),
        }
    }
}

/// Sink collecting events in memory.
#[derive(Debug, Clone, Default)]
pub struct TraceLog {
    events: Vec<TraceEvent>,
}

impl TraceLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded events in order.
    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Returns the number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns the number of events of the given kind.
    #[must_use]
    pub fn count(&self, kind: TraceEventKind) -> usize {
        self.events.iter().filter(|event| event.kind() == kind).count()
    }

    /// Returns every unrolled handler in order.
    pub fn handlers(&self) -> impl Iterator<Item = &HandlerTrace> {
        self.events.iter().filter_map(|event| match event {
            TraceEvent::HandlerUnrolled(handler) => Some(handler),
            _ => None,
        })
    }

    /// Returns a one-line summary such as `2 entries found, 14 handlers unrolled`.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut counts = [0_usize; TraceEventKind::COUNT];
        for event in &self.events {
            counts[event.kind() as usize] += 1;
        }

        let parts: Vec<String> = TraceEventKind::iter()
            .filter(|kind| counts[*kind as usize] > 0)
            .map(|kind| format!("{} {}", counts[kind as usize], kind.description()))
            .collect();

        if parts.is_empty() {
            "no events".to_string()
        } else {
            parts.join(", ")
        }
    }
}

impl TraceSink for TraceLog {
    fn record(&mut self, event: &TraceEvent) {
        self.events.push(event.clone());
    }
}

impl<T: TraceSink + ?Sized> TraceSink for &mut T {
    fn record(&mut self, event: &TraceEvent) {
        (**self).record(event);
    }
}
