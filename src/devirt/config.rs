//! Configuration for the devirtualization pipeline.
//!
//! Each stage has its own small configuration type; [`DevirtConfig`] aggregates them for
//! the [`Devirtualizer`](crate::devirt::Devirtualizer).

/// Configuration for the VM entry scanner.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Name of the section to scan (default: `.text`).
    ///
    /// `None` scans every section marked executable.
    pub code_section: Option<String>,

    /// Skip a single byte and continue when the scanner hits an undecodable instruction
    /// (default: `false`, which fails the scan).
    pub resync_on_invalid: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            code_section: Some(".text".to_string()),
            resync_on_invalid: false,
        }
    }
}

impl ScanConfig {
    /// Creates the default scan configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans the named section instead of `.text`.
    #[must_use]
    pub fn with_code_section(mut self, name: impl Into<String>) -> Self {
        self.code_section = Some(name.into());
        self
    }

    /// Scans every executable section.
    #[must_use]
    pub fn all_executable(mut self) -> Self {
        self.code_section = None;
        self
    }

    /// Enables or disables resynchronisation on undecodable bytes.
    #[must_use]
    pub fn with_resync(mut self, resync: bool) -> Self {
        self.resync_on_invalid = resync;
        self
    }
}

/// Configuration for the trampoline flattener.
#[derive(Debug, Clone)]
pub struct FlattenConfig {
    /// Maximum number of decoded instructions per flatten call (default: 100,000).
    pub max_steps: usize,
}

impl Default for FlattenConfig {
    fn default() -> Self {
        Self { max_steps: 100_000 }
    }
}

impl FlattenConfig {
    /// Sets the decode step limit.
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }
}

/// Configuration for the handler chain unroller.
#[derive(Debug, Clone)]
pub struct UnrollConfig {
    /// Maximum number of handlers followed from one entry (default: 10,000).
    pub max_handlers: usize,
}

impl Default for UnrollConfig {
    fn default() -> Self {
        Self {
            max_handlers: 10_000,
        }
    }
}

impl UnrollConfig {
    /// Sets the handler limit.
    #[must_use]
    pub fn with_max_handlers(mut self, max_handlers: usize) -> Self {
        self.max_handlers = max_handlers;
        self
    }
}

/// Configuration for the handler optimizer.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Drop the first `ja` and everything after it before optimizing (default: `true`).
    ///
    /// Handler sequences end in the dispatcher's bounds check; what follows is the dispatch
    /// tail, not handler semantics.
    pub truncate_dispatch_tail: bool,

    /// Retain any instruction whose memory operand is addressed through the stack pointer
    /// or the virtual stack pointer (default: `true`).
    pub protect_stack_addressing: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            truncate_dispatch_tail: true,
            protect_stack_addressing: true,
        }
    }
}

impl OptimizerConfig {
    /// Creates the default optimizer configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables dispatch-tail truncation.
    #[must_use]
    pub fn with_truncate_dispatch_tail(mut self, enabled: bool) -> Self {
        self.truncate_dispatch_tail = enabled;
        self
    }

    /// Enables or disables stack-addressing protection.
    #[must_use]
    pub fn with_protect_stack_addressing(mut self, enabled: bool) -> Self {
        self.protect_stack_addressing = enabled;
        self
    }

    /// Only the dead-code elimination stage: no truncation, no stack-addressing protection.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            truncate_dispatch_tail: false,
            protect_stack_addressing: false,
        }
    }
}

/// Aggregated configuration for the [`Devirtualizer`](crate::devirt::Devirtualizer).
#[derive(Debug, Clone, Default)]
pub struct DevirtConfig {
    /// Entry scanner settings.
    pub scan: ScanConfig,
    /// Flattener settings.
    pub flatten: FlattenConfig,
    /// Unroller settings.
    pub unroll: UnrollConfig,
    /// Optimizer settings.
    pub optimizer: OptimizerConfig,
}

impl DevirtConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
