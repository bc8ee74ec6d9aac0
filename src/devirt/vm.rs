//! Virtual machine model and the parser contracts.
//!
//! The pipeline is agnostic of how a particular protector version encodes its entry stub
//! and handlers. That knowledge lives behind [`EntryParser`] and [`HandlerParser`]; the
//! core only consumes what they extract: the [`VmState`] registers, the handler successor
//! chain, and the [`ConstantRange`]s that the optimizer collapses.

use std::fmt;

use crate::{
    file::Image,
    x86::{InstructionSequence, RegisterId},
    Result,
};

/// Register assignment and decryption state of one virtual machine instance.
///
/// Created by the [`EntryParser`] from a VM entry stub and threaded through every handler
/// of the chain. Handler parsers may advance `rolling_key` and `vip_rva`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmState {
    /// Register holding the virtual stack pointer
    pub vsp: RegisterId,
    /// Register holding the virtual instruction pointer
    pub vip: RegisterId,
    /// Current rolling decryption key
    pub rolling_key: u64,
    /// RVA the virtual instruction pointer refers to
    pub vip_rva: u64,
}

impl VmState {
    /// Creates a state with the given register assignment and zeroed key and VIP.
    #[must_use]
    pub fn new(vsp: RegisterId, vip: RegisterId) -> Self {
        VmState {
            vsp,
            vip,
            rolling_key: 0,
            vip_rva: 0,
        }
    }

    /// Sets the rolling key.
    #[must_use]
    pub fn with_rolling_key(mut self, rolling_key: u64) -> Self {
        self.rolling_key = rolling_key;
        self
    }

    /// Sets the virtual instruction pointer RVA.
    #[must_use]
    pub fn with_vip_rva(mut self, vip_rva: u64) -> Self {
        self.vip_rva = vip_rva;
        self
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vsp={} vip={} key=0x{:x} vip_rva=0x{:x}",
            self.vsp, self.vip, self.rolling_key, self.vip_rva
        )
    }
}

/// A named value a handler parser decoded for one handler (operand, immediate, offset).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerParameter {
    /// Parameter name, e.g. `"imm"`
    pub name: String,
    /// Decoded value
    pub value: u64,
}

impl HandlerParameter {
    /// Creates a parameter.
    #[must_use]
    pub fn new(name: impl Into<String>, value: u64) -> Self {
        HandlerParameter {
            name: name.into(),
            value,
        }
    }
}

impl fmt::Display for HandlerParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: 0x{:x}", self.name, self.value)
    }
}

/// A contiguous instruction range that computes one constant into one register.
///
/// `begin` and `end` index the flattened handler sequence the parser was given, `end`
/// exclusive. The optimizer replaces the whole range by a single `mov register, value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstantRange {
    /// First instruction of the range
    pub begin: usize,
    /// One past the last instruction of the range
    pub end: usize,
    /// Register receiving the constant
    pub register: RegisterId,
    /// Resolved constant value
    pub value: u64,
}

impl ConstantRange {
    /// Creates a range.
    #[must_use]
    pub fn new(begin: usize, end: usize, register: RegisterId, value: u64) -> Self {
        ConstantRange {
            begin,
            end,
            register,
            value,
        }
    }

    /// Returns the number of instructions covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.begin)
    }

    /// Returns `true` if the range covers no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }
}

/// One parsed VM handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandler {
    /// RVA of the handler
    pub address: u64,
    /// RVA of the next handler, `None` when the chain ends here
    pub successor: Option<u64>,
    /// Parameters decoded from the handler
    pub parameters: Vec<HandlerParameter>,
    /// Constant computations resolved by the parser
    pub constant_ranges: Vec<ConstantRange>,
}

impl VmHandler {
    /// Creates a terminal handler without parameters.
    #[must_use]
    pub fn new(address: u64) -> Self {
        VmHandler {
            address,
            successor: None,
            parameters: Vec::new(),
            constant_ranges: Vec::new(),
        }
    }

    /// Sets the successor handler.
    #[must_use]
    pub fn with_successor(mut self, successor: u64) -> Self {
        self.successor = Some(successor);
        self
    }

    /// Appends a decoded parameter.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: u64) -> Self {
        self.parameters.push(HandlerParameter::new(name, value));
        self
    }

    /// Appends a resolved constant range.
    #[must_use]
    pub fn with_constant_range(mut self, range: ConstantRange) -> Self {
        self.constant_ranges.push(range);
        self
    }

    /// Returns `true` if the chain ends with this handler.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.successor.is_none()
    }
}

/// Extracts the initial VM state from a flattened VM entry stub.
pub trait EntryParser {
    /// Parses the flattened entry `sequence` and returns the VM state together with the
    /// RVA of the first handler.
    ///
    /// # Errors
    ///
    /// Implementations return [`crate::Error::Parser`] when the stub does not match the
    /// expected layout.
    fn parse(&mut self, image: &dyn Image, sequence: &InstructionSequence)
        -> Result<(VmState, u64)>;
}

/// Extracts one [`VmHandler`] from a flattened handler sequence.
pub trait HandlerParser {
    /// Parses the handler at `address`.
    ///
    /// `state` is mutable so the parser can advance the rolling key and the virtual
    /// instruction pointer as the handler would.
    ///
    /// # Errors
    ///
    /// Implementations return [`crate::Error::Parser`] when the handler is not recognised.
    fn parse(
        &mut self,
        address: u64,
        state: &mut VmState,
        sequence: &InstructionSequence,
    ) -> Result<VmHandler>;
}
