//! Canonical register identity.
//!
//! Def-use reasoning over x86 code has to treat `al`, `ah`, `ax`, `eax` and `rax` as the
//! same storage. [`RegisterId`] collapses every alias of a physical register into one
//! comparable key, and adds a synthetic [`RegisterId::FLAGS`] so that flag producers and
//! consumers take part in the same analysis.

use std::fmt;

use iced_x86::Register;

/// Canonical identity of a physical register.
///
/// Two operands that reference overlapping storage always canonicalize to the same
/// identity. [`RegisterId::NONE`] stands for an absent register and is never a dependency.
///
/// The only way to name a machine register is [`RegisterId::canonicalize`] (or `From`), so
/// a sub-register such as `ebp` can never stand in for `rbp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterId(Identity);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Identity {
    None,
    Flags,
    /// Always a full-width register
    Reg(Register),
}

impl RegisterId {
    /// No register (absent operand, unused memory base or index)
    pub const NONE: RegisterId = RegisterId(Identity::None);

    /// The flags register (`rflags`/`eflags`)
    pub const FLAGS: RegisterId = RegisterId(Identity::Flags);

    /// Canonicalizes `register` to its full-width identity.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use iced_x86::Register;
    /// use vmscope::x86::RegisterId;
    ///
    /// let rax = RegisterId::canonicalize(Register::AH);
    /// assert_eq!(rax, RegisterId::canonicalize(Register::EAX));
    /// assert_eq!(rax.register(), Some(Register::RAX));
    /// assert_eq!(RegisterId::canonicalize(Register::R9W).register(), Some(Register::R9));
    /// assert_eq!(RegisterId::canonicalize(Register::None), RegisterId::NONE);
    /// ```
    #[must_use]
    pub fn canonicalize(register: Register) -> RegisterId {
        match register {
            Register::None => RegisterId::NONE,
            other => RegisterId(Identity::Reg(other.full_register())),
        }
    }

    /// Returns `true` for [`RegisterId::NONE`].
    #[must_use]
    pub fn is_none(self) -> bool {
        self == RegisterId::NONE
    }

    /// Returns `true` for [`RegisterId::FLAGS`].
    #[must_use]
    pub fn is_flags(self) -> bool {
        self == RegisterId::FLAGS
    }

    /// Returns the full-width register, if this identity names one.
    #[must_use]
    pub fn register(self) -> Option<Register> {
        match self.0 {
            Identity::Reg(register) => Some(register),
            Identity::None | Identity::Flags => None,
        }
    }

    /// Returns the register to use as a destination for code of the given bitness.
    ///
    /// In 32-bit code the canonical 64-bit identity is narrowed to its 32-bit view.
    #[must_use]
    pub fn register_for(self, bitness: u32) -> Option<Register> {
        let register = self.register()?;
        if bitness == 64 {
            Some(register)
        } else {
            Some(register.full_register32())
        }
    }

    /// The canonical identity of the architectural stack pointer.
    #[must_use]
    pub fn stack_pointer() -> RegisterId {
        RegisterId(Identity::Reg(Register::RSP))
    }
}

impl From<Register> for RegisterId {
    fn from(register: Register) -> Self {
        RegisterId::canonicalize(register)
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Identity::None => write!(f, "none"),
            Identity::Flags => write!(f, "flags"),
            Identity::Reg(register) => write!(f, "{}", format!("{register:?}").to_lowercase()),
        }
    }
}

/// Returns `true` when a write to `register` leaves part of its canonical register intact.
///
/// 8- and 16-bit writes merge into the wider register. 32-bit writes in 64-bit code zero
/// the upper half and therefore fully define the canonical register.
#[must_use]
pub fn is_partial_write(register: Register) -> bool {
    (register.is_gpr8() || register.is_gpr16()) && register.size() < 4
}
