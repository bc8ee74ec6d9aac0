//! Def-use based dead code elimination.
//!
//! # Algorithm
//!
//! 1. Classify every instruction as retained (sink or side effect) or as a candidate
//! 2. Build a def-use graph over instruction positions: each register read links to the
//!    most recent definition of its canonical register (last definition wins)
//! 3. Scan the remaining candidates from the most recent one backwards and remove the
//!    first without users, detaching its own uses
//! 4. Repeat step 3 until no candidate can be removed
//!
//! Removing a definition can only ever remove users from earlier definitions, so the
//! backward scan reaches a fixed point in at most one removal per candidate.
//!
//! # Retained instructions
//!
//! - Sinks whose effects are invisible to register tracking: the `cbw`/`cwd` conversion
//!   family, `lahf`, `cmp`, `test`, `pushf*` and the `lea reg, [rip-7]` self-reference
//! - Anything writing memory
//! - Conditional branches and other control transfers left in the sequence
//! - Anything writing the stack pointer or the virtual stack pointer
//! - With [`OptimizerConfig::protect_stack_addressing`], anything addressing memory through
//!   the stack pointer or the virtual stack pointer

use iced_x86::{FlowControl, Mnemonic};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    devirt::{config::OptimizerConfig, vm::VmState},
    x86::{Insn, InstructionSequence, OperandKind, RegisterId},
};

/// Displacement of the `lea reg, [rip-7]` self-reference emitted by the VM.
const SELF_REFERENCE_DISPLACEMENT: i64 = -7;

/// Use edges between instruction positions of one sequence.
#[derive(Debug, Clone, Default)]
pub struct DefUseGraph {
    /// `uses[i]`: definitions instruction `i` reads from
    uses: Vec<FxHashSet<usize>>,
    /// `users[d]`: instructions reading definition `d`
    users: Vec<FxHashSet<usize>>,
}

impl DefUseGraph {
    /// Builds the graph for `sequence` with last-definition-wins reaching definitions.
    #[must_use]
    pub fn build(sequence: &InstructionSequence) -> Self {
        let mut graph = DefUseGraph {
            uses: vec![FxHashSet::default(); sequence.len()],
            users: vec![FxHashSet::default(); sequence.len()],
        };
        let mut last_definition: FxHashMap<RegisterId, usize> = FxHashMap::default();

        for (index, insn) in sequence.iter().enumerate() {
            for register in insn.reads() {
                if let Some(&definition) = last_definition.get(register) {
                    graph.uses[index].insert(definition);
                    graph.users[definition].insert(index);
                }
            }

            for register in insn.writes() {
                last_definition.insert(*register, index);
            }
        }

        graph
    }

    /// Returns `true` if some instruction reads a value defined at `index`.
    #[must_use]
    pub fn has_users(&self, index: usize) -> bool {
        self.users.get(index).is_some_and(|users| !users.is_empty())
    }

    /// Returns the instructions reading a value defined at `index`, sorted ascending.
    #[must_use]
    pub fn users(&self, index: usize) -> Vec<usize> {
        let mut users: Vec<usize> = self
            .users
            .get(index)
            .map(|users| users.iter().copied().collect())
            .unwrap_or_default();
        users.sort_unstable();
        users
    }

    /// Returns the definitions instruction `index` reads from, sorted ascending.
    #[must_use]
    pub fn uses(&self, index: usize) -> Vec<usize> {
        let mut uses: Vec<usize> = self
            .uses
            .get(index)
            .map(|uses| uses.iter().copied().collect())
            .unwrap_or_default();
        uses.sort_unstable();
        uses
    }

    /// Removes every use edge originating at `index`.
    pub fn detach(&mut self, index: usize) {
        let Some(uses) = self.uses.get_mut(index) else {
            return;
        };

        for definition in uses.drain() {
            self.users[definition].remove(&index);
        }
    }
}

/// Returns `true` for instructions kept regardless of their users.
#[must_use]
pub fn is_sink(insn: &Insn) -> bool {
    matches!(
        insn.mnemonic(),
        Mnemonic::Cbw
            | Mnemonic::Cwde
            | Mnemonic::Cdqe
            | Mnemonic::Cwd
            | Mnemonic::Cdq
            | Mnemonic::Cqo
            | Mnemonic::Lahf
            | Mnemonic::Cmp
            | Mnemonic::Test
            | Mnemonic::Pushf
            | Mnemonic::Pushfd
            | Mnemonic::Pushfq
    ) || is_self_reference(insn)
}

/// Returns `true` for `lea reg, [rip-7]`.
fn is_self_reference(insn: &Insn) -> bool {
    if insn.mnemonic() != Mnemonic::Lea {
        return false;
    }

    let [destination, source] = insn.operands() else {
        return false;
    };

    matches!(destination.kind, OperandKind::Register(_))
        && source.as_memory().is_some_and(|memory| {
            memory.is_ip_relative()
                && memory.displacement == SELF_REFERENCE_DISPLACEMENT
                && memory.index == iced_x86::Register::None
                && memory.scale == 1
        })
}

/// Returns `true` if removing `insn` could change state beyond its register results.
#[must_use]
pub fn has_side_effects(insn: &Insn, protected: &[RegisterId], config: &OptimizerConfig) -> bool {
    if insn.writes_memory() || insn.flow_control() != FlowControl::Next {
        return true;
    }

    if insn
        .writes()
        .iter()
        .any(|register| protected.contains(register))
    {
        return true;
    }

    config.protect_stack_addressing
        && insn
            .operands()
            .iter()
            .filter_map(|operand| operand.as_memory())
            .any(|memory| {
                protected
                    .iter()
                    .any(|&register| memory.uses_register(register))
            })
}

/// Removes instructions whose results are never read.
///
/// Returns the surviving instructions in their original order.
#[must_use]
pub fn eliminate_dead_code(
    state: &VmState,
    config: &OptimizerConfig,
    sequence: InstructionSequence,
) -> InstructionSequence {
    let protected = [RegisterId::stack_pointer(), state.vsp];
    let mut graph = DefUseGraph::build(&sequence);

    let mut candidates: Vec<usize> = sequence
        .iter()
        .enumerate()
        .filter(|(_, insn)| !is_sink(insn) && !has_side_effects(insn, &protected, config))
        .map(|(index, _)| index)
        .collect();

    let mut removed = vec![false; sequence.len()];
    while let Some(position) = candidates
        .iter()
        .rposition(|&index| !graph.has_users(index))
    {
        let index = candidates.remove(position);
        graph.detach(index);
        removed[index] = true;
    }

    let keep: Vec<usize> = (0..sequence.len()).filter(|&index| !removed[index]).collect();
    let mut sequence = sequence;
    sequence.retain_indices(&keep);
    sequence
}
