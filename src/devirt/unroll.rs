//! Handler chain unrolling.
//!
//! Starting from the first handler of a VM entry, every handler is flattened, handed to the
//! [`HandlerParser`], optimized with the constant ranges the parser resolved, and reported.
//! The parser names the next handler; the chain ends when it reports none.
//!
//! Only a single successor per handler is followed. Handlers that branch to several
//! successors would need full control-flow reconstruction, which is out of scope here.

use log::debug;
use rustc_hash::FxHashSet;

use crate::{
    devirt::{
        config::UnrollConfig,
        flatten::Flattener,
        optimizer::Optimizer,
        trace::{HandlerTrace, TraceEvent, TraceSink},
        vm::{HandlerParser, VmState},
    },
    file::Image,
    x86::Codec,
    Error, Result,
};

/// Walks the handler chain of one VM entry.
pub struct Unroller<'a, I: Image + ?Sized> {
    flattener: Flattener<'a, I>,
    optimizer: Optimizer,
    config: UnrollConfig,
}

impl<'a, I: Image + ?Sized> Unroller<'a, I> {
    /// Creates an unroller from its stages.
    pub fn new(flattener: Flattener<'a, I>, optimizer: Optimizer, config: UnrollConfig) -> Self {
        Unroller {
            flattener,
            optimizer,
            config,
        }
    }

    /// Unrolls the chain starting at `first_handler`.
    ///
    /// Every handler is reported to `sink` as [`TraceEvent::HandlerUnrolled`] as soon as it
    /// is processed, and returned in chain order. `state` is threaded through the handler
    /// parser and holds the final state afterwards.
    ///
    /// # Errors
    ///
    /// - Any error from flattening, parsing or optimizing a handler
    /// - [`Error::HandlerCycle`] if a handler is reached twice with the same rolling key
    /// - [`Error::StepLimit`] if the chain is longer than [`UnrollConfig::max_handlers`]
    pub fn unroll(
        &self,
        codec: &mut dyn Codec,
        parser: &mut dyn HandlerParser,
        state: &mut VmState,
        first_handler: u64,
        sink: &mut dyn TraceSink,
    ) -> Result<Vec<HandlerTrace>> {
        let mut handlers = Vec::new();
        let mut visited = FxHashSet::default();
        let mut address = first_handler;

        loop {
            if handlers.len() >= self.config.max_handlers {
                return Err(Error::StepLimit(self.config.max_handlers));
            }
            if !visited.insert((address, state.rolling_key)) {
                return Err(Error::HandlerCycle(address));
            }

            let sequence = self.flattener.flatten_at(codec, address)?;
            let handler = parser.parse(address, state, &sequence)?;
            let optimized =
                self.optimizer
                    .optimize(codec, state, &handler.constant_ranges, &sequence)?;

            debug!(
                "Handler 0x{address:x}: {} -> {} instructions",
                sequence.len(),
                optimized.len()
            );

            let trace = HandlerTrace {
                address,
                successor: handler.successor,
                parameters: handler.parameters,
                original_len: sequence.len(),
                optimized,
            };
            sink.record(&TraceEvent::HandlerUnrolled(trace.clone()));
            handlers.push(trace);

            match handler.successor {
                Some(successor) => address = successor,
                None => break,
            }
        }

        Ok(handlers)
    }
}
