//! Devirtualization driver.
//!
//! [`Devirtualizer`] ties the stages together for one image: it scans for VM entries,
//! parses each entry stub and unrolls the handler chain behind it. A failure while
//! processing one entry is reported and skipped; the remaining entries are still
//! processed. [`process_parallel`] distributes entries over the rayon thread pool with one
//! codec and one parser set per worker.

use log::{info, warn};
use rayon::prelude::*;
use rustc_hash::FxHashSet;

use crate::{
    devirt::{
        config::DevirtConfig,
        flatten::Flattener,
        optimizer::Optimizer,
        scanner::{EntryReference, EntryScanner},
        trace::{HandlerTrace, LogSink, TraceEvent, TraceSink},
        unroll::Unroller,
        vm::{EntryParser, HandlerParser, VmState},
    },
    file::Image,
    x86::{Codec, IcedCodec, InstructionSequence},
    Error, Result,
};

/// Outcome of processing one VM entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryReport {
    /// RVA of the VM entry stub
    pub entry: u64,
    /// Flattened length of the entry stub
    pub entry_len: usize,
    /// State extracted by the entry parser
    pub initial_state: VmState,
    /// State after the last handler
    pub final_state: VmState,
    /// RVA of the first handler
    pub first_handler: u64,
    /// Handlers in chain order
    pub handlers: Vec<HandlerTrace>,
}

/// A VM entry that could not be processed.
#[derive(Debug)]
pub struct EntryFailure {
    /// RVA of the VM entry stub
    pub entry: u64,
    /// Why processing stopped
    pub error: Error,
}

/// Outcome of processing every entry of an image.
#[derive(Debug, Default)]
pub struct ProcessSummary {
    /// Successfully processed entries in scan order
    pub reports: Vec<EntryReport>,
    /// Failed entries in scan order
    pub failures: Vec<EntryFailure>,
}

impl ProcessSummary {
    /// Returns the total number of handlers unrolled over all entries.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.reports.iter().map(|report| report.handlers.len()).sum()
    }

    /// Returns `true` if no entry failed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn push(&mut self, entry: u64, result: Result<EntryReport>, sink: &mut dyn TraceSink) {
        match result {
            Ok(report) => self.reports.push(report),
            Err(error) => {
                warn!("Skipping VM entry 0x{entry:x} - {error}");
                sink.record(&TraceEvent::EntryFailed {
                    entry,
                    error: error.to_string(),
                });
                self.failures.push(EntryFailure { entry, error });
            }
        }
    }
}

/// Drives the full pipeline over one image.
///
/// # Examples
///
/// ```rust,no_run
/// use vmscope::prelude::*;
/// # struct MyEntryParser;
/// # impl EntryParser for MyEntryParser {
/// #     fn parse(&mut self, _: &dyn Image, _: &InstructionSequence) -> vmscope::Result<(VmState, u64)> { unimplemented!() }
/// # }
/// # struct MyHandlerParser;
/// # impl HandlerParser for MyHandlerParser {
/// #     fn parse(&mut self, _: u64, _: &mut VmState, _: &InstructionSequence) -> vmscope::Result<VmHandler> { unimplemented!() }
/// # }
///
/// let image = PeImage::from_file(std::path::Path::new("protected.vmp.exe"))?;
/// let mut devirt = Devirtualizer::with_iced(&image, MyEntryParser, MyHandlerParser)?;
///
/// let mut log = TraceLog::new();
/// let summary = devirt.process(&mut log)?;
/// println!("{} ({} failed)", log.summary(), summary.failures.len());
/// # Ok::<(), vmscope::Error>(())
/// ```
pub struct Devirtualizer<'a> {
    image: &'a dyn Image,
    codec: Box<dyn Codec + 'a>,
    entry_parser: Box<dyn EntryParser + 'a>,
    handler_parser: Box<dyn HandlerParser + 'a>,
    config: DevirtConfig,
}

impl<'a> Devirtualizer<'a> {
    /// Creates a devirtualizer with the default configuration.
    pub fn new(
        image: &'a dyn Image,
        codec: impl Codec + 'a,
        entry_parser: impl EntryParser + 'a,
        handler_parser: impl HandlerParser + 'a,
    ) -> Self {
        Devirtualizer {
            image,
            codec: Box::new(codec),
            entry_parser: Box::new(entry_parser),
            handler_parser: Box::new(handler_parser),
            config: DevirtConfig::default(),
        }
    }

    /// Creates a devirtualizer decoding with an [`IcedCodec`] of the image's bitness.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] if the image is neither 32- nor 64-bit.
    pub fn with_iced(
        image: &'a dyn Image,
        entry_parser: impl EntryParser + 'a,
        handler_parser: impl HandlerParser + 'a,
    ) -> Result<Self> {
        let codec = IcedCodec::new(image.bitness())?;
        Ok(Self::new(image, codec, entry_parser, handler_parser))
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: DevirtConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &DevirtConfig {
        &self.config
    }

    /// Returns the image being processed.
    #[must_use]
    pub fn image(&self) -> &'a dyn Image {
        self.image
    }

    /// Returns the RVAs of all VM entries, in scan order.
    ///
    /// # Errors
    ///
    /// See [`EntryScanner::find_entries`].
    pub fn find_entries(&mut self) -> Result<Vec<u64>> {
        EntryScanner::new(self.config.scan.clone()).find_entries(self.image, self.codec.as_mut())
    }

    /// Returns every jump into a VM entry, reporting each as [`TraceEvent::EntryFound`].
    ///
    /// # Errors
    ///
    /// See [`EntryScanner::find_entries`].
    pub fn find_references(&mut self, sink: &mut dyn TraceSink) -> Result<Vec<EntryReference>> {
        let references = EntryScanner::new(self.config.scan.clone())
            .find_references(self.image, self.codec.as_mut())?;
        for reference in &references {
            sink.record(&TraceEvent::EntryFound(*reference));
        }
        Ok(references)
    }

    /// Flattens the code at `rva`.
    ///
    /// # Errors
    ///
    /// See [`Flattener::flatten`].
    pub fn flatten(&mut self, rva: u64) -> Result<InstructionSequence> {
        self.flattener().flatten_at(self.codec.as_mut(), rva)
    }

    fn flattener(&self) -> Flattener<'a, dyn Image + 'a> {
        Flattener::new(self.image, self.config.flatten.clone())
    }

    /// Parses the entry stub at `entry` and unrolls its handler chain.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by the flattener, a parser, the optimizer or the
    /// unroller's termination guards.
    pub fn process_entry(&mut self, entry: u64, sink: &mut dyn TraceSink) -> Result<EntryReport> {
        sink.record(&TraceEvent::EntryStarted { entry });

        let flattener = self.flattener();
        let sequence = flattener.flatten_at(self.codec.as_mut(), entry)?;
        let (initial_state, first_handler) = self.entry_parser.parse(self.image, &sequence)?;
        info!("VM entry 0x{entry:x}: {initial_state}, first handler 0x{first_handler:x}");

        let unroller = Unroller::new(
            flattener,
            Optimizer::new(self.config.optimizer.clone()),
            self.config.unroll.clone(),
        );
        let mut state = initial_state;
        let handlers = unroller.unroll(
            self.codec.as_mut(),
            self.handler_parser.as_mut(),
            &mut state,
            first_handler,
            sink,
        )?;

        sink.record(&TraceEvent::EntryCompleted {
            entry,
            handlers: handlers.len(),
        });

        Ok(EntryReport {
            entry,
            entry_len: sequence.len(),
            initial_state,
            final_state: state,
            first_handler,
            handlers,
        })
    }

    /// Processes the given entries, isolating failures to the entry that raised them.
    pub fn process_entries(&mut self, entries: &[u64], sink: &mut dyn TraceSink) -> ProcessSummary {
        let mut summary = ProcessSummary::default();
        for &entry in entries {
            let result = self.process_entry(entry, sink);
            summary.push(entry, result, sink);
        }
        summary
    }

    /// Scans the image and processes every distinct VM entry.
    ///
    /// # Errors
    ///
    /// Only a failing scan is an error; failing entries are recorded in the summary.
    pub fn process(&mut self, sink: &mut dyn TraceSink) -> Result<ProcessSummary> {
        let references = self.find_references(sink)?;
        let entries = distinct_entries(&references);

        Ok(self.process_entries(&entries, sink))
    }
}

/// Returns the distinct entry RVAs of `references` in first-seen order.
#[must_use]
pub fn distinct_entries(references: &[EntryReference]) -> Vec<u64> {
    let mut seen = FxHashSet::default();
    references
        .iter()
        .map(|reference| reference.entry)
        .filter(|entry| seen.insert(*entry))
        .collect()
}

/// Processes `entries` on the rayon thread pool.
///
/// `factory` builds one [`Devirtualizer`] per worker split; codecs and parsers are never
/// shared between threads. Events are forwarded to the `log` facade. Reports and failures
/// keep the order of `entries`.
pub fn process_parallel<'a, F>(entries: &[u64], factory: F) -> ProcessSummary
where
    F: Fn() -> Devirtualizer<'a> + Sync + Send,
{
    let results: Vec<(u64, Result<EntryReport>)> = entries
        .par_iter()
        .map_init(&factory, |worker, &entry| {
            (entry, worker.process_entry(entry, &mut LogSink))
        })
        .collect();

    let mut summary = ProcessSummary::default();
    for (entry, result) in results {
        summary.push(entry, result, &mut LogSink);
    }
    summary
}
