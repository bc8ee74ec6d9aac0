// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
//#![deny(unsafe_code)]
// - 'file/physical.rs' uses mmap to map a file into memory

//! # vmscope
//!
//! A devirtualization toolkit for x86/x64 executables protected by a code-virtualizing
//! obfuscator. Protected functions are replaced by a jump into a VM entry stub; the
//! virtual machine behind it runs a chain of handlers, each hidden under trampolines,
//! junk computation and encrypted constants. `vmscope` finds those entries, flattens the
//! trampoline-obfuscated code, walks the handler chain and reduces every handler to the
//! instructions that matter.
//!
//! ## Features
//!
//! - **PE loading** - PE32/PE32+ via goblin, memory-mapped or from a buffer; flat code dumps
//! - **Entry discovery** - Linear sweep for `jmp`s into `push imm32; call rel32` stubs
//! - **Trampoline flattening** - Follows chained `jmp`/`call` fragments with cycle guards
//! - **Handler unrolling** - Walks the successor chain with pluggable entry/handler parsers
//! - **Optimization** - Dispatch-tail truncation, constant lowering, alias-aware dead-code elimination
//! - **Structured tracing** - Events instead of console output, forwarded to `log` on demand
//! - **Parallel processing** - Entries distributed over rayon with per-worker codecs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vmscope::prelude::*;
//! use std::path::Path;
//!
//! let image = PeImage::from_file(Path::new("protected.vmp.exe"))?;
//! let mut codec = IcedCodec::new(image.bitness())?;
//!
//! for entry in EntryScanner::default().find_entries(&image, &mut codec)? {
//!     let sequence = Flattener::new(&image, FlattenConfig::default()).flatten_at(&mut codec, entry)?;
//!     println!("VM entry 0x{entry:x}\n{sequence}");
//! }
//! # Ok::<(), vmscope::Error>(())
//! ```
//!
//! Unrolling handler chains needs protector-specific knowledge: implement
//! [`devirt::EntryParser`] and [`devirt::HandlerParser`] and hand them to a
//! [`devirt::Devirtualizer`].
//!
//! ## Architecture
//!
//! - [`file`] - [`file::Image`] trait, PE and raw images
//! - [`x86`] - Register identities, decoded instructions, codec, instruction sequences
//! - [`devirt`] - Scanner, flattener, unroller, optimizer, trace and driver
//! - [`prelude`] - Re-exports of the commonly used types
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Logging
//!
//! The library logs through the `log` facade: `info` for found entries, `warn` for skipped
//! entries and `debug` for per-handler detail. Install any logger to see it.
#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use vmscope::prelude::*;
///
/// let image = PeImage::from_file("protected.vmp.exe".as_ref())?;
/// let mut codec = IcedCodec::new(image.bitness())?;
/// let entries = EntryScanner::default().find_entries(&image, &mut codec)?;
/// # Ok::<(), vmscope::Error>(())
/// ```
pub mod prelude;

pub mod devirt;
pub mod file;
pub mod x86;

/// `vmscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `vmscope` Error type
///
/// # Examples
///
/// ```rust
/// use vmscope::{file::RawImage, devirt::{FlattenConfig, Flattener}, x86::IcedCodec, Error};
///
/// let image = RawImage::from_flat(vec![0xC3], 0x1000, 64);
/// let mut codec = IcedCodec::new(64)?;
///
/// match Flattener::new(&image, FlattenConfig::default()).flatten_at(&mut codec, 0x8000) {
///     Err(Error::SectionNotFound(rva)) => println!("0x{rva:x} is not mapped"),
///     Err(e) => println!("Error: {e}"),
///     Ok(sequence) => println!("{sequence}"),
/// }
/// # Ok::<(), vmscope::Error>(())
/// ```
pub use error::Error;
