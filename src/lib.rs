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
#![allow(clippy::too_many_arguments)]
//#![deny(unsafe_code)]
// - 'trampoline/buffer.rs' reads and writes raw code memory and calls mprotect
// - 'trampoline/arena.rs' leaks anonymous mappings to keep frames alive
// - 'trampoline/mod.rs' frees payload copies through their raw address
// - 'patch/runtime.rs' declares the unsafe `MethodRuntime` contract on entry points
// - 'patch/patcher.rs' installs and removes detours on runtime-provided entry points

//! # dotpatch
//!
//! [![Crates.io](https://img.shields.io/crates/v/dotpatch.svg)](https://crates.io/crates/dotpatch)
//! [![Documentation](https://docs.rs/dotpatch/badge.svg)](https://docs.rs/dotpatch)
//! [![License](https://img.shields.io/badge/license-Apache--2.0-blue.svg)](https://github.com/BinFlip/dotpatch/blob/main/LICENSE-APACHE)
//!
//! Runtime method interception for CIL. `dotpatch` rewrites a compiled .NET method so that
//! calls to it run a replacement built from the original body plus any number of
//! prefixes, postfixes, finalizers and instruction transforms, registered by independent
//! owners and combined in a deterministic order.
//!
//! ## Features
//!
//! - **Instruction codec** - decode and encode CIL instruction streams and method bodies,
//!   including exception clauses and label based branches
//! - **Patch ordering** - priorities plus before/after constraints between owners
//! - **Replacement synthesis** - argument, result and state injection, skip-original gates and
//!   finalizer exception handling
//! - **Trampolines** - entry-point detours for x86, x64 and ARM64 that carry the serialized
//!   patch set, so the state of a method can be recovered from its code alone
//!
//! ## Architecture
//!
//! - [`assembly`] - opcodes, the instruction model, encoder, decoder and [`assembly::CodeMatcher`]
//! - [`metadata`] - tokens, signatures, method keys and method body headers
//! - [`patch`] - [`patch::Patcher`], the registry, ordering and the synthesizer
//! - [`trampoline`] - executable memory and entry-point detours
//! - [`config`] - [`config::PatcherConfig`]
//!
//! The host runtime is abstracted by [`patch::MethodRuntime`]: it describes methods, hands
//! out their IL and entry points and compiles synthesized bodies. Everything else lives in
//! this crate.
//!
//! ## Quick Start
//!
//! ```rust
//! use dotpatch::assembly::{decode_stream, encode, opcodes, CodeGenerator};
//!
//! // static int Add(int a, int b) => a + b;
//! let code = [0x02, 0x03, 0x58, 0x2A];
//! let mut generator = CodeGenerator::new();
//! let instructions = decode_stream(&code, &mut generator)?;
//! assert_eq!(instructions[2].opcode, opcodes::ADD);
//!
//! let encoded = encode(&instructions, &mut generator)?;
//! assert_eq!(encoded.code, code);
//! # Ok::<(), dotpatch::Error>(())
//! ```
//!
//! Patching goes through a [`patch::Patcher`]:
//!
//! ```rust,ignore
//! use dotpatch::prelude::*;
//!
//! let patcher = Patcher::new("com.example.audit", runtime);
//! patcher.patch(&original, PatchRequest::new().prefix(log_call))?;
//! // ...
//! patcher.unpatch_all()?;
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result). A failed patch or unpatch leaves the
//! method in its previous state: nothing is committed to the registry and the trampoline is
//! only touched once the replacement has been compiled.
//!
//! ## Logging
//!
//! The crate logs through [`tracing`], with the `log` feature enabled so records also reach
//! `log` based subscribers. Installs and rebuilds are logged at debug level, single
//! instruction rewrites at trace level.
//!
//! ## Thread Safety
//!
//! Patch and unpatch operations on one [`patch::PatchRegistry`] are serialized by its lock.
//! Making sure no thread executes an entry point while it is first overwritten is the job
//! of the [`patch::MethodRuntime`] implementation.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// ```rust
/// use dotpatch::prelude::*;
///
/// let options = PatchOptions::new().with_priority(Priority::HIGH).after("com.example.core");
/// assert_eq!(options.priority, Priority::HIGH);
/// ```
pub mod prelude;

/// CIL instructions: opcodes, the instruction model, encoder, decoder and pattern matching
pub mod assembly;

/// Configuration of a [`patch::Patcher`]
pub mod config;

/// Low-level byte access shared by the codec
pub mod file;

/// Tokens, signatures and method bodies
pub mod metadata;

/// Patch registration, ordering and replacement synthesis
pub mod patch;

/// Entry point detours and executable memory
pub mod trampoline;

/// `dotpatch` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `dotpatch` Error type
///
/// # Examples
///
/// ```rust
/// use dotpatch::{assembly::{decode_stream, CodeGenerator}, Error};
///
/// // `ldc.i4` without its operand
/// match decode_stream(&[0x20, 0x01], &mut CodeGenerator::new()) {
///     Err(Error::MalformedBody { .. }) => {}
///     other => panic!("unexpected {other:?}"),
/// }
/// ```
pub use error::Error;

/// Cursor over a byte slice, see [`file::parser::Parser`]
pub use file::parser::Parser;
