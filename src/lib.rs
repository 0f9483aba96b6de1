// Copyright 2025-2026 Johann Kempter
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

#![deny(missing_docs)]

//! # destring
//!
//! A static string deobfuscator for .NET assemblies, built on
//! [`dotscope`](https://crates.io/crates/dotscope).
//!
//! String obfuscators replace every literal in a program with a call to an
//! auto-generated accessor method that decrypts one string out of a large
//! encrypted byte blob at run time. `destring` undoes that transformation
//! without ever executing the decoder: it locates the decoder type, lifts
//! the encrypted payload out of the metadata, inverts the cipher, recovers
//! each accessor's `(offset, length)` slice from its instruction stream, and
//! rewrites every call site into a plain `ldstr` carrying the recovered
//! text. The output assembly is functionally equivalent and readable in any
//! disassembler.
//!
//! # Pipeline
//!
//! The pipeline is linear, single-threaded, and side-effect-free until the
//! final write:
//!
//! 1. [`Module::load`] loads and parses the assembly ([`module`])
//! 2. [`locator::locate_decoder`] finds the decoder type and payload blob
//! 3. [`payload::extract_payload`] + [`payload::decrypt_in_place`]
//! 4. [`accessors::analyze_accessors`] builds the name to literal map
//! 5. [`rewriter::rewrite_call_sites`] plans in-place substitutions
//! 6. [`verifier::count_residual_calls`] sanity-checks the result
//! 7. [`Module::write_patched`] materializes and writes the output
//!
//! [`pipeline::run`] drives steps 2–6 and returns a [`PipelineReport`]
//! together with the [`PatchSet`] to write.
//!
//! # Example
//!
//! ```rust,no_run
//! use destring::{pipeline, Module};
//!
//! let module = Module::load(std::path::Path::new("obfuscated.exe"))?;
//! let outcome = pipeline::run(&module)?;
//! println!("{} call sites replaced", outcome.report.calls_replaced);
//! module.write_patched(&outcome.patches, std::path::Path::new("clean.exe"))?;
//! # Ok::<(), destring::Error>(())
//! ```
//!
//! # What this crate does not do
//!
//! No control-flow deobfuscation, no symbol renaming, no re-signing, and no
//! removal of the (now unreferenced) decoder type. Decoders using a cipher
//! or accessor shape other than the one handled here are reported as
//! not found rather than guessed at.

pub mod accessors;
pub mod locator;
pub mod module;
pub mod payload;
pub mod pipeline;
pub mod rewriter;
pub mod verifier;

mod error;

pub use accessors::AccessorMap;
pub use error::Error;
pub use locator::DecoderBinding;
pub use module::{Module, PatchSet};
pub use pipeline::{PipelineOutcome, PipelineReport};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
