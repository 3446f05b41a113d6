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
// unsafe is confined to:
// - 'host' which wraps raw JNI pointers and calls through the JNI function table
// - 'patch' which reads, allocates and writes executable memory
// - 'engine/intercept.rs' which is the extern "system" entry point the host calls

//! # classweave
//!
//! A runtime bytecode-instrumentation engine for JVM hosts. `classweave` runs inside the host
//! process, redirects the host's native class-definition entry point to itself, passes the
//! raw bytes of every class through an ordered chain of rewriters, and notifies subscribers of
//! load events. The host keeps running unaware of the interception.
//!
//! ## Features
//!
//! - **Live redirection** - x86_64 prologue patching with a relocated-prologue trampoline
//! - **Ordered rewriting** - Method hooks scoped to a class, then whole-class transforms
//! - **Failure isolation** - A failing or panicking callback never fails the load
//! - **Synchronous events** - Subscribers observe a load before the host sees the class
//! - **Testable seams** - Patch backend and host runtime are traits with in-process fakes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use classweave::prelude::*;
//!
//! classweave::diagnostics::init_console();
//!
//! let engine = Engine::new(EngineConfig::default());
//! engine.add_method_hook(MethodHook::new(
//!     "com/example/Service",
//!     "handle",
//!     "(Ljava/lang/String;)V",
//!     |_target, bytes| RewriteResult::Rewritten(bytes.to_vec()),
//! ))?;
//! engine.subscribe(EventKind::ClassLoad, |class| println!("loaded {class}"));
//!
//! match engine.init(None, None) {
//!     InitOutcome::Patched => {}
//!     outcome => eprintln!("engine is not receiving classes: {outcome:?}"),
//! }
//! # Ok::<(), classweave::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`patch`] - Machine-code concerns: symbol resolution, page protection, jump encoding
//! - [`registry`] - Transforms, method hooks, subscribers and the loaded-class cache
//! - [`pipeline`] - Applies the registry to one class
//! - [`engine`] - Lifecycle, configuration calls and the intercepted entry point
//! - [`host`] - The few JNI types and calls the engine depends on
//!
//! ## Concurrency
//!
//! The engine spawns no threads. Loads from concurrent host threads are serialized through one
//! registry lock, which is also taken by every configuration call. Callbacks run under that
//! lock and must not call back into the engine.

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust
/// use classweave::prelude::*;
///
/// let engine = Engine::with_backends(
///     EngineConfig::passive(),
///     Box::new(NativeRedirector::new()),
///     Box::new(JniRuntime::new()),
/// );
/// assert!(matches!(engine.init(None, None), InitOutcome::Passive));
/// ```
pub mod prelude;

/// Engine configuration
pub mod config;

/// Console diagnostics
pub mod diagnostics;

/// Host runtime binding: JNI types and the [`host::HostRuntime`] seam
pub mod host;

/// Redirection of the host's native entry point
///
/// # Key Components
///
/// - [`patch::Redirector`] - Trait the engine installs redirects through
/// - [`patch::NativeRedirector`] - x86_64 backend patching live code
/// - [`patch::x86_64`] - Jump encodings and prologue planning, usable without touching memory
pub mod patch;

/// Registered transforms, hooks, subscribers and loaded classes
pub mod registry;

/// The rewriting pipeline
pub mod pipeline;

/// The engine and its intercepted entry point
pub mod engine;

/// `classweave` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always
/// [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `classweave` Error type
///
/// Install-path errors reach embedders inside [`InitOutcome::Degraded`]; configuration calls
/// return them directly.
pub use error::Error;

pub use config::{EngineConfig, TargetSymbol};
pub use engine::{DefineRequest, Engine, InitOutcome};
pub use patch::{InstalledRedirect, NativeRedirector, Redirector};
pub use pipeline::{PipelineOutput, RewriteFailure, Stage, TransformPipeline};
pub use registry::{
    EventCallback, EventKind, MethodHook, MethodTarget, Registry, RewriteResult, Transform,
};
