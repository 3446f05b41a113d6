//! # classweave Prelude
//!
//! The types needed to configure an engine and write transforms, method hooks and
//! subscribers.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

pub use crate::{Error, Result};

// ================================================================================================
// Engine
// ================================================================================================

pub use crate::{Engine, EngineConfig, InitOutcome, TargetSymbol};

// ================================================================================================
// Callbacks
// ================================================================================================

pub use crate::{
    EventCallback, EventKind, MethodHook, MethodTarget, RewriteFailure, RewriteResult, Transform,
};

// ================================================================================================
// Backends
// ================================================================================================

pub use crate::{
    host::{HostRuntime, JniRuntime},
    InstalledRedirect, NativeRedirector, Redirector,
};
