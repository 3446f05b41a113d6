//! Engine configuration.
//!
//! [`EngineConfig`] collects the knobs an embedder picks before calling
//! [`crate::Engine::init`]: which exported function to redirect, whether to patch at all, and
//! how strictly callbacks are isolated from one another.

use std::fmt;

use crate::host::DefineClassFn;

/// Default module that exports the class-definition entry point.
#[cfg(windows)]
pub const DEFAULT_HOST_MODULE: &str = "jvm.dll";
/// Default module that exports the class-definition entry point.
#[cfg(target_os = "macos")]
pub const DEFAULT_HOST_MODULE: &str = "libjvm.dylib";
/// Default module that exports the class-definition entry point.
#[cfg(not(any(windows, target_os = "macos")))]
pub const DEFAULT_HOST_MODULE: &str = "libjvm.so";

/// Default exported name of the native class-definition entry point.
pub const DEFAULT_DEFINE_CLASS_SYMBOL: &str = "JNI_DefineClass";

/// An exported function inside a module that is already loaded in this process.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TargetSymbol {
    /// File name of the module, e.g. `jvm.dll`
    pub module: String,
    /// Exported symbol name
    pub symbol: String,
}

impl TargetSymbol {
    /// Creates a new target description.
    ///
    /// ## Arguments
    /// * 'module' - File name of the already-loaded module
    /// * 'symbol' - Exported symbol to redirect
    pub fn new(module: impl Into<String>, symbol: impl Into<String>) -> Self {
        TargetSymbol {
            module: module.into(),
            symbol: symbol.into(),
        }
    }
}

impl Default for TargetSymbol {
    fn default() -> Self {
        TargetSymbol::new(DEFAULT_HOST_MODULE, DEFAULT_DEFINE_CLASS_SYMBOL)
    }
}

impl fmt::Display for TargetSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.module, self.symbol)
    }
}

/// Configuration for an [`crate::Engine`].
///
/// # Examples
///
/// ```rust
/// use classweave::{EngineConfig, TargetSymbol};
///
/// let config = EngineConfig::default()
///     .with_target(TargetSymbol::new("libjvm.so", "JNI_DefineClass"))
///     .with_catch_panics(true);
/// assert!(config.install_redirect);
///
/// // The host already routes loads to the engine by other means.
/// let passive = EngineConfig::passive();
/// assert!(!passive.install_redirect);
/// assert!(passive.original.is_none());
/// ```
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// The entry point that `init` redirects
    pub target: TargetSymbol,

    /// Install the redirect during `init` (default: true)
    /// When false, classes only reach the pipeline through [`crate::Engine::define_class`]
    pub install_redirect: bool,

    /// Treat a panicking transform or hook like one that returned a failure (default: true)
    /// When false, panics propagate; the native entry point still stops them at the FFI boundary
    pub catch_panics: bool,

    /// Define function used while no redirect is installed (default: none)
    /// Passive embedders set this to the host's entry point they route into
    /// [`crate::Engine::define_class`]
    pub original: Option<DefineClassFn>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target: TargetSymbol::default(),
            install_redirect: true,
            catch_panics: true,
            original: None,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration that never patches the host.
    #[must_use]
    pub fn passive() -> Self {
        Self {
            install_redirect: false,
            ..Self::default()
        }
    }

    /// Sets the entry point to redirect.
    #[must_use]
    pub fn with_target(mut self, target: TargetSymbol) -> Self {
        self.target = target;
        self
    }

    /// Sets whether callback panics are isolated.
    #[must_use]
    pub fn with_catch_panics(mut self, catch_panics: bool) -> Self {
        self.catch_panics = catch_panics;
        self
    }

    /// Sets the define function classes are delegated to while no redirect is installed.
    ///
    /// An installed redirect always takes precedence.
    #[must_use]
    pub fn with_original(mut self, original: DefineClassFn) -> Self {
        self.original = Some(original);
        self
    }
}
