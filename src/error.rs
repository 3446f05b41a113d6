use thiserror::Error;

use crate::registry::EventKind;

macro_rules! patch_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Patch {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Patch {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Most of these never reach the embedder as an `Err`: failures while installing the redirect
/// are absorbed into [`crate::InitOutcome::Degraded`], and failures inside registered callbacks
/// are recorded as [`crate::RewriteFailure`] values by the pipeline. The variants are still
/// public so that degraded outcomes can be inspected and matched on.
///
/// # Error Categories
///
/// ## Redirect Installation
/// - [`Error::ModuleNotFound`] - The host module is not loaded in this process
/// - [`Error::SymbolNotFound`] - The host module does not export the entry point
/// - [`Error::MemoryProtection`] - Page protection could not be changed, or memory allocated
/// - [`Error::PrologueTooShort`] - The entry point is too small to hold a jump
/// - [`Error::Relocation`] - The overwritten prologue could not be moved to the trampoline
/// - [`Error::Patch`] - Any other inconsistency in the patch arithmetic
/// - [`Error::UnsupportedPlatform`] - No native backend for this architecture
///
/// ## Engine Lifecycle
/// - [`Error::EngineActive`] - Another engine already owns the native entry point
/// - [`Error::MissingCallback`] - An event was enabled without a callback
///
/// # Examples
///
/// ```rust
/// use classweave::{Error, InitOutcome};
///
/// fn describe(outcome: &InitOutcome) -> String {
///     match outcome {
///         InitOutcome::Patched => "redirect installed".to_string(),
///         InitOutcome::Passive => "patching disabled".to_string(),
///         InitOutcome::Degraded(Error::SymbolNotFound { symbol, .. }) => {
///             format!("host does not export {symbol}")
///         }
///         InitOutcome::Degraded(e) => format!("degraded: {e}"),
///     }
/// }
/// ```
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The host module is not loaded in the current process.
    ///
    /// The engine never loads the host module itself; it has to be mapped already,
    /// e.g. because the engine runs inside the host's own process.
    #[error("Module '{0}' is not loaded in this process")]
    ModuleNotFound(String),

    /// The host module is loaded, but does not export the requested symbol.
    #[error("Module '{module}' does not export '{symbol}'")]
    SymbolNotFound {
        /// The module that was searched
        module: String,
        /// The symbol that could not be resolved
        symbol: String,
    },

    /// Changing page protection or allocating executable memory failed.
    ///
    /// The associated address is the start of the region that was being modified.
    #[error("Memory protection failure at {address:#x} - {message}")]
    MemoryProtection {
        /// Start of the affected region
        address: usize,
        /// Description reported by the operating system
        message: String,
    },

    /// The entry point ends before enough whole instructions could be taken to hold the
    /// redirecting jump.
    #[error("Prologue at {address:#x} is too short - {available} of {needed} bytes usable")]
    PrologueTooShort {
        /// Address of the entry point
        address: usize,
        /// Bytes of whole instructions found before the function ended
        available: usize,
        /// Bytes required by the jump
        needed: usize,
    },

    /// The overwritten prologue instructions could not be re-encoded at the trampoline address.
    #[error("Failed to relocate prologue - {0}")]
    Relocation(String),

    /// Internal inconsistency while building or writing the patch.
    ///
    /// # Fields
    ///
    /// * `message` - Description of what went wrong
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Patch - {file}:{line}: {message}")]
    Patch {
        /// The message to be printed for the Patch error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// No native redirect backend exists for this target.
    #[error("Native redirection is only supported on x86_64")]
    UnsupportedPlatform,

    /// The native entry point is already routed to a different engine instance.
    ///
    /// Only one engine per process can own the redirected entry point.
    #[error("Another engine already owns the native entry point")]
    EngineActive,

    /// An event kind was enabled without a callback to deliver it to.
    #[error("Enabling {0} requires a callback")]
    MissingCallback(EventKind),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}
