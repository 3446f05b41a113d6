//! Redirecting the host's native entry point.
//!
//! This module owns every machine-code concern of the engine. The rest of the crate only sees
//! the [`Redirector`] trait: hand it the entry point to redirect and the address of the
//! replacement, get back an [`InstalledRedirect`] holding a callable pointer to the original
//! behaviour.
//!
//! # Key Components
//!
//! - [`Redirector`] - Installs and removes a redirect
//! - [`InstalledRedirect`] - Record of one installed redirect, including the original entry point
//! - [`NativeRedirector`] - The x86_64 backend that patches live code
//! - [`x86_64`] - Pure jump encodings and prologue planning
//! - [`memory`] - Page protection guard and near allocation
//! - [`symbol`] - Export lookup in already-loaded modules
//!
//! # Installation Steps
//!
//! 1. Resolve the export in the already-loaded host module
//! 2. Allocate a region within ±1 GiB of it, holding a relay to the replacement and a trampoline
//! 3. Plan the prologue: whole instructions covering a `jmp rel32` to the relay
//! 4. Relocate those instructions into the trampoline, followed by a jump back
//! 5. Write the jump under a [`memory::ProtectionGuard`]
//!
//! The trampoline becomes the original entry point. Calling it runs the untouched prologue and
//! continues in the host function behind the jump, so the redirect is bypassed.
//!
//! A failing step leaves the target untouched; [`crate::Engine::init`] then reports
//! [`crate::InitOutcome::Degraded`]. That includes finding no free region in range.

pub mod memory;
pub mod symbol;
pub mod x86_64;

use std::ffi::c_void;

use crate::{config::TargetSymbol, host::DefineClassFn, Result};

/// A record of one installed redirect.
#[derive(Debug)]
pub struct InstalledRedirect {
    address: usize,
    original: DefineClassFn,
    overwritten: Vec<u8>,
    module: Option<libloading::Library>,
}

impl InstalledRedirect {
    /// Creates a record for a redirect at `address`.
    ///
    /// ## Arguments
    /// * 'address' - The patched entry point
    /// * 'original' - Callable original behaviour that bypasses the redirect
    /// * 'overwritten' - The bytes that were replaced at `address`
    pub fn new(address: usize, original: DefineClassFn, overwritten: Vec<u8>) -> Self {
        InstalledRedirect {
            address,
            original,
            overwritten,
            module: None,
        }
    }

    /// Keeps `module` referenced for as long as the redirect exists.
    #[must_use]
    pub fn with_module(mut self, module: libloading::Library) -> Self {
        self.module = Some(module);
        self
    }

    /// The patched entry point.
    pub fn address(&self) -> usize {
        self.address
    }

    /// The original entry point, safe to call from the replacement.
    pub fn original(&self) -> DefineClassFn {
        self.original
    }

    /// The bytes that were replaced at [`InstalledRedirect::address`].
    pub fn overwritten(&self) -> &[u8] {
        &self.overwritten
    }
}

/// Installs and removes the redirect of an entry point.
///
/// A redirector is used by exactly one engine. [`crate::Engine::init`] calls
/// [`Redirector::install`] at most once per init/shutdown cycle, and
/// [`crate::Engine::shutdown`] hands the record back to [`Redirector::restore`].
///
/// # Implementing Test Doubles
///
/// ```rust
/// use classweave::{InstalledRedirect, Redirector, TargetSymbol};
/// use std::ffi::c_void;
///
/// struct Unavailable;
///
/// impl Redirector for Unavailable {
///     fn install(
///         &self,
///         target: &TargetSymbol,
///         _replacement: *const c_void,
///     ) -> classweave::Result<InstalledRedirect> {
///         Err(classweave::Error::SymbolNotFound {
///             module: target.module.clone(),
///             symbol: target.symbol.clone(),
///         })
///     }
///
///     fn restore(&self, _installed: &InstalledRedirect) -> classweave::Result<()> {
///         Ok(())
///     }
/// }
/// ```
pub trait Redirector: Send + Sync {
    /// Redirects `target` to `replacement`.
    ///
    /// `replacement` has the signature of [`DefineClassFn`].
    ///
    /// # Errors
    ///
    /// Any error leaves the target untouched.
    fn install(&self, target: &TargetSymbol, replacement: *const c_void)
        -> Result<InstalledRedirect>;

    /// Puts the overwritten bytes back.
    ///
    /// # Errors
    ///
    /// Returns an error if the original bytes could not be written.
    fn restore(&self, installed: &InstalledRedirect) -> Result<()>;

    /// Whether redirected calls arrive at the crate's native entry point.
    ///
    /// When `true`, the engine publishes itself so the native entry point can find it.
    fn needs_global_dispatch(&self) -> bool {
        false
    }
}

/// [`Redirector`] that patches the live entry point of the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeRedirector;

impl NativeRedirector {
    /// Bytes read from the entry point for prologue planning.
    pub const PROLOGUE_WINDOW: usize = 32;

    /// Offset of the trampoline inside the allocated region, behind the relay.
    const TRAMPOLINE_OFFSET: usize = 16;

    /// Creates the native backend.
    pub fn new() -> Self {
        NativeRedirector
    }
}

#[cfg(target_arch = "x86_64")]
impl NativeRedirector {
    /// Redirects the function starting at `address` to `replacement`.
    ///
    /// This is [`Redirector::install`] after symbol resolution. The returned record holds no
    /// module reference.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing step; the function is untouched in that case.
    ///
    /// # Safety
    ///
    /// `address` must be the start of a mapped function with at least
    /// [`Self::PROLOGUE_WINDOW`] readable bytes, and no thread may be executing its prologue.
    pub unsafe fn redirect_at(
        address: usize,
        replacement: *const c_void,
    ) -> Result<InstalledRedirect> {
        let code = memory::read_code(address, Self::PROLOGUE_WINDOW);

        let mut region = memory::ExecutableRegion::allocate_near(address, 0x100)?;
        let relay = region.base();
        let trampoline = relay + Self::TRAMPOLINE_OFFSET;

        let plan = x86_64::plan_redirect(&code, address as u64, relay as u64)?;
        let relocated = plan.relocate(trampoline as u64)?;

        region.write(0, &x86_64::encode_abs_jmp(replacement as u64))?;
        region.write(Self::TRAMPOLINE_OFFSET, &relocated)?;
        region.seal()?;

        memory::write_code(address, &plan.patch_bytes())?;

        // The trampoline stays mapped for the rest of the process: a host thread may still run it
        let trampoline_base = region.leak() + Self::TRAMPOLINE_OFFSET;

        // SAFETY: the trampoline holds the relocated prologue of a DefineClassFn
        let original: DefineClassFn = std::mem::transmute(trampoline_base);

        tracing::info!(
            address = format_args!("{address:#x}"),
            trampoline = format_args!("{trampoline_base:#x}"),
            consumed = plan.consumed,
            "Installed redirect"
        );

        Ok(InstalledRedirect::new(
            address,
            original,
            code[..plan.consumed].to_vec(),
        ))
    }
}

#[cfg(target_arch = "x86_64")]
impl Redirector for NativeRedirector {
    fn install(
        &self,
        target: &TargetSymbol,
        replacement: *const c_void,
    ) -> Result<InstalledRedirect> {
        let resolved = symbol::resolve(target)?;
        tracing::debug!(symbol = %target, "Resolved entry point");

        // SAFETY: exports of a mapped module point at the start of mapped code
        let installed = unsafe { Self::redirect_at(resolved.address, replacement)? };
        Ok(installed.with_module(resolved.module))
    }

    fn restore(&self, installed: &InstalledRedirect) -> Result<()> {
        // SAFETY: the bytes were read from this address when the redirect was installed
        unsafe { memory::write_code(installed.address(), installed.overwritten())? };
        tracing::info!(
            address = format_args!("{:#x}", installed.address()),
            "Removed redirect"
        );
        Ok(())
    }

    fn needs_global_dispatch(&self) -> bool {
        true
    }
}

#[cfg(not(target_arch = "x86_64"))]
impl Redirector for NativeRedirector {
    fn install(
        &self,
        _target: &TargetSymbol,
        _replacement: *const c_void,
    ) -> Result<InstalledRedirect> {
        Err(crate::Error::UnsupportedPlatform)
    }

    fn restore(&self, _installed: &InstalledRedirect) -> Result<()> {
        Err(crate::Error::UnsupportedPlatform)
    }
}
