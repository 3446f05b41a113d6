//! Export lookup in modules that are already loaded.
//!
//! The engine attaches to a running host; it must never map a second copy of the host module.
//! Windows uses `GetModuleHandleExW` through
//! [`libloading::os::windows::Library::open_already_loaded`], unix uses `dlopen` with
//! `RTLD_NOLOAD`.

use std::ffi::c_void;

use libloading::Library;

use crate::{config::TargetSymbol, Error, Result};

/// A resolved export together with the module handle that keeps it mapped.
#[derive(Debug)]
pub struct ResolvedSymbol {
    /// Address of the export
    pub address: usize,
    /// Reference on the owning module
    pub module: Library,
}

#[cfg(windows)]
fn open_loaded(module: &str) -> Result<Library> {
    libloading::os::windows::Library::open_already_loaded(module)
        .map(Library::from)
        .map_err(|_| Error::ModuleNotFound(module.to_string()))
}

#[cfg(unix)]
fn open_loaded(module: &str) -> Result<Library> {
    // SAFETY: RTLD_NOLOAD never maps the module, so no initializers run
    unsafe {
        libloading::os::unix::Library::open(Some(module), libc::RTLD_NOW | libc::RTLD_NOLOAD)
    }
    .map(Library::from)
    .map_err(|_| Error::ModuleNotFound(module.to_string()))
}

/// Resolves `target.symbol` inside the already-loaded `target.module`.
///
/// # Errors
///
/// - [`Error::ModuleNotFound`] if the module is not mapped into this process
/// - [`Error::SymbolNotFound`] if it does not export the symbol
pub fn resolve(target: &TargetSymbol) -> Result<ResolvedSymbol> {
    let module = open_loaded(&target.module)?;

    let not_found = || Error::SymbolNotFound {
        module: target.module.clone(),
        symbol: target.symbol.clone(),
    };

    // SAFETY: the symbol is only read as an address, never called through this type
    let address = unsafe {
        module
            .get::<*const c_void>(target.symbol.as_bytes())
            .map(|symbol| *symbol as usize)
            .map_err(|_| not_found())?
    };

    if address == 0 {
        return Err(not_found());
    }

    Ok(ResolvedSymbol { address, module })
}
