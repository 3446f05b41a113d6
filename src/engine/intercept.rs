//! The path a class takes from the host's entry point through the engine and back.
//!
//! [`Engine::define_class`] is the safe core: pipeline, delegation to the original entry point,
//! cache update and `ClassLoad` notification. Passive embedders call it directly.
//! [`native_define_class`] is what the redirect jumps to; it locates the published engine and
//! turns the raw call into a [`DefineRequest`].
//!
//! One engine per process can be published. Publication happens in [`Engine::init`] when the
//! redirector routes calls to [`native_define_class`], and is withdrawn by [`Engine::shutdown`].

use std::{
    borrow::Cow,
    ffi::{c_char, CStr},
    panic::{self, AssertUnwindSafe},
    ptr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;

use super::Engine;
use crate::{
    host::{jbyte, jclass, jobject, jsize, DefineClassFn, EnvHandle, JNIEnv},
    patch::InstalledRedirect,
    pipeline::panic_message,
    registry::EventKind,
    Error, Result,
};

static ACTIVE: RwLock<Option<Arc<Engine>>> = parking_lot::const_rwlock(None);

// Last original entry point ever installed. Kept after shutdown: a redirect that could not be
// removed still needs somewhere to forward to.
static FALLBACK: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn publish(engine: &Arc<Engine>) -> Result<()> {
    let mut active = ACTIVE.write();
    match active.as_ref() {
        Some(current) if !Arc::ptr_eq(current, engine) => Err(Error::EngineActive),
        _ => {
            *active = Some(Arc::clone(engine));
            Ok(())
        }
    }
}

pub(crate) fn withdraw(engine: &Engine) {
    let mut active = ACTIVE.write();
    if active
        .as_ref()
        .is_some_and(|current| ptr::eq(Arc::as_ptr(current), engine))
    {
        *active = None;
    }
}

pub(crate) fn remember_original(original: DefineClassFn) {
    FALLBACK.store(original as usize, Ordering::Release);
}

fn fallback() -> Option<DefineClassFn> {
    let raw = FALLBACK.load(Ordering::Acquire);
    if raw == 0 {
        return None;
    }

    // SAFETY: FALLBACK only ever holds addresses stored from a DefineClassFn
    Some(unsafe { std::mem::transmute::<usize, DefineClassFn>(raw) })
}

/// The engine currently receiving redirected calls.
pub fn active() -> Option<Arc<Engine>> {
    ACTIVE.read().clone()
}

/// One call of the class-definition entry point.
#[derive(Debug, Clone, Copy)]
pub struct DefineRequest<'a> {
    env: EnvHandle,
    name: Option<&'a CStr>,
    loader: jobject,
    bytes: &'a [u8],
}

impl<'a> DefineRequest<'a> {
    /// Creates a request.
    ///
    /// ## Arguments
    /// * 'env' - Environment of the calling thread
    /// * 'name' - Internal class name, `None` if the host passed none
    /// * 'loader' - Defining class loader, passed through untouched
    /// * 'bytes' - The class file as the host supplied it
    pub fn new(env: EnvHandle, name: Option<&'a CStr>, loader: jobject, bytes: &'a [u8]) -> Self {
        DefineRequest {
            env,
            name,
            loader,
            bytes,
        }
    }

    /// Builds a request from the raw arguments of the entry point.
    ///
    /// A null buffer or non-positive length is read as an empty class. Returns `None` for a null
    /// environment.
    ///
    /// # Safety
    ///
    /// `env` must be null or the caller's environment, `name` null or a NUL-terminated string,
    /// and `buf` must point to `len` readable bytes when it is not null. All of them must stay
    /// valid for `'a`.
    pub unsafe fn from_raw(
        env: *mut JNIEnv,
        name: *const c_char,
        loader: jobject,
        buf: *const jbyte,
        len: jsize,
    ) -> Option<Self> {
        let env = EnvHandle::from_raw(env)?;
        let name = (!name.is_null()).then(|| CStr::from_ptr(name));
        let bytes: &'a [u8] = match usize::try_from(len) {
            Ok(len) if len > 0 && !buf.is_null() => {
                std::slice::from_raw_parts(buf.cast::<u8>(), len)
            }
            _ => &[],
        };
        Some(DefineRequest::new(env, name, loader, bytes))
    }

    /// Class name for callbacks and events; empty when the host passed none.
    pub fn class_name(&self) -> Cow<'a, str> {
        self.name.map(CStr::to_string_lossy).unwrap_or_default()
    }

    /// The class bytes as supplied by the host.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Environment of the calling thread.
    pub fn env(&self) -> EnvHandle {
        self.env
    }
}

impl Engine {
    /// Defines a class through the pipeline and the original entry point.
    ///
    /// Runs the pipeline over a private copy of the bytes and hands the result to the original
    /// entry point: the trampoline of the installed redirect, or
    /// [`crate::EngineConfig::original`] while none is installed. A defined class is recorded as
    /// a global reference and announced to the `ClassLoad` subscriber before this returns. A
    /// null result from the host is returned as is, without cache update or event.
    ///
    /// A class whose host call outlasts an [`Engine::shutdown`] is returned to the host but
    /// neither recorded nor announced.
    ///
    /// Returns null without running any callback if there is no original entry point.
    pub fn define_class(&self, request: DefineRequest<'_>) -> jclass {
        let class = request.class_name();

        let (original, generation) = {
            let state = self.state.lock();
            let original = state
                .installed()
                .map(InstalledRedirect::original)
                .or(self.config.original);
            (original, self.generation.load(Ordering::Acquire))
        };
        let Some(original) = original else {
            tracing::error!(class = %class, "No original entry point, rejecting class");
            return ptr::null_mut();
        };

        let output = {
            let registry = self.registry.lock();
            self.pipeline.apply(&registry, &class, request.bytes.to_vec())
        };

        let bytes: &[u8] = if jsize::try_from(output.bytes.len()).is_ok() {
            &output.bytes
        } else {
            tracing::warn!(
                class = %class,
                len = output.bytes.len(),
                "Rewritten class exceeds the host's size limit, defining the original"
            );
            request.bytes
        };
        let Ok(len) = jsize::try_from(bytes.len()) else {
            tracing::error!(
                class = %class,
                len = bytes.len(),
                "Class exceeds the host's size limit"
            );
            return ptr::null_mut();
        };

        // SAFETY: `original` bypasses the redirect and has the host's signature; all pointers
        // outlive the call
        let defined = unsafe {
            original(
                request.env.as_raw(),
                request.name.map_or(ptr::null(), CStr::as_ptr),
                request.loader,
                bytes.as_ptr().cast::<jbyte>(),
                len,
            )
        };

        if defined.is_null() {
            tracing::debug!(class = %class, "Host rejected class");
            return defined;
        }

        let mut registry = self.registry.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            tracing::debug!(class = %class, "Engine shut down during load, class not recorded");
            return defined;
        }
        match self.runtime.new_global_ref(request.env, defined) {
            Some(handle) => registry.record_loaded(handle),
            None => tracing::warn!(class = %class, "Could not pin defined class"),
        }
        Self::notify(&registry, EventKind::ClassLoad, &class);

        defined
    }
}

unsafe fn forward(
    env: *mut JNIEnv,
    name: *const c_char,
    loader: jobject,
    buf: *const jbyte,
    len: jsize,
) -> jclass {
    match fallback() {
        Some(original) => original(env, name, loader, buf, len),
        None => ptr::null_mut(),
    }
}

/// Replacement for the host's class-definition entry point.
///
/// Routes the call to the published engine. Without one, or when the engine panics, the call is
/// forwarded unmodified to the last installed original entry point. Panics never cross this
/// boundary.
///
/// # Safety
///
/// Must only be called by the host with the arguments of its own entry point.
pub unsafe extern "system" fn native_define_class(
    env: *mut JNIEnv,
    name: *const c_char,
    loader: jobject,
    buf: *const jbyte,
    len: jsize,
) -> jclass {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let engine = active()?;
        // SAFETY: the host passes valid arguments for the duration of this call
        let request = DefineRequest::from_raw(env, name, loader, buf, len)?;
        Some(engine.define_class(request))
    }));

    match result {
        Ok(Some(defined)) => defined,
        Ok(None) => forward(env, name, loader, buf, len),
        Err(payload) => {
            tracing::error!(
                panic = panic_message(&*payload),
                "Panic while defining class, forwarding unmodified"
            );
            forward(env, name, loader, buf, len)
        }
    }
}
