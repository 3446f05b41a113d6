//! Shared test doubles: a recording original entry point, a redirector that never touches live
//! code, and a host runtime that never touches a VM.

use std::{
    cell::RefCell,
    ffi::{c_char, c_void, CStr},
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    config::TargetSymbol,
    host::{
        jbyte, jclass, jint, jobject, jsize, ClassHandle, DefineClassFn, EnvHandle, HostRuntime,
        JNIEnv,
    },
    patch::{InstalledRedirect, Redirector},
    Error, Result,
};

/// Serializes tests that publish an engine for the native entry point.
pub static DISPATCH_LOCK: Mutex<()> = parking_lot::const_mutex(());

thread_local! {
    static RECEIVED: RefCell<Vec<(String, Vec<u8>)>> = const { RefCell::new(Vec::new()) };
}

/// Returns and clears the classes [`define_success`] saw on this thread.
pub fn take_received() -> Vec<(String, Vec<u8>)> {
    RECEIVED.with(|received| std::mem::take(&mut *received.borrow_mut()))
}

/// A non-null environment that must never be dereferenced.
pub fn fake_env() -> EnvHandle {
    // SAFETY: the fakes only compare and forward the pointer
    unsafe { EnvHandle::from_raw(NonNull::<JNIEnv>::dangling().as_ptr()) }.unwrap()
}

unsafe fn record(name: *const c_char, buf: *const jbyte, len: jsize) {
    let name = if name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(name).to_string_lossy().into_owned()
    };
    let bytes = if buf.is_null() || len <= 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(buf.cast::<u8>(), len as usize).to_vec()
    };
    RECEIVED.with(|received| received.borrow_mut().push((name, bytes)));
}

/// Original entry point that records its input and defines every class.
pub unsafe extern "system" fn define_success(
    _env: *mut JNIEnv,
    name: *const c_char,
    _loader: jobject,
    buf: *const jbyte,
    len: jsize,
) -> jclass {
    record(name, buf, len);
    NonNull::<c_void>::dangling().as_ptr()
}

/// Original entry point that records its input and rejects every class.
pub unsafe extern "system" fn define_failure(
    _env: *mut JNIEnv,
    name: *const c_char,
    _loader: jobject,
    buf: *const jbyte,
    len: jsize,
) -> jclass {
    record(name, buf, len);
    ptr::null_mut()
}

/// Counters shared between a [`FakeRedirector`] and its test.
#[derive(Debug, Default)]
pub struct RedirectStats {
    pub installs: AtomicUsize,
    pub restores: AtomicUsize,
}

/// [`Redirector`] that records calls instead of patching.
pub struct FakeRedirector {
    stats: Arc<RedirectStats>,
    original: DefineClassFn,
    failure: Option<Error>,
    global_dispatch: bool,
}

impl FakeRedirector {
    pub fn new() -> Self {
        FakeRedirector {
            stats: Arc::default(),
            original: define_success,
            failure: None,
            global_dispatch: false,
        }
    }

    pub fn failing(error: Error) -> Self {
        FakeRedirector {
            failure: Some(error),
            ..Self::new()
        }
    }

    pub fn with_original(mut self, original: DefineClassFn) -> Self {
        self.original = original;
        self
    }

    pub fn with_global_dispatch(mut self) -> Self {
        self.global_dispatch = true;
        self
    }

    pub fn stats(&self) -> Arc<RedirectStats> {
        self.stats.clone()
    }
}

impl Redirector for FakeRedirector {
    fn install(
        &self,
        _target: &TargetSymbol,
        replacement: *const c_void,
    ) -> Result<InstalledRedirect> {
        self.stats.installs.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        assert!(!replacement.is_null());
        Ok(InstalledRedirect::new(0x1000, self.original, vec![0x90; 5]))
    }

    fn restore(&self, _installed: &InstalledRedirect) -> Result<()> {
        self.stats.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn needs_global_dispatch(&self) -> bool {
        self.global_dispatch
    }
}

/// [`HostRuntime`] that hands out distinct fake global references.
pub struct FakeRuntime {
    next: AtomicUsize,
    released: Arc<Mutex<Vec<ClassHandle>>>,
    version: Option<jint>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        FakeRuntime {
            next: AtomicUsize::new(1),
            released: Arc::default(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: jint) -> Self {
        self.version = Some(version);
        self
    }

    pub fn released(&self) -> Arc<Mutex<Vec<ClassHandle>>> {
        self.released.clone()
    }
}

impl HostRuntime for FakeRuntime {
    fn new_global_ref(&self, _env: EnvHandle, _class: jclass) -> Option<ClassHandle> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        // SAFETY: fake handles are only compared, never dereferenced
        unsafe { ClassHandle::from_raw((id * 8) as jclass) }
    }

    fn delete_global_ref(&self, _env: EnvHandle, class: ClassHandle) {
        self.released.lock().push(class);
    }

    fn version(&self, _env: EnvHandle) -> Option<jint> {
        self.version
    }
}
