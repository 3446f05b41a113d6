//! Host runtime binding.
//!
//! The engine needs very little from the JVM it lives in: the calling convention of the
//! class-definition entry point, and a way to turn the local class reference that entry point
//! returns into a reference that outlives the current native frame. Both are described here.
//!
//! # Key Components
//!
//! - [`DefineClassFn`] - Signature of the host's native class-definition entry point
//! - [`EnvHandle`], [`VmHandle`], [`ClassHandle`] - Non-null wrappers around JNI pointers
//! - [`HostRuntime`] - Reference management and version queries the engine delegates to the host
//! - [`JniRuntime`] - [`HostRuntime`] implementation calling through the JNI function table
//!
//! # Thread Safety
//!
//! [`EnvHandle`] is only valid on the thread it was handed to and is deliberately `!Send`.
//! [`VmHandle`] and [`ClassHandle`] (which always wraps a global reference) may be shared.

#![allow(non_camel_case_types)]

mod jni;

pub use jni::JniRuntime;

use std::{
    ffi::{c_char, c_void},
    fmt,
    ptr::NonNull,
};

/// JNI `jint`
pub type jint = i32;
/// JNI `jlong`
pub type jlong = i64;
/// JNI `jbyte`
pub type jbyte = i8;
/// JNI `jsize`
pub type jsize = jint;
/// JNI `jobject`
pub type jobject = *mut c_void;
/// JNI `jclass`
pub type jclass = jobject;

/// Opaque JNI environment; only ever handled behind a pointer.
#[repr(C)]
pub struct JNIEnv {
    _private: [u8; 0],
}

/// Opaque JNI invocation interface; only ever handled behind a pointer.
#[repr(C)]
pub struct JavaVM {
    _private: [u8; 0],
}

/// `JNI_OK`
pub const JNI_OK: jint = 0;

/// The host's native class-definition entry point.
///
/// Argument order: environment, class name (internal form, may be null), defining loader,
/// class bytes, byte length. Returns the defined class or null with an exception pending.
pub type DefineClassFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    name: *const c_char,
    loader: jobject,
    buf: *const jbyte,
    len: jsize,
) -> jclass;

/// The JNI environment of the calling thread.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EnvHandle {
    raw: NonNull<JNIEnv>,
    _thread_bound: std::marker::PhantomData<*mut JNIEnv>,
}

impl EnvHandle {
    /// Wraps a raw environment pointer.
    ///
    /// # Safety
    ///
    /// `raw` must be null or a valid `JNIEnv*` for the calling thread, and the handle must not
    /// outlive the native frame it was received in.
    pub unsafe fn from_raw(raw: *mut JNIEnv) -> Option<Self> {
        NonNull::new(raw).map(|raw| EnvHandle {
            raw,
            _thread_bound: std::marker::PhantomData,
        })
    }

    /// Returns the raw pointer.
    pub fn as_raw(&self) -> *mut JNIEnv {
        self.raw.as_ptr()
    }
}

impl fmt::Debug for EnvHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvHandle({:p})", self.raw)
    }
}

/// The host's invocation interface, valid for the lifetime of the VM.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VmHandle(NonNull<JavaVM>);

// SAFETY: a JavaVM pointer is process-wide and usable from any thread.
unsafe impl Send for VmHandle {}
unsafe impl Sync for VmHandle {}

impl VmHandle {
    /// Wraps a raw invocation interface pointer.
    ///
    /// # Safety
    ///
    /// `raw` must be null or the `JavaVM*` of the host this engine is embedded in.
    pub unsafe fn from_raw(raw: *mut JavaVM) -> Option<Self> {
        NonNull::new(raw).map(VmHandle)
    }

    /// Returns the raw pointer.
    pub fn as_raw(&self) -> *mut JavaVM {
        self.0.as_ptr()
    }
}

impl fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VmHandle({:p})", self.0)
    }
}

/// A global reference to a class defined through the engine.
///
/// Handles are opaque: they compare by reference identity and are only meaningful to the host.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassHandle(NonNull<c_void>);

// SAFETY: ClassHandle only ever wraps JNI global references, which are valid on every thread.
unsafe impl Send for ClassHandle {}
unsafe impl Sync for ClassHandle {}

impl ClassHandle {
    /// Wraps a raw global reference.
    ///
    /// # Safety
    ///
    /// `raw` must be null or a JNI global reference (not a local reference).
    pub unsafe fn from_raw(raw: jclass) -> Option<Self> {
        NonNull::new(raw).map(ClassHandle)
    }

    /// Returns the raw global reference.
    pub fn as_raw(&self) -> jclass {
        self.0.as_ptr()
    }
}

impl fmt::Debug for ClassHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassHandle({:p})", self.0)
    }
}

/// Services the engine needs from the host besides the entry point itself.
///
/// The engine calls these on host threads, always with the environment of the calling thread.
/// Production code uses [`JniRuntime`]; tests substitute an implementation that never touches a
/// real VM.
pub trait HostRuntime: Send + Sync {
    /// Promotes `class` (a local reference returned by the entry point) to a global reference.
    ///
    /// Returns `None` when the host could not create the reference.
    fn new_global_ref(&self, env: EnvHandle, class: jclass) -> Option<ClassHandle>;

    /// Releases a global reference previously returned by [`HostRuntime::new_global_ref`].
    fn delete_global_ref(&self, env: EnvHandle, class: ClassHandle);

    /// Returns the host's JNI version, if it can report one.
    fn version(&self, env: EnvHandle) -> Option<jint>;
}
