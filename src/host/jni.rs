use std::ffi::c_void;

use super::{jclass, jint, jobject, ClassHandle, EnvHandle, HostRuntime, JNIEnv};

// Slots in the JNINativeInterface function table. The first four are reserved.
const GET_VERSION: usize = 4;
const NEW_GLOBAL_REF: usize = 21;
const DELETE_GLOBAL_REF: usize = 22;

type GetVersionFn = unsafe extern "system" fn(*mut JNIEnv) -> jint;
type NewGlobalRefFn = unsafe extern "system" fn(*mut JNIEnv, jobject) -> jobject;
type DeleteGlobalRefFn = unsafe extern "system" fn(*mut JNIEnv, jobject);

/// [`HostRuntime`] backed by the JNI function table of the calling thread's environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct JniRuntime;

impl JniRuntime {
    /// Creates the runtime binding.
    pub fn new() -> Self {
        JniRuntime
    }
}

/// Reads slot `index` of the function table `env` points to.
///
/// # Safety
///
/// `env` must be a live `JNIEnv*`, and `F` must be the function pointer type of that slot.
unsafe fn function<F: Copy>(env: EnvHandle, index: usize) -> Option<F> {
    debug_assert_eq!(
        std::mem::size_of::<F>(),
        std::mem::size_of::<*const c_void>()
    );

    let table = *(env.as_raw() as *const *const *const c_void);
    if table.is_null() {
        return None;
    }

    let slot = *table.add(index);
    if slot.is_null() {
        return None;
    }

    Some(std::mem::transmute_copy::<*const c_void, F>(&slot))
}

impl HostRuntime for JniRuntime {
    fn new_global_ref(&self, env: EnvHandle, class: jclass) -> Option<ClassHandle> {
        // SAFETY: EnvHandle guarantees a live environment for this thread
        unsafe {
            let new_global_ref = function::<NewGlobalRefFn>(env, NEW_GLOBAL_REF)?;
            ClassHandle::from_raw(new_global_ref(env.as_raw(), class))
        }
    }

    fn delete_global_ref(&self, env: EnvHandle, class: ClassHandle) {
        // SAFETY: EnvHandle guarantees a live environment, ClassHandle a global reference
        unsafe {
            if let Some(delete_global_ref) = function::<DeleteGlobalRefFn>(env, DELETE_GLOBAL_REF)
            {
                delete_global_ref(env.as_raw(), class.as_raw());
            }
        }
    }

    fn version(&self, env: EnvHandle) -> Option<jint> {
        // SAFETY: EnvHandle guarantees a live environment for this thread
        unsafe {
            let get_version = function::<GetVersionFn>(env, GET_VERSION)?;
            Some(get_version(env.as_raw()))
        }
    }
}
