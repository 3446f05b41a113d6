//! Byte-rewriting callbacks.
//!
//! Two kinds of callbacks can rewrite a class on its way to the host:
//!
//! - [`MethodHook`] - scoped to one class/method/signature triple, runs only for that class
//! - [`Transform`] - runs for every class
//!
//! Both report their outcome as a [`RewriteResult`] instead of unwinding, so that the pipeline
//! can keep going when one of them fails.

use std::{fmt, sync::Arc};

/// Outcome of a single rewriting callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteResult {
    /// The callback produced new class bytes.
    Rewritten(Vec<u8>),
    /// The callback left the class as it was.
    Unchanged,
    /// The callback failed; the bytes from before it are kept.
    Failed(String),
}

impl From<Vec<u8>> for RewriteResult {
    fn from(bytes: Vec<u8>) -> Self {
        RewriteResult::Rewritten(bytes)
    }
}

impl<E: fmt::Display> From<std::result::Result<Vec<u8>, E>> for RewriteResult {
    fn from(result: std::result::Result<Vec<u8>, E>) -> Self {
        match result {
            Ok(bytes) => RewriteResult::Rewritten(bytes),
            Err(e) => RewriteResult::Failed(e.to_string()),
        }
    }
}

/// Type alias for whole-class transform callbacks: `(class name, bytes) -> result`.
pub type TransformFn = dyn Fn(&str, &[u8]) -> RewriteResult + Send + Sync;

/// Type alias for method hook callbacks: `(scope, bytes) -> result`.
pub type MethodHookFn = dyn Fn(&MethodTarget, &[u8]) -> RewriteResult + Send + Sync;

/// A whole-class transform.
///
/// # Examples
///
/// ```rust
/// use classweave::{RewriteResult, Transform};
///
/// // Appends a marker byte to every class
/// let marker = Transform::new("marker", |_class, bytes| {
///     let mut out = bytes.to_vec();
///     out.push(0xFF);
///     RewriteResult::Rewritten(out)
/// });
/// assert_eq!(marker.name(), "marker");
/// ```
#[derive(Clone)]
pub struct Transform {
    name: String,
    callback: Arc<TransformFn>,
}

impl Transform {
    /// Creates a named transform.
    ///
    /// The name only appears in diagnostics and failure records.
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&str, &[u8]) -> RewriteResult + Send + Sync + 'static,
    {
        Transform {
            name: name.into(),
            callback: Arc::new(callback),
        }
    }

    /// Returns the transform's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the callback.
    pub fn rewrite(&self, class: &str, bytes: &[u8]) -> RewriteResult {
        (self.callback)(class, bytes)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform").field("name", &self.name).finish()
    }
}

/// The class/method/signature triple a [`MethodHook`] is scoped to.
///
/// Class names use the form the host reports at load time, e.g. `java/lang/String`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodTarget {
    /// Internal class name
    pub class: String,
    /// Method name
    pub method: String,
    /// Method descriptor, e.g. `(Ljava/lang/String;)V`
    pub signature: String,
}

impl MethodTarget {
    /// Creates a new scope.
    pub fn new(
        class: impl Into<String>,
        method: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        MethodTarget {
            class: class.into(),
            method: method.into(),
            signature: signature.into(),
        }
    }

    /// Exact, case-sensitive comparison with the class name of a load.
    pub fn matches_class(&self, class: &str) -> bool {
        self.class == class
    }
}

impl fmt::Display for MethodTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class, self.method, self.signature)
    }
}

/// A rewriting callback for one method of one class.
///
/// The hook fires for every load whose class name equals [`MethodTarget::class`]; method name
/// and signature are handed to the callback, which locates the method in the bytes itself.
///
/// # Examples
///
/// ```rust
/// use classweave::{MethodHook, RewriteResult};
///
/// let hook = MethodHook::new("com/example/Service", "handle", "()V", |target, _bytes| {
///     assert_eq!(target.method, "handle");
///     RewriteResult::Unchanged
/// });
/// assert!(hook.target().matches_class("com/example/Service"));
/// assert!(!hook.target().matches_class("com/example/service"));
/// ```
#[derive(Clone)]
pub struct MethodHook {
    target: MethodTarget,
    callback: Arc<MethodHookFn>,
}

impl MethodHook {
    /// Creates a hook scoped to `class.method signature`.
    pub fn new<F>(
        class: impl Into<String>,
        method: impl Into<String>,
        signature: impl Into<String>,
        callback: F,
    ) -> Self
    where
        F: Fn(&MethodTarget, &[u8]) -> RewriteResult + Send + Sync + 'static,
    {
        MethodHook {
            target: MethodTarget::new(class, method, signature),
            callback: Arc::new(callback),
        }
    }

    /// Returns the hook's scope.
    pub fn target(&self) -> &MethodTarget {
        &self.target
    }

    /// Runs the callback.
    pub fn rewrite(&self, bytes: &[u8]) -> RewriteResult {
        (self.callback)(&self.target, bytes)
    }
}

impl fmt::Debug for MethodHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodHook")
            .field("target", &self.target)
            .finish()
    }
}
