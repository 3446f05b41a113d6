//! The rewriting pipeline every class passes through before it reaches the host.
//!
//! A load runs in two stages over the same accumulated buffer:
//!
//! 1. Method hooks whose class equals the loading class, in registration order
//! 2. All transforms, in registration order
//!
//! A callback that returns [`RewriteResult::Failed`] (or panics, when panics are caught) does not
//! stop the load: the bytes from before that callback are kept, the failure is recorded as a
//! [`RewriteFailure`], and the next callback runs.
//!
//! # Examples
//!
//! ```rust
//! use classweave::{pipeline::TransformPipeline, registry::Registry, RewriteResult, Transform};
//!
//! let mut registry = Registry::new();
//! registry.add_transform(Transform::new("append", |_, bytes| {
//!     let mut out = bytes.to_vec();
//!     out.push(0xFF);
//!     RewriteResult::Rewritten(out)
//! }));
//!
//! let output = TransformPipeline::new(true).apply(&registry, "a/B", vec![1, 2]);
//! assert_eq!(output.bytes, [1, 2, 0xFF]);
//! assert!(output.failures.is_empty());
//! ```

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
};

use crate::registry::{Registry, RewriteResult};

/// The pipeline stage a callback belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    /// A [`crate::MethodHook`]
    MethodHook,
    /// A [`crate::Transform`]
    Transform,
}

/// A callback that failed while rewriting a class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RewriteFailure {
    /// Stage of the failing callback
    pub stage: Stage,
    /// Transform name, or `class.method signature` for hooks
    pub name: String,
    /// Class that was being rewritten
    pub class: String,
    /// Reported failure, or the panic message
    pub reason: String,
}

impl fmt::Display for RewriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}' failed on {}: {}",
            self.stage, self.name, self.class, self.reason
        )
    }
}

/// Result of running the pipeline over one class.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineOutput {
    /// The bytes to hand to the host
    pub bytes: Vec<u8>,
    /// Callbacks that failed, in the order they ran
    pub failures: Vec<RewriteFailure>,
    /// Number of callbacks that produced new bytes
    pub rewrites: usize,
}

impl PipelineOutput {
    /// Returns `true` if no callback failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs the registered hooks and transforms over class bytes.
#[derive(Clone, Copy, Debug)]
pub struct TransformPipeline {
    catch_panics: bool,
}

impl Default for TransformPipeline {
    fn default() -> Self {
        TransformPipeline::new(true)
    }
}

impl TransformPipeline {
    /// Creates a pipeline.
    ///
    /// ## Arguments
    /// * 'catch_panics' - Treat a panicking callback like one that returned a failure
    pub fn new(catch_panics: bool) -> Self {
        TransformPipeline { catch_panics }
    }

    /// Rewrites `bytes` of `class` with everything in `registry`.
    ///
    /// Never fails: the worst case hands back the input unchanged, with failures recorded.
    pub fn apply(&self, registry: &Registry, class: &str, bytes: Vec<u8>) -> PipelineOutput {
        let mut output = PipelineOutput {
            bytes,
            ..PipelineOutput::default()
        };

        for hook in registry.hooks_for(class) {
            let result = self.invoke(|| hook.rewrite(&output.bytes));
            self.accept(
                &mut output,
                result,
                Stage::MethodHook,
                || hook.target().to_string(),
                class,
            );
        }

        for transform in registry.transforms() {
            let result = self.invoke(|| transform.rewrite(class, &output.bytes));
            self.accept(
                &mut output,
                result,
                Stage::Transform,
                || transform.name().to_string(),
                class,
            );
        }

        output
    }

    fn invoke<F>(&self, callback: F) -> RewriteResult
    where
        F: FnOnce() -> RewriteResult,
    {
        if !self.catch_panics {
            return callback();
        }

        match panic::catch_unwind(AssertUnwindSafe(callback)) {
            Ok(result) => result,
            Err(payload) => {
                RewriteResult::Failed(format!("panicked: {}", panic_message(&*payload)))
            }
        }
    }

    fn accept(
        &self,
        output: &mut PipelineOutput,
        result: RewriteResult,
        stage: Stage,
        name: impl FnOnce() -> String,
        class: &str,
    ) {
        match result {
            RewriteResult::Rewritten(bytes) => {
                output.bytes = bytes;
                output.rewrites += 1;
            }
            RewriteResult::Unchanged => {}
            RewriteResult::Failed(reason) => {
                let failure = RewriteFailure {
                    stage,
                    name: name(),
                    class: class.to_string(),
                    reason,
                };
                tracing::warn!(
                    stage = %failure.stage,
                    name = %failure.name,
                    class = %failure.class,
                    reason = %failure.reason,
                    "Rewrite failed, keeping previous bytes"
                );
                output.failures.push(failure);
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
