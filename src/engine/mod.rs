//! The embedder-facing engine.
//!
//! An [`Engine`] ties the pieces together: it owns the [`Registry`] of everything the embedder
//! registered, drives the [`Redirector`] during [`Engine::init`] and [`Engine::shutdown`], and
//! runs the [`TransformPipeline`] for every class that reaches [`Engine::define_class`].
//!
//! # Locking
//!
//! Two locks exist, and they are never held at the same time:
//!
//! - the state lock, held briefly to read or update the lifecycle state
//! - the registry lock, held for configuration calls and for the complete pipeline of one load,
//!   including the synchronous `ClassLoad` notification
//!
//! Loads are therefore serialized across all host threads. Callbacks run while the registry
//! lock is held and must not call back into the engine; doing so deadlocks.
//!
//! Every [`Engine::shutdown`] advances a generation counter before it clears the registry. A
//! load whose host call finishes after that point sees the new generation under the registry
//! lock and leaves the cleared registry alone.
//!
//! # Examples
//!
//! ```rust,no_run
//! use classweave::{Engine, EngineConfig, EventKind, RewriteResult, Transform};
//!
//! let engine = Engine::new(EngineConfig::default());
//! engine.add_transformer(Transform::new("marker", |_class, bytes| {
//!     let mut out = bytes.to_vec();
//!     out.push(0xFF);
//!     RewriteResult::Rewritten(out)
//! }))?;
//! engine.subscribe(EventKind::ClassLoad, |class| println!("loaded {class}"));
//!
//! // Somewhere inside the host, e.g. from Agent_OnLoad:
//! let outcome = engine.init(None, None);
//! if !outcome.is_patched() {
//!     eprintln!("running unpatched: {outcome:?}");
//! }
//! # Ok::<(), classweave::Error>(())
//! ```

pub mod intercept;

use std::{
    ffi::c_void,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    config::EngineConfig,
    host::{jint, jlong, ClassHandle, EnvHandle, HostRuntime, JniRuntime, VmHandle},
    patch::{InstalledRedirect, NativeRedirector, Redirector},
    pipeline::{panic_message, TransformPipeline},
    registry::{EventCallback, EventKind, MethodHook, Registry, Transform},
    Error, Result,
};

pub use intercept::DefineRequest;

/// What [`Engine::init`] achieved.
#[derive(Clone, Debug)]
pub enum InitOutcome {
    /// The host entry point is redirected to the engine.
    Patched,
    /// Redirection is disabled in the configuration; loads only arrive through
    /// [`Engine::define_class`] and are delegated to [`EngineConfig::original`].
    Passive,
    /// Installing the redirect failed. The engine keeps working, but the host never routes
    /// classes to it.
    Degraded(Error),
}

impl InitOutcome {
    /// Returns `true` for [`InitOutcome::Patched`].
    pub fn is_patched(&self) -> bool {
        matches!(self, InitOutcome::Patched)
    }

    /// Returns the installation error of a degraded init.
    pub fn error(&self) -> Option<&Error> {
        match self {
            InitOutcome::Degraded(error) => Some(error),
            _ => None,
        }
    }
}

/// Lifecycle state of an [`Engine`].
///
/// The engine counts as initialized while `outcome` is set.
#[derive(Debug, Default)]
pub(crate) struct EngineState {
    vm: Option<VmHandle>,
    installed: Option<InstalledRedirect>,
    outcome: Option<InitOutcome>,
}

impl EngineState {
    pub(crate) fn initialized(&self) -> bool {
        self.outcome.is_some()
    }

    pub(crate) fn installed(&self) -> Option<&InstalledRedirect> {
        self.installed.as_ref()
    }
}

/// Bytecode-instrumentation engine embedded in a host runtime.
///
/// Engines are shared by [`Arc`]; any thread may configure one at any time.
pub struct Engine {
    config: EngineConfig,
    pipeline: TransformPipeline,
    redirector: Box<dyn Redirector>,
    runtime: Box<dyn HostRuntime>,
    state: Mutex<EngineState>,
    registry: Mutex<Registry>,
    generation: AtomicU64,
}

impl Engine {
    /// Creates an engine with the native redirect backend and the JNI runtime binding.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::with_backends(
            config,
            Box::new(NativeRedirector::new()),
            Box::new(JniRuntime::new()),
        )
    }

    /// Creates an engine with explicit backends.
    ///
    /// ## Arguments
    /// * 'config' - Engine configuration
    /// * 'redirector' - Installs the redirect during `init`
    /// * 'runtime' - Reference management of the host
    pub fn with_backends(
        config: EngineConfig,
        redirector: Box<dyn Redirector>,
        runtime: Box<dyn HostRuntime>,
    ) -> Arc<Self> {
        Arc::new(Engine {
            pipeline: TransformPipeline::new(config.catch_panics),
            config,
            redirector,
            runtime,
            state: Mutex::new(EngineState::default()),
            registry: Mutex::new(Registry::new()),
            generation: AtomicU64::new(0),
        })
    }

    /// Starts the engine inside the host.
    ///
    /// Installs the redirect unless the configuration is passive, then notifies the `VmInit`
    /// subscriber. Calling `init` again before [`Engine::shutdown`] does nothing and returns
    /// the outcome of the first call; the redirect is installed at most once.
    ///
    /// Installation failures never propagate: they are logged and reported as
    /// [`InitOutcome::Degraded`].
    pub fn init(self: &Arc<Self>, env: Option<EnvHandle>, vm: Option<VmHandle>) -> InitOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if let Some(outcome) = &state.outcome {
                tracing::debug!("Engine already initialized");
                return outcome.clone();
            }

            state.vm = vm;
            let outcome = if self.config.install_redirect {
                self.install(&mut state)
            } else {
                tracing::info!("Redirect disabled, engine is passive");
                InitOutcome::Passive
            };
            state.outcome = Some(outcome.clone());
            outcome
        };

        if let Some(version) = env.and_then(|env| self.runtime.version(env)) {
            tracing::debug!(version = format_args!("{version:#x}"), "Host JNI version");
        }

        self.post_event(EventKind::VmInit, "");
        outcome
    }

    fn install(self: &Arc<Self>, state: &mut EngineState) -> InitOutcome {
        let global = self.redirector.needs_global_dispatch();
        if global {
            if let Err(error) = intercept::publish(self) {
                tracing::error!(
                    error = %error,
                    "Cannot route the native entry point to this engine"
                );
                return InitOutcome::Degraded(error);
            }
        }

        let replacement = intercept::native_define_class as *const c_void;
        match self.redirector.install(&self.config.target, replacement) {
            Ok(installed) => {
                if global {
                    intercept::remember_original(installed.original());
                }
                state.installed = Some(installed);
                InitOutcome::Patched
            }
            Err(error) => {
                if global {
                    intercept::withdraw(self);
                }
                tracing::error!(
                    symbol = %self.config.target,
                    error = %error,
                    "Failed to install redirect, continuing unpatched"
                );
                InitOutcome::Degraded(error)
            }
        }
    }

    /// Stops the engine.
    ///
    /// Notifies the `VmDeath` subscriber, removes the redirect, releases the global references
    /// of all defined classes and clears the registry. Does nothing if the engine is not
    /// initialized. A later [`Engine::init`] starts from a clean registry, including when a
    /// load was still inside the host while this ran.
    ///
    /// Without `env` the global references cannot be released and are leaked.
    pub fn shutdown(&self, env: Option<EnvHandle>) {
        let installed = {
            let mut state = self.state.lock();
            if state.outcome.take().is_none() {
                return;
            }
            self.generation.fetch_add(1, Ordering::AcqRel);
            state.vm = None;
            state.installed.take()
        };

        self.post_event(EventKind::VmDeath, "");

        if let Some(installed) = installed {
            if let Err(error) = self.redirector.restore(&installed) {
                tracing::error!(
                    address = format_args!("{:#x}", installed.address()),
                    error = %error,
                    "Failed to remove redirect"
                );
            }
        }
        intercept::withdraw(self);

        let loaded = {
            let mut registry = self.registry.lock();
            let loaded = registry.take_loaded();
            registry.clear();
            loaded
        };

        match env {
            Some(env) => {
                for class in loaded {
                    self.runtime.delete_global_ref(env, class);
                }
            }
            None if !loaded.is_empty() => {
                tracing::warn!(
                    count = loaded.len(),
                    "No environment at shutdown, leaking class references"
                );
            }
            None => {}
        }

        tracing::info!("Engine shut down");
    }

    /// Adds capability codes to the advertised set.
    ///
    /// The codes are opaque to the engine and never enforced.
    ///
    /// # Errors
    ///
    /// Currently always succeeds.
    pub fn add_capabilities(&self, codes: &[jlong]) -> Result<()> {
        self.registry.lock().add_capabilities(codes);
        Ok(())
    }

    /// Snapshot of the advertised capability codes.
    pub fn capabilities(&self) -> Vec<jlong> {
        self.registry.lock().capabilities().to_vec()
    }

    /// Appends a whole-class transform. Visible to every load that starts afterwards.
    ///
    /// # Errors
    ///
    /// Currently always succeeds.
    pub fn add_transformer(&self, transform: Transform) -> Result<()> {
        tracing::debug!(name = transform.name(), "Registered transform");
        self.registry.lock().add_transform(transform);
        Ok(())
    }

    /// Appends a method hook. Visible to every load that starts afterwards.
    ///
    /// # Errors
    ///
    /// Currently always succeeds.
    pub fn add_method_hook(&self, hook: MethodHook) -> Result<()> {
        tracing::debug!(target_method = %hook.target(), "Registered method hook");
        self.registry.lock().add_method_hook(hook);
        Ok(())
    }

    /// Enables or disables notifications for `kind`.
    ///
    /// Enabling replaces an existing subscriber; disabling removes it and ignores `callback`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCallback`] when enabling without a callback.
    pub fn set_event_notification_mode(
        &self,
        enable: bool,
        kind: EventKind,
        callback: Option<EventCallback>,
    ) -> Result<()> {
        let mut registry = self.registry.lock();
        if enable {
            let callback = callback.ok_or(Error::MissingCallback(kind))?;
            registry.subscribers_mut().set(kind, callback);
        } else {
            registry.subscribers_mut().remove(kind);
        }
        Ok(())
    }

    /// Subscribes `callback` to `kind`, replacing any previous subscriber.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.registry
            .lock()
            .subscribers_mut()
            .set(kind, Arc::new(callback));
    }

    /// Removes the subscriber of `kind`. Returns `true` if there was one.
    pub fn unsubscribe(&self, kind: EventKind) -> bool {
        self.registry.lock().subscribers_mut().remove(kind).is_some()
    }

    /// Delivers an event to its subscriber on the calling thread.
    ///
    /// The engine only detects class definitions itself; embedders that learn about unloads
    /// by other means forward them here as [`EventKind::ClassUnload`].
    ///
    /// Returns `true` if a subscriber was invoked.
    pub fn post_event(&self, kind: EventKind, class: &str) -> bool {
        let registry = self.registry.lock();
        Self::notify(&registry, kind, class)
    }

    /// Invokes a subscriber, containing any panic it raises.
    fn notify(registry: &Registry, kind: EventKind, class: &str) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| {
            registry.subscribers().dispatch(kind, class)
        })) {
            Ok(delivered) => delivered,
            Err(payload) => {
                tracing::error!(
                    event = %kind,
                    class,
                    panic = panic_message(&*payload),
                    "Event subscriber panicked"
                );
                true
            }
        }
    }

    /// Snapshot of the global references of every class defined through the engine.
    pub fn loaded_classes(&self) -> Vec<ClassHandle> {
        self.registry.lock().loaded().to_vec()
    }

    /// The host's JNI version.
    pub fn version(&self, env: EnvHandle) -> Option<jint> {
        self.runtime.version(env)
    }

    /// Returns `true` between [`Engine::init`] and [`Engine::shutdown`].
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized()
    }

    /// Returns `true` while the redirect is installed.
    pub fn is_patched(&self) -> bool {
        self.state.lock().installed.is_some()
    }

    /// Outcome of the current init, if initialized.
    pub fn outcome(&self) -> Option<InitOutcome> {
        self.state.lock().outcome.clone()
    }

    /// The host's invocation interface handed to [`Engine::init`].
    pub fn vm(&self) -> Option<VmHandle> {
        self.state.lock().vm
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = format!("{:?}", *self.state.lock());
        let registry = self.registry.lock();
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("state", &format_args!("{state}"))
            .field("generation", &self.generation.load(Ordering::Acquire))
            .field("registry", &*registry)
            .finish()
    }
}
