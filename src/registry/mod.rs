//! Everything an embedder has handed to the engine.
//!
//! The [`Registry`] holds requested capabilities, registered transforms and method hooks, event
//! subscribers and the global references of every class defined through the engine. The engine
//! keeps it behind a single lock; the pipeline reads it while that lock is held.
//!
//! # Key Components
//!
//! - [`Registry`] - The container itself
//! - [`transform`] - [`Transform`], [`MethodHook`] and [`RewriteResult`]
//! - [`events`] - [`EventKind`] and [`Subscribers`]

pub mod events;
pub mod transform;

use std::fmt;

pub use events::{EventCallback, EventKind, Subscribers};
pub use transform::{MethodHook, MethodTarget, RewriteResult, Transform};

use crate::host::{jlong, ClassHandle};

/// State registered with an engine.
///
/// Transforms and hooks keep their registration order, which is also the order in which the
/// pipeline runs them.
#[derive(Default)]
pub struct Registry {
    capabilities: Vec<jlong>,
    transforms: Vec<Transform>,
    hooks: Vec<MethodHook>,
    subscribers: Subscribers,
    loaded: Vec<ClassHandle>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds capability codes. Codes already present are ignored.
    pub fn add_capabilities(&mut self, codes: &[jlong]) {
        for code in codes {
            if !self.capabilities.contains(code) {
                self.capabilities.push(*code);
            }
        }
    }

    /// Requested capability codes in the order they were first added.
    pub fn capabilities(&self) -> &[jlong] {
        &self.capabilities
    }

    /// Appends a whole-class transform.
    pub fn add_transform(&mut self, transform: Transform) {
        self.transforms.push(transform);
    }

    /// Registered transforms in registration order.
    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    /// Appends a method hook.
    pub fn add_method_hook(&mut self, hook: MethodHook) {
        self.hooks.push(hook);
    }

    /// Registered method hooks in registration order.
    pub fn method_hooks(&self) -> &[MethodHook] {
        &self.hooks
    }

    /// Method hooks scoped to `class`.
    pub fn hooks_for<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a MethodHook> + 'a {
        self.hooks
            .iter()
            .filter(move |hook| hook.target().matches_class(class))
    }

    /// Event subscribers.
    pub fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    /// Mutable access to the event subscribers.
    pub fn subscribers_mut(&mut self) -> &mut Subscribers {
        &mut self.subscribers
    }

    /// Records a class defined through the engine.
    pub fn record_loaded(&mut self, class: ClassHandle) {
        self.loaded.push(class);
    }

    /// Global references of defined classes, oldest first.
    pub fn loaded(&self) -> &[ClassHandle] {
        &self.loaded
    }

    /// Removes and returns the recorded classes.
    pub fn take_loaded(&mut self) -> Vec<ClassHandle> {
        std::mem::take(&mut self.loaded)
    }

    /// Drops everything that was registered.
    pub fn clear(&mut self) {
        self.capabilities.clear();
        self.transforms.clear();
        self.hooks.clear();
        self.subscribers.clear();
        self.loaded.clear();
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("capabilities", &self.capabilities)
            .field("transforms", &self.transforms.len())
            .field("hooks", &self.hooks.len())
            .field("subscribers", &self.subscribers)
            .field("loaded", &self.loaded.len())
            .finish()
    }
}
