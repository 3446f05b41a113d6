//! Event kinds and their subscribers.

use std::{fmt, sync::Arc};

use strum::{EnumCount, EnumIter, FromRepr};

/// Lifecycle events an embedder can subscribe to.
///
/// The discriminants are the raw codes of the embedder-facing interface.
///
/// | Kind | Fired by |
/// |------|----------|
/// | [`EventKind::ClassLoad`] | every successful class definition through the engine |
/// | [`EventKind::ClassUnload`] | only [`crate::Engine::post_event`]; unloads are not detected |
/// | [`EventKind::VmInit`] | [`crate::Engine::init`] |
/// | [`EventKind::VmDeath`] | [`crate::Engine::shutdown`] |
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, EnumIter, EnumCount, FromRepr,
)]
#[strum(serialize_all = "kebab-case")]
#[repr(i32)]
pub enum EventKind {
    /// A class was defined
    ClassLoad = 1,
    /// A class was unloaded
    ClassUnload = 2,
    /// The engine was initialized inside the host
    VmInit = 3,
    /// The engine is shutting down
    VmDeath = 4,
}

impl EventKind {
    fn slot(self) -> usize {
        self as usize - 1
    }
}

/// Callback invoked with the class name of an event (empty for VM events).
pub type EventCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// At most one subscriber per [`EventKind`].
#[derive(Default, Clone)]
pub struct Subscribers {
    slots: [Option<EventCallback>; EventKind::COUNT],
}

impl Subscribers {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `kind`, returning the subscriber it replaced.
    pub fn set(&mut self, kind: EventKind, callback: EventCallback) -> Option<EventCallback> {
        self.slots[kind.slot()].replace(callback)
    }

    /// Removes the subscriber for `kind`.
    pub fn remove(&mut self, kind: EventKind) -> Option<EventCallback> {
        self.slots[kind.slot()].take()
    }

    /// Returns the subscriber for `kind`.
    pub fn get(&self, kind: EventKind) -> Option<&EventCallback> {
        self.slots[kind.slot()].as_ref()
    }

    /// Returns `true` if someone listens to `kind`.
    pub fn is_subscribed(&self, kind: EventKind) -> bool {
        self.get(kind).is_some()
    }

    /// Invokes the subscriber of `kind` synchronously on the calling thread.
    ///
    /// Returns `true` if a subscriber was invoked.
    pub fn dispatch(&self, kind: EventKind, class: &str) -> bool {
        match self.get(kind) {
            Some(callback) => {
                callback(class);
                true
            }
            None => false,
        }
    }

    /// Number of kinds with a subscriber.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns `true` if no kind has a subscriber.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all subscribers.
    pub fn clear(&mut self) {
        self.slots = Default::default();
    }
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use strum::IntoEnumIterator;

        f.debug_list()
            .entries(EventKind::iter().filter(|kind| self.is_subscribed(*kind)))
            .finish()
    }
}
