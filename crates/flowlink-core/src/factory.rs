//! Event factory
//!
//! Deserialization needs a fresh instance of the right concrete type before it can
//! read fields. The factory maps type ids to constructors; links own one and share
//! it with every session.

use hashbrown::HashMap;

use crate::builtin;
use crate::event::Event;

/// Constructor for a registered event type
pub type EventConstructor = fn() -> Box<dyn Event>;

/// Registry of event constructors keyed by type id
#[derive(Clone, Default)]
pub struct EventFactory {
    constructors: HashMap<i32, (EventConstructor, &'static str)>,
}

impl EventFactory {
    /// Create an empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory that knows the builtin protocol events
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        builtin::register_builtins(&mut factory);
        factory
    }

    /// Register `E`, replacing any previous constructor for its type id
    pub fn register<E: Event + Default>(&mut self) -> &mut Self {
        fn construct<E: Event + Default>() -> Box<dyn Event> {
            Box::new(E::default())
        }
        let sample = E::default();
        let type_id = sample.event_type();
        let constructor: EventConstructor = construct::<E>;
        if let Some((_, previous)) = self
            .constructors
            .insert(type_id, (constructor, sample.type_name()))
        {
            if previous != sample.type_name() {
                tracing::warn!(
                    "Event type id {} re-registered: {} replaces {}",
                    type_id,
                    sample.type_name(),
                    previous
                );
            }
        }
        self
    }

    /// Create a default instance of the event registered under `type_id`
    pub fn create(&self, type_id: i32) -> Option<Box<dyn Event>> {
        self.constructors
            .get(&type_id)
            .map(|(constructor, _)| constructor())
    }

    pub fn contains(&self, type_id: i32) -> bool {
        self.constructors.contains_key(&type_id)
    }

    /// Registered type name, for diagnostics
    pub fn type_name(&self, type_id: i32) -> Option<&'static str> {
        self.constructors.get(&type_id).map(|(_, name)| *name)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl core::fmt::Debug for EventFactory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<_> = self.constructors.values().map(|(_, name)| *name).collect();
        names.sort_unstable();
        f.debug_struct("EventFactory").field("types", &names).finish()
    }
}
