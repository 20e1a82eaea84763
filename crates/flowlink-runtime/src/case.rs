//! Handler bindings
//!
//! A flow dispatches an event to every handler whose template matches it. The
//! templates and handlers live in a [`Binder`]; [`Case`]s populate the binder
//! when the flow starts and the binder is emptied again when it stops.
//!
//! A template matches an event when the type ids agree, the template's routing
//! handle is zero or equal to the event's, and every field the template set
//! explicitly holds an equal value in the event (see [`Event::equivalent`]).

use std::sync::Arc;

use hashbrown::HashMap;
use smallvec::SmallVec;

use flowlink_core::{Event, Result};

/// Type-erased event handler
pub type Handler = Arc<dyn Fn(&dyn Event) + Send + Sync>;

/// Handler lists returned by [`Binder::handlers_for`]
pub type Handlers = SmallVec<[Handler; 4]>;

// ----------------------------------------------------------------------------
// Case
// ----------------------------------------------------------------------------

/// A unit of handler bindings installed on a flow for the duration of a run
pub trait Case: Send + Sync {
    /// Install bindings. Runs on start, before the first event is dispatched.
    fn setup(&self, binder: &mut Binder) -> Result<()>;

    /// Release resources held by the case. Runs on stop, after the dispatch
    /// loop has finished; the binder is cleared afterwards either way.
    fn teardown(&self, _binder: &mut Binder) {}

    fn name(&self) -> &str {
        "case"
    }
}

/// A [`Case`] built from a setup closure
pub struct FnCase<F> {
    name: String,
    setup: F,
}

impl<F> FnCase<F>
where
    F: Fn(&mut Binder) + Send + Sync,
{
    pub fn new<T: Into<String>>(name: T, setup: F) -> Self {
        Self {
            name: name.into(),
            setup,
        }
    }
}

impl<F> Case for FnCase<F>
where
    F: Fn(&mut Binder) + Send + Sync,
{
    fn setup(&self, binder: &mut Binder) -> Result<()> {
        (self.setup)(binder);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ----------------------------------------------------------------------------
// Binder
// ----------------------------------------------------------------------------

struct Binding {
    template: Box<dyn Event>,
    handler: Handler,
}

/// Type id -> bindings map consulted by the dispatch loop
#[derive(Default)]
pub struct Binder {
    bindings: HashMap<i32, Vec<Binding>>,
}

impl Binder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to events matching `template`
    pub fn bind<E, F>(&mut self, template: E, handler: F) -> &mut Self
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |event: &dyn Event| {
            if let Some(event) = event.downcast_ref::<E>() {
                handler(event);
            }
        });
        self.bind_dyn(Box::new(template), handler)
    }

    /// Bind `handler` to every event of type `E`
    pub fn bind_type<E, F>(&mut self, handler: F) -> &mut Self
    where
        E: Event + Default,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.bind(E::default(), handler)
    }

    /// Bind a type-erased handler
    pub fn bind_dyn(&mut self, template: Box<dyn Event>, handler: Handler) -> &mut Self {
        tracing::trace!("Binding handler for {}", template.type_name());
        self.bindings
            .entry(template.event_type())
            .or_default()
            .push(Binding { template, handler });
        self
    }

    /// Remove every binding for `type_id`
    pub fn unbind_type(&mut self, type_id: i32) -> usize {
        self.bindings
            .remove(&type_id)
            .map(|removed| removed.len())
            .unwrap_or(0)
    }

    /// Whether any binding matches `event`
    pub fn matches(&self, event: &dyn Event) -> bool {
        self.bindings
            .get(&event.event_type())
            .map(|bindings| bindings.iter().any(|b| b.template.equivalent(event)))
            .unwrap_or(false)
    }

    /// Handlers whose template matches `event`, in binding order
    pub fn handlers_for(&self, event: &dyn Event) -> Handlers {
        let mut handlers = Handlers::new();
        if let Some(bindings) = self.bindings.get(&event.event_type()) {
            handlers.extend(
                bindings
                    .iter()
                    .filter(|b| b.template.equivalent(event))
                    .map(|b| Arc::clone(&b.handler)),
            );
        }
        handlers
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    pub fn len(&self) -> usize {
        self.bindings.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl core::fmt::Debug for Binder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Binder")
            .field("types", &self.bindings.len())
            .field("bindings", &self.len())
            .finish()
    }
}
