//! Hub
//!
//! Registry of attached flows and the single entry point for posting events.
//! The hub is an ordinary shared service (`Arc<Hub>`) handed to whoever needs
//! to post; links, timers and applications all hold a reference.
//!
//! [`Hub::startup`] starts every flow in attach order and returns a
//! [`FlowsGuard`]; dropping the guard stops them in reverse order, so no flow
//! outlives the scope, even on an early return or a panic.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, info, trace};

use flowlink_core::{Event, FlowError, HeartbeatEvent, Result};

use crate::flow::{current_flow, Flow};

// ----------------------------------------------------------------------------
// Hub
// ----------------------------------------------------------------------------

/// Process-wide router and registry of flows
#[derive(Default)]
pub struct Hub {
    flows: RwLock<Vec<Arc<dyn Flow>>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach `flow`. Names must be unique.
    pub fn attach(&self, flow: Arc<dyn Flow>) -> Result<()> {
        let mut flows = self.flows.write().unwrap_or_else(PoisonError::into_inner);
        if flows.iter().any(|f| f.name() == flow.name()) {
            return Err(FlowError::AlreadyAttached {
                name: flow.name().to_string(),
            }
            .into());
        }
        debug!("Attached flow {}", flow.name());
        flows.push(flow);
        Ok(())
    }

    /// Detach the flow called `name`. The caller owns stopping it.
    pub fn detach(&self, name: &str) -> Option<Arc<dyn Flow>> {
        let mut flows = self.flows.write().unwrap_or_else(PoisonError::into_inner);
        let index = flows.iter().position(|f| f.name() == name)?;
        debug!("Detached flow {}", name);
        Some(flows.remove(index))
    }

    pub fn flow(&self, name: &str) -> Option<Arc<dyn Flow>> {
        self.flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|f| f.name() == name)
            .cloned()
    }

    /// Snapshot of the attached flows in attach order
    pub fn flows(&self) -> Vec<Arc<dyn Flow>> {
        self.flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver `event` to every flow with a matching binding.
    ///
    /// Returns the number of flows that accepted it.
    pub fn post(&self, event: Box<dyn Event>) -> usize {
        let targets: Vec<_> = self
            .flows()
            .into_iter()
            .filter(|flow| flow.matches(event.as_ref()))
            .collect();

        if targets.is_empty() {
            debug!(
                "No flow bound to {} (handle {})",
                event.type_name(),
                event.handle()
            );
            return 0;
        }

        if let Some(current) = current_flow() {
            trace!("{} posted from flow {}", event.type_name(), current);
        }

        let mut delivered = 0;
        let last = targets.len() - 1;
        let mut event = Some(event);
        for (index, flow) in targets.iter().enumerate() {
            let copy = if index == last {
                event.take()
            } else {
                event.as_ref().map(|e| e.clone())
            };
            if let Some(copy) = copy {
                if flow.feed(copy) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// The event driving link keepalives
    pub fn heartbeat_event() -> Box<dyn Event> {
        let mut heartbeat = HeartbeatEvent::new();
        heartbeat.set_transform_eligible(false);
        Box::new(heartbeat)
    }

    /// Start every attached flow in attach order.
    ///
    /// If one fails, the flows already started are stopped in reverse order
    /// and the error is returned.
    pub fn startup(self: &Arc<Self>) -> Result<FlowsGuard> {
        let flows = self.flows();
        for (index, flow) in flows.iter().enumerate() {
            if let Err(e) = flow.start() {
                error!("Flow {} failed to start: {}", flow.name(), e);
                for started in flows[..index].iter().rev() {
                    started.stop();
                }
                return Err(e);
            }
        }
        info!("Hub started {} flows", flows.len());
        Ok(FlowsGuard {
            hub: Arc::clone(self),
            armed: true,
        })
    }

    /// Stop every attached flow in reverse attach order
    pub fn shutdown(&self) {
        let flows = self.flows();
        for flow in flows.iter().rev() {
            flow.stop();
        }
        info!("Hub stopped {} flows", flows.len());
    }
}

impl core::fmt::Debug for Hub {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: Vec<String> = self.flows().iter().map(|f| f.name().to_string()).collect();
        f.debug_struct("Hub").field("flows", &names).finish()
    }
}

// ----------------------------------------------------------------------------
// Flows Guard
// ----------------------------------------------------------------------------

/// Scope of a hub startup; stops all flows when dropped
#[must_use = "dropping the guard stops every flow"]
pub struct FlowsGuard {
    hub: Arc<Hub>,
    armed: bool,
}

impl FlowsGuard {
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Stop every flow now
    pub fn shutdown(mut self) {
        self.armed = false;
        self.hub.shutdown();
    }
}

impl Drop for FlowsGuard {
    fn drop(&mut self) {
        if self.armed {
            self.hub.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{Binder, FnCase};
    use crate::flow::{FlowState, ThreadlessFlow};
    use flowlink_core::{define_event, FlowConfig};

    define_event! {
        pub struct Note = 21 {
            topic: String => set_topic,
        }
    }

    fn listener(name: &str, topic: Option<&str>) -> Arc<ThreadlessFlow> {
        let flow = ThreadlessFlow::new(name, FlowConfig::testing());
        let topic = topic.map(str::to_string);
        flow.add_case(Arc::new(FnCase::new("notes", move |binder: &mut Binder| {
            let mut template = Note::new();
            if let Some(topic) = &topic {
                template.set_topic(topic.clone());
            }
            binder.bind(template, |_: &Note| {});
        })));
        flow
    }

    #[test]
    fn test_attach_rejects_duplicate_names() {
        let hub = Hub::new();
        hub.attach(listener("a", None)).unwrap();
        assert!(hub.attach(listener("a", None)).is_err());
        assert!(hub.flow("a").is_some());
        assert!(hub.detach("a").is_some());
        assert!(hub.flow("a").is_none());
    }

    #[test]
    fn test_post_routes_by_binding() {
        let hub = Hub::new();
        let all = listener("all", None);
        let news = listener("news", Some("news"));
        hub.attach(all.clone()).unwrap();
        hub.attach(news.clone()).unwrap();
        let _guard = hub.startup().unwrap();

        let mut sports = Note::new();
        sports.set_topic("sports".to_string());
        assert_eq!(hub.post(Box::new(sports)), 1);

        let mut headline = Note::new();
        headline.set_topic("news".to_string());
        assert_eq!(hub.post(Box::new(headline)), 2);

        assert_eq!(all.try_dispatch_all(), 2);
        assert_eq!(news.try_dispatch_all(), 1);
    }

    #[test]
    fn test_guard_stops_flows_on_drop() {
        let hub = Hub::new();
        let flow = listener("scoped", None);
        hub.attach(flow.clone()).unwrap();
        {
            let _guard = hub.startup().unwrap();
            assert_eq!(flow.state(), FlowState::Running);
        }
        assert_eq!(flow.state(), FlowState::Stopped);
        assert_eq!(hub.post(Box::new(Note::new())), 0);
    }
}
