//! Link notifications posted through the hub.
//!
//! Each carries the session handle as its routing handle and the link name in
//! `link`, so a case can bind to one link with a template.

use flowlink_core::{define_event, Event, EventFactory};

define_event! {
    /// A session finished setup, or failed to
    pub struct LinkSessionConnected = -30 {
        link: String => set_link,
        result: bool => set_result,
        context: String => set_context,
    }
}

define_event! {
    /// An established session is gone for good
    pub struct LinkSessionDisconnected = -31 {
        link: String => set_link,
        context: String => set_context,
    }
}

define_event! {
    /// A dropped session resumed on a new connection
    pub struct LinkSessionRecovered = -32 {
        link: String => set_link,
        token: String => set_token,
    }
}

define_event! {
    /// Server-side expiry of a recoverable session
    pub struct SessionRecoveryTimeout = -40 {
        link: String => set_link,
        token: String => set_token,
    }
}

define_event! {
    /// Deadline of a session's current setup stage. `epoch` identifies the
    /// stage it was armed for.
    pub struct SessionSetupTimeout = -41 {
        link: String => set_link,
        epoch: u64 => set_epoch,
    }
}

/// Register the link notifications, e.g. for flows that log or forward them
pub fn register_link_events(factory: &mut EventFactory) {
    factory
        .register::<LinkSessionConnected>()
        .register::<LinkSessionDisconnected>()
        .register::<LinkSessionRecovered>()
        .register::<SessionRecoveryTimeout>()
        .register::<SessionSetupTimeout>();
}

pub(crate) fn connected(link: &str, handle: u64, result: bool, context: &str) -> Box<LinkSessionConnected> {
    let mut event = LinkSessionConnected::new().with_handle(handle);
    event
        .set_link(link.to_string())
        .set_result(result)
        .set_context(context.to_string());
    Box::new(event)
}

pub(crate) fn disconnected(link: &str, handle: u64, context: &str) -> Box<LinkSessionDisconnected> {
    let mut event = LinkSessionDisconnected::new().with_handle(handle);
    event
        .set_link(link.to_string())
        .set_context(context.to_string());
    Box::new(event)
}

pub(crate) fn recovered(link: &str, handle: u64, token: &str) -> Box<LinkSessionRecovered> {
    let mut event = LinkSessionRecovered::new().with_handle(handle);
    event.set_link(link.to_string()).set_token(token.to_string());
    Box::new(event)
}

pub(crate) fn recovery_timeout(link: &str, token: &str) -> Box<SessionRecoveryTimeout> {
    let mut event = SessionRecoveryTimeout::new();
    event.set_link(link.to_string()).set_token(token.to_string());
    event.set_transform_eligible(false);
    Box::new(event)
}

pub(crate) fn setup_timeout(link: &str, handle: u64, epoch: u64) -> Box<SessionSetupTimeout> {
    let mut event = SessionSetupTimeout::new().with_handle(handle);
    event.set_link(link.to_string()).set_epoch(epoch);
    event.set_transform_eligible(false);
    Box::new(event)
}
