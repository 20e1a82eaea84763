//! Hub bindings for a link
//!
//! Installs the link's timers on a flow: the hub-wide heartbeat drives every
//! session's keepalive, setup timeouts fail sessions stuck in a handshake, and
//! recovery timeouts scheduled by this link expire dropped sessions. The case holds the link weakly so a flow never keeps a
//! closed link alive.

use std::sync::{Arc, Weak};

use tracing::debug;

use flowlink_core::{Event, HeartbeatEvent, Result};
use flowlink_runtime::{Binder, Case};

use crate::events::{SessionRecoveryTimeout, SessionSetupTimeout};
use crate::link::LinkCore;

pub struct LinkCase {
    link: Weak<LinkCore>,
    name: String,
}

impl LinkCase {
    pub fn new(link: &Arc<LinkCore>) -> Self {
        Self {
            link: Arc::downgrade(link),
            name: format!("link:{}", link.name()),
        }
    }
}

impl Case for LinkCase {
    fn setup(&self, binder: &mut Binder) -> Result<()> {
        let link = self.link.clone();
        binder.bind(HeartbeatEvent::new(), move |heartbeat: &HeartbeatEvent| {
            // Only the hub-wide tick; peer heartbeats carry a session handle
            if heartbeat.handle() != 0 {
                return;
            }
            if let Some(link) = link.upgrade() {
                link.on_heartbeat();
            }
        });

        let Some(core) = self.link.upgrade() else {
            return Ok(());
        };
        let mut template = SessionRecoveryTimeout::new();
        template.set_link(core.name().to_string());
        let link = self.link.clone();
        binder.bind(template, move |timeout: &SessionRecoveryTimeout| {
            if let Some(link) = link.upgrade() {
                link.on_recovery_timeout(timeout.token());
            }
        });

        let mut template = SessionSetupTimeout::new();
        template.set_link(core.name().to_string());
        let link = self.link.clone();
        binder.bind(template, move |timeout: &SessionSetupTimeout| {
            if let Some(link) = link.upgrade() {
                link.on_setup_timeout(timeout.handle(), *timeout.epoch());
            }
        });
        debug!("Installed {}", self.name);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
