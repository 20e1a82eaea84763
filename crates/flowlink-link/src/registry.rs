//! Session registry
//!
//! Process-wide bookkeeping shared by links: the pool of session handles and
//! the token map used to find a dropped session when its client comes back.
//! Create one and hand it to every link that should share handle space; links
//! built without one get a private registry.
//!
//! A session lock may be held when calling into the registry, never the
//! reverse.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use hashbrown::HashMap;
use tracing::trace;
use uuid::Uuid;

use crate::session::LinkSession;

#[derive(Debug, Default)]
struct HandlePool {
    next: u64,
    free: BinaryHeap<Reverse<u64>>,
}

/// Handle pool and token map
#[derive(Default)]
pub struct SessionRegistry {
    handles: Mutex<HandlePool>,
    tokens: RwLock<HashMap<String, Weak<LinkSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lowest free handle. Handles start at 1; 0 means unassigned.
    pub fn acquire(&self) -> u64 {
        let mut pool = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(Reverse(handle)) = pool.free.pop() {
            return handle;
        }
        pool.next += 1;
        pool.next
    }

    /// Return `handle` to the pool
    pub fn release(&self, handle: u64) {
        if handle == 0 {
            return;
        }
        trace!("Released handle {}", handle);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free
            .push(Reverse(handle));
    }

    /// Fresh random token
    pub fn mint_token(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn bind_token(&self, token: &str, session: &Arc<LinkSession>) {
        if token.is_empty() {
            return;
        }
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.to_string(), Arc::downgrade(session));
    }

    /// Session registered under `token`, if it is still alive
    pub fn lookup(&self, token: &str) -> Option<Arc<LinkSession>> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .and_then(Weak::upgrade)
    }

    pub fn unbind_token(&self, token: &str) {
        if token.is_empty() {
            return;
        }
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }

    /// Number of registered tokens
    pub fn token_count(&self) -> usize {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl core::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("tokens", &self.token_count())
            .finish()
    }
}
