//! Native event bridge
//!
//! The driver library addresses callbacks through an opaque `user_data`
//! pointer with no notion of sessions. Each registered [`EventContext`] gets
//! a [`ContextToken`] stored behind that pointer, and upcalls are routed back
//! through the bridge, which owns the `token -> context` map.
//!
//! Upcalls may arrive on a thread other than the one driving the poll loop,
//! so every registry access goes through one mutex. Handlers run outside it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::events::{Event, EventHandler, NativeEvent};

static GLOBAL_BRIDGE: Lazy<Arc<EventBridge>> = Lazy::new(|| Arc::new(EventBridge::new()));

/// Correlation token handed to the native side. Tokens are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextToken(u64);

impl ContextToken {
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

struct ContextShared {
    handler: Mutex<Box<dyn EventHandler>>,
    token: Mutex<Option<ContextToken>>,
}

/// An application event handler together with its registration state.
///
/// Clones share the same handler and registration.
#[derive(Clone)]
pub struct EventContext {
    shared: Arc<ContextShared>,
}

impl EventContext {
    pub fn new(handler: impl EventHandler + 'static) -> Self {
        Self {
            shared: Arc::new(ContextShared {
                handler: Mutex::new(Box::new(handler)),
                token: Mutex::new(None),
            }),
        }
    }

    /// Token of the current registration, if any
    pub fn token(&self) -> Option<ContextToken> {
        *self.shared.token.lock()
    }

    pub fn is_registered(&self) -> bool {
        self.token().is_some()
    }

    /// Record `token` as the registration. Fails with the existing token if
    /// the context is already registered.
    pub(crate) fn bind(&self, token: ContextToken) -> Result<()> {
        let mut current = self.shared.token.lock();
        match *current {
            Some(existing) => Err(Error::ContextAlreadyRegistered(existing)),
            None => {
                *current = Some(token);
                Ok(())
            }
        }
    }

    pub(crate) fn unbind(&self) {
        *self.shared.token.lock() = None;
    }

    /// Returns false when the handler did not opt into this kind
    fn deliver(&self, event: NativeEvent<'_>) -> bool {
        let mut handler = self.shared.handler.lock();
        if !handler.interests().contains(event.kind().mask()) {
            return false;
        }
        Event::from(event).deliver_to(&mut **handler);
        true
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("token", &self.token())
            .finish_non_exhaustive()
    }
}

/// Registry mapping correlation tokens to event contexts
pub struct EventBridge {
    next_token: AtomicU64,
    contexts: Mutex<HashMap<ContextToken, EventContext>>,
}

impl EventBridge {
    /// Create an isolated registry
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide registry used by sessions opened without an explicit bridge
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_BRIDGE)
    }

    pub fn issue_token(&self) -> ContextToken {
        ContextToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, token: ContextToken, context: EventContext) -> Result<()> {
        let mut contexts = self.contexts.lock();
        if contexts.contains_key(&token) {
            return Err(Error::ContextAlreadyRegistered(token));
        }
        contexts.insert(token, context);
        debug!("Registered event context {}", token);
        Ok(())
    }

    pub fn unregister(&self, token: ContextToken) -> Result<EventContext> {
        let context = self
            .contexts
            .lock()
            .remove(&token)
            .ok_or(Error::ContextNotRegistered)?;
        debug!("Unregistered event context {}", token);
        Ok(context)
    }

    pub fn contains(&self, token: ContextToken) -> bool {
        self.contexts.lock().contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route one upcall to its context.
    ///
    /// Returns `Ok(false)` when the handler has not opted into this event kind.
    /// An unknown token means the native side holds a token this bridge never
    /// issued or already released, which is reported as
    /// [`Error::IntegrityViolation`].
    pub fn dispatch(&self, token: ContextToken, event: NativeEvent<'_>) -> Result<bool> {
        let context = self.contexts.lock().get(&token).cloned();
        let Some(context) = context else {
            error!("Native event {:?} for unknown context {}", event.kind(), token);
            return Err(Error::IntegrityViolation(token));
        };

        let delivered = context.deliver(event);
        if !delivered {
            trace!("Dropped {:?} event for {}: not subscribed", event.kind(), token);
        }
        Ok(delivered)
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new()
    }
}
