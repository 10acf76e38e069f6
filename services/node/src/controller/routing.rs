//! Message type to handler routing.
//!
//! Routes are registered once at startup; lookups afterwards are read-only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use shoal_wire::MessageType;
use tracing::warn;

use super::{ActorMessage, DispatchError};

/// What a handler returns: an optional reply payload.
pub type HandlerResult = Result<Option<Bytes>, DispatchError>;

/// Handler used by the stateless controller.
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    async fn handle(&self, msg: &ActorMessage) -> HandlerResult;
}

#[async_trait]
impl<F> PacketHandler for F
where
    F: Fn(&ActorMessage) -> HandlerResult + Send + Sync + 'static,
{
    async fn handle(&self, msg: &ActorMessage) -> HandlerResult {
        self(msg)
    }
}

/// Handler used by the stateful controller; runs inside the entity's actor
/// with exclusive access to its state.
#[async_trait]
pub trait EntityHandler<S: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, state: &mut S, msg: &ActorMessage) -> HandlerResult;
}

#[async_trait]
impl<S, F> EntityHandler<S> for F
where
    S: Send + 'static,
    F: Fn(&mut S, &ActorMessage) -> HandlerResult + Send + Sync + 'static,
{
    async fn handle(&self, state: &mut S, msg: &ActorMessage) -> HandlerResult {
        self(state, msg)
    }
}

/// Table of handlers keyed by message type.
pub struct RoutingTable<H: ?Sized> {
    routes: HashMap<MessageType, Arc<H>>,
}

impl<H: ?Sized> Default for RoutingTable<H> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<H: ?Sized + Send + Sync> RoutingTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `message_type`, replacing any earlier route.
    ///
    /// Handshake types never reach controllers and are not registered.
    pub fn insert(&mut self, message_type: MessageType, handler: Arc<H>) -> &mut Self {
        if message_type.is_handshake() {
            warn!(message_type = %message_type, "Refusing route for reserved handshake type");
            return self;
        }
        if self.routes.insert(message_type, handler).is_some() {
            warn!(message_type = %message_type, "Replaced existing route");
        }
        self
    }

    pub fn get(&self, message_type: MessageType) -> Option<&Arc<H>> {
        self.routes.get(&message_type)
    }

    pub fn contains(&self, message_type: MessageType) -> bool {
        self.routes.contains_key(&message_type)
    }

    /// Registered message types, ascending.
    pub fn message_types(&self) -> Vec<MessageType> {
        let mut types: Vec<MessageType> = self.routes.keys().copied().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl RoutingTable<dyn PacketHandler> {
    /// Builder-style registration of a stateless handler.
    #[must_use]
    pub fn route(mut self, message_type: MessageType, handler: impl PacketHandler) -> Self {
        self.insert(message_type, Arc::new(handler));
        self
    }
}

impl<S: Send + 'static> RoutingTable<dyn EntityHandler<S>> {
    /// Builder-style registration of an entity handler.
    #[must_use]
    pub fn route(mut self, message_type: MessageType, handler: impl EntityHandler<S>) -> Self {
        self.insert(message_type, Arc::new(handler));
        self
    }
}
