//! Stateful controller: one long-lived actor per entity.
//!
//! Packets are routed by their actor id. A packet whose type is marked as
//! "create" spawns the entity if it does not exist yet; any other packet
//! for a missing entity is dropped.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use shoal_id::ActorId;
use shoal_wire::MessageType;
use tracing::{debug, warn};

use super::{
    ActorMessage, DispatchOutcome, DropReason, EntityHandler, EventController, RoutingTable,
};
use crate::actors::{Actor, ActorContext, ActorError, ActorManager};
use crate::topology::RemoteNode;

type InitFn<S> = dyn Fn(ActorId) -> S + Send + Sync;

/// Controller keeping one [`EntityActor`] per actor id.
pub struct StatefulController<S: Send + 'static> {
    routes: Arc<RoutingTable<dyn EntityHandler<S>>>,
    init: Arc<InitFn<S>>,
    create_types: HashSet<MessageType>,
    actors: ActorManager<ActorMessage>,
}

impl<S: Send + 'static> StatefulController<S> {
    /// `init` builds the state of a newly created entity.
    pub fn new(
        routes: RoutingTable<dyn EntityHandler<S>>,
        init: impl Fn(ActorId) -> S + Send + Sync + 'static,
    ) -> Self {
        Self {
            routes: Arc::new(routes),
            init: Arc::new(init),
            create_types: HashSet::new(),
            actors: ActorManager::new(),
        }
    }

    /// Marks `message_type` as creating its target entity on demand.
    #[must_use]
    pub fn create_on(mut self, message_type: MessageType) -> Self {
        self.create_types.insert(message_type);
        self
    }

    /// Uses `actors` instead of a default manager.
    #[must_use]
    pub fn with_actor_manager(mut self, actors: ActorManager<ActorMessage>) -> Self {
        self.actors = actors;
        self
    }

    pub fn actors(&self) -> &ActorManager<ActorMessage> {
        &self.actors
    }

    fn new_actor(&self, actor_id: ActorId) -> EntityActor<S> {
        EntityActor {
            state: (self.init)(actor_id),
            routes: Arc::clone(&self.routes),
        }
    }
}

#[async_trait]
impl<S: Send + 'static> EventController for StatefulController<S> {
    fn on_packet(&self, msg: ActorMessage) -> DispatchOutcome {
        let message_type = msg.message_type();
        let actor_id = msg.actor_id();

        if !self.routes.contains(message_type) {
            warn!(message_type = %message_type, actor_id = %actor_id, "No handler for message type, dropping");
            return DispatchOutcome::Dropped(DropReason::NoHandler(message_type));
        }

        let (handle, created) = if self.create_types.contains(&message_type) {
            self.actors
                .get_or_spawn(actor_id, || self.new_actor(actor_id))
        } else {
            match self.actors.get(actor_id) {
                Some(handle) => (handle, false),
                None => {
                    warn!(
                        message_type = %message_type,
                        actor_id = %actor_id,
                        peer = %msg.replier.peer(),
                        "Actor not found, dropping"
                    );
                    return DispatchOutcome::Dropped(DropReason::UnknownActor(actor_id));
                }
            }
        };

        if handle.send(msg).is_err() {
            warn!(actor_id = %actor_id, message_type = %message_type, "Actor stopped, dropping");
            return DispatchOutcome::Dropped(DropReason::ActorStopped(actor_id));
        }

        if created {
            debug!(actor_id = %actor_id, message_type = %message_type, "Created actor");
            DispatchOutcome::Created
        } else {
            DispatchOutcome::Dispatched
        }
    }

    fn on_leave(&self, node: &Arc<RemoteNode>) {
        debug!(node_id = %node.node_id(), actors = self.actors.len(), "Peer left");
    }

    fn create_actor(&self, actor_id: ActorId) -> bool {
        let (_, created) = self
            .actors
            .get_or_spawn(actor_id, || self.new_actor(actor_id));
        created
    }

    async fn shutdown(&self) {
        self.actors.stop_all().await;
    }
}

// =============================================================================
// Entity Actor
// =============================================================================

/// Actor owning the state of one entity.
pub struct EntityActor<S: Send + 'static> {
    state: S,
    routes: Arc<RoutingTable<dyn EntityHandler<S>>>,
}

#[async_trait]
impl<S: Send + 'static> Actor for EntityActor<S> {
    type Message = ActorMessage;

    fn name(&self) -> &str {
        "entity"
    }

    async fn handle(&mut self, msg: ActorMessage, ctx: &mut ActorContext) -> Result<bool, ActorError> {
        let message_type = msg.message_type();
        let Some(handler) = self.routes.get(message_type).cloned() else {
            warn!(actor_id = %ctx.actor_id, message_type = %message_type, "No handler inside actor");
            return Ok(true);
        };

        match handler.handle(&mut self.state, &msg).await {
            Ok(Some(payload)) => {
                if let Err(e) = msg.reply(payload) {
                    warn!(actor_id = %ctx.actor_id, error = %e, "Failed to queue reply");
                }
                Ok(true)
            }
            Ok(None) => Ok(true),
            Err(e) => Err(ActorError::Handler(e.to_string())),
        }
    }
}
