//! Actors: entities with their own ordered mailbox.

mod framework;
mod manager;

pub use framework::{Actor, ActorContext, ActorError, ActorHandle, Message};
pub use manager::{ActorManager, DEFAULT_DRAIN_TIMEOUT};
