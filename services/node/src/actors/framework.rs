//! Core actor types.
//!
//! An actor owns an unbounded FIFO mailbox drained by exactly one task, so
//! its messages are handled one at a time in arrival order:
//! - `Actor` trait for defining behavior
//! - `ActorHandle` for enqueueing from any number of producers
//! - `run_actor_loop` as the single consumer
//!
//! A failing or panicking handler is logged and the loop moves on to the
//! next message.

use std::any::Any;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use shoal_id::ActorId;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// Behavior of one actor.
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop. An `Err` is
    /// logged and processing continues with the next message.
    async fn handle(&mut self, msg: Self::Message, ctx: &mut ActorContext) -> Result<bool, ActorError>;

    /// Called before the first message.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called once the mailbox is drained or the actor asked to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Per-actor bookkeeping handed to every call.
#[derive(Debug)]
pub struct ActorContext {
    /// Actor's id.
    pub actor_id: ActorId,

    /// Messages handled so far, including failed ones.
    pub messages_processed: u64,

    /// Handler errors and panics so far.
    pub failures: u64,

    /// When the last message was taken off the queue.
    pub last_message_at: Option<Instant>,
}

impl ActorContext {
    pub fn new(actor_id: ActorId) -> Self {
        Self {
            actor_id,
            messages_processed: 0,
            failures: 0,
            last_message_at: None,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// The handler failed on one message.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The actor no longer accepts messages.
    #[error("actor {0} stopped")]
    Stopped(ActorId),

    /// No actor with this id.
    #[error("actor {0} not found")]
    NotFound(ActorId),

    /// An actor with this id is already running.
    #[error("actor {0} already exists")]
    AlreadyExists(ActorId),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for enqueueing messages to an actor.
#[derive(Debug)]
pub struct ActorHandle<M: Message> {
    tx: mpsc::UnboundedSender<M>,
    actor_id: ActorId,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id,
        }
    }
}

impl<M: Message> ActorHandle<M> {
    pub(crate) fn new(tx: mpsc::UnboundedSender<M>, actor_id: ActorId) -> Self {
        Self { tx, actor_id }
    }

    /// Enqueue a message. Never blocks.
    pub fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .map_err(|_| ActorError::Stopped(self.actor_id))
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    /// Returns true once the mailbox stopped accepting messages.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

/// Drain the mailbox until it is empty and closed.
///
/// Cancelling `close` stops new messages from being accepted; everything
/// already queued is still handled.
pub(crate) async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::UnboundedReceiver<A::Message>,
    close: CancellationToken,
    actor_id: ActorId,
) {
    let mut ctx = ActorContext::new(actor_id);

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, actor = %actor.name(), error = %e, "Actor failed to start");
        return;
    }
    debug!(actor_id = %actor_id, actor = %actor.name(), "Actor started");

    let mut closing = false;
    loop {
        tokio::select! {
            biased;

            _ = close.cancelled(), if !closing => {
                closing = true;
                rx.close();
                debug!(actor_id = %actor_id, "Actor mailbox closed, draining");
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    break;
                };

                ctx.messages_processed += 1;
                ctx.last_message_at = Some(Instant::now());

                match AssertUnwindSafe(actor.handle(msg, &mut ctx)).catch_unwind().await {
                    Ok(Ok(true)) => {}
                    Ok(Ok(false)) => {
                        info!(actor_id = %actor_id, "Actor requested stop");
                        break;
                    }
                    Ok(Err(e)) => {
                        ctx.failures += 1;
                        error!(actor_id = %actor_id, actor = %actor.name(), error = %e, "Actor handler failed");
                    }
                    Err(panic) => {
                        ctx.failures += 1;
                        error!(
                            actor_id = %actor_id,
                            actor = %actor.name(),
                            panic = %panic_message(panic.as_ref()),
                            "Actor handler panicked"
                        );
                    }
                }
            }
        }
    }

    rx.close();
    actor.on_stop(&mut ctx).await;

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        failures = ctx.failures,
        "Actor stopped"
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
