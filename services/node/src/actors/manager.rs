//! Registry of running actors keyed by [`ActorId`].
//!
//! The manager owns every actor task. Stopping an actor closes its mailbox,
//! waits up to the drain timeout for queued messages to be handled and
//! aborts the task if it is still running after that.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shoal_id::ActorId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::framework::{run_actor_loop, Actor, ActorError, ActorHandle, Message};

/// Default wait for a mailbox to drain on stop.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct ManagedActor<M: Message> {
    handle: ActorHandle<M>,
    close: CancellationToken,
    task: JoinHandle<()>,
}

/// Concurrent actor registry.
pub struct ActorManager<M: Message> {
    actors: DashMap<ActorId, ManagedActor<M>>,
    drain_timeout: Duration,
}

impl<M: Message> Default for ActorManager<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Message> ActorManager<M> {
    pub fn new() -> Self {
        Self::with_drain_timeout(DEFAULT_DRAIN_TIMEOUT)
    }

    pub fn with_drain_timeout(drain_timeout: Duration) -> Self {
        Self {
            actors: DashMap::new(),
            drain_timeout,
        }
    }

    /// Spawns `actor` under `actor_id`.
    pub fn spawn<A>(&self, actor_id: ActorId, actor: A) -> Result<ActorHandle<M>, ActorError>
    where
        A: Actor<Message = M>,
    {
        match self.actors.entry(actor_id) {
            Entry::Occupied(_) => Err(ActorError::AlreadyExists(actor_id)),
            Entry::Vacant(slot) => Ok(slot.insert(start(actor_id, actor)).handle.clone()),
        }
    }

    /// Returns the running actor, spawning one from `make` if there is none.
    ///
    /// The second value is true if the actor was created by this call.
    pub fn get_or_spawn<A, F>(&self, actor_id: ActorId, make: F) -> (ActorHandle<M>, bool)
    where
        A: Actor<Message = M>,
        F: FnOnce() -> A,
    {
        match self.actors.entry(actor_id) {
            Entry::Occupied(mut existing) if existing.get().handle.is_closed() => {
                // The previous actor stopped on its own; replace it.
                let previous = existing.insert(start(actor_id, make()));
                previous.task.abort();
                (existing.get().handle.clone(), true)
            }
            Entry::Occupied(existing) => (existing.get().handle.clone(), false),
            Entry::Vacant(slot) => (slot.insert(start(actor_id, make())).handle.clone(), true),
        }
    }

    pub fn get(&self, actor_id: ActorId) -> Option<ActorHandle<M>> {
        self.actors.get(&actor_id).map(|actor| actor.handle.clone())
    }

    pub fn contains(&self, actor_id: ActorId) -> bool {
        self.actors.contains_key(&actor_id)
    }

    /// Enqueues `msg` for `actor_id`.
    ///
    /// An actor that stopped on its own is removed on the first failed send.
    pub fn send(&self, actor_id: ActorId, msg: M) -> Result<(), ActorError> {
        let handle = self.get(actor_id).ok_or(ActorError::NotFound(actor_id))?;
        let result = handle.send(msg);
        if result.is_err() {
            self.actors.remove_if(&actor_id, |_, actor| actor.handle.is_closed());
        }
        result
    }

    /// Ids of every registered actor.
    pub fn actor_ids(&self) -> Vec<ActorId> {
        let mut ids: Vec<ActorId> = self.actors.iter().map(|actor| *actor.key()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Stops one actor after draining its mailbox.
    ///
    /// Returns false if no such actor was registered.
    pub async fn stop(&self, actor_id: ActorId) -> bool {
        let Some((_, actor)) = self.actors.remove(&actor_id) else {
            return false;
        };

        actor.close.cancel();
        let mut task = actor.task;
        if tokio::time::timeout(self.drain_timeout, &mut task).await.is_err() {
            warn!(actor_id = %actor_id, "Actor did not drain in time, aborting");
            task.abort();
        }
        true
    }

    /// Stops every actor.
    pub async fn stop_all(&self) {
        let ids: Vec<ActorId> = self.actors.iter().map(|actor| *actor.key()).collect();
        let stopping: Vec<(ActorId, ManagedActor<M>)> = ids
            .into_iter()
            .filter_map(|id| self.actors.remove(&id))
            .collect();

        if stopping.is_empty() {
            return;
        }
        info!(count = stopping.len(), "Stopping all actors");

        for (_, actor) in &stopping {
            actor.close.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        for (actor_id, actor) in stopping {
            let mut task = actor.task;
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!(actor_id = %actor_id, "Force aborting actor");
                task.abort();
            }
        }

        debug!("All actors stopped");
    }
}

fn start<A: Actor>(actor_id: ActorId, actor: A) -> ManagedActor<A::Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    let close = CancellationToken::new();
    let name = actor.name().to_string();
    let task = tokio::spawn(run_actor_loop(actor, rx, close.clone(), actor_id));

    debug!(actor_id = %actor_id, actor = %name, "Spawned actor");

    ManagedActor {
        handle: ActorHandle::new(tx, actor_id),
        close,
        task,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::ActorContext;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    enum Msg {
        Push(u32),
        Sleep(Duration),
        Quit,
    }

    struct Collector {
        out: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl Actor for Collector {
        type Message = Msg;

        fn name(&self) -> &str {
            "collector"
        }

        async fn handle(&mut self, msg: Msg, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
            match msg {
                Msg::Push(n) => self.out.lock().unwrap().push(n),
                Msg::Sleep(d) => tokio::time::sleep(d).await,
                Msg::Quit => return Ok(false),
            }
            Ok(true)
        }
    }

    fn collector() -> (Collector, Arc<Mutex<Vec<u32>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        (Collector { out: Arc::clone(&out) }, out)
    }

    #[tokio::test]
    async fn test_spawn_rejects_duplicate_id() {
        let manager = ActorManager::new();
        let (a, _) = collector();
        let (b, _) = collector();

        manager.spawn(ActorId::new(1), a).unwrap();
        assert!(matches!(
            manager.spawn(ActorId::new(1), b),
            Err(ActorError::AlreadyExists(_))
        ));
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_drains_queue() {
        let manager = ActorManager::new();
        let (actor, out) = collector();
        let id = ActorId::new(7);
        manager.spawn(id, actor).unwrap();

        for n in 0..50 {
            manager.send(id, Msg::Push(n)).unwrap();
        }
        assert!(manager.stop(id).await);
        assert!(!manager.stop(id).await);

        assert_eq!(*out.lock().unwrap(), (0..50).collect::<Vec<_>>());
        assert!(matches!(manager.send(id, Msg::Push(0)), Err(ActorError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_after_drain_timeout() {
        let manager = ActorManager::with_drain_timeout(Duration::from_secs(5));
        let (actor, out) = collector();
        let id = ActorId::new(3);
        manager.spawn(id, actor).unwrap();

        manager.send(id, Msg::Sleep(Duration::from_secs(60))).unwrap();
        manager.send(id, Msg::Push(1)).unwrap();

        let started = tokio::time::Instant::now();
        assert!(manager.stop(id).await);
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
        assert!(out.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_or_spawn_replaces_stopped_actor() {
        let manager = ActorManager::new();
        let id = ActorId::new(9);

        let (first, created) = manager.get_or_spawn(id, || collector().0);
        assert!(created);
        first.send(Msg::Quit).unwrap();
        while !first.is_closed() {
            tokio::task::yield_now().await;
        }

        let (actor, out) = collector();
        let (second, created) = manager.get_or_spawn(id, move || actor);
        assert!(created);
        second.send(Msg::Push(4)).unwrap();
        manager.stop_all().await;
        assert_eq!(*out.lock().unwrap(), vec![4]);

        let (_, created) = manager.get_or_spawn(id, || collector().0);
        assert!(created);
        let (_, created) = manager.get_or_spawn(id, || collector().0);
        assert!(!created);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_per_actor_order_with_concurrent_producers() {
        let manager = Arc::new(ActorManager::new());
        let id = ActorId::new(1);
        let (actor, out) = collector();
        manager.spawn(id, actor).unwrap();

        let producers: Vec<_> = (0..4u32)
            .map(|producer| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    for seq in 0..250u32 {
                        manager.send(id, Msg::Push(producer * 1000 + seq)).unwrap();
                        if seq % 50 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }
        manager.stop(id).await;

        let out = out.lock().unwrap();
        assert_eq!(out.len(), 1000);
        for producer in 0..4u32 {
            let seqs: Vec<u32> = out
                .iter()
                .filter(|v| **v / 1000 == producer)
                .map(|v| v % 1000)
                .collect();
            assert_eq!(seqs, (0..250).collect::<Vec<_>>());
        }
    }
}
