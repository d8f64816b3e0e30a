//! The per-instance task

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use super::{ActorRef, Phase, Services, View};
use crate::actor::{
    evaluate, initial_states, project, ActorInput, ChildEvent, ContextOf, Effect, Envelope,
    EnvelopeOf, Event, Machine, RawEvent, Region, StateValue,
};
use crate::child::{
    ChildHandle, ChildProxy, ChildStatus, ChildTable, Observed, ParentInbox, ProxyLinks,
};
use crate::error::{KitError, Result};
use crate::storage::{PersistedState, ScopedStorage};
use crate::sync::{diff, Applied, EventSink, Frame, StaleReason, SyncChannel};
use crate::types::{ActorKey, Caller, Revision};

pub(crate) enum Command<M: Machine> {
    Event(EnvelopeOf<M>),
    Subscribe {
        caller: Caller,
        reply: oneshot::Sender<Result<SyncChannel>>,
    },
    Unsubscribe(u64),
    Snapshot {
        caller: Caller,
        reply: oneshot::Sender<Result<View>>,
    },
    Children {
        reply: oneshot::Sender<Vec<ChildStatus>>,
    },
}

struct Subscriber {
    id: u64,
    caller: Caller,
    frames: mpsc::Sender<Frame>,
    /// Last snapshot sent on this channel, the base for the next patch
    last: Value,
}

/// State owned by one instance task
pub struct ActorRuntime<M: Machine> {
    key: ActorKey,
    machine: Arc<M>,
    regions: Vec<Box<dyn Region<M>>>,
    context: ContextOf<M>,
    states: StateValue,
    revision: Revision,
    children: ChildTable,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    storage: ScopedStorage,
    services: Services,
    inbox: mpsc::WeakSender<Command<M>>,
}

impl<M: Machine> ActorRuntime<M> {
    /// Start the task for a new instance and return its handle
    pub fn spawn(machine: Arc<M>, input: ActorInput, services: Services) -> Arc<dyn ActorRef> {
        let (tx, rx) = mpsc::channel(services.config.inbox_capacity.max(1));
        let (phase_tx, phase_rx) = watch::channel(Phase::Created);

        let regions = machine.regions();
        let runtime = Self {
            key: input.key.clone(),
            context: machine.initial_context(&input),
            states: initial_states(&regions),
            regions,
            revision: Revision::genesis(),
            children: ChildTable::default(),
            subscribers: Vec::new(),
            next_subscriber: 0,
            storage: ScopedStorage::new(services.storage.clone(), input.key.clone()),
            services,
            inbox: tx.downgrade(),
            machine: machine.clone(),
        };
        tokio::spawn(runtime.run(rx, phase_tx));

        Arc::new(RuntimeHandle {
            key: input.key,
            machine,
            inbox: tx,
            phase: phase_rx,
        })
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<Command<M>>, phase: watch::Sender<Phase>) {
        self.restore().await;
        phase.send_replace(Phase::Active);
        info!(
            actor_type = %self.key.actor_type,
            actor_id = %self.key.actor_id,
            revision = %self.revision,
            "instance active"
        );

        while let Some(command) = inbox.recv().await {
            match command {
                Command::Event(envelope) => self.handle(envelope).await,
                Command::Subscribe { caller, reply } => {
                    let _ = reply.send(self.subscribe(caller));
                }
                Command::Unsubscribe(id) => self.unsubscribe(id),
                Command::Snapshot { caller, reply } => {
                    let _ = reply.send(self.view(&caller));
                }
                Command::Children { reply } => {
                    let _ = reply.send(self.children.status());
                }
            }
        }

        phase.send_replace(Phase::Stopped);
        debug!(actor = %self.key, "instance stopped");
    }

    async fn restore(&mut self) {
        let saved = match self.storage.load_state().await {
            Ok(Some(saved)) => saved,
            Ok(None) => return,
            Err(err) => {
                warn!(actor = %self.key, error = %err, "failed to load persisted state");
                return;
            }
        };

        match serde_json::from_value::<ContextOf<M>>(saved.context) {
            Ok(context) => {
                self.context = context;
                self.revision = saved.revision;
                for (region, state) in saved.states {
                    if let Some(slot) = self.states.get_mut(&region) {
                        *slot = state;
                    }
                }
                info!(actor = %self.key, revision = %self.revision, "restored persisted state");
            }
            Err(err) => {
                warn!(
                    actor = %self.key,
                    error = %err,
                    "persisted context unreadable, starting fresh"
                );
            }
        }
    }

    async fn persist(
        &self,
        context: &ContextOf<M>,
        states: &StateValue,
        revision: Revision,
    ) -> Result<()> {
        let state = PersistedState {
            revision,
            context: serde_json::to_value(context)?,
            states: states.clone(),
        };
        self.storage.save_state(&state).await?;
        Ok(())
    }

    async fn handle(&mut self, envelope: EnvelopeOf<M>) {
        if let Event::Child(event) = &envelope.event {
            self.observe_child(event);
        }

        let outcome = evaluate(
            &self.regions,
            &self.states,
            &self.context,
            &envelope,
            &self.children,
        );

        for (region, guard) in &outcome.denied {
            debug!(
                target: "kitchencraft::audit",
                actor = %self.key,
                caller = %envelope.caller,
                region,
                ?guard,
                "event denied"
            );
        }

        if !outcome.accepted {
            trace!(actor = %self.key, origin = ?envelope.origin(), "event ignored");
            return;
        }

        // A revision is published only once it is stored, so a restart
        // never hands out a revision number twice.
        let revision = self.revision.next();
        let context = outcome.context.as_ref().unwrap_or(&self.context);
        if let Err(err) = self.persist(context, &outcome.states, revision).await {
            warn!(
                target: "kitchencraft::audit",
                actor = %self.key,
                caller = %envelope.caller,
                %revision,
                error = %err,
                "state not persisted, event dropped"
            );
            return;
        }

        if let Some(context) = outcome.context {
            self.context = context;
        }
        self.states = outcome.states;
        self.revision = revision;

        self.run_effects(outcome.effects);
        self.publish();
    }

    fn observe_child(&mut self, event: &ChildEvent) {
        let child = event.key();
        match self.children.observe(event) {
            Observed::Applied(Applied::Stale(reason)) => {
                warn!(actor = %self.key, %child, ?reason, "child cache stale");
                // A remote error means the proxy is already reconnecting.
                if !matches!(reason, StaleReason::Remote(_)) {
                    if let Some(handle) = self.children.get(&child.actor_id) {
                        handle.proxy().resync();
                    }
                }
            }
            Observed::Applied(_) => {}
            Observed::Removed => info!(actor = %self.key, %child, "child handle removed"),
            Observed::Unknown => debug!(actor = %self.key, %child, "event for unknown child"),
        }
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::SpawnChild {
                    actor_type,
                    child_id,
                    caller,
                } => self.spawn_child(ActorKey::new(actor_type, child_id), caller),
                Effect::ForwardToChild { child_id, event } => {
                    let Some(handle) = self.children.get(&child_id) else {
                        warn!(actor = %self.key, child = %child_id, "no handle for child");
                        continue;
                    };
                    if !handle.proxy().forward(event) {
                        warn!(actor = %self.key, child = %child_id, "child proxy gone");
                    }
                }
            }
        }
    }

    fn spawn_child(&mut self, key: ActorKey, caller: Caller) {
        if self.children.contains(&key.actor_id) {
            debug!(actor = %self.key, child = %key, "child already spawned");
            return;
        }

        let links = ProxyLinks {
            issuer: self.services.issuer.clone(),
            connector: self.services.connector.clone(),
            parent: Arc::new(InboxLink(self.inbox.clone())),
            policy: self.services.config.reconnect,
        };
        let proxy = ChildProxy::spawn(key.clone(), caller.clone(), links);
        info!(actor = %self.key, child = %key, caller = %caller, "spawned child");
        self.children.insert(ChildHandle::new(key, caller, proxy));
    }

    fn publish(&mut self) {
        let key = &self.key;
        let context = &self.context;
        let states = &self.states;
        let revision = self.revision;

        self.subscribers.retain_mut(|sub| {
            let next = match project(context, states, &sub.caller) {
                Ok(next) => next,
                Err(err) => {
                    warn!(actor = %key, subscriber = sub.id, error = %err, "projection failed");
                    return false;
                }
            };
            let operations = diff(&sub.last, &next);
            sub.last = next;

            match sub.frames.try_send(Frame::Updated {
                key: key.clone(),
                operations,
                revision,
            }) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(actor = %key, subscriber = sub.id, "subscriber lagging, dropped");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    fn subscribe(&mut self, caller: Caller) -> Result<SyncChannel> {
        let inbox = self
            .inbox
            .upgrade()
            .ok_or_else(|| KitError::InstanceUnavailable(self.key.clone()))?;
        let snapshot = project(&self.context, &self.states, &caller)?;

        let (tx, rx) = mpsc::channel(self.services.config.subscriber_capacity.max(1));
        tx.try_send(Frame::Initialized {
            key: self.key.clone(),
            snapshot: snapshot.clone(),
            revision: self.revision,
        })
        .map_err(|_| KitError::ChannelClosed(self.key.clone()))?;

        let id = self.next_subscriber;
        self.next_subscriber += 1;
        self.subscribers.push(Subscriber {
            id,
            caller: caller.clone(),
            frames: tx,
            last: snapshot,
        });
        debug!(
            actor = %self.key,
            caller = %caller,
            subscriber = id,
            revision = %self.revision,
            "subscriber attached"
        );

        let sink = LocalSink {
            key: self.key.clone(),
            caller: caller.clone(),
            machine: self.machine.clone(),
            inbox,
            subscriber: id,
        };
        Ok(SyncChannel::new(self.key.clone(), caller, rx, sink))
    }

    fn unsubscribe(&mut self, id: u64) {
        let before = self.subscribers.len();
        self.subscribers.retain(|sub| sub.id != id);
        if self.subscribers.len() != before {
            debug!(actor = %self.key, subscriber = id, "subscriber detached");
        }
    }

    fn view(&self, caller: &Caller) -> Result<View> {
        Ok(View {
            snapshot: project(&self.context, &self.states, caller)?,
            revision: self.revision,
        })
    }
}

/// A child proxy's path back into its parent's inbox
///
/// Weak, so live children never keep a parent running.
struct InboxLink<M: Machine>(mpsc::WeakSender<Command<M>>);

#[async_trait]
impl<M: Machine> ParentInbox for InboxLink<M> {
    async fn deliver(&self, event: ChildEvent) -> bool {
        let Some(inbox) = self.0.upgrade() else {
            return false;
        };
        inbox
            .send(Command::Event(Envelope::child(event)))
            .await
            .is_ok()
    }
}

/// Outbound half of a locally attached channel
struct LocalSink<M: Machine> {
    key: ActorKey,
    caller: Caller,
    machine: Arc<M>,
    inbox: mpsc::Sender<Command<M>>,
    subscriber: u64,
}

#[async_trait]
impl<M: Machine> EventSink for LocalSink<M> {
    async fn send(&self, payload: Value) -> Result<()> {
        let raw = RawEvent::from_caller(self.caller.clone(), payload);
        let event = self.machine.parse_event(&raw)?;
        self.inbox
            .send(Command::Event(Envelope::new(event, raw.caller)))
            .await
            .map_err(|_| KitError::InstanceUnavailable(self.key.clone()))
    }

    fn close(&self) {
        let _ = self.inbox.try_send(Command::Unsubscribe(self.subscriber));
    }
}

struct RuntimeHandle<M: Machine> {
    key: ActorKey,
    machine: Arc<M>,
    inbox: mpsc::Sender<Command<M>>,
    phase: watch::Receiver<Phase>,
}

impl<M: Machine> RuntimeHandle<M> {
    fn unavailable(&self) -> KitError {
        KitError::InstanceUnavailable(self.key.clone())
    }
}

#[async_trait]
impl<M: Machine> ActorRef for RuntimeHandle<M> {
    fn key(&self) -> &ActorKey {
        &self.key
    }

    fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    async fn send(&self, raw: RawEvent) -> Result<()> {
        let event = self.machine.parse_event(&raw)?;
        self.inbox
            .send(Command::Event(Envelope::new(event, raw.caller)))
            .await
            .map_err(|_| self.unavailable())
    }

    async fn subscribe(&self, caller: Caller) -> Result<SyncChannel> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(Command::Subscribe { caller, reply })
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())?
    }

    async fn snapshot(&self, caller: Caller) -> Result<View> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(Command::Snapshot { caller, reply })
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())?
    }

    async fn children(&self) -> Result<Vec<ChildStatus>> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(Command::Children { reply })
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }
}
