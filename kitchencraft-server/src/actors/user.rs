//! The user actor.
//!
//! One instance per signed-in user. It owns the user's thread children:
//! the first `NEW_MESSAGE` for a thread id spawns a thread actor, later
//! ones are forwarded through the existing handle. Frames coming back from
//! each thread are folded into the caller's private thread summaries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kitchencraft_kit::actor::{ContextOf, Scope};
use kitchencraft_kit::{
    ActorInput, ActorType, ChildEvent, Context, Effect, Event, Guard, Machine, Owned, Region,
    Step, Transition,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::thread::THREAD;

pub const USER: &str = "user";

/// Entries kept in `recentThreadIds`
pub const RECENT_THREADS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPublic {
    pub owner_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl Owned for UserPublic {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPrivate {
    /// Most recent first
    pub recent_thread_ids: Vec<String>,
    pub threads: BTreeMap<String, ThreadSummary>,
}

/// Where the parent's link to a thread stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Connecting,
    Synced,
    Stale,
    Failed,
    Closed,
}

/// What the user knows about one of its threads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub status: ThreadStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: u64,
}

impl ThreadSummary {
    fn connecting() -> Self {
        Self {
            status: ThreadStatus::Connecting,
            created_at: None,
            last_message_at: None,
            message_count: 0,
        }
    }

    /// Copy the thread's public fields from its synced snapshot
    fn refresh(&mut self, snapshot: &Value) {
        let public = &snapshot["public"];
        self.status = ThreadStatus::Synced;
        self.created_at = serde_json::from_value(public["createdAt"].clone()).ok().flatten();
        self.last_message_at = serde_json::from_value(public["lastMessageAt"].clone())
            .ok()
            .flatten();
        self.message_count = public["messageCount"].as_u64().unwrap_or(0);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserClientEvent {
    #[serde(rename_all = "camelCase")]
    NewMessage {
        thread_id: String,
        text: String,
        message_id: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserServiceEvent {
    /// Recipe payloads are opaque here
    SyncRecipes { recipes: Vec<Value> },
}

pub struct UserMachine;

impl Machine for UserMachine {
    type Public = UserPublic;
    type Private = UserPrivate;
    type ClientEvent = UserClientEvent;
    type ServiceEvent = UserServiceEvent;

    fn actor_type(&self) -> ActorType {
        ActorType::new(USER)
    }

    fn initial_context(&self, input: &ActorInput) -> ContextOf<Self> {
        Context::new(UserPublic {
            owner_id: input.creator.id.clone(),
            created_at: None,
            last_sync: None,
        })
    }

    fn regions(&self) -> Vec<Box<dyn Region<Self>>> {
        vec![Box::new(Initialization), Box::new(Row), Box::new(Threads)]
    }
}

/// Always `Ready`; present so the composite state matches the client's
struct Initialization;

impl Region<UserMachine> for Initialization {
    fn name(&self) -> &'static str {
        "Initialization"
    }

    fn initial(&self) -> &'static str {
        "Ready"
    }

    fn step(&self, _state: &str, _scope: &Scope<'_, UserMachine>) -> Step<UserMachine> {
        Step::Ignore
    }
}

/// The user's row: created on the owner's first event, stamped on sync
struct Row;

impl Region<UserMachine> for Row {
    fn name(&self) -> &'static str {
        "Row"
    }

    fn initial(&self) -> &'static str {
        "Uninitialized"
    }

    fn step(&self, state: &str, scope: &Scope<'_, UserMachine>) -> Step<UserMachine> {
        if matches!(scope.event(), Event::Child(_)) {
            return Step::Ignore;
        }
        if !scope.allows(Guard::CallerIsOwner) {
            return Step::Denied(Guard::CallerIsOwner);
        }

        let now = scope.now();
        let mut transition = if state == "Uninitialized" {
            Transition::to("Created")
                .assign(scope.context.with_public(|p| p.created_at = Some(now)))
        } else {
            Transition::stay()
        };

        if let Event::Service(UserServiceEvent::SyncRecipes { .. }) = scope.event() {
            let base = transition.context.as_ref().unwrap_or(scope.context);
            let next = base.with_public(|p| p.last_sync = Some(now));
            transition = transition.assign(next);
        }
        transition.into()
    }
}

/// Thread children and the caller's view of them
struct Threads;

impl Threads {
    fn new_message(
        scope: &Scope<'_, UserMachine>,
        thread_id: &str,
        text: &str,
    ) -> Step<UserMachine> {
        if !scope.allows(Guard::CallerIsOwner) {
            return Step::Denied(Guard::CallerIsOwner);
        }
        let caller = scope.caller();

        let mut transition = Transition::stay();
        if !scope.children.contains(thread_id) {
            transition = transition.effect(Effect::SpawnChild {
                actor_type: ActorType::new(THREAD),
                child_id: thread_id.to_string(),
                caller: caller.clone(),
            });
        }

        let context = scope.context.with_private(&caller.id, |p| {
            p.recent_thread_ids.retain(|id| id != thread_id);
            p.recent_thread_ids.insert(0, thread_id.to_string());
            p.recent_thread_ids.truncate(RECENT_THREADS);
            p.threads
                .entry(thread_id.to_string())
                .or_insert_with(ThreadSummary::connecting);
        });

        transition
            .assign(context)
            .effect(Effect::ForwardToChild {
                child_id: thread_id.to_string(),
                event: json!({"type": "NEW_MESSAGE", "content": text}),
            })
            .into()
    }

    fn child_event(scope: &Scope<'_, UserMachine>, event: &ChildEvent) -> Step<UserMachine> {
        let thread_id = event.key().actor_id.clone();
        // Handles are removed on failure, so the owner comes from the context.
        let owner = match scope.children.get(&thread_id) {
            Some(handle) => handle.caller().id.clone(),
            None => scope.context.public.owner_id.clone(),
        };
        let snapshot = scope
            .children
            .get(&thread_id)
            .and_then(|handle| handle.snapshot())
            .cloned();

        let status = match event {
            ChildEvent::Initialized { .. } | ChildEvent::Updated { .. } => None,
            ChildEvent::ChannelError { .. } => Some(ThreadStatus::Stale),
            ChildEvent::SpawnFailure { .. } => Some(ThreadStatus::Failed),
            ChildEvent::Closed { .. } => Some(ThreadStatus::Closed),
        };
        if status.is_none() && snapshot.is_none() {
            return Step::Ignore;
        }

        let context = scope.context.with_private(&owner, |p| {
            let summary = p
                .threads
                .entry(thread_id)
                .or_insert_with(ThreadSummary::connecting);
            match (status, &snapshot) {
                (Some(status), _) => summary.status = status,
                (None, Some(snapshot)) => summary.refresh(snapshot),
                (None, None) => {}
            }
        });
        Transition::stay().assign(context).into()
    }
}

impl Region<UserMachine> for Threads {
    fn name(&self) -> &'static str {
        "Threads"
    }

    fn initial(&self) -> &'static str {
        "Idle"
    }

    fn step(&self, _state: &str, scope: &Scope<'_, UserMachine>) -> Step<UserMachine> {
        match scope.event() {
            Event::Client(UserClientEvent::NewMessage {
                thread_id, text, ..
            }) => Self::new_message(scope, thread_id, text),
            Event::Child(event) => Self::child_event(scope, event),
            Event::Service(_) => Step::Ignore,
        }
    }
}
