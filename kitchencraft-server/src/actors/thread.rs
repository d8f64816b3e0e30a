//! The thread actor.
//!
//! A conversation thread. Threads are only ever spawned by a user actor,
//! which talks to them as a service caller carrying the user's id; there
//! are no client events.

use chrono::{DateTime, Utc};
use kitchencraft_kit::actor::{ContextOf, Scope};
use kitchencraft_kit::{
    ActorInput, ActorType, Context, Event, Guard, Machine, NoEvents, Owned, Region, Step,
    Transition,
};
use serde::{Deserialize, Serialize};

pub const THREAD: &str = "thread";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPublic {
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: u64,
}

impl Owned for ThreadPublic {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPrivate {
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadServiceEvent {
    NewMessage { content: String },
}

pub struct ThreadMachine;

impl Machine for ThreadMachine {
    type Public = ThreadPublic;
    type Private = ThreadPrivate;
    type ClientEvent = NoEvents;
    type ServiceEvent = ThreadServiceEvent;

    fn actor_type(&self) -> ActorType {
        ActorType::new(THREAD)
    }

    fn initial_context(&self, input: &ActorInput) -> ContextOf<Self> {
        Context::new(ThreadPublic {
            owner_id: input.creator.id.clone(),
            created_at: input.created_at,
            last_message_at: None,
            message_count: 0,
        })
    }

    fn regions(&self) -> Vec<Box<dyn Region<Self>>> {
        vec![Box::new(Conversation)]
    }
}

struct Conversation;

impl Region<ThreadMachine> for Conversation {
    fn name(&self) -> &'static str {
        "Conversation"
    }

    fn initial(&self) -> &'static str {
        "Empty"
    }

    fn step(&self, state: &str, scope: &Scope<'_, ThreadMachine>) -> Step<ThreadMachine> {
        let Event::Service(ThreadServiceEvent::NewMessage { content }) = scope.event() else {
            return Step::Ignore;
        };
        if !scope.allows(Guard::CallerIsOwner) {
            return Step::Denied(Guard::CallerIsOwner);
        }

        let now = scope.now();
        let caller = scope.caller().id.clone();
        tracing::trace!(chars = content.len(), "thread message");
        let context = scope
            .context
            .with_public(|p| {
                p.last_message_at = Some(now);
                p.message_count += 1;
            })
            .with_private(&caller, |p| {
                if !p.user_ids.contains(&caller) {
                    p.user_ids.push(caller.clone());
                }
            });

        let transition = if state == "Empty" {
            Transition::to("Active")
        } else {
            Transition::stay()
        };
        transition.assign(context).into()
    }
}
