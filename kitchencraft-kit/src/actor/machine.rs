//! Machines, regions and the pure transition step
//!
//! A machine is a list of orthogonal regions evaluated against the same
//! context. Each region sees every event and independently transitions or
//! ignores it. Regions never perform side effects; they return declared
//! [`Effect`]s that the runtime executes after the step commits.

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::context::{Context, Owned, StateValue};
use super::event::{Envelope, Event, Origin, RawEvent};
use crate::child::ChildTable;
use crate::error::{KitError, Result};
use crate::types::{ActorKey, ActorType, Caller};

pub type ContextOf<M> = Context<<M as Machine>::Public, <M as Machine>::Private>;
pub type EventOf<M> = Event<<M as Machine>::ClientEvent, <M as Machine>::ServiceEvent>;
pub type EnvelopeOf<M> = Envelope<<M as Machine>::ClientEvent, <M as Machine>::ServiceEvent>;

/// What a new instance is created from
#[derive(Debug, Clone, PartialEq)]
pub struct ActorInput {
    pub key: ActorKey,
    /// The caller whose event or channel caused the instance to exist
    pub creator: Caller,
    pub created_at: DateTime<Utc>,
}

/// Behavior of one actor type
pub trait Machine: Sized + Send + Sync + 'static {
    type Public: Owned + Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;
    type Private: Serialize + DeserializeOwned + Clone + Default + Debug + Send + Sync + 'static;
    type ClientEvent: DeserializeOwned + Clone + Debug + Send + Sync + 'static;
    type ServiceEvent: DeserializeOwned + Clone + Debug + Send + Sync + 'static;

    fn actor_type(&self) -> ActorType;

    /// Context for an instance with no persisted state
    fn initial_context(&self, input: &ActorInput) -> ContextOf<Self>;

    fn regions(&self) -> Vec<Box<dyn Region<Self>>>;

    /// Validate a raw event against the schema for its origin
    fn parse_event(&self, raw: &RawEvent) -> Result<EventOf<Self>> {
        let invalid = |e: serde_json::Error| KitError::SchemaValidation(e.to_string());
        match raw.origin {
            Origin::Client => serde_json::from_value(raw.payload.clone())
                .map(Event::Client)
                .map_err(invalid),
            Origin::Service => serde_json::from_value(raw.payload.clone())
                .map(Event::Service)
                .map_err(invalid),
            Origin::System => Err(KitError::SchemaValidation(
                "system events are produced by the runtime".into(),
            )),
        }
    }
}

/// Predicates gating transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    CallerIsOwner,
}

impl Guard {
    pub fn allows<P: Owned, Q>(self, context: &Context<P, Q>, caller: &Caller) -> bool {
        match self {
            Guard::CallerIsOwner => context.public.owner_id() == caller.id,
        }
    }
}

/// Side effects a region may declare
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Ensure a child handle exists for `child_id`
    SpawnChild {
        actor_type: ActorType,
        child_id: String,
        caller: Caller,
    },
    /// Send an event payload to an existing child
    ForwardToChild { child_id: String, event: Value },
}

/// Everything a region may read while stepping
pub struct Scope<'a, M: Machine> {
    pub context: &'a ContextOf<M>,
    pub envelope: &'a EnvelopeOf<M>,
    pub children: &'a ChildTable,
}

impl<'a, M: Machine> Scope<'a, M> {
    pub fn event(&self) -> &'a EventOf<M> {
        &self.envelope.event
    }

    pub fn caller(&self) -> &'a Caller {
        &self.envelope.caller
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.envelope.received_at
    }

    pub fn allows(&self, guard: Guard) -> bool {
        guard.allows(self.context, &self.envelope.caller)
    }
}

/// A region's accepted transition
pub struct Transition<M: Machine> {
    /// New state for the region, `None` to stay
    pub target: Option<&'static str>,
    /// Replacement context, `None` to keep the current one
    pub context: Option<ContextOf<M>>,
    pub effects: Vec<Effect>,
}

impl<M: Machine> Transition<M> {
    pub fn stay() -> Self {
        Self {
            target: None,
            context: None,
            effects: Vec::new(),
        }
    }

    pub fn to(target: &'static str) -> Self {
        Self {
            target: Some(target),
            ..Self::stay()
        }
    }

    pub fn assign(mut self, context: ContextOf<M>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Result of stepping one region
pub enum Step<M: Machine> {
    Ignore,
    Denied(Guard),
    Transition(Transition<M>),
}

impl<M: Machine> From<Transition<M>> for Step<M> {
    fn from(transition: Transition<M>) -> Self {
        Step::Transition(transition)
    }
}

/// One orthogonal sub-state-machine
pub trait Region<M: Machine>: Send + Sync {
    fn name(&self) -> &'static str;

    fn initial(&self) -> &'static str;

    fn step(&self, state: &str, scope: &Scope<'_, M>) -> Step<M>;
}

/// Starting state for every region
pub fn initial_states<M: Machine>(regions: &[Box<dyn Region<M>>]) -> StateValue {
    regions
        .iter()
        .map(|r| (r.name().to_string(), r.initial().to_string()))
        .collect()
}

/// Combined result of stepping every region
pub struct Outcome<M: Machine> {
    /// At least one region transitioned
    pub accepted: bool,
    /// Replacement context, if any region produced one
    pub context: Option<ContextOf<M>>,
    pub states: StateValue,
    pub effects: Vec<Effect>,
    /// Regions whose guard turned the event away
    pub denied: Vec<(&'static str, Guard)>,
}

/// Step every region in order against one event
///
/// Each region sees the context produced by the regions before it. Nothing
/// here touches the outside world; the caller commits the outcome and runs
/// the effects.
pub fn evaluate<M: Machine>(
    regions: &[Box<dyn Region<M>>],
    states: &StateValue,
    context: &ContextOf<M>,
    envelope: &EnvelopeOf<M>,
    children: &ChildTable,
) -> Outcome<M> {
    let mut next_states = states.clone();
    let mut next_context: Option<ContextOf<M>> = None;
    let mut effects = Vec::new();
    let mut denied = Vec::new();
    let mut accepted = false;

    for region in regions {
        let current = next_states
            .get(region.name())
            .cloned()
            .unwrap_or_else(|| region.initial().to_string());
        let scope = Scope {
            context: next_context.as_ref().unwrap_or(context),
            envelope,
            children,
        };

        match region.step(&current, &scope) {
            Step::Ignore => {}
            Step::Denied(guard) => denied.push((region.name(), guard)),
            Step::Transition(transition) => {
                accepted = true;
                if let Some(target) = transition.target {
                    next_states.insert(region.name().to_string(), target.to_string());
                }
                if let Some(ctx) = transition.context {
                    next_context = Some(ctx);
                }
                effects.extend(transition.effects);
            }
        }
    }

    Outcome {
        accepted,
        context: next_context,
        states: next_states,
        effects,
        denied,
    }
}
