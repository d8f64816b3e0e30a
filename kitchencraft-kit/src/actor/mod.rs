//! Actor model primitives
//!
//! - `Context`: public state plus per-caller private slices
//! - `Machine`: an actor type, built from orthogonal `Region`s
//! - `Event` / `Envelope`: validated input to an instance
//! - `evaluate`: the pure step from (context, event) to (context', effects)

mod context;
mod event;
mod machine;

pub use context::{project, Context, Owned, StateValue};
pub use event::{ChildEvent, Envelope, Event, NoEvents, Origin, RawEvent};
pub use machine::{
    evaluate, initial_states, ActorInput, ContextOf, Effect, EnvelopeOf, EventOf, Guard, Machine,
    Outcome, Region, Scope, Step, Transition,
};
