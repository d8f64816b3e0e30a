//! Partitioned actor context
//!
//! Every instance owns a public part visible to any authorized caller and a
//! private map keyed by caller id, where each caller sees only its own
//! entry. Updates go through the `with_*` helpers, which return a new value
//! and leave the original untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Caller;

/// Composite state: region name to current state name
pub type StateValue = BTreeMap<String, String>;

/// Public context types that record an owner
pub trait Owned {
    fn owner_id(&self) -> &str;
}

/// Public plus per-caller private context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context<P, Q> {
    pub public: P,
    #[serde(default = "BTreeMap::new")]
    pub private: BTreeMap<String, Q>,
}

impl<P: Clone, Q: Clone + Default> Context<P, Q> {
    pub fn new(public: P) -> Self {
        Self {
            public,
            private: BTreeMap::new(),
        }
    }

    /// The private slice for `caller_id`, if one was ever written
    pub fn private_for(&self, caller_id: &str) -> Option<&Q> {
        self.private.get(caller_id)
    }

    /// New context with the public part edited
    pub fn with_public(&self, edit: impl FnOnce(&mut P)) -> Self {
        let mut next = self.clone();
        edit(&mut next.public);
        next
    }

    /// New context with one caller's private slice edited
    pub fn with_private(&self, caller_id: &str, edit: impl FnOnce(&mut Q)) -> Self {
        let mut next = self.clone();
        edit(next.private.entry(caller_id.to_string()).or_default());
        next
    }

    /// New context with arbitrary edits
    pub fn with(&self, edit: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        edit(&mut next);
        next
    }
}

#[derive(Serialize)]
struct SnapshotView<'a, P, Q> {
    public: &'a P,
    private: &'a Q,
    value: &'a StateValue,
}

/// Caller-visible projection of a context
///
/// Contains the public part, the caller's own private slice (or an empty
/// default), and the composite region state.
pub fn project<P, Q>(
    context: &Context<P, Q>,
    states: &StateValue,
    caller: &Caller,
) -> Result<Value, serde_json::Error>
where
    P: Serialize,
    Q: Serialize + Default,
{
    let fallback = Q::default();
    let private = context.private.get(&caller.id).unwrap_or(&fallback);
    serde_json::to_value(SnapshotView {
        public: &context.public,
        private,
        value: states,
    })
}
