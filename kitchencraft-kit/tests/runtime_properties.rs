//! Runtime properties exercised through a router.
//!
//! Two small machines: `counter` (owner-gated increments) and `hub`, which
//! spawns counters as children and records what it hears back from them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kitchencraft_kit::actor::{ContextOf, StateValue};
use kitchencraft_kit::testing::{eventually, sync_until, TapConnector};
use kitchencraft_kit::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const TIMEOUT: Duration = Duration::from_secs(5);

// counter

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CounterPublic {
    owner_id: String,
    count: u64,
}

impl Owned for CounterPublic {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CounterPrivate {
    increments: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum CounterEvent {
    Increment { by: u64 },
}

struct Counter;

struct Count;

impl Region<Counter> for Count {
    fn name(&self) -> &'static str {
        "Count"
    }

    fn initial(&self) -> &'static str {
        "Counting"
    }

    fn step(&self, _state: &str, scope: &Scope<'_, Counter>) -> Step<Counter> {
        let by = match scope.event() {
            Event::Client(CounterEvent::Increment { by })
            | Event::Service(CounterEvent::Increment { by }) => *by,
            Event::Child(_) => return Step::Ignore,
        };
        if !scope.allows(Guard::CallerIsOwner) {
            return Step::Denied(Guard::CallerIsOwner);
        }
        let caller = scope.caller().id.clone();
        let next = scope
            .context
            .with_public(|p| p.count += by)
            .with_private(&caller, |p| p.increments += 1);
        Transition::stay().assign(next).into()
    }
}

impl Machine for Counter {
    type Public = CounterPublic;
    type Private = CounterPrivate;
    type ClientEvent = CounterEvent;
    type ServiceEvent = CounterEvent;

    fn actor_type(&self) -> ActorType {
        ActorType::new("counter")
    }

    fn initial_context(&self, input: &ActorInput) -> ContextOf<Self> {
        Context::new(CounterPublic {
            owner_id: input.creator.id.clone(),
            count: 0,
        })
    }

    fn regions(&self) -> Vec<Box<dyn Region<Self>>> {
        vec![Box::new(Count)]
    }
}

// hub

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HubPublic {
    owner_id: String,
    children: BTreeMap<String, String>,
}

impl Owned for HubPublic {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum HubEvent {
    Open { child: String },
    /// Pass `event` to an already open child untouched
    Relay { child: String, event: Value },
}

struct Hub;

struct Children;

impl Region<Hub> for Children {
    fn name(&self) -> &'static str {
        "Children"
    }

    fn initial(&self) -> &'static str {
        "Watching"
    }

    fn step(&self, _state: &str, scope: &Scope<'_, Hub>) -> Step<Hub> {
        match scope.event() {
            Event::Client(HubEvent::Open { child }) => {
                if !scope.allows(Guard::CallerIsOwner) {
                    return Step::Denied(Guard::CallerIsOwner);
                }
                let mut transition = Transition::stay();
                if !scope.children.contains(child) {
                    transition = transition.effect(Effect::SpawnChild {
                        actor_type: ActorType::new("counter"),
                        child_id: child.clone(),
                        caller: scope.caller().clone(),
                    });
                }
                transition
                    .effect(Effect::ForwardToChild {
                        child_id: child.clone(),
                        event: json!({"type": "INCREMENT", "by": 1}),
                    })
                    .into()
            }
            Event::Client(HubEvent::Relay { child, event }) => {
                if !scope.allows(Guard::CallerIsOwner) {
                    return Step::Denied(Guard::CallerIsOwner);
                }
                Transition::stay()
                    .effect(Effect::ForwardToChild {
                        child_id: child.clone(),
                        event: event.clone(),
                    })
                    .into()
            }
            Event::Child(event) => {
                let id = event.key().actor_id.clone();
                let status = match event {
                    ChildEvent::SpawnFailure { .. } => "failed".to_string(),
                    ChildEvent::Closed { .. } => "closed".to_string(),
                    ChildEvent::ChannelError { .. } => "stale".to_string(),
                    _ => match scope.children.get(&id).and_then(|h| h.snapshot()) {
                        Some(snapshot) => format!("count={}", snapshot["public"]["count"]),
                        None => return Step::Ignore,
                    },
                };
                Transition::stay()
                    .assign(scope.context.with_public(|p| {
                        p.children.insert(id, status);
                    }))
                    .into()
            }
            Event::Service(never) => match *never {},
        }
    }
}

impl Machine for Hub {
    type Public = HubPublic;
    type Private = ();
    type ClientEvent = HubEvent;
    type ServiceEvent = NoEvents;

    fn actor_type(&self) -> ActorType {
        ActorType::new("hub")
    }

    fn initial_context(&self, input: &ActorInput) -> ContextOf<Self> {
        Context::new(HubPublic {
            owner_id: input.key.actor_id.clone(),
            children: BTreeMap::new(),
        })
    }

    fn regions(&self) -> Vec<Box<dyn Region<Self>>> {
        vec![Box::new(Children)]
    }
}

// harness

struct Harness {
    router: Arc<Router>,
    tap: Arc<TapConnector>,
    issuer: Arc<TokenIssuer>,
}

impl Harness {
    async fn new() -> Self {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        Self::with_storage(storage).await
    }

    async fn with_storage(storage: Arc<dyn Storage>) -> Self {
        Self::build(storage, config(), |tap| tap as Arc<dyn Connector>)
    }

    async fn with_config(config: RuntimeConfig) -> Self {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        Self::build(storage, config, |tap| tap as Arc<dyn Connector>)
    }

    /// `wrap` decides what sits in front of the tap
    fn build(
        storage: Arc<dyn Storage>,
        config: RuntimeConfig,
        wrap: impl FnOnce(Arc<TapConnector>) -> Arc<dyn Connector>,
    ) -> Self {
        let issuer = Arc::new(TokenIssuer::new("test", b"kit-secret"));
        let mut tap = None;
        let router = Router::with_connector(issuer.clone(), storage, config, |weak| {
            let connector = Arc::new(TapConnector::new(Arc::new(LocalConnector::new(weak))));
            tap = Some(connector.clone());
            wrap(connector)
        });
        router.register(Counter).register(Hub);

        Self {
            router,
            tap: tap.unwrap(),
            issuer,
        }
    }

    fn token(&self, key: &ActorKey, caller: &str) -> String {
        self.issuer.issue(key, &Caller::client(caller)).unwrap()
    }

    async fn watch(&self, key: &ActorKey, caller: &str) -> (SyncChannel, Replica) {
        let channel = self
            .router
            .open_channel(key, &self.token(key, caller))
            .await
            .unwrap();
        (channel, Replica::new(key.clone()))
    }
}

fn config() -> RuntimeConfig {
    RuntimeConfig {
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(20),
        },
        ..RuntimeConfig::default()
    }
}

fn child_status(snapshot: &Value, child: &str) -> Option<String> {
    snapshot["public"]["children"][child]
        .as_str()
        .map(str::to_string)
}

#[tokio::test]
async fn spawn_is_idempotent() {
    let h = Harness::new().await;
    let hub = ActorKey::new("hub", "alice");
    let counter = ActorKey::new("counter", "c1");
    let token = h.token(&hub, "alice");

    h.router
        .submit(&hub, &token, json!({"type": "OPEN", "child": "c1"}))
        .await
        .unwrap();
    h.router
        .submit(&hub, &token, json!({"type": "OPEN", "child": "c1"}))
        .await
        .unwrap();

    let (mut channel, mut replica) = h.watch(&hub, "alice").await;
    let done = sync_until(&mut channel, &mut replica, TIMEOUT, |s| {
        child_status(s, "c1").as_deref() == Some("count=2")
    })
    .await;
    assert!(done.is_some(), "hub never saw both increments");

    assert_eq!(h.tap.connects(&counter), 1);
    let children = h.router.get(&hub).unwrap().children().await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].key, counter);
    assert_eq!(children[0].state, ChannelState::Synced);
}

#[tokio::test]
async fn non_owner_events_are_silent() {
    let h = Harness::new().await;
    let key = ActorKey::new("counter", "c1");

    // Alice's channel creates the instance, so she owns it.
    let (mut alice, mut alice_view) = h.watch(&key, "alice").await;
    let (mut bob, mut bob_view) = h.watch(&key, "bob").await;
    alice_view.apply(&alice.next_frame().await.unwrap());
    bob_view.apply(&bob.next_frame().await.unwrap());

    bob.send(json!({"type": "INCREMENT", "by": 5})).await.unwrap();
    alice.send(json!({"type": "INCREMENT", "by": 1})).await.unwrap();

    // The first update anyone sees is Alice's, at revision 1.
    let frame = alice.next_frame().await.unwrap();
    assert_eq!(frame.revision(), Some(Revision(1)));
    alice_view.apply(&frame);
    assert_eq!(alice_view.synced_snapshot().unwrap()["public"]["count"], 1);

    let frame = bob.next_frame().await.unwrap();
    assert_eq!(frame.revision(), Some(Revision(1)));
    bob_view.apply(&frame);
    let bob_snapshot = bob_view.synced_snapshot().unwrap();
    assert_eq!(bob_snapshot["public"]["count"], 1);
    assert_eq!(bob_snapshot["private"]["increments"], 0);
}

#[tokio::test]
async fn revisions_are_contiguous_and_patches_converge() {
    let h = Harness::new().await;
    let key = ActorKey::new("counter", "c2");
    let (mut channel, mut replica) = h.watch(&key, "alice").await;

    for by in 1..=5 {
        channel
            .send(json!({"type": "INCREMENT", "by": by}))
            .await
            .unwrap();
    }

    let mut revisions = Vec::new();
    while revisions.last() != Some(&5) {
        let frame = tokio::time::timeout(TIMEOUT, channel.next_frame())
            .await
            .unwrap()
            .unwrap();
        revisions.push(frame.revision().unwrap().get());
        replica.apply(&frame);
    }
    assert_eq!(revisions, vec![0, 1, 2, 3, 4, 5]);

    let view = h
        .router
        .snapshot(&key, &h.token(&key, "alice"))
        .await
        .unwrap();
    assert_eq!(view.revision, Revision(5));
    assert_eq!(
        serde_json::to_string(replica.synced_snapshot().unwrap()).unwrap(),
        serde_json::to_string(&view.snapshot).unwrap()
    );
    assert_eq!(view.snapshot["public"]["count"], 15);
    assert_eq!(view.snapshot["private"]["increments"], 5);
}

#[tokio::test]
async fn tokens_are_scoped_to_one_instance() {
    let h = Harness::new().await;
    let token = h.token(&ActorKey::new("counter", "c1"), "alice");

    for other in [ActorKey::new("counter", "c2"), ActorKey::new("hub", "c1")] {
        let err = h.router.open_channel(&other, &token).await.unwrap_err();
        assert!(
            matches!(err, KitError::Token(TokenError::ScopeMismatch { .. })),
            "unexpected {err:?}"
        );
    }

    let err = h
        .router
        .open_channel(&ActorKey::new("counter", "c1"), "")
        .await
        .unwrap_err();
    assert!(matches!(err, KitError::Token(TokenError::Missing)));

    // Rejected handshakes never create instances.
    assert!(h.router.is_empty());
}

#[tokio::test]
async fn malformed_events_are_rejected_at_intake() {
    let h = Harness::new().await;
    let key = ActorKey::new("counter", "c3");
    let token = h.token(&key, "alice");

    let err = h
        .router
        .submit(&key, &token, json!({"type": "DECREMENT"}))
        .await
        .unwrap_err();
    assert!(matches!(err, KitError::SchemaValidation(_)));

    let view = h.router.snapshot(&key, &token).await.unwrap();
    assert_eq!(view.revision, Revision(0));
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("kit.db").display());
    let key = ActorKey::new("counter", "c1");

    {
        let storage = Arc::new(SqliteStorage::connect(&url).await.unwrap());
        let h = Harness::with_storage(storage).await;
        let token = h.token(&key, "alice");
        for _ in 0..3 {
            h.router
                .submit(&key, &token, json!({"type": "INCREMENT", "by": 2}))
                .await
                .unwrap();
        }
        let view = h.router.snapshot(&key, &token).await.unwrap();
        assert_eq!(view.revision, Revision(3));
    }

    let storage = Arc::new(SqliteStorage::connect(&url).await.unwrap());
    let h = Harness::with_storage(storage).await;
    let view = h
        .router
        .snapshot(&key, &h.token(&key, "alice"))
        .await
        .unwrap();
    assert_eq!(view.revision, Revision(3));
    assert_eq!(view.snapshot["public"]["count"], 6);
    assert_eq!(view.snapshot["public"]["ownerId"], "alice");
    assert_eq!(view.snapshot["private"]["increments"], 3);
}

struct Refusing;

#[async_trait]
impl Connector for Refusing {
    async fn connect(&self, key: &ActorKey, _token: &str) -> Result<SyncChannel> {
        Err(KitError::Transport(format!("refused {key}")))
    }
}

#[tokio::test]
async fn spawn_failure_reaches_parent_as_event() {
    let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
    let issuer = Arc::new(TokenIssuer::new("test", b"kit-secret"));
    let router = Router::with_connector(
        issuer.clone(),
        storage,
        RuntimeConfig::default(),
        |_| Arc::new(Refusing) as Arc<dyn Connector>,
    );
    router.register(Counter).register(Hub);

    let hub = ActorKey::new("hub", "alice");
    let token = issuer.issue(&hub, &Caller::client("alice")).unwrap();
    router
        .submit(&hub, &token, json!({"type": "OPEN", "child": "c9"}))
        .await
        .unwrap();

    let mut channel = router.open_channel(&hub, &token).await.unwrap();
    let mut replica = Replica::new(hub.clone());
    let failed = sync_until(&mut channel, &mut replica, TIMEOUT, |s| {
        child_status(s, "c9").as_deref() == Some("failed")
    })
    .await;
    assert!(failed.is_some());

    // The handle is gone and the parent keeps accepting events.
    let actor = router.get(&hub).unwrap();
    assert!(actor.children().await.unwrap().is_empty());
    assert_eq!(actor.phase(), Phase::Active);
    router
        .submit(&hub, &token, json!({"type": "OPEN", "child": "c9"}))
        .await
        .unwrap();
}

#[tokio::test]
async fn severed_child_resyncs_with_fresh_snapshot() {
    let h = Harness::new().await;
    let hub = ActorKey::new("hub", "alice");
    let counter = ActorKey::new("counter", "c1");
    let token = h.token(&hub, "alice");

    h.router
        .submit(&hub, &token, json!({"type": "OPEN", "child": "c1"}))
        .await
        .unwrap();
    let (mut channel, mut replica) = h.watch(&hub, "alice").await;
    let status =
        |want: &'static str| move |s: &Value| child_status(s, "c1").as_deref() == Some(want);

    assert!(sync_until(&mut channel, &mut replica, TIMEOUT, status("count=1"))
        .await
        .is_some());

    assert_eq!(h.tap.sever(&counter), 1);

    assert!(sync_until(&mut channel, &mut replica, TIMEOUT, status("stale"))
        .await
        .is_some());
    assert!(sync_until(&mut channel, &mut replica, TIMEOUT, status("count=1"))
        .await
        .is_some());

    assert_eq!(h.tap.connects(&counter), 2);
    let kinds = h.tap.frame_kinds(&counter);
    assert_eq!(kinds.iter().filter(|k| **k == "INITIALIZED").count(), 2);

    let actor = h.router.get(&hub).unwrap();
    let synced = eventually(TIMEOUT, || {
        let actor = actor.clone();
        async move {
            actor
                .children()
                .await
                .map(|c| c.len() == 1 && c[0].state == ChannelState::Synced)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(synced);
}

#[tokio::test]
async fn instances_become_active() {
    let h = Harness::new().await;
    let key = ActorKey::new("counter", "c1");
    let actor = h.router.resolve(&key, &Caller::client("alice")).unwrap();
    assert!(eventually(TIMEOUT, || {
        let actor = actor.clone();
        async move { actor.phase() == Phase::Active }
    })
    .await);

    // Same key, same instance.
    let again = h.router.resolve(&key, &Caller::client("bob")).unwrap();
    assert!(Arc::ptr_eq(&actor, &again));
    assert_eq!(h.router.len(), 1);

    let states: StateValue = serde_json::from_value(
        h.router
            .snapshot(&key, &h.token(&key, "alice"))
            .await
            .unwrap()
            .snapshot["value"]
            .clone(),
    )
    .unwrap();
    assert_eq!(states.get("Count").map(String::as_str), Some("Counting"));
}

#[tokio::test]
async fn refused_forward_keeps_child_channel() {
    let h = Harness::new().await;
    let hub = ActorKey::new("hub", "alice");
    let counter = ActorKey::new("counter", "c1");
    let token = h.token(&hub, "alice");
    let (mut channel, mut replica) = h.watch(&hub, "alice").await;

    h.router
        .submit(&hub, &token, json!({"type": "OPEN", "child": "c1"}))
        .await
        .unwrap();
    assert!(sync_until(&mut channel, &mut replica, TIMEOUT, |s| {
        child_status(s, "c1").as_deref() == Some("count=1")
    })
    .await
    .is_some());

    // The counter has no BOGUS event; the proxy drops it and carries on.
    h.router
        .submit(
            &hub,
            &token,
            json!({"type": "RELAY", "child": "c1", "event": {"type": "BOGUS"}}),
        )
        .await
        .unwrap();
    h.router
        .submit(&hub, &token, json!({"type": "OPEN", "child": "c1"}))
        .await
        .unwrap();

    let mut seen = Vec::new();
    let done = tokio::time::timeout(TIMEOUT, async {
        loop {
            let frame = channel.next_frame().await.unwrap();
            replica.apply(&frame);
            if let Some(status) = replica.synced_snapshot().and_then(|s| child_status(s, "c1")) {
                seen.push(status.clone());
                if status == "count=2" {
                    break;
                }
            }
        }
    })
    .await;
    assert!(done.is_ok(), "second increment never arrived");
    assert!(!seen.iter().any(|s| s == "stale"), "child went stale: {seen:?}");

    assert_eq!(h.tap.connects(&counter), 1);
    assert_eq!(h.tap.frame_kinds(&counter), vec!["INITIALIZED", "UPDATED", "UPDATED"]);
}

/// Lets the first `allowed` connects through, then refuses
struct Rationed {
    inner: Arc<dyn Connector>,
    allowed: AtomicUsize,
}

#[async_trait]
impl Connector for Rationed {
    async fn connect(&self, key: &ActorKey, token: &str) -> Result<SyncChannel> {
        let granted = self
            .allowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !granted {
            return Err(KitError::Transport(format!("refused {key}")));
        }
        self.inner.connect(key, token).await
    }
}

#[tokio::test]
async fn exhausted_reconnects_close_the_handle() {
    let config = RuntimeConfig {
        reconnect: ReconnectPolicy {
            max_attempts: 1,
            delay: Duration::from_millis(10),
        },
        ..RuntimeConfig::default()
    };
    let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
    let h = Harness::build(storage, config, |tap| {
        Arc::new(Rationed {
            inner: tap,
            allowed: AtomicUsize::new(1),
        }) as Arc<dyn Connector>
    });
    let hub = ActorKey::new("hub", "alice");
    let counter = ActorKey::new("counter", "c1");
    let token = h.token(&hub, "alice");
    let (mut channel, mut replica) = h.watch(&hub, "alice").await;
    let status =
        |want: &'static str| move |s: &Value| child_status(s, "c1").as_deref() == Some(want);

    h.router
        .submit(&hub, &token, json!({"type": "OPEN", "child": "c1"}))
        .await
        .unwrap();
    assert!(sync_until(&mut channel, &mut replica, TIMEOUT, status("count=1"))
        .await
        .is_some());

    assert_eq!(h.tap.sever(&counter), 1);
    assert!(sync_until(&mut channel, &mut replica, TIMEOUT, status("closed"))
        .await
        .is_some());
    assert_eq!(h.tap.connects(&counter), 1);

    let actor = h.router.get(&hub).unwrap();
    assert!(actor.children().await.unwrap().is_empty());

    // The parent keeps working; a fresh spawn is attempted and refused.
    h.router
        .submit(&hub, &token, json!({"type": "OPEN", "child": "c1"}))
        .await
        .unwrap();
    assert!(sync_until(&mut channel, &mut replica, TIMEOUT, status("failed"))
        .await
        .is_some());
}

#[tokio::test]
async fn lagging_subscriber_is_dropped_and_resyncs() {
    let h = Harness::with_config(RuntimeConfig {
        subscriber_capacity: 1,
        ..config()
    })
    .await;
    let key = ActorKey::new("counter", "c1");
    let token = h.token(&key, "alice");

    // Never read: the INITIALIZED frame fills its queue.
    let (mut idle, _) = h.watch(&key, "alice").await;
    h.router
        .submit(&key, &token, json!({"type": "INCREMENT", "by": 1}))
        .await
        .unwrap();
    let view = h.router.snapshot(&key, &token).await.unwrap();
    assert_eq!(view.revision, Revision(1));

    let first = idle.next_frame().await.unwrap();
    assert_eq!(first.kind(), "INITIALIZED");
    assert_eq!(first.revision(), Some(Revision(0)));
    let next = tokio::time::timeout(TIMEOUT, idle.next_frame()).await.unwrap();
    assert!(next.is_none(), "lagging channel should end, got {next:?}");

    let (mut fresh, mut replica) = h.watch(&key, "alice").await;
    let snapshot = sync_until(&mut fresh, &mut replica, TIMEOUT, |s| s["public"]["count"] == 1)
        .await
        .unwrap();
    assert_eq!(snapshot["private"]["increments"], 1);
    assert_eq!(replica.revision(), Some(Revision(1)));
}

#[tokio::test]
async fn lost_update_triggers_resync() {
    let h = Harness::new().await;
    let hub = ActorKey::new("hub", "alice");
    let counter = ActorKey::new("counter", "c1");
    let token = h.token(&hub, "alice");
    let (mut channel, mut replica) = h.watch(&hub, "alice").await;
    let open = json!({"type": "OPEN", "child": "c1"});

    h.router.submit(&hub, &token, open.clone()).await.unwrap();
    assert!(sync_until(&mut channel, &mut replica, TIMEOUT, |s| {
        child_status(s, "c1").as_deref() == Some("count=1")
    })
    .await
    .is_some());

    // Revision 2 vanishes in transit; revision 3 then exposes the gap.
    h.tap.drop_next_update(&counter);
    h.router.submit(&hub, &token, open.clone()).await.unwrap();
    h.router.submit(&hub, &token, open).await.unwrap();

    assert!(sync_until(&mut channel, &mut replica, TIMEOUT, |s| {
        child_status(s, "c1").as_deref() == Some("count=3")
    })
    .await
    .is_some());
    assert_eq!(h.tap.connects(&counter), 2);
    let kinds = h.tap.frame_kinds(&counter);
    assert_eq!(kinds.iter().filter(|k| **k == "INITIALIZED").count(), 2);
    assert_eq!(kinds.last(), Some(&"INITIALIZED"));

    let actor = h.router.get(&hub).unwrap();
    let synced = eventually(TIMEOUT, || {
        let actor = actor.clone();
        async move {
            matches!(
                actor.children().await.as_deref(),
                Ok([child]) if child.state == ChannelState::Synced
                    && child.revision == Some(Revision(3))
            )
        }
    })
    .await;
    assert!(synced);
}

/// Sqlite storage whose writes can be switched off
struct Flaky {
    inner: SqliteStorage,
    refuse_writes: AtomicBool,
}

#[async_trait]
impl Storage for Flaky {
    async fn execute(
        &self,
        query: &str,
        params: &[Value],
    ) -> std::result::Result<Vec<storage::Row>, StorageError> {
        let write = query.trim_start().starts_with("INSERT");
        if write && self.refuse_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Query("disk full".into()));
        }
        self.inner.execute(query, params).await
    }
}

#[tokio::test]
async fn unpersisted_events_are_not_published() {
    let storage = Arc::new(Flaky {
        inner: SqliteStorage::in_memory().await.unwrap(),
        refuse_writes: AtomicBool::new(false),
    });
    let key = ActorKey::new("counter", "c1");
    let increment = json!({"type": "INCREMENT", "by": 1});

    {
        let h = Harness::with_storage(storage.clone()).await;
        let token = h.token(&key, "alice");
        let (mut channel, mut replica) = h.watch(&key, "alice").await;

        h.router.submit(&key, &token, increment.clone()).await.unwrap();
        storage.refuse_writes.store(true, Ordering::SeqCst);
        h.router.submit(&key, &token, increment.clone()).await.unwrap();
        let view = h.router.snapshot(&key, &token).await.unwrap();
        assert_eq!(view.revision, Revision(1));
        assert_eq!(view.snapshot["public"]["count"], 1);

        storage.refuse_writes.store(false, Ordering::SeqCst);
        h.router.submit(&key, &token, increment.clone()).await.unwrap();

        let mut revisions = Vec::new();
        while revisions.last() != Some(&2) {
            let frame = tokio::time::timeout(TIMEOUT, channel.next_frame())
                .await
                .unwrap()
                .unwrap();
            revisions.push(frame.revision().unwrap().get());
            replica.apply(&frame);
        }
        assert_eq!(revisions, vec![0, 1, 2]);
        assert_eq!(replica.synced_snapshot().unwrap()["public"]["count"], 2);
    }

    // A new router over the same storage resumes at the last published revision.
    let h = Harness::with_storage(storage).await;
    let view = h
        .router
        .snapshot(&key, &h.token(&key, "alice"))
        .await
        .unwrap();
    assert_eq!(view.revision, Revision(2));
    assert_eq!(view.snapshot["public"]["count"], 2);
}
