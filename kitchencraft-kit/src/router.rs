//! Routing table
//!
//! The router maps each `(actorType, actorId)` to exactly one running
//! instance, creating it on first use. It is also the only place tokens
//! are checked: channel handshakes, snapshots and event submissions all
//! verify the presented token against the target key before the instance
//! is touched.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

use crate::actor::{ActorInput, Machine, RawEvent};
use crate::error::{KitError, Result};
use crate::runtime::{ActorRef, ActorRuntime, RuntimeConfig, Services, View};
use crate::storage::Storage;
use crate::sync::SyncChannel;
use crate::token::{Claims, TokenIssuer};
use crate::types::{ActorKey, ActorType, Caller};

/// Opens sync channels to instances
///
/// Parents reach their children only through a connector, so the child
/// may live in this process or behind a network hop.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, key: &ActorKey, token: &str) -> Result<SyncChannel>;
}

/// Connector for instances hosted by the same router
pub struct LocalConnector {
    router: Weak<Router>,
}

impl LocalConnector {
    pub fn new(router: Weak<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, key: &ActorKey, token: &str) -> Result<SyncChannel> {
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| KitError::InstanceUnavailable(key.clone()))?;
        router.open_channel(key, token).await
    }
}

trait Spawner: Send + Sync {
    fn spawn(&self, input: ActorInput, services: Services) -> Arc<dyn ActorRef>;
}

struct MachineSpawner<M: Machine>(Arc<M>);

impl<M: Machine> Spawner for MachineSpawner<M> {
    fn spawn(&self, input: ActorInput, services: Services) -> Arc<dyn ActorRef> {
        ActorRuntime::spawn(self.0.clone(), input, services)
    }
}

struct Entry {
    actor: Arc<dyn ActorRef>,
    created_at: DateTime<Utc>,
}

/// The explicit `(actorType, actorId) -> instance` table
pub struct Router {
    machines: RwLock<HashMap<ActorType, Arc<dyn Spawner>>>,
    instances: Mutex<HashMap<ActorKey, Entry>>,
    issuer: Arc<TokenIssuer>,
    storage: Arc<dyn Storage>,
    connector: Arc<dyn Connector>,
    config: RuntimeConfig,
}

impl Router {
    /// Router whose instances reach their children in-process
    pub fn new(
        issuer: Arc<TokenIssuer>,
        storage: Arc<dyn Storage>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        Self::with_connector(issuer, storage, config, |router| {
            Arc::new(LocalConnector::new(router)) as Arc<dyn Connector>
        })
    }

    /// Router with a custom connector for child channels
    ///
    /// The closure receives a weak reference to the router being built so
    /// the connector can route back into it.
    pub fn with_connector<F>(
        issuer: Arc<TokenIssuer>,
        storage: Arc<dyn Storage>,
        config: RuntimeConfig,
        connector: F,
    ) -> Arc<Self>
    where
        F: FnOnce(Weak<Router>) -> Arc<dyn Connector>,
    {
        Arc::new_cyclic(|weak| Self {
            machines: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            issuer,
            storage,
            connector: connector(weak.clone()),
            config,
        })
    }

    /// Register the machine for its actor type
    pub fn register<M: Machine>(&self, machine: M) -> &Self {
        let actor_type = machine.actor_type();
        debug!(%actor_type, "registered machine");
        self.machines
            .write()
            .insert(actor_type, Arc::new(MachineSpawner(Arc::new(machine))));
        self
    }

    pub fn issuer(&self) -> &Arc<TokenIssuer> {
        &self.issuer
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn is_registered(&self, actor_type: &ActorType) -> bool {
        self.machines.read().contains_key(actor_type)
    }

    /// The running instance for `key`, created on first use
    pub fn resolve(&self, key: &ActorKey, creator: &Caller) -> Result<Arc<dyn ActorRef>> {
        let mut instances = self.instances.lock();
        if let Some(entry) = instances.get(key) {
            return Ok(entry.actor.clone());
        }

        let spawner = self
            .machines
            .read()
            .get(&key.actor_type)
            .cloned()
            .ok_or_else(|| KitError::UnknownActorType(key.actor_type.clone()))?;

        let created_at = Utc::now();
        let input = ActorInput {
            key: key.clone(),
            creator: creator.clone(),
            created_at,
        };
        let services = Services {
            issuer: self.issuer.clone(),
            connector: self.connector.clone(),
            storage: self.storage.clone(),
            config: self.config,
        };
        let actor = spawner.spawn(input, services);
        info!(actor = %key, creator = %creator, "instance created");

        instances.insert(
            key.clone(),
            Entry {
                actor: actor.clone(),
                created_at,
            },
        );
        Ok(actor)
    }

    /// The running instance for `key`, without creating one
    pub fn get(&self, key: &ActorKey) -> Option<Arc<dyn ActorRef>> {
        self.instances.lock().get(key).map(|e| e.actor.clone())
    }

    pub fn created_at(&self, key: &ActorKey) -> Option<DateTime<Utc>> {
        self.instances.lock().get(key).map(|e| e.created_at)
    }

    pub fn keys(&self) -> Vec<ActorKey> {
        let mut keys: Vec<_> = self.instances.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }

    /// Verify `token` for `key` and return the caller it names
    pub fn authorize(&self, key: &ActorKey, token: &str) -> Result<Claims> {
        if !self.is_registered(&key.actor_type) {
            return Err(KitError::UnknownActorType(key.actor_type.clone()));
        }
        let claims = self.issuer.verify(token, key)?;
        debug!(
            target: "kitchencraft::audit",
            actor = %key,
            caller = %claims.caller(),
            jti = %claims.jti,
            "token accepted"
        );
        Ok(claims)
    }

    /// Handshake: verify the token, then open a channel
    pub async fn open_channel(&self, key: &ActorKey, token: &str) -> Result<SyncChannel> {
        let caller = self.authorize(key, token)?.caller();
        self.resolve(key, &caller)?.subscribe(caller).await
    }

    /// Verify the token, then return the caller's snapshot
    pub async fn snapshot(&self, key: &ActorKey, token: &str) -> Result<View> {
        let caller = self.authorize(key, token)?.caller();
        self.resolve(key, &caller)?.snapshot(caller).await
    }

    /// Verify the token, then submit an event as its caller
    pub async fn submit(&self, key: &ActorKey, token: &str, payload: Value) -> Result<()> {
        let caller = self.authorize(key, token)?.caller();
        self.dispatch(key, RawEvent::from_caller(caller, payload))
            .await
    }

    /// Submit an event from an already authenticated caller
    pub async fn dispatch(&self, key: &ActorKey, raw: RawEvent) -> Result<()> {
        self.resolve(key, &raw.caller)?.send(raw).await
    }
}
