//! Live connector instances, cached by logical query identity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rowtap_core::Result;
use serde_json::Value;
use tracing::{debug, info};

use crate::registry::ConnectorRegistry;
use crate::{ConnectionDescriptor, Connector};

/// Continuation state of one client.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ClientCursor {
    /// Canonical filters + sort + fields the cursor belongs to.
    pub(crate) signature: String,
    pub(crate) last_seen: Option<Value>,
    pub(crate) last_used: Instant,
}

impl ClientCursor {
    pub(crate) fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            last_seen: None,
            last_used: Instant::now(),
        }
    }
}

/// A connector bound to one identity, plus per-client continuation state.
pub struct ConnectorInstance {
    id: String,
    descriptor: ConnectionDescriptor,
    registration: String,
    dialect: String,
    connector: Arc<dyn Connector>,
    /// Held for the duration of each read; serializes reads on this instance.
    cursors: tokio::sync::Mutex<HashMap<String, ClientCursor>>,
    last_used: Mutex<Instant>,
}

impl ConnectorInstance {
    pub fn new(
        id: impl Into<String>,
        descriptor: ConnectionDescriptor,
        registration: impl Into<String>,
        dialect: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            id: id.into(),
            descriptor,
            registration: registration.into(),
            dialect: dialect.into(),
            connector,
            cursors: tokio::sync::Mutex::new(HashMap::new()),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn registration(&self) -> &str {
        &self.registration
    }

    pub fn dialect_name(&self) -> &str {
        &self.dialect
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Forget client cursors unused for at least `ttl`. Returns how many were dropped.
    pub async fn prune_cursors(&self, ttl: Duration) -> usize {
        let mut cursors = self.cursors.lock().await;
        let before = cursors.len();
        cursors.retain(|_, cursor| cursor.last_used.elapsed() < ttl);
        before - cursors.len()
    }

    pub(crate) async fn lock_reads(&self) -> tokio::sync::MutexGuard<'_, HashMap<String, ClientCursor>> {
        self.cursors.lock().await
    }
}

/// Cache of [`ConnectorInstance`]s keyed by identity.
pub struct ConnectorStore {
    registry: ConnectorRegistry,
    instances: Mutex<HashMap<String, Arc<ConnectorInstance>>>,
}

impl ConnectorStore {
    pub fn new(registry: ConnectorRegistry) -> Self {
        Self {
            registry,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ConnectorInstance>>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ConnectorInstance>> {
        self.lock().get(id).cloned()
    }

    /// Return the cached instance for `id`, building one if there is none or
    /// if the descriptor changed. Connecting happens outside the map lock.
    pub async fn resolve(&self, id: &str, descriptor: &ConnectionDescriptor) -> Result<Arc<ConnectorInstance>> {
        if let Some(existing) = self.get(id) {
            if existing.descriptor == *descriptor {
                existing.touch();
                debug!("Reusing {} connector for '{}'", existing.dialect, id);
                return Ok(existing);
            }
        }

        let (registration, dialect) = self.registry.resolve(descriptor)?;
        let canonical = ConnectionDescriptor {
            uri: registration.factory.canonical_uri(&descriptor.uri)?,
            ..descriptor.clone()
        };
        let connector = registration.factory.connect(&canonical).await?;
        let instance = Arc::new(ConnectorInstance::new(
            id,
            descriptor.clone(),
            registration.name.clone(),
            dialect,
            connector,
        ));

        // A concurrent caller may have finished first; keep its instance.
        let (winner, stale) = {
            let mut instances = self.lock();
            let current = instances
                .get(id)
                .filter(|current| current.descriptor == *descriptor)
                .cloned();
            match current {
                Some(current) => (current, Some(instance)),
                None => {
                    let replaced = instances.insert(id.to_string(), instance.clone());
                    (instance, replaced)
                }
            }
        };
        if let Some(stale) = stale {
            stale.connector.close().await;
        }
        info!(
            "Connector '{}' ready for '{}' ({} dialect)",
            winner.registration, id, winner.dialect
        );
        Ok(winner)
    }

    /// Drop the instance for `id`. Returns whether one existed.
    pub async fn close(&self, id: &str) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some(instance) => {
                instance.connector.close().await;
                info!("Closed connector for '{}'", id);
                true
            }
            None => false,
        }
    }

    /// Close instances unused for at least `ttl`. Instances a caller still
    /// holds are skipped. Client cursors idle for `ttl` are dropped from the
    /// instances that stay. Returns how many instances were closed.
    pub async fn evict_idle(&self, ttl: Duration) -> usize {
        let (evicted, kept): (Vec<Arc<ConnectorInstance>>, Vec<Arc<ConnectorInstance>>) = {
            let mut instances = self.lock();
            let idle: Vec<String> = instances
                .iter()
                .filter(|(_, inst)| Arc::strong_count(inst) == 1 && inst.idle_for() >= ttl)
                .map(|(id, _)| id.clone())
                .collect();
            let evicted = idle.iter().filter_map(|id| instances.remove(id)).collect();
            (evicted, instances.values().cloned().collect())
        };
        for instance in &evicted {
            instance.connector.close().await;
            info!("Evicted idle connector for '{}'", instance.id);
        }
        for instance in &kept {
            let pruned = instance.prune_cursors(ttl).await;
            if pruned > 0 {
                debug!("Dropped {} stale client cursor(s) for '{}'", pruned, instance.id);
            }
        }
        evicted.len()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
