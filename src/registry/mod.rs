/// Client for the external port registry
///
/// The registry is an optional enhancement: every call here degrades to the last good
/// listing (or an empty one) instead of failing. One cache slot is shared by the whole
/// process; construct one `RegistryClient` and hand out `Arc`s to it.
pub mod transport;

#[cfg(test)]
pub mod testing;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::app::{REGISTRY_DESCRIPTION, REGISTRY_PROJECT};
use crate::error::RecoverableError;
pub use transport::{HttpTransport, PortRequest, RegistryTransport};

/// Owner reported for entries that don't name a project
pub const UNKNOWN_PROJECT: &str = "?";

/// One service as listed by `GET /ports`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub port: u16,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub in_use: bool,
}

impl RegistryEntry {
    pub fn owner(&self) -> &str {
        self.project.as_deref().unwrap_or(UNKNOWN_PROJECT)
    }
}

/// service name -> entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    services: BTreeMap<String, RegistryEntry>,
}

impl RegistrySnapshot {
    pub fn new(services: BTreeMap<String, RegistryEntry>) -> Self {
        Self { services }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn get(&self, service: &str) -> Option<&RegistryEntry> {
        self.services.get(service)
    }

    /// port -> distinct owning projects
    pub fn owners_by_port(&self) -> BTreeMap<u16, BTreeSet<String>> {
        let mut by_port: BTreeMap<u16, BTreeSet<String>> = BTreeMap::new();
        for entry in self.services.values() {
            by_port
                .entry(entry.port)
                .or_default()
                .insert(entry.owner().to_string());
        }
        by_port
    }
}

/// Injected time source so cache expiry is testable
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct CacheSlot {
    snapshot: Arc<RegistrySnapshot>,
    fetched_at: Option<Instant>,
}

pub struct RegistryClient {
    transport: Arc<dyn RegistryTransport>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    timeout: Duration,
    cache: RwLock<CacheSlot>,
    // Held only while a refresh is in flight, so concurrent misses share one request
    refresh: Mutex<()>,
}

impl RegistryClient {
    pub fn new(
        transport: Arc<dyn RegistryTransport>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            clock,
            ttl,
            timeout,
            cache: RwLock::new(CacheSlot {
                snapshot: Arc::new(RegistrySnapshot::default()),
                fetched_at: None,
            }),
            refresh: Mutex::new(()),
        }
    }

    /// Client talking HTTP to `base_url` on the system clock
    pub fn http(base_url: &str, ttl: Duration, timeout: Duration) -> Result<Self, RecoverableError> {
        let transport = HttpTransport::new(base_url, timeout)?;
        Ok(Self::new(Arc::new(transport), Arc::new(SystemClock), ttl, timeout))
    }

    fn fresh(&self) -> Option<Arc<RegistrySnapshot>> {
        let slot = self.cache.read();
        let fetched_at = slot.fetched_at?;
        (self.clock.now().saturating_duration_since(fetched_at) < self.ttl).then(|| slot.snapshot.clone())
    }

    fn cached(&self) -> Arc<RegistrySnapshot> {
        self.cache.read().snapshot.clone()
    }

    /// Current listing: cached within the TTL, otherwise refreshed, otherwise stale.
    /// Never errors; the worst case is an empty snapshot.
    pub async fn fetch(&self) -> Arc<RegistrySnapshot> {
        if let Some(snapshot) = self.fresh() {
            return snapshot;
        }

        let _guard = self.refresh.lock().await;
        // Another task may have refreshed while we waited
        if let Some(snapshot) = self.fresh() {
            return snapshot;
        }

        match self.refresh_now().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let stale = self.cached();
                warn!("{}; using cached registry ({} services)", e, stale.len());
                stale
            }
        }
    }

    async fn refresh_now(&self) -> Result<Arc<RegistrySnapshot>, RecoverableError> {
        let snapshot = tokio::time::timeout(self.timeout, self.transport.list_ports())
            .await
            .map_err(|_| {
                RecoverableError::RegistryUnavailable(format!("timed out after {:?}", self.timeout))
            })??;

        let snapshot = Arc::new(snapshot);
        let mut slot = self.cache.write();
        slot.snapshot = snapshot.clone();
        slot.fetched_at = Some(self.clock.now());
        debug!("Registry refreshed: {} services", snapshot.len());
        Ok(snapshot)
    }

    /// Ask the registry to allocate or confirm a port for one of our own services.
    /// Falls back to `preferred_port` on any failure.
    pub async fn request_port(&self, service: &str, project: &str, preferred_port: u16) -> u16 {
        let request = PortRequest {
            service: service.to_string(),
            project: project.to_string(),
            description: if project == REGISTRY_PROJECT {
                REGISTRY_DESCRIPTION.to_string()
            } else {
                String::new()
            },
            preferred_port,
        };

        match tokio::time::timeout(self.timeout, self.transport.request_port(&request)).await {
            Ok(Ok(port)) => {
                if port != preferred_port {
                    info!("Registry moved {} from :{} to :{}", service, preferred_port, port);
                }
                port
            }
            Ok(Err(e)) => {
                warn!("{}; keeping :{} for {}", e, preferred_port, service);
                preferred_port
            }
            Err(_) => {
                warn!("Port request for {} timed out; keeping :{}", service, preferred_port);
                preferred_port
            }
        }
    }
}
