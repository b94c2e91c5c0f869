//! Fakes for exercising the registry seams without a network

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::{Clock, PortRequest, RegistryEntry, RegistrySnapshot, RegistryTransport};
use crate::error::RecoverableError;

pub fn entry(port: u16, project: &str) -> RegistryEntry {
    RegistryEntry {
        port,
        project: Some(project.to_string()),
        description: None,
        in_use: true,
    }
}

pub fn registry_with<const N: usize>(services: [(&str, RegistryEntry); N]) -> RegistrySnapshot {
    RegistrySnapshot::new(
        services
            .into_iter()
            .map(|(name, entry)| (name.to_string(), entry))
            .collect::<BTreeMap<_, _>>(),
    )
}

pub struct FakeTransport {
    listing: Mutex<RegistrySnapshot>,
    grant: Mutex<Option<u16>>,
    delay: Mutex<Option<Duration>>,
    last_request: Mutex<Option<PortRequest>>,
    // Returned by every call while set
    failure: Mutex<Option<RecoverableError>>,
    list_calls: AtomicUsize,
}

impl FakeTransport {
    pub fn new(listing: RegistrySnapshot) -> Self {
        Self {
            listing: Mutex::new(listing),
            grant: Mutex::new(None),
            delay: Mutex::new(None),
            last_request: Mutex::new(None),
            failure: Mutex::new(None),
            list_calls: AtomicUsize::new(0),
        }
    }

    pub fn down() -> Self {
        let transport = Self::new(RegistrySnapshot::default());
        transport.go_down();
        transport
    }

    pub fn go_down(&self) {
        self.fail_with(RecoverableError::RegistryUnavailable("connection refused".to_string()));
    }

    pub fn fail_with(&self, error: RecoverableError) {
        *self.failure.lock() = Some(error);
    }

    pub fn set_listing(&self, listing: RegistrySnapshot) {
        *self.listing.lock() = listing;
    }

    pub fn set_grant(&self, port: Option<u16>) {
        *self.grant.lock() = port;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<PortRequest> {
        self.last_request.lock().clone()
    }
}

impl RegistryTransport for FakeTransport {
    fn list_ports(&self) -> BoxFuture<'_, Result<RegistrySnapshot, RecoverableError>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(error) = self.failure.lock().clone() {
                return Err(error);
            }
            Ok(self.listing.lock().clone())
        })
    }

    fn request_port<'a>(&'a self, request: &'a PortRequest) -> BoxFuture<'a, Result<u16, RecoverableError>> {
        *self.last_request.lock() = Some(request.clone());
        Box::pin(async move {
            if let Some(error) = self.failure.lock().clone() {
                return Err(error);
            }
            Ok(self.grant.lock().unwrap_or(request.preferred_port))
        })
    }
}

pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}
