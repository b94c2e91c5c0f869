/// HTTP side of the registry client
///
/// `GET /ports` lists services, `POST /ports/request` asks for an allocation. Decode
/// failures are reported as malformed; everything else counts as unavailable.
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{RegistryEntry, RegistrySnapshot};
use crate::error::RecoverableError;

/// Body of `POST /ports/request`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortRequest {
    pub service: String,
    pub project: String,
    pub description: String,
    pub preferred_port: u16,
}

#[derive(Debug, Deserialize)]
struct PortGrant {
    port: u16,
}

/// The wire side of the registry client
pub trait RegistryTransport: Send + Sync {
    /// `GET /ports`
    fn list_ports(&self) -> BoxFuture<'_, Result<RegistrySnapshot, RecoverableError>>;

    /// `POST /ports/request`
    fn request_port<'a>(&'a self, request: &'a PortRequest) -> BoxFuture<'a, Result<u16, RecoverableError>>;
}

pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RecoverableError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| RecoverableError::RegistryUnavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn classify(e: reqwest::Error) -> RecoverableError {
    if e.is_decode() {
        RecoverableError::RegistryMalformed(e.to_string())
    } else {
        RecoverableError::RegistryUnavailable(e.to_string())
    }
}

impl RegistryTransport for HttpTransport {
    fn list_ports(&self) -> BoxFuture<'_, Result<RegistrySnapshot, RecoverableError>> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.url("/ports"))
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(classify)?;
            let entries: BTreeMap<String, RegistryEntry> = response.json().await.map_err(classify)?;
            Ok(RegistrySnapshot::new(entries))
        })
    }

    fn request_port<'a>(&'a self, request: &'a PortRequest) -> BoxFuture<'a, Result<u16, RecoverableError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url("/ports/request"))
                .json(request)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(classify)?;
            let grant: PortGrant = response.json().await.map_err(classify)?;
            Ok(grant.port)
        })
    }
}
