//! Reverse lookup from phone number to peer identity
//!
//! Results, including misses, are cached per normalized number for a
//! configurable TTL. Concurrent lookups of the same number share one request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callbridge_session_core::config::duration_ms;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ClientError, ClientResult};
use crate::single_flight::SingleFlight;
use crate::token::endpoint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupConfig {
    #[serde(with = "duration_ms")]
    pub cache_ttl: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self { cache_ttl: Duration::from_secs(5 * 60) }
    }
}

/// Response of the reverse lookup endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupResult {
    pub exists: bool,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl LookupResult {
    pub fn not_found() -> Self {
        Self { exists: false, identity: None, display_name: None }
    }

    /// Identity to call, if the number belongs to a peer user
    pub fn peer_identity(&self) -> Option<&str> {
        if self.exists {
            self.identity.as_deref()
        } else {
            None
        }
    }
}

/// Strip formatting from a phone number, keeping a leading `+`
pub fn normalize_phone(input: &str) -> String {
    let trimmed = input.trim();
    let mut normalized = String::with_capacity(trimmed.len());
    if trimmed.starts_with('+') {
        normalized.push('+');
    }
    normalized.extend(trimmed.chars().filter(|c| c.is_ascii_digit()));
    normalized
}

#[async_trait]
pub trait LookupProvider: Send + Sync {
    async fn lookup_phone(&self, phone: &str, credential: Option<&str>) -> ClientResult<LookupResult>;
}

/// `GET {base}/users/lookup/phone?phoneNumber=`
#[derive(Debug, Clone)]
pub struct HttpLookupProvider {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpLookupProvider {
    pub fn new(base_url: Url) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl LookupProvider for HttpLookupProvider {
    async fn lookup_phone(&self, phone: &str, credential: Option<&str>) -> ClientResult<LookupResult> {
        let mut url = endpoint(&self.base_url, "users/lookup/phone")?;
        url.query_pairs_mut().append_pair("phoneNumber", phone);

        let mut request = self.client.get(url);
        if let Some(credential) = credential {
            request = request.bearer_auth(credential);
        }
        let response = request.send().await.map_err(|e| ClientError::from_request("phone lookup", &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(LookupResult::not_found());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status.as_u16(), body));
        }

        response
            .json::<LookupResult>()
            .await
            .map_err(|e| ClientError::from_request("phone lookup", &e))
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: LookupResult,
    fetched_at: Instant,
}

pub struct PhoneLookupService {
    provider: Arc<dyn LookupProvider>,
    ttl: Duration,
    cache: DashMap<String, CacheEntry>,
    flights: SingleFlight<String, ClientResult<LookupResult>>,
    credential: RwLock<Option<String>>,
}

impl PhoneLookupService {
    pub fn new(provider: Arc<dyn LookupProvider>, config: LookupConfig) -> Self {
        Self {
            provider,
            ttl: config.cache_ttl,
            cache: DashMap::new(),
            flights: SingleFlight::new(),
            credential: RwLock::new(None),
        }
    }

    /// Bearer credential attached to subsequent lookups
    pub fn set_credential(&self, credential: Option<String>) {
        *self.credential.write() = credential;
    }

    pub async fn lookup(&self, phone: &str) -> ClientResult<LookupResult> {
        let number = normalize_phone(phone);
        if let Some(hit) = self.cached(&number) {
            debug!(phone = %number, exists = hit.exists, "Phone lookup cache hit");
            return Ok(hit);
        }

        let provider = self.provider.clone();
        let credential = self.credential.read().clone();
        let key = number.clone();
        let result = self
            .flights
            .run(number.clone(), move || async move {
                provider.lookup_phone(&key, credential.as_deref()).await
            })
            .await;

        match &result {
            Ok(found) => {
                self.cache.insert(number, CacheEntry { result: found.clone(), fetched_at: Instant::now() });
            }
            Err(e) => warn!(phone = %number, error = %e, "Phone lookup failed"),
        }
        result
    }

    /// Peer identity registered for `phone`, if any
    pub async fn lookup_identity(&self, phone: &str) -> ClientResult<Option<String>> {
        Ok(self.lookup(phone).await?.peer_identity().map(str::to_string))
    }

    fn cached(&self, number: &str) -> Option<LookupResult> {
        let entry = self.cache.get(number)?;
        if entry.fetched_at.elapsed() < self.ttl {
            return Some(entry.result.clone());
        }
        drop(entry);
        self.cache.remove(number);
        None
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
