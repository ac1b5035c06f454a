//! Transport credential fetch
//!
//! [`TokenService`] resolves which transports the account may use and vends
//! the carrier access token. Concurrent requests for the same credential share
//! one fetch; the fetch is retried with backoff for recoverable failures and
//! bounded overall by a timeout. A fetched token is reused until shortly
//! before it expires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::client::recovery::{retry_with_backoff, with_timeout, ErrorContext, RetryConfig};
use crate::error::{ClientError, ClientResult};
use crate::lifecycle::CallMode;
use crate::single_flight::SingleFlight;

/// Tokens are treated as expired this long before `expires_at`
pub const EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// Response of the credential endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportToken {
    #[serde(default)]
    pub mode: Option<CallMode>,
    #[serde(default)]
    pub peer_ready: Option<bool>,
    #[serde(default)]
    pub carrier_token: Option<String>,
    pub identity: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TransportToken {
    /// Whether the account may boot the carrier transport
    pub fn carrier_enabled(&self) -> bool {
        self.carrier_token.is_some() && !matches!(self.mode, Some(CallMode::Peer) | Some(CallMode::None))
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let skew = chrono::Duration::from_std(EXPIRY_SKEW).unwrap_or_else(|_| chrono::Duration::zero());
                now < expires_at - skew
            }
            None => true,
        }
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self, credential: &str) -> ClientResult<TransportToken>;
}

/// Join `path` onto `base`, keeping any path prefix on the base
pub(crate) fn endpoint(base: &Url, path: &str) -> ClientResult<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path).context("building endpoint url")
}

/// `GET {base}/token` with bearer auth
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTokenProvider {
    pub fn new(base_url: Url) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self, credential: &str) -> ClientResult<TransportToken> {
        let url = endpoint(&self.base_url, "token")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| ClientError::from_request("token fetch", &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status.as_u16(), body));
        }

        response
            .json::<TransportToken>()
            .await
            .map_err(|e| ClientError::from_request("token fetch", &e))
    }
}

struct CachedToken {
    credential: String,
    token: TransportToken,
}

pub struct TokenService {
    provider: Arc<dyn TokenProvider>,
    fetch_timeout: Duration,
    retry: RetryConfig,
    cache: Mutex<Option<CachedToken>>,
    flights: SingleFlight<String, ClientResult<TransportToken>>,
}

impl TokenService {
    pub fn new(provider: Arc<dyn TokenProvider>, fetch_timeout: Duration) -> Self {
        Self {
            provider,
            fetch_timeout,
            retry: RetryConfig::quick(),
            cache: Mutex::new(None),
            flights: SingleFlight::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Token for `credential`, from cache or a shared fetch
    pub async fn get_token(&self, credential: &str) -> ClientResult<TransportToken> {
        if let Some(token) = self.cached(credential) {
            debug!("Using cached transport token");
            return Ok(token);
        }

        let provider = self.provider.clone();
        let retry = self.retry.clone();
        let fetch_timeout = self.fetch_timeout;
        let owned = credential.to_string();

        let result = self
            .flights
            .run(owned.clone(), move || async move {
                with_timeout(
                    "token fetch",
                    fetch_timeout,
                    retry_with_backoff("token fetch", retry, || {
                        let provider = provider.clone();
                        let credential = owned.clone();
                        async move { provider.fetch_token(&credential).await }
                    }),
                )
                .await
            })
            .await;

        if let Ok(token) = &result {
            info!(identity = %token.identity, mode = ?token.mode, carrier = token.carrier_enabled(), "Transport token fetched");
            *self.cache.lock() = Some(CachedToken { credential: credential.to_string(), token: token.clone() });
        }
        result
    }

    /// Drop the cached token so the next request refetches
    pub fn invalidate(&self) {
        if self.cache.lock().take().is_some() {
            debug!("Transport token invalidated");
        }
    }

    pub fn cached(&self, credential: &str) -> Option<TransportToken> {
        let cache = self.cache.lock();
        cache
            .as_ref()
            .filter(|c| c.credential == credential && c.token.is_fresh(Utc::now()))
            .map(|c| c.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProvider {
        calls: AtomicU32,
        delay: Duration,
        expires_in: Option<chrono::Duration>,
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn fetch_token(&self, credential: &str) -> ClientResult<TransportToken> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(TransportToken {
                mode: Some(CallMode::Dual),
                peer_ready: Some(true),
                carrier_token: Some(format!("carrier-{credential}")),
                identity: "alice".to_string(),
                expires_at: self.expires_in.map(|d| Utc::now() + d),
            })
        }
    }

    fn provider(delay: Duration, expires_in: Option<chrono::Duration>) -> Arc<CountingProvider> {
        Arc::new(CountingProvider { calls: AtomicU32::new(0), delay, expires_in })
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_share_one_request() {
        let provider = provider(Duration::from_millis(200), None);
        let service = Arc::new(TokenService::new(provider.clone(), Duration::from_secs(30)));

        let (a, b, c) = tokio::join!(
            service.get_token("cred"),
            service.get_token("cred"),
            service.get_token("cred")
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(c.unwrap().identity, "alice");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_until_invalidated() {
        let provider = provider(Duration::ZERO, None);
        let service = TokenService::new(provider.clone(), Duration::from_secs(30));

        service.get_token("cred").await.unwrap();
        service.get_token("cred").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        service.invalidate();
        service.get_token("cred").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        service.get_token("other").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_expiry_token_is_refetched() {
        let provider = provider(Duration::ZERO, Some(chrono::Duration::seconds(30)));
        let service = TokenService::new(provider.clone(), Duration::from_secs(30));

        service.get_token("cred").await.unwrap();
        service.get_token("cred").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_is_timeout_bounded() {
        let provider = provider(Duration::from_secs(120), None);
        let service = TokenService::new(provider, Duration::from_secs(30));

        let err = service.get_token("cred").await.unwrap_err();
        assert!(matches!(err, ClientError::OperationTimeout { duration_ms: 30000, .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_carrier_enabled() {
        let mut token = TransportToken {
            mode: Some(CallMode::Dual),
            peer_ready: None,
            carrier_token: Some("t".into()),
            identity: "a".into(),
            expires_at: None,
        };
        assert!(token.carrier_enabled());
        token.mode = Some(CallMode::Peer);
        assert!(!token.carrier_enabled());
        token.mode = None;
        token.carrier_token = None;
        assert!(!token.carrier_enabled());
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let base = Url::parse("https://api.example.com/v1").unwrap();
        assert_eq!(endpoint(&base, "token").unwrap().as_str(), "https://api.example.com/v1/token");
        let base = Url::parse("https://api.example.com/").unwrap();
        assert_eq!(
            endpoint(&base, "users/lookup/phone").unwrap().as_str(),
            "https://api.example.com/users/lookup/phone"
        );
    }
}
