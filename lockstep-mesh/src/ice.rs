//! ICE configuration resolution
//!
//! Produces the three connection-setup profiles the escalation ladder walks
//! through. Relay credentials are fetched from the credential endpoint and
//! cached for their TTL; a failed fetch degrades hybrid to direct-only
//! instead of erroring.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use lockstep_core::config::IceConfig;
use lockstep_core::{Error, Result};

use crate::tier::RelayProfile;

/// Cache key for the single relay credential entry
const CREDENTIAL_CACHE_KEY: &str = "relay_credential";

/// One ICE server entry handed to the connection factory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcIceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl RtcIceServer {
    #[must_use]
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Candidate-gathering policy for a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportPolicy {
    /// Gather every candidate type
    All,
    /// Gather relay candidates only
    Relay,
}

/// Resolved ICE configuration for one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcIceConfig {
    pub servers: Vec<RtcIceServer>,
    pub policy: TransportPolicy,
}

/// Time-limited relay credential as served by the credential endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayCredential {
    pub urls: Vec<String>,
    pub username: String,
    pub password: String,
    pub expires_at: DateTime<Utc>,
}

impl RelayCredential {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Source of relay credentials
#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<RelayCredential>;
}

/// Fetches relay credentials from the configured HTTP endpoint
pub struct HttpCredentialFetcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCredentialFetcher {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl CredentialFetcher for HttpCredentialFetcher {
    async fn fetch(&self) -> anyhow::Result<RelayCredential> {
        let credential = self
            .client
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?
            .json::<RelayCredential>()
            .await?;
        Ok(credential)
    }
}

/// Resolves relay profiles into concrete ICE configurations
pub struct IceResolver {
    stun_urls: Vec<String>,
    fetcher: Option<Arc<dyn CredentialFetcher>>,
    credential_cache: Cache<&'static str, RelayCredential>,
}

impl IceResolver {
    #[must_use]
    pub fn new(config: &IceConfig, fetcher: Option<Arc<dyn CredentialFetcher>>) -> Self {
        let fetcher = fetcher.or_else(|| {
            config
                .credential_endpoint
                .as_ref()
                .map(|ep| Arc::new(HttpCredentialFetcher::new(ep.clone())) as Arc<dyn CredentialFetcher>)
        });

        // TTL slightly under the credential lifetime so a cached entry is
        // never handed out expired.
        let ttl = config
            .credential_ttl()
            .saturating_sub(Duration::from_secs(60))
            .max(Duration::from_secs(60));

        Self {
            stun_urls: config.stun_urls.clone(),
            fetcher,
            credential_cache: Cache::builder().max_capacity(1).time_to_live(ttl).build(),
        }
    }

    /// Resolve a profile into the ICE servers and policy for one attempt
    pub async fn resolve(&self, profile: RelayProfile) -> Result<RtcIceConfig> {
        match profile {
            RelayProfile::DirectOnly => Ok(RtcIceConfig {
                servers: self.stun_servers(),
                policy: TransportPolicy::All,
            }),
            RelayProfile::Hybrid => {
                let mut servers = self.stun_servers();
                match self.relay_credential().await {
                    Some(credential) => servers.push(Self::relay_server(&credential)),
                    None => {
                        // Degrade rather than fail: a hybrid attempt without
                        // relay hints is exactly a direct-only attempt.
                        debug!("no relay credential available, hybrid degrades to direct-only");
                    }
                }
                Ok(RtcIceConfig {
                    servers,
                    policy: TransportPolicy::All,
                })
            }
            RelayProfile::RelayOnly => {
                let credential = self.relay_credential().await.ok_or_else(|| {
                    Error::NegotiationFailed(
                        "relay-only attempt has no relay credential".to_string(),
                    )
                })?;
                Ok(RtcIceConfig {
                    servers: vec![Self::relay_server(&credential)],
                    policy: TransportPolicy::Relay,
                })
            }
        }
    }

    fn stun_servers(&self) -> Vec<RtcIceServer> {
        self.stun_urls
            .iter()
            .map(|url| RtcIceServer::stun(url.clone()))
            .collect()
    }

    fn relay_server(credential: &RelayCredential) -> RtcIceServer {
        RtcIceServer {
            urls: credential.urls.clone(),
            username: Some(credential.username.clone()),
            credential: Some(credential.password.clone()),
        }
    }

    /// Fetch-or-cache the relay credential; `None` when no fetcher is
    /// configured, the fetch fails, or the credential came back expired
    async fn relay_credential(&self) -> Option<RelayCredential> {
        let fetcher = self.fetcher.as_ref()?;

        let result = self
            .credential_cache
            .try_get_with(CREDENTIAL_CACHE_KEY, async {
                fetcher.fetch().await
            })
            .await;

        match result {
            Ok(credential) if credential.is_expired() => {
                warn!("credential endpoint returned an already-expired relay credential");
                self.credential_cache.invalidate(CREDENTIAL_CACHE_KEY).await;
                None
            }
            Ok(credential) => Some(credential),
            Err(err) => {
                warn!(error = %err, "relay credential fetch failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StaticFetcher {
        calls: AtomicU32,
        fail: bool,
    }

    impl StaticFetcher {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl CredentialFetcher for StaticFetcher {
        async fn fetch(&self) -> anyhow::Result<RelayCredential> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow::anyhow!("endpoint unreachable"));
            }
            Ok(RelayCredential {
                urls: vec!["turn:turn.example.com:3478".to_string()],
                username: "1754500000:alice".to_string(),
                password: "secret".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    fn resolver(fetcher: Option<Arc<dyn CredentialFetcher>>) -> IceResolver {
        IceResolver::new(&IceConfig::default(), fetcher)
    }

    #[tokio::test]
    async fn test_direct_only_has_no_relay_servers() {
        let config = resolver(None)
            .resolve(RelayProfile::DirectOnly)
            .await
            .unwrap();

        assert_eq!(config.policy, TransportPolicy::All);
        assert!(config.servers.iter().all(|s| s.credential.is_none()));
    }

    #[tokio::test]
    async fn test_hybrid_includes_relay_when_fetch_succeeds() {
        let fetcher: Arc<dyn CredentialFetcher> = Arc::new(StaticFetcher::new(false));
        let config = resolver(Some(fetcher))
            .resolve(RelayProfile::Hybrid)
            .await
            .unwrap();

        assert_eq!(config.policy, TransportPolicy::All);
        assert!(config.servers.iter().any(|s| s.credential.is_some()));
    }

    #[tokio::test]
    async fn test_hybrid_degrades_to_direct_on_fetch_failure() {
        let fetcher: Arc<dyn CredentialFetcher> = Arc::new(StaticFetcher::new(true));
        let config = resolver(Some(fetcher))
            .resolve(RelayProfile::Hybrid)
            .await
            .unwrap();

        assert_eq!(config.policy, TransportPolicy::All);
        assert!(config.servers.iter().all(|s| s.credential.is_none()));
    }

    #[tokio::test]
    async fn test_relay_only_requires_credential() {
        let err = resolver(None)
            .resolve(RelayProfile::RelayOnly)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NegotiationFailed(_)));

        let fetcher: Arc<dyn CredentialFetcher> = Arc::new(StaticFetcher::new(false));
        let config = resolver(Some(fetcher))
            .resolve(RelayProfile::RelayOnly)
            .await
            .unwrap();
        assert_eq!(config.policy, TransportPolicy::Relay);
        assert_eq!(config.servers.len(), 1);
    }

    #[tokio::test]
    async fn test_credential_is_cached_across_resolves() {
        let fetcher = Arc::new(StaticFetcher::new(false));
        let resolver = resolver(Some(fetcher.clone() as Arc<dyn CredentialFetcher>));

        resolver.resolve(RelayProfile::Hybrid).await.unwrap();
        resolver.resolve(RelayProfile::Hybrid).await.unwrap();
        resolver.resolve(RelayProfile::RelayOnly).await.unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
