//! TURN credential minting
//!
//! RFC 5389 long-term credentials over a shared static secret, compatible
//! with coturn's `static-auth-secret` mode. The HTTP layer serves the
//! minted credential from the endpoint clients resolve relay hints from.

use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

use lockstep_core::config::IceConfig;
use lockstep_core::models::ParticipantId;

/// Time-limited TURN credential
///
/// Field names line up with what the client-side resolver deserializes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCredential {
    /// TURN server URLs this credential is valid for
    pub urls: Vec<String>,
    /// Username in format `<expiry_timestamp>:<participant_id>`
    pub username: String,
    /// base64(HMAC-SHA1(secret, username))
    pub password: String,
    /// Credential expiry time
    pub expires_at: DateTime<Utc>,
}

/// Mints TURN credentials from the shared static secret
#[derive(Clone)]
pub struct TurnCredentialService {
    config: IceConfig,
}

impl TurnCredentialService {
    #[must_use]
    pub const fn new(config: IceConfig) -> Self {
        Self { config }
    }

    /// Generate a time-limited credential for a participant
    pub fn mint(&self, participant: &ParticipantId) -> anyhow::Result<TurnCredential> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(self.config.credential_ttl())?;
        let expiry_timestamp = expires_at.timestamp();

        let username = format!("{expiry_timestamp}:{participant}");
        let password = self.compute_hmac(&username)?;

        Ok(TurnCredential {
            urls: self.config.turn_urls.clone(),
            username,
            password,
            expires_at,
        })
    }

    fn compute_hmac(&self, username: &str) -> anyhow::Result<String> {
        let mut mac = Hmac::<Sha1>::new_from_slice(self.config.turn_static_secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to create HMAC: {e}"))?;

        mac.update(username.as_bytes());
        let result = mac.finalize();
        let credential = base64::engine::general_purpose::STANDARD.encode(result.into_bytes());

        Ok(credential)
    }

    /// Whether a credential is still usable
    #[must_use]
    pub fn is_credential_valid(&self, credential: &TurnCredential) -> bool {
        Utc::now() < credential.expires_at
    }

    /// Validate the TURN portion of the configuration
    pub fn validate_config(&self) -> anyhow::Result<()> {
        if self.config.turn_urls.is_empty() {
            return Err(anyhow::anyhow!("no TURN server URLs configured"));
        }

        for url in &self.config.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                return Err(anyhow::anyhow!(
                    "TURN server URL must start with 'turn:' or 'turns:': {url}"
                ));
            }
        }

        if self.config.turn_static_secret.len() < 32 {
            return Err(anyhow::anyhow!(
                "TURN static secret should be at least 32 characters"
            ));
        }

        if self.config.credential_ttl_seconds < 60 {
            return Err(anyhow::anyhow!(
                "TURN credential TTL should be at least 60 seconds"
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IceConfig {
        IceConfig {
            turn_urls: vec!["turn:turn.example.com:3478".to_string()],
            turn_static_secret: "test_secret_key_1234567890abcdefgh".to_string(),
            credential_ttl_seconds: 3_600,
            ..Default::default()
        }
    }

    #[test]
    fn test_mint_credential() {
        let service = TurnCredentialService::new(config());
        let participant = ParticipantId::from("user12345678");

        let credential = service.mint(&participant).unwrap();

        assert!(credential.username.ends_with(":user12345678"));
        assert!(base64::engine::general_purpose::STANDARD
            .decode(&credential.password)
            .is_ok());
        assert!(credential.expires_at > Utc::now());
        assert!(service.is_credential_valid(&credential));
    }

    #[test]
    fn test_hmac_is_deterministic() {
        let service = TurnCredentialService::new(config());

        let username = "12345:user12345678";
        let first = service.compute_hmac(username).unwrap();
        let second = service.compute_hmac(username).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_expired_credential_is_invalid() {
        let service = TurnCredentialService::new(config());
        let participant = ParticipantId::from("user12345678");

        let mut credential = service.mint(&participant).unwrap();
        credential.expires_at = Utc::now() - chrono::Duration::hours(1);
        assert!(!service.is_credential_valid(&credential));
    }

    #[test]
    fn test_validate_config() {
        assert!(TurnCredentialService::new(config()).validate_config().is_ok());

        let mut no_urls = config();
        no_urls.turn_urls.clear();
        assert!(TurnCredentialService::new(no_urls).validate_config().is_err());

        let mut bad_scheme = config();
        bad_scheme.turn_urls = vec!["stun:stun.example.com".to_string()];
        assert!(TurnCredentialService::new(bad_scheme)
            .validate_config()
            .is_err());

        let mut short_secret = config();
        short_secret.turn_static_secret = "short".to_string();
        assert!(TurnCredentialService::new(short_secret)
            .validate_config()
            .is_err());

        let mut short_ttl = config();
        short_ttl.credential_ttl_seconds = 30;
        assert!(TurnCredentialService::new(short_ttl)
            .validate_config()
            .is_err());
    }
}
