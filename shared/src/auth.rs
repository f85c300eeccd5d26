//! Google OAuth2 access tokens for calling Cloud APIs.
//!
//! Credentials are resolved in this order:
//! 1. `GOOGLE_ACCESS_TOKEN` - a pre-minted token, handy for local runs
//! 2. `GOOGLE_APPLICATION_CREDENTIALS` - a service-account JSON key, exchanged
//!    through a signed JWT bearer assertion
//! 3. the metadata server available on Cloud Run and GCE

use std::env;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::http::ensure_success;
use crate::{Error, Result};

/// Scope covering Discovery Engine and Vertex AI.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens are refreshed this long before they actually expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Service-account key file as downloaded from the console.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

/// Claims of the JWT bearer assertion sent to the token endpoint.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssertionClaims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

impl AssertionClaims {
    pub fn new(key: &ServiceAccountKey, now: DateTime<Utc>) -> Self {
        let iat = now.timestamp();
        Self {
            iss: key.client_email.clone(),
            scope: CLOUD_PLATFORM_SCOPE.to_string(),
            aud: key
                .token_uri
                .clone()
                .unwrap_or_else(|| TOKEN_URI.to_string()),
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        }
    }
}

/// Google OAuth token response
#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    expires_in: i64,
}

/// A bearer token and the moment it stops being valid.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn from_response(response: GoogleTokenResponse, now: DateTime<Utc>) -> Self {
        Self {
            token: response.access_token,
            expires_at: now + Duration::seconds(response.expires_in),
        }
    }

    /// Whether the token can still be handed out at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS) > now
    }
}

/// Where access tokens come from.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    Static(String),
    ServiceAccount(ServiceAccountKey),
    MetadataServer,
}

impl CredentialSource {
    /// Resolve the credential source from the environment.
    pub fn from_env() -> Result<Self> {
        if let Some(token) = env::var("GOOGLE_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
        {
            return Ok(CredentialSource::Static(token.trim().to_string()));
        }

        if let Ok(path) = env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| Error::Auth(format!("Failed to read {}: {}", path, e)))?;
            let key: ServiceAccountKey = serde_json::from_str(&content)
                .map_err(|e| Error::Auth(format!("Invalid service account key {}: {}", path, e)))?;
            return Ok(CredentialSource::ServiceAccount(key));
        }

        Ok(CredentialSource::MetadataServer)
    }

    fn describe(&self) -> &'static str {
        match self {
            CredentialSource::Static(_) => "static token",
            CredentialSource::ServiceAccount(_) => "service account key",
            CredentialSource::MetadataServer => "metadata server",
        }
    }
}

/// Hands out access tokens, fetching a new one only when the cached one is
/// about to expire.
pub struct TokenProvider {
    source: CredentialSource,
    http_client: reqwest::Client,
    cache: RwLock<Option<AccessToken>>,
}

impl TokenProvider {
    pub fn new(source: CredentialSource, http_client: reqwest::Client) -> Self {
        info!(source = source.describe(), "Using Google credentials");
        Self {
            source,
            http_client,
            cache: RwLock::new(None),
        }
    }

    /// Get a valid access token.
    pub async fn access_token(&self) -> Result<String> {
        {
            let cache = self.cache.read().await;
            if let Some(token) = cache.as_ref().filter(|t| t.is_fresh(Utc::now())) {
                return Ok(token.token.clone());
            }
        }

        let token = self.fetch().await?;
        debug!(expires_at = %token.expires_at, "Fetched access token");

        let value = token.token.clone();
        *self.cache.write().await = Some(token);
        Ok(value)
    }

    async fn fetch(&self) -> Result<AccessToken> {
        let now = Utc::now();
        match &self.source {
            CredentialSource::Static(token) => Ok(AccessToken {
                token: token.clone(),
                expires_at: now + Duration::hours(12),
            }),
            CredentialSource::ServiceAccount(key) => self.exchange_assertion(key, now).await,
            CredentialSource::MetadataServer => self.fetch_from_metadata(now).await,
        }
    }

    /// Exchange a signed JWT assertion for an access token
    async fn exchange_assertion(
        &self,
        key: &ServiceAccountKey,
        now: DateTime<Utc>,
    ) -> Result<AccessToken> {
        let assertion = sign_assertion(key, now)?;
        let token_uri = key.token_uri.as_deref().unwrap_or(TOKEN_URI);

        let params = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];

        let response = self
            .http_client
            .post(token_uri)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Auth(format!("Token exchange request failed: {}", e)))?;

        let response = ensure_success("oauth2", response).await?;
        let token_response: GoogleTokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("Failed to parse token response: {}", e)))?;

        Ok(AccessToken::from_response(token_response, now))
    }

    async fn fetch_from_metadata(&self, now: DateTime<Utc>) -> Result<AccessToken> {
        let response = self
            .http_client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| Error::Auth(format!("Metadata server unreachable: {}", e)))?;

        let response = ensure_success("metadata", response).await?;
        let token_response: GoogleTokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("Failed to parse metadata token: {}", e)))?;

        Ok(AccessToken::from_response(token_response, now))
    }
}

/// Sign the RS256 bearer assertion for a service-account key.
pub fn sign_assertion(key: &ServiceAccountKey, now: DateTime<Utc>) -> Result<String> {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = key.private_key_id.clone();

    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| Error::Auth(format!("Invalid private key: {}", e)))?;

    encode(&header, &AssertionClaims::new(key, now), &encoding_key)
        .map_err(|e| Error::Auth(format!("Failed to sign assertion: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ServiceAccountKey {
        serde_json::from_str(
            r#"{
                "type": "service_account",
                "client_email": "loader@p1.iam.gserviceaccount.com",
                "private_key": "not a pem",
                "private_key_id": "abc123"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_assertion_claims() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let claims = AssertionClaims::new(&key(), now);

        assert_eq!(claims.iss, "loader@p1.iam.gserviceaccount.com");
        assert_eq!(claims.scope, CLOUD_PLATFORM_SCOPE);
        assert_eq!(claims.aud, "https://oauth2.googleapis.com/token");
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_invalid_private_key_is_auth_error() {
        let result = sign_assertion(&key(), Utc::now());
        assert!(matches!(result, Err(Error::Auth(_))));
    }

    #[test]
    fn test_token_freshness() {
        let now = Utc::now();
        let token = AccessToken {
            token: "t".to_string(),
            expires_at: now + Duration::seconds(120),
        };
        assert!(token.is_fresh(now));
        assert!(!token.is_fresh(now + Duration::seconds(61)));
    }

    #[tokio::test]
    async fn test_static_token_is_served_from_cache() {
        let provider = TokenProvider::new(
            CredentialSource::Static("local-token".to_string()),
            reqwest::Client::new(),
        );

        assert_eq!(provider.access_token().await.unwrap(), "local-token");
        assert!(provider.cache.read().await.is_some());
        assert_eq!(provider.access_token().await.unwrap(), "local-token");
    }
}
