//! Google service-account credentials and the OAuth2 JWT bearer grant.

use std::fmt;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::{CredentialError, TransferError};

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
/// Create/write access to files the account creates, nothing wider.
pub const DRIVE_FILE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Refresh a cached token this long before Google would reject it.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Deserialize)]
struct ServiceAccountFile {
    #[serde(rename = "type")]
    account_type: Option<String>,
    client_email: String,
    private_key: String,
    private_key_id: Option<String>,
    token_uri: Option<String>,
}

/// A parsed service-account key. The private key only exists as a signing
/// key and is never printed.
#[derive(Clone)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key_id: Option<String>,
    pub token_uri: String,
    signing_key: EncodingKey,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

impl ServiceAccountKey {
    /// Parses the JSON key file Google issues for a service account.
    ///
    /// Error messages never quote the document, since it holds the private key.
    pub fn from_json(json: &str) -> Result<Self, CredentialError> {
        let file: ServiceAccountFile = serde_json::from_str(json).map_err(|e| CredentialError::Malformed {
            category: format!("{:?}", e.classify()).to_lowercase(),
            line: e.line(),
            column: e.column(),
        })?;

        if let Some(kind) = file.account_type.as_deref() {
            if kind != "service_account" {
                return Err(CredentialError::WrongType(kind.to_string()));
            }
        }
        if file.client_email.trim().is_empty() {
            return Err(CredentialError::MissingClientEmail);
        }
        let signing_key = EncodingKey::from_rsa_pem(file.private_key.as_bytes())
            .map_err(|_| CredentialError::InvalidPrivateKey)?;

        Ok(Self {
            client_email: file.client_email,
            private_key_id: file.private_key_id,
            token_uri: file
                .token_uri
                .filter(|uri| !uri.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            signing_key,
        })
    }

    fn signed_assertion(&self, scope: &str, issued_at: i64) -> Result<String, TransferError> {
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope,
            aud: &self.token_uri,
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();
        jsonwebtoken::encode(&header, &claims, &self.signing_key)
            .map_err(|e| TransferError::Auth(format!("could not sign token request: {e}")))
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Deserialize, Default)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

struct CachedToken {
    client_email: String,
    access_token: String,
    expires_at: i64,
}

/// Exchanges signed assertions for access tokens and caches the result.
pub struct ServiceAccountAuth {
    http: reqwest::Client,
    scope: String,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountAuth {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            scope: DRIVE_FILE_SCOPE.to_string(),
            cached: Mutex::new(None),
        }
    }

    /// Returns a bearer token for `key`, fetching a new one when the cached
    /// token is missing, about to expire, or belongs to another account.
    pub async fn access_token(&self, key: &ServiceAccountKey) -> Result<String, TransferError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now().timestamp();
        if let Some(token) = cached.as_ref() {
            if token.client_email == key.client_email && token.expires_at - EXPIRY_MARGIN_SECS > now {
                return Ok(token.access_token.clone());
            }
        }

        let fresh = self.request_token(key, now).await?;
        let access_token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(access_token)
    }

    async fn request_token(&self, key: &ServiceAccountKey, now: i64) -> Result<CachedToken, TransferError> {
        const OPERATION: &str = "token exchange";
        let assertion = key.signed_assertion(&self.scope, now)?;
        debug!(client_email = %key.client_email, token_uri = %key.token_uri, "Requesting Drive access token");

        let response = self
            .http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|source| TransferError::Network { operation: OPERATION, source })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(TransferError::Status {
                operation: OPERATION,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        if !status.is_success() {
            let detail: TokenErrorResponse = response.json().await.unwrap_or_default();
            return Err(TransferError::Auth(format!(
                "HTTP {}: {} {}",
                status.as_u16(),
                detail.error,
                detail.error_description
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| TransferError::Protocol {
            operation: OPERATION,
            detail: e.to_string(),
        })?;
        Ok(CachedToken {
            client_email: key.client_email.clone(),
            access_token: token.access_token,
            expires_at: now + token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS),
        })
    }
}
