//! OAuth2 session for the CAME Connect cloud
//!
//! The vendor only accepts Authorization-Code + PKCE where the code itself is
//! obtained with the resource owner's password. A refresh is therefore two
//! round trips: `/oauth/auth-code` then `/oauth/token`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::config::CredentialsConfig;
use crate::error::{GateError, GateResult};

const VERIFIER_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";
const NONCE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Refresh this long before the server-side expiry
const EXPIRY_MARGIN_SECS: i64 = 60;
/// Lower bound on a token's local lifetime
const MIN_LIFETIME_SECS: i64 = 30;

const AUTH_ERROR_CODES: [&str; 3] = ["invalid_grant", "invalid_client", "unauthorized_client"];

#[derive(Debug, Clone)]
struct TokenInfo {
    access_token: String,
    expires_at: Instant,
}

impl TokenInfo {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Failure of the most recent exchange, handed to callers that queued behind it
#[derive(Default)]
struct RefreshOutcome {
    failure: Option<GateError>,
}

/// Owns the bearer token. All callers go through `ensure_token`.
pub struct TokenManager {
    credentials: CredentialsConfig,
    base_url: String,
    http_client: Client,
    token: RwLock<Option<TokenInfo>>,
    /// Serializes refreshes so concurrent callers share one exchange
    refresh_lock: Mutex<RefreshOutcome>,
    /// Completed exchanges, successful or not
    refreshes: AtomicU64,
}

impl TokenManager {
    pub fn new(credentials: CredentialsConfig, base_url: &str, http_client: Client) -> Self {
        Self {
            credentials,
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            token: RwLock::new(None),
            refresh_lock: Mutex::new(RefreshOutcome::default()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Return a valid access token, refreshing at most once across all
    /// concurrent callers.
    ///
    /// Callers that queue behind an exchange get its outcome, whether that is
    /// the new token or the error it failed with.
    pub async fn ensure_token(&self) -> GateResult<String> {
        if let Some(token) = self.cached().await {
            return Ok(token);
        }

        let seen = self.refreshes.load(Ordering::Acquire);
        let mut outcome = self.refresh_lock.lock().await;

        // Another caller may have finished the refresh while we waited
        if let Some(token) = self.cached().await {
            return Ok(token);
        }
        if self.refreshes.load(Ordering::Acquire) != seen {
            if let Some(failure) = &outcome.failure {
                tracing::debug!("[Auth] Sharing failed refresh: {}", failure);
                return Err(failure.replay());
            }
        }

        let result = self.exchange().await;
        outcome.failure = result.as_ref().err().map(GateError::replay);
        self.refreshes.fetch_add(1, Ordering::Release);

        result
    }

    async fn exchange(&self) -> GateResult<String> {
        let verifier = generate_code_verifier(64);
        let code = self.fetch_auth_code(&verifier).await?;
        let info = self.fetch_token(&code, &verifier).await?;
        let access_token = info.access_token.clone();

        *self.token.write().await = Some(info);
        Ok(access_token)
    }

    /// Drop the cached token so the next `ensure_token` re-exchanges
    pub async fn invalidate(&self) {
        let mut token = self.token.write().await;
        if token.take().is_some() {
            tracing::debug!("[Auth] Cached token invalidated");
        }
    }

    async fn cached(&self) -> Option<String> {
        let token = self.token.read().await;
        token
            .as_ref()
            .filter(|t| t.is_valid())
            .map(|t| t.access_token.clone())
    }

    fn basic_header(&self) -> String {
        let raw = format!(
            "{}:{}",
            self.credentials.client_id, self.credentials.client_secret
        );
        format!("Basic {}", STANDARD.encode(raw))
    }

    async fn fetch_auth_code(&self, verifier: &str) -> GateResult<String> {
        let url = format!("{}/oauth/auth-code", self.base_url);
        let challenge = code_challenge(verifier);
        let state = random_string(NONCE_ALPHABET, 16);
        let nonce = random_string(NONCE_ALPHABET, 16);

        let query = [
            ("client_id", self.credentials.client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", self.credentials.redirect_uri.as_str()),
            ("state", state.as_str()),
            ("nonce", nonce.as_str()),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
        ];
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", self.credentials.client_id.as_str()),
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
        ];

        let resp = self
            .http_client
            .post(&url)
            .header("Authorization", self.basic_header())
            .header("Accept", "application/json")
            .query(&query)
            .form(&form)
            .send()
            .await?;

        let status = resp.status();
        let body = read_json(resp).await;
        classify_auth_response(status, &body, "auth-code")?;

        match body.get("code").and_then(Value::as_str) {
            Some(code) if status == StatusCode::OK => Ok(code.to_string()),
            _ => Err(GateError::Api(format!("auth-code failed: {} {}", status, body))),
        }
    }

    async fn fetch_token(&self, code: &str, verifier: &str) -> GateResult<TokenInfo> {
        let url = format!("{}/oauth/token", self.base_url);
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.credentials.redirect_uri.as_str()),
            ("code_verifier", verifier),
        ];

        let resp = self
            .http_client
            .post(&url)
            .header("Authorization", self.basic_header())
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;

        let status = resp.status();
        let body = read_json(resp).await;
        classify_auth_response(status, &body, "token exchange")?;

        let access_token = match body.get("access_token").and_then(Value::as_str) {
            Some(token) if status == StatusCode::OK => token.to_string(),
            _ => return Err(GateError::Api(format!("token failed: {} {}", status, body))),
        };

        let ttl = parse_expires_in(body.get("expires_in"));
        let lifetime = token_lifetime(ttl);
        tracing::info!(
            "[Auth] Token acquired, expires in {} sec (refresh after {} sec)",
            ttl,
            lifetime.as_secs()
        );

        Ok(TokenInfo {
            access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}

/// Source of raw bearer tokens for non-REST transports
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> GateResult<String>;
    async fn invalidate(&self);
}

#[async_trait]
impl TokenSource for TokenManager {
    async fn access_token(&self) -> GateResult<String> {
        self.ensure_token().await
    }

    async fn invalidate(&self) {
        TokenManager::invalidate(self).await
    }
}

/// Local lifetime for a token with server TTL `ttl`: `max(30, ttl - 60)` seconds
pub fn token_lifetime(ttl: i64) -> Duration {
    let secs = ttl.saturating_sub(EXPIRY_MARGIN_SECS).max(MIN_LIFETIME_SECS);
    Duration::from_secs(secs as u64)
}

fn parse_expires_in(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// 401, or a rejected grant in the body, means the credentials are bad.
fn classify_auth_response(status: StatusCode, body: &Value, step: &str) -> GateResult<()> {
    if status == StatusCode::UNAUTHORIZED {
        tracing::error!("[Auth] {} rejected with 401", step);
        return Err(GateError::Auth(format!("{} rejected (401)", step)));
    }

    if !status.is_success() {
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            if AUTH_ERROR_CODES.contains(&error) {
                tracing::error!("[Auth] {} rejected: {}", step, error);
                return Err(GateError::Auth(format!("{} rejected: {}", step, error)));
            }
        }
    }

    Ok(())
}

async fn read_json(resp: reqwest::Response) -> Value {
    let bytes = resp.bytes().await.unwrap_or_default();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

/// PKCE verifier of `len` characters (clamped to 43..=96) from the unreserved set
pub fn generate_code_verifier(len: usize) -> String {
    random_string(VERIFIER_ALPHABET, len.clamp(43, 96))
}

/// S256 challenge: unpadded URL-safe base64 of SHA-256(verifier)
pub fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

fn random_string(alphabet: &[u8], len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}
