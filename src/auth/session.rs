//! Session-backed token renewal.
//!
//! The marketplace token is minted from an authorized messenger session.
//! The interactive login that creates that session is out of scope; a
//! sidecar holding the session exposes a single endpoint that mints a new
//! marketplace token on request.
//!
//! Request:  `POST {renew_url}` with `{"api_id": .., "api_hash": .., "session": ..}`
//! Response: `{"token": "...", "expires_in": 3600}` (`expires_in` optional)

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{expiry_after, MintedToken, RenewError, TokenRenewer};

#[derive(Serialize)]
struct RenewRequest<'a> {
    api_id: &'a str,
    api_hash: &'a str,
    session: &'a str,
}

#[derive(Debug, Deserialize)]
struct RenewResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Renews the marketplace token through the session sidecar.
pub struct HttpSessionRenewer {
    http: Client,
    renew_url: String,
    api_id: SecretString,
    api_hash: SecretString,
    session_name: String,
}

impl HttpSessionRenewer {
    pub fn new(
        renew_url: String,
        api_id: SecretString,
        api_hash: SecretString,
        session_name: String,
        timeout: Duration,
    ) -> Result<Self, RenewError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RenewError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            renew_url,
            api_id,
            api_hash,
            session_name,
        })
    }
}

#[async_trait]
impl TokenRenewer for HttpSessionRenewer {
    async fn renew(&self) -> Result<MintedToken, RenewError> {
        debug!(url = %self.renew_url, session = %self.session_name, "Requesting token renewal");

        let body = RenewRequest {
            api_id: self.api_id.expose_secret(),
            api_hash: self.api_hash.expose_secret(),
            session: &self.session_name,
        };

        let resp = self
            .http
            .post(&self.renew_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RenewError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let text = resp.text().await.unwrap_or_default();
            return Err(RenewError::Unauthorized(format!("HTTP {status}: {text}")));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RenewError::Transport(format!("HTTP {status}: {text}")));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| RenewError::Transport(e.to_string()))?;
        let minted = parse_renew_response(&text)?;
        info!(expires_at = ?minted.expires_at, "Session minted a new token");
        Ok(minted)
    }
}

fn parse_renew_response(body: &str) -> Result<MintedToken, RenewError> {
    let parsed: RenewResponse =
        serde_json::from_str(body).map_err(|e| RenewError::Malformed(e.to_string()))?;

    let token = parsed
        .token
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| RenewError::Malformed("response carried no token".to_string()))?;

    // Out-of-range lifetimes are treated as unknown; the token is then
    // renewed on its first 401.
    let expires_at = parsed
        .expires_in
        .and_then(|secs| u64::try_from(secs).ok())
        .and_then(|secs| expiry_after(Utc::now(), secs));

    Ok(MintedToken {
        value: SecretString::new(token),
        expires_at,
    })
}
