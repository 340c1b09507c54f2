//! Bearer-token lifecycle.
//!
//! `TokenManager` owns the one live `AuthToken` and its state machine:
//!
//! ```text
//!   valid ──(401 / expiry)──▶ refreshing ──(renewed)──▶ valid
//!                                 │
//!                                 └──(renewal failed)──▶ invalid (terminal)
//! ```
//!
//! Refresh is single-flight. The first caller to observe a stale token
//! starts the renewal; everyone else awaits the same shared future and gets
//! the same result.

pub mod session;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::engine::events::{EngineEvent, EventSink};
use crate::types::{AuthError, TokenState};

// ---------------------------------------------------------------------------
// Renewal seam
// ---------------------------------------------------------------------------

/// A freshly minted credential.
#[derive(Debug)]
pub struct MintedToken {
    pub value: SecretString,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenewError {
    #[error("session is not authorized: {0}")]
    Unauthorized(String),
    #[error("renewal request failed: {0}")]
    Transport(String),
    #[error("renewal response malformed: {0}")]
    Malformed(String),
}

/// The session collaborator that can mint a new bearer token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenRenewer: Send + Sync {
    async fn renew(&self) -> Result<MintedToken, RenewError>;
}

/// Expiry `secs` seconds from `now`. `None` when the lifetime is not
/// positive or does not fit the calendar.
pub fn expiry_after(now: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    let secs = i64::try_from(secs).ok()?;
    now.checked_add_signed(chrono::Duration::try_seconds(secs)?)
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// The live credential. Read-only outside the manager.
#[derive(Debug)]
pub struct AuthToken {
    value: SecretString,
    pub generation: u64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    /// Raw header value.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

type RefreshFuture = Shared<BoxFuture<'static, Result<Arc<AuthToken>, AuthError>>>;

struct TokenCell {
    token: Arc<AuthToken>,
    state: TokenState,
    inflight: Option<RefreshFuture>,
    invalid_reason: Option<String>,
}

impl TokenCell {
    fn invalid_error(&self) -> AuthError {
        AuthError::Invalid(
            self.invalid_reason
                .clone()
                .unwrap_or_else(|| "token renewal failed earlier".to_string()),
        )
    }
}

fn lock(cell: &Mutex<TokenCell>) -> MutexGuard<'_, TokenCell> {
    cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sole writer of the bearer token. Cheap to share behind an `Arc`.
pub struct TokenManager {
    cell: Arc<Mutex<TokenCell>>,
    renewer: Arc<dyn TokenRenewer>,
    events: EventSink,
    renewals: Arc<AtomicU64>,
}

impl TokenManager {
    /// Start from a seed token (generation 1), typically read from the
    /// environment.
    pub fn new(
        seed: SecretString,
        expires_at: Option<DateTime<Utc>>,
        renewer: Arc<dyn TokenRenewer>,
        events: EventSink,
    ) -> Self {
        let token = AuthToken {
            value: seed,
            generation: 1,
            issued_at: Utc::now(),
            expires_at,
        };
        Self {
            cell: Arc::new(Mutex::new(TokenCell {
                token: Arc::new(token),
                state: TokenState::Valid,
                inflight: None,
                invalid_reason: None,
            })),
            renewer,
            events,
            renewals: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> TokenState {
        lock(&self.cell).state
    }

    pub fn is_invalid(&self) -> bool {
        self.state() == TokenState::Invalid
    }

    /// Why renewal failed, once the manager is `invalid`.
    pub fn invalid_reason(&self) -> Option<String> {
        let cell = lock(&self.cell);
        match cell.state {
            TokenState::Invalid => Some(cell.invalid_error().to_string()),
            _ => None,
        }
    }

    pub fn generation(&self) -> u64 {
        lock(&self.cell).token.generation
    }

    /// Renewal calls made so far.
    pub fn renewals(&self) -> u64 {
        self.renewals.load(Ordering::Relaxed)
    }

    /// The token to attach to the next request.
    ///
    /// Waits for an in-flight refresh, and starts one if the expiry
    /// estimate has elapsed.
    pub async fn current(&self) -> Result<Arc<AuthToken>, AuthError> {
        let pending = {
            let mut cell = lock(&self.cell);
            match cell.state {
                TokenState::Invalid => return Err(cell.invalid_error()),
                TokenState::Refreshing => match cell.inflight.clone() {
                    Some(pending) => pending,
                    None => return Err(cell.invalid_error()),
                },
                TokenState::Valid => {
                    if !cell.token.is_expired(Utc::now()) {
                        return Ok(cell.token.clone());
                    }
                    info!(
                        generation = cell.token.generation,
                        "Token expiry estimate elapsed, refreshing"
                    );
                    self.begin_refresh(&mut cell)
                }
            }
        };
        pending.await
    }

    /// Report a 401 seen with the token of `stale_generation` and get a
    /// usable token back.
    ///
    /// A report about a generation that has already been replaced returns
    /// the current token without renewing.
    pub async fn refresh(&self, stale_generation: u64) -> Result<Arc<AuthToken>, AuthError> {
        let pending = {
            let mut cell = lock(&self.cell);
            match cell.state {
                TokenState::Invalid => return Err(cell.invalid_error()),
                TokenState::Refreshing => match cell.inflight.clone() {
                    Some(pending) => pending,
                    None => return Err(cell.invalid_error()),
                },
                TokenState::Valid if cell.token.generation > stale_generation => {
                    return Ok(cell.token.clone());
                }
                TokenState::Valid => {
                    warn!(generation = stale_generation, "Token rejected, refreshing");
                    self.begin_refresh(&mut cell)
                }
            }
        };
        pending.await
    }

    /// Move `valid → refreshing` and install the shared renewal future.
    /// Must be called with the cell locked.
    fn begin_refresh(&self, cell: &mut TokenCell) -> RefreshFuture {
        let generation = cell.token.generation;
        cell.state = TokenState::Refreshing;
        self.events.emit(EngineEvent::TokenStateChanged {
            from: TokenState::Valid,
            to: TokenState::Refreshing,
            generation,
        });

        let renewer = self.renewer.clone();
        let shared_cell = self.cell.clone();
        let events = self.events.clone();
        let renewals = self.renewals.clone();

        let refresh = async move {
            renewals.fetch_add(1, Ordering::Relaxed);
            let renewed = renewer.renew().await;

            let mut cell = lock(&shared_cell);
            cell.inflight = None;
            match renewed {
                Ok(minted) => {
                    let token = Arc::new(AuthToken {
                        value: minted.value,
                        generation: generation + 1,
                        issued_at: Utc::now(),
                        expires_at: minted.expires_at,
                    });
                    cell.token = token.clone();
                    cell.state = TokenState::Valid;
                    info!(
                        generation = token.generation,
                        expires_at = ?token.expires_at,
                        "Token renewed"
                    );
                    events.emit(EngineEvent::TokenStateChanged {
                        from: TokenState::Refreshing,
                        to: TokenState::Valid,
                        generation: token.generation,
                    });
                    Ok(token)
                }
                Err(e) => {
                    let reason = e.to_string();
                    cell.state = TokenState::Invalid;
                    cell.invalid_reason = Some(reason.clone());
                    error!(error = %reason, "Token renewal failed, credentials are now invalid");
                    events.emit(EngineEvent::TokenStateChanged {
                        from: TokenState::Refreshing,
                        to: TokenState::Invalid,
                        generation,
                    });
                    Err(AuthError::Invalid(reason))
                }
            }
        }
        .boxed()
        .shared();

        cell.inflight = Some(refresh.clone());
        refresh
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
