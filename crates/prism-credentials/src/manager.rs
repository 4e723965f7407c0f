//! Process-wide credential manager.
//!
//! Two caches: descriptors per domain (60 s TTL, invalidated when the
//! backing file changes, single-flight reload) and OAuth tokens per account
//! (proactive refresh, serialized per account so concurrent callers share
//! one refresh).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use prism_core::mask::masked;

use crate::descriptor::{file_name, CredentialDescriptor, CredentialKind, OAuthCredentials};
use crate::error::{CredentialError, Result};

const DESCRIPTOR_TTL: Duration = Duration::from_secs(60);
const FILE_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Refresh fires this far ahead of `expires_at`.
const REFRESH_LEEWAY_MS: i64 = 60_000;
const REFRESH_MAX_ATTEMPTS: u32 = 3;
const REFRESH_BASE_DELAY_MS: u64 = 500;

const DEFAULT_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
pub const OAUTH_BETA: &str = "oauth-2025-04-20";

/// Headers to attach to one upstream call.
#[derive(Debug, Clone)]
pub struct AuthMaterial {
    pub headers: Vec<(&'static str, String)>,
}

struct CachedDescriptor {
    descriptor: Arc<CredentialDescriptor>,
    path: PathBuf,
    mtime: Option<SystemTime>,
    loaded_at: Instant,
}

struct OauthState {
    creds: OAuthCredentials,
    /// Descriptor file refreshed tokens are persisted back into.
    path: PathBuf,
    descriptor: Arc<CredentialDescriptor>,
}

pub struct CredentialManager {
    dir: PathBuf,
    http: reqwest::Client,
    token_url: String,
    descriptors: DashMap<String, CachedDescriptor>,
    /// Single-flight guards for descriptor reloads, one per lookup key.
    loads: DashMap<String, Arc<Mutex<()>>>,
    /// OAuth refresh state, one entry per account id. The RwLock serializes
    /// refreshes: readers take the fast path, the writer re-checks expiry
    /// before actually refreshing.
    tokens: DashMap<String, Arc<RwLock<OauthState>>>,
}

impl CredentialManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_token_url(dir, DEFAULT_TOKEN_URL)
    }

    /// Test seam: point OAuth refreshes at a local endpoint.
    pub fn with_token_url(dir: impl Into<PathBuf>, token_url: &str) -> Self {
        Self {
            dir: dir.into(),
            http: reqwest::Client::new(),
            token_url: token_url.to_string(),
            descriptors: DashMap::new(),
            loads: DashMap::new(),
            tokens: DashMap::new(),
        }
    }

    /// Resolve the descriptor for an inbound host. Tries the host as given
    /// (which may include `:port`), then the port-stripped form.
    pub async fn descriptor_for_host(&self, host: &str) -> Result<Arc<CredentialDescriptor>> {
        match self.descriptor(host).await {
            Err(CredentialError::UnknownDomain(_)) => {}
            other => return other,
        }
        let stripped = host.split(':').next().unwrap_or(host);
        if stripped == host {
            return Err(CredentialError::UnknownDomain(host.to_string()));
        }
        self.descriptor(stripped).await
    }

    /// Resolve a pool member's descriptor by account id (sibling file).
    pub async fn member_descriptor(&self, account_id: &str) -> Result<Arc<CredentialDescriptor>> {
        self.descriptor(account_id).await
    }

    /// Cached descriptor lookup with TTL + mtime invalidation.
    pub async fn descriptor(&self, key: &str) -> Result<Arc<CredentialDescriptor>> {
        if let Some(cached) = self.fresh(key) {
            return Ok(cached);
        }

        // Single-flight: one reload per key at a time; latecomers re-check
        // the cache after the lock.
        let gate = self
            .loads
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        if let Some(cached) = self.fresh(key) {
            return Ok(cached);
        }

        let loaded = self.load_file(key).await?;
        let descriptor = loaded.descriptor.clone();
        debug!(key, kind = ?descriptor.kind, "credential descriptor loaded");
        self.descriptors.insert(key.to_string(), loaded);
        Ok(descriptor)
    }

    fn fresh(&self, key: &str) -> Option<Arc<CredentialDescriptor>> {
        let cached = self.descriptors.get(key)?;
        if cached.loaded_at.elapsed() >= DESCRIPTOR_TTL {
            return None;
        }
        // Reload when the backing file changed (or vanished) under us.
        let current_mtime = std::fs::metadata(&cached.path).and_then(|m| m.modified()).ok();
        if current_mtime != cached.mtime {
            return None;
        }
        Some(cached.descriptor.clone())
    }

    async fn load_file(&self, key: &str) -> Result<CachedDescriptor> {
        let path = self.dir.join(file_name(key));
        let read = tokio::time::timeout(FILE_READ_TIMEOUT, tokio::fs::read_to_string(&path));
        let data = match read.await {
            Err(_) => {
                return Err(CredentialError::ReadTimeout(path.display().to_string()));
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::UnknownDomain(key.to_string()));
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(data)) => data,
        };
        let descriptor = CredentialDescriptor::parse(&path.display().to_string(), &data)?;
        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        Ok(CachedDescriptor {
            descriptor: Arc::new(descriptor),
            path,
            mtime,
            loaded_at: Instant::now(),
        })
    }

    /// Auth headers for an upstream call with this (non-pool) descriptor.
    /// Pool descriptors must be resolved to a member first.
    pub async fn auth_material(
        &self,
        key: &str,
        descriptor: &Arc<CredentialDescriptor>,
    ) -> Result<AuthMaterial> {
        match descriptor.kind {
            CredentialKind::ApiKey => {
                let api_key = descriptor.api_key.clone().ok_or_else(|| {
                    CredentialError::Invalid {
                        path: file_name(key),
                        reason: "api_key kind without api_key".to_string(),
                    }
                })?;
                Ok(AuthMaterial {
                    headers: vec![("x-api-key", api_key)],
                })
            }
            CredentialKind::Oauth => {
                let token = self.ensure_oauth(key, descriptor).await?;
                Ok(AuthMaterial {
                    headers: vec![
                        ("authorization", format!("Bearer {token}")),
                        ("anthropic-beta", OAUTH_BETA.to_string()),
                    ],
                })
            }
            CredentialKind::Pool => Err(CredentialError::Invalid {
                path: file_name(key),
                reason: "pool descriptors carry no auth material; select a member".to_string(),
            }),
        }
    }

    /// Return a valid access token, refreshing proactively when it expires
    /// within the leeway window. Serialized per account.
    async fn ensure_oauth(
        &self,
        key: &str,
        descriptor: &Arc<CredentialDescriptor>,
    ) -> Result<String> {
        let account_id = descriptor.account_id.clone();
        let state = self
            .tokens
            .entry(account_id.clone())
            .or_insert_with(|| {
                let creds = descriptor
                    .oauth
                    .clone()
                    .expect("validated oauth descriptor");
                Arc::new(RwLock::new(OauthState {
                    creds,
                    path: self.dir.join(file_name(key)),
                    descriptor: descriptor.clone(),
                }))
            })
            .clone();

        let now = chrono::Utc::now().timestamp_millis();

        // Fast path — read lock
        {
            let state = state.read().await;
            if now + REFRESH_LEEWAY_MS < state.creds.expires_at {
                return Ok(state.creds.access_token.clone());
            }
        }

        // Slow path — write lock, re-check, refresh. Everyone else waiting on
        // the same account blocks here and then takes the re-check exit.
        let mut state = state.write().await;
        let now = chrono::Utc::now().timestamp_millis();
        if now + REFRESH_LEEWAY_MS < state.creds.expires_at {
            return Ok(state.creds.access_token.clone());
        }

        info!(
            account_id,
            token = %masked("oauth", &state.creds.access_token),
            "refreshing upstream OAuth token"
        );

        match self.refresh_with_backoff(&account_id, &state.creds).await {
            Ok(new_creds) => {
                state.creds = new_creds;
                self.persist_refresh(&state).await;
                Ok(state.creds.access_token.clone())
            }
            Err(e) => {
                // Drop the poisoned token so the next caller reloads from disk.
                drop(state);
                self.tokens.remove(&account_id);
                self.descriptors.remove(key);
                Err(e)
            }
        }
    }

    async fn refresh_with_backoff(
        &self,
        account_id: &str,
        current: &OAuthCredentials,
    ) -> Result<OAuthCredentials> {
        let mut last_error = String::new();
        for attempt in 0..REFRESH_MAX_ATTEMPTS {
            if attempt > 0 {
                let base = REFRESH_BASE_DELAY_MS * 2u64.pow(attempt - 1);
                let jitter = rand::thread_rng().gen_range(0..=base / 2);
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
            }
            match self.refresh_once(current).await {
                Ok(creds) => {
                    debug!(account_id, attempt, "OAuth refresh succeeded");
                    return Ok(creds);
                }
                Err(reason) => {
                    warn!(account_id, attempt, %reason, "OAuth refresh attempt failed");
                    last_error = reason;
                }
            }
        }
        Err(CredentialError::RefreshFailed {
            account_id: account_id.to_string(),
            reason: last_error,
        })
    }

    async fn refresh_once(
        &self,
        current: &OAuthCredentials,
    ) -> std::result::Result<OAuthCredentials, String> {
        let body = format!(
            "grant_type=refresh_token&refresh_token={}&client_id={}",
            urlencoding::encode(&current.refresh_token),
            OAUTH_CLIENT_ID
        );

        let resp = self
            .http
            .post(&self.token_url)
            .header("content-type", "application/x-www-form-urlencoded")
            .header("accept", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(format!("token endpoint returned {status}"));
        }

        let token: TokenRefreshResponse = resp.json().await.map_err(|e| e.to_string())?;
        let now = chrono::Utc::now().timestamp_millis();
        Ok(OAuthCredentials {
            access_token: token.access_token,
            refresh_token: token
                .refresh_token
                .unwrap_or_else(|| current.refresh_token.clone()),
            expires_at: now + (token.expires_in as i64 * 1000),
            scopes: current.scopes.clone(),
        })
    }

    /// Best-effort write-back of refreshed tokens so restarts keep them.
    async fn persist_refresh(&self, state: &OauthState) {
        let mut descriptor = (*state.descriptor).clone();
        descriptor.oauth = Some(state.creds.clone());
        match serde_json::to_string_pretty(&descriptor) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&state.path, json).await {
                    warn!(path = %state.path.display(), error = %e,
                          "failed to persist refreshed credentials");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize refreshed credentials"),
        }
    }
}

#[derive(Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}
