//! Account registry: the gateway's view of accounts, credentials, quota state
//! and sticky assignments.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use switchboard_core::{Account, AccountId, AccountStatus, Credentials, GatewayError};

/// Default time an account stays out of the primary tier after a quota hit.
pub const DEFAULT_QUOTA_COOLDOWN: Duration = Duration::from_secs(60);

#[async_trait]
pub trait AccountRegistry: Send + Sync {
    async fn list_accounts(&self, provider_key: &str) -> Result<Vec<Account>, GatewayError>;

    /// `Ok(None)` means the credential cannot be resolved right now (missing,
    /// revoked, expired OAuth token).
    async fn get_credentials(
        &self,
        account_id: &AccountId,
    ) -> Result<Option<Credentials>, GatewayError>;

    async fn is_quota_limited(&self, account_id: &AccountId) -> bool;

    async fn mark_expired(&self, account_id: &AccountId);

    async fn set_sticky_assignment(&self, provider_key: &str, model_id: &str, account_id: &AccountId);

    async fn get_sticky_assignment(&self, provider_key: &str, model_id: &str) -> Option<AccountId>;

    /// Called when an attempt on `account_id` failed with a quota error.
    async fn record_quota_exhausted(&self, _account_id: &AccountId, _retry_after: Option<Duration>) {}
}

#[derive(Clone, Debug)]
struct StoredCredential {
    credentials: Credentials,
    expires_at: Option<DateTime<Utc>>,
}

/// Registry held entirely in memory. Backs the demo binary and tests.
pub struct InMemoryRegistry {
    accounts: RwLock<Vec<Account>>,
    credentials: DashMap<AccountId, StoredCredential>,
    quota_until: DashMap<AccountId, Instant>,
    sticky: DashMap<(String, String), AccountId>,
    quota_cooldown: Duration,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(Vec::new()),
            credentials: DashMap::new(),
            quota_until: DashMap::new(),
            sticky: DashMap::new(),
            quota_cooldown: DEFAULT_QUOTA_COOLDOWN,
        }
    }

    pub fn with_quota_cooldown(mut self, cooldown: Duration) -> Self {
        self.quota_cooldown = cooldown;
        self
    }

    /// Register an account. `credentials` may be `None` for accounts whose
    /// secret lives elsewhere.
    pub fn insert(&self, account: Account, credentials: Option<Credentials>) {
        self.insert_expiring(account, credentials, None);
    }

    pub fn insert_expiring(
        &self,
        account: Account,
        credentials: Option<Credentials>,
        expires_at: Option<DateTime<Utc>>,
    ) {
        if let Some(credentials) = credentials {
            self.credentials.insert(
                account.id.clone(),
                StoredCredential {
                    credentials,
                    expires_at,
                },
            );
        }
        let mut accounts = self.accounts.write();
        accounts.retain(|a| a.id != account.id);
        accounts.push(account);
    }

    /// Put an account into quota cooldown for `duration`.
    pub fn set_quota_limited(&self, account_id: &AccountId, duration: Duration) {
        self.quota_until
            .insert(account_id.clone(), Instant::now() + duration);
    }

    pub fn account(&self, account_id: &AccountId) -> Option<Account> {
        self.accounts
            .read()
            .iter()
            .find(|a| &a.id == account_id)
            .cloned()
    }
}

#[async_trait]
impl AccountRegistry for InMemoryRegistry {
    async fn list_accounts(&self, provider_key: &str) -> Result<Vec<Account>, GatewayError> {
        Ok(self
            .accounts
            .read()
            .iter()
            .filter(|a| a.provider_key == provider_key)
            .cloned()
            .collect())
    }

    async fn get_credentials(
        &self,
        account_id: &AccountId,
    ) -> Result<Option<Credentials>, GatewayError> {
        if self
            .account(account_id)
            .is_some_and(|a| a.status != AccountStatus::Active)
        {
            debug!(account = %account_id, "account not active, credentials withheld");
            return Ok(None);
        }

        let Some(stored) = self.credentials.get(account_id) else {
            return Ok(None);
        };
        if let Some(expires_at) = stored.expires_at {
            if expires_at <= Utc::now() {
                debug!(account = %account_id, %expires_at, "credential expired");
                return Ok(None);
            }
        }
        Ok(Some(stored.credentials.clone()))
    }

    async fn is_quota_limited(&self, account_id: &AccountId) -> bool {
        // Prune only an expired entry, atomically per key.
        self.quota_until
            .remove_if(account_id, |_, until| *until <= Instant::now());
        self.quota_until
            .get(account_id)
            .is_some_and(|until| *until > Instant::now())
    }

    async fn mark_expired(&self, account_id: &AccountId) {
        let mut accounts = self.accounts.write();
        if let Some(account) = accounts.iter_mut().find(|a| &a.id == account_id) {
            info!(account = %account_id, "marking account expired");
            account.status = AccountStatus::Expired;
        }
    }

    async fn set_sticky_assignment(&self, provider_key: &str, model_id: &str, account_id: &AccountId) {
        self.sticky.insert(
            (provider_key.to_string(), model_id.to_string()),
            account_id.clone(),
        );
    }

    async fn get_sticky_assignment(&self, provider_key: &str, model_id: &str) -> Option<AccountId> {
        self.sticky
            .get(&(provider_key.to_string(), model_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    async fn record_quota_exhausted(&self, account_id: &AccountId, retry_after: Option<Duration>) {
        let cooldown = retry_after.unwrap_or(self.quota_cooldown);
        info!(account = %account_id, cooldown_secs = cooldown.as_secs(), "account quota exhausted");
        self.set_quota_limited(account_id, cooldown);
    }
}
