use dashmap::DashMap;

use switchboard_core::AccountId;

/// Last account that successfully served each (provider, model).
///
/// Shared across concurrent requests; each key is updated atomically.
#[derive(Debug, Default)]
pub struct RotationState {
    last_used: DashMap<(String, String), AccountId>,
}

impl RotationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_used(&self, provider_key: &str, model_id: &str) -> Option<AccountId> {
        self.last_used
            .get(&(provider_key.to_string(), model_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn record(&self, provider_key: &str, model_id: &str, account_id: &AccountId) {
        self.last_used.insert(
            (provider_key.to_string(), model_id.to_string()),
            account_id.clone(),
        );
    }
}
