use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::AccountId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Expired,
    Disabled,
}

/// One upstream credential set registered for a provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub provider_key: String,
    pub display_name: String,
    #[serde(default)]
    pub status: AccountStatus,
    #[serde(default)]
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: impl Into<String>, provider_key: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        let id = AccountId::from_raw(id);
        Self {
            display_name: id.to_string(),
            id,
            provider_key: provider_key.into(),
            status: AccountStatus::Active,
            is_default: false,
            created_at,
        }
    }

    pub fn with_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    pub fn with_status(mut self, status: AccountStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serde() {
        assert_eq!(serde_json::to_string(&AccountStatus::Expired).unwrap(), r#""expired""#);
        let parsed: AccountStatus = serde_json::from_str(r#""disabled""#).unwrap();
        assert_eq!(parsed, AccountStatus::Disabled);
    }

    #[test]
    fn builder_defaults() {
        let account = Account::new("a", "openai", Utc::now());
        assert!(account.is_active());
        assert!(!account.is_default);
        assert_eq!(account.display_name, "a");

        let expired = account.with_status(AccountStatus::Expired).with_default(true);
        assert!(!expired.is_active());
        assert!(expired.is_default);
    }

    #[test]
    fn deserialize_with_defaults() {
        let account: Account = serde_json::from_str(
            r#"{"id":"work","provider_key":"openai","display_name":"Work","created_at":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(account.status, AccountStatus::Active);
        assert!(!account.is_default);
    }
}
