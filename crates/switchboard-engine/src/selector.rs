//! Candidate ordering for one request.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use switchboard_core::{Account, AccountId, GatewayError};

use crate::registry::AccountRegistry;
use crate::rotation::RotationState;

/// Everything the ordering decision depends on, gathered up front.
#[derive(Clone, Debug, Default)]
pub struct SelectionInput {
    pub load_balance: bool,
    pub accounts: Vec<Account>,
    pub sticky: Option<AccountId>,
    pub last_used: Option<AccountId>,
    pub quota_limited: HashSet<AccountId>,
}

/// Order candidate accounts for a request.
///
/// Without load balancing at most one candidate is returned: the sticky
/// account, else the default, else the oldest. With load balancing every
/// eligible account is returned in round-robin order after the last-used
/// one, quota-limited accounts dropped unless nothing else remains, and the
/// sticky account moved to the front.
pub fn order_candidates(input: &SelectionInput) -> Vec<Account> {
    let mut eligible: Vec<&Account> = input.accounts.iter().filter(|a| a.is_active()).collect();
    if eligible.is_empty() {
        eligible = input.accounts.iter().collect();
    }
    eligible.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    if !input.load_balance {
        let chosen = input
            .sticky
            .as_ref()
            .and_then(|id| eligible.iter().position(|a| &a.id == id))
            .or_else(|| eligible.iter().position(|a| a.is_default))
            .or((!eligible.is_empty()).then_some(0));
        return chosen.map(|i| vec![eligible[i].clone()]).unwrap_or_default();
    }

    if let Some(pos) = input
        .last_used
        .as_ref()
        .and_then(|id| eligible.iter().position(|a| &a.id == id))
    {
        let len = eligible.len();
        eligible.rotate_left((pos + 1) % len);
    }

    let primary: Vec<&Account> = eligible
        .iter()
        .copied()
        .filter(|a| !input.quota_limited.contains(&a.id))
        .collect();
    let mut tier = if primary.is_empty() { eligible } else { primary };

    if let Some(id) = &input.sticky {
        if let Some(pos) = tier.iter().position(|a| &a.id == id) {
            let sticky = tier.remove(pos);
            tier.insert(0, sticky);
        }
    }

    tier.into_iter().cloned().collect()
}

/// Gathers selection inputs from the registry and rotation state.
pub struct AccountSelector {
    registry: Arc<dyn AccountRegistry>,
    rotation: Arc<RotationState>,
}

impl AccountSelector {
    pub fn new(registry: Arc<dyn AccountRegistry>, rotation: Arc<RotationState>) -> Self {
        Self { registry, rotation }
    }

    pub async fn candidates(
        &self,
        provider_key: &str,
        model_id: &str,
        load_balance: bool,
    ) -> Result<Vec<Account>, GatewayError> {
        let accounts = self.registry.list_accounts(provider_key).await?;

        let mut quota_limited = HashSet::new();
        if load_balance {
            for account in &accounts {
                if self.registry.is_quota_limited(&account.id).await {
                    quota_limited.insert(account.id.clone());
                }
            }
        }

        let input = SelectionInput {
            load_balance,
            sticky: self
                .registry
                .get_sticky_assignment(provider_key, model_id)
                .await,
            last_used: self.rotation.last_used(provider_key, model_id),
            quota_limited,
            accounts,
        };
        let candidates = order_candidates(&input);

        debug!(
            provider = provider_key,
            model = model_id,
            load_balance,
            candidates = ?candidates.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(),
            "ordered candidates"
        );
        Ok(candidates)
    }
}
