//! Read-only view of the embedding application's account store
//!
//! The push core never owns accounts or credentials; it resolves inbound
//! routing keys and enumerates accounts per credential set through this
//! boundary.

use std::sync::RwLock;
use uuid::Uuid;

use crate::types::error::Result;
use crate::types::{AccountId, AccountWithCredentials, CredentialsId};

pub trait AccountStore: Send + Sync {
    /// Resolve an inbound (device client id, remote account id) pair.
    fn account(
        &self,
        device_client_id: Uuid,
        jmap_account_id: &str,
    ) -> Result<Option<AccountWithCredentials>>;

    /// Any one account of a credential set; registration is per credential
    /// set, so any of them carries enough context.
    fn any_account(&self, credentials_id: CredentialsId) -> Result<Option<AccountWithCredentials>>;

    /// Every account id under a credential set.
    fn account_ids(&self, credentials_id: CredentialsId) -> Result<Vec<AccountId>>;
}

/// Account store backed by a plain in-memory list.
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<Vec<AccountWithCredentials>>,
}

impl InMemoryAccountStore {
    pub fn insert(&self, account: AccountWithCredentials) {
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        accounts.retain(|a| a.id != account.id);
        accounts.push(account);
    }

    pub fn remove_credentials(&self, credentials_id: CredentialsId) {
        self.accounts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|a| a.credentials.id != credentials_id);
    }
}

impl AccountStore for InMemoryAccountStore {
    fn account(
        &self,
        device_client_id: Uuid,
        jmap_account_id: &str,
    ) -> Result<Option<AccountWithCredentials>> {
        Ok(self
            .accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|a| a.device_client_id == device_client_id && a.jmap_account_id == jmap_account_id)
            .cloned())
    }

    fn any_account(&self, credentials_id: CredentialsId) -> Result<Option<AccountWithCredentials>> {
        Ok(self
            .accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|a| a.credentials.id == credentials_id)
            .cloned())
    }

    fn account_ids(&self, credentials_id: CredentialsId) -> Result<Vec<AccountId>> {
        Ok(self
            .accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|a| a.credentials.id == credentials_id)
            .map(|a| a.id)
            .collect())
    }
}
