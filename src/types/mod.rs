//! Account and credential identities consumed by the push core
//!
//! The credential/account store itself is external; these are the read-only
//! records the push subsystem works with.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

/// Local identifier of one credential set (one remote server login).
///
/// Several accounts can share credentials; push registration is keyed on
/// this, not on account ids.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CredentialsId(pub i64);

impl std::fmt::Display for CredentialsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local identifier of one account row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AccountId(pub i64);

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One credential set, shared by every account that uses the same login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub id: CredentialsId,
    /// Location of the remote server's session resource.
    pub session_resource: String,
}

/// An account joined with its credentials, as read from the external store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountWithCredentials {
    /// Local account row id.
    pub id: AccountId,
    /// The account id the remote server uses in push payloads.
    pub jmap_account_id: String,
    /// Display name, used only in logs.
    pub name: String,
    /// Stable per (installation, credentials) routing key for inbound push.
    pub device_client_id: Uuid,
    pub credentials: Credentials,
}
