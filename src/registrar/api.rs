//! Remote subscription API boundary
//!
//! Wire types for the server's session resource and push-subscription set
//! call, and the trait an embedding JMAP client implements to execute them.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::types::error::Result;
use crate::types::AccountWithCredentials;

/// Capability under which the server advertises its VAPID key.
pub const CAPABILITY_WEB_PUSH_VAPID: &str = "urn:ietf:params:jmap:webpush-vapid";

/// Back-reference id used for the single subscription in a create call.
pub const CREATE_REF: &str = "ps0";

/// The slice of the server session resource the push core reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub capabilities: BTreeMap<String, serde_json::Value>,
}

impl Session {
    /// Server-provided VAPID application server key, when advertised.
    ///
    /// A malformed key is treated as absent; registration then proceeds
    /// without one instead of failing outright.
    pub fn application_server_key(&self) -> Option<Vec<u8>> {
        let encoded = self
            .capabilities
            .get(CAPABILITY_WEB_PUSH_VAPID)?
            .get("applicationServerKey")?
            .as_str()?;
        match BASE64URL.decode(encoded) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("Ignoring malformed application server key: {e}");
                None
            }
        }
    }
}

/// Client public key and shared secret handed to the server for payload
/// encryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Push subscription creation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscriptionCreate {
    pub device_client_id: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<SubscriptionKeys>,
}

/// One push-subscription set call. Destroys and creates execute in a
/// single request so the server never holds both the stale and the fresh
/// subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetSubscriptionRequest {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub destroy: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub create: BTreeMap<String, PushSubscriptionCreate>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub update: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

/// Server-assigned properties of a created subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedSubscription {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetSubscriptionResponse {
    #[serde(default)]
    pub created: BTreeMap<String, CreatedSubscription>,
    #[serde(default)]
    pub updated: Vec<String>,
    #[serde(default)]
    pub destroyed: Vec<String>,
}

/// Boundary to the remote server, implemented by the embedding client.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    /// Fetch the session resource for the account's credentials.
    async fn session(&self, account: &AccountWithCredentials) -> Result<Session>;

    /// Execute one push-subscription set call.
    async fn set_subscription(
        &self,
        account: &AccountWithCredentials,
        request: SetSubscriptionRequest,
    ) -> Result<SetSubscriptionResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn application_server_key_is_read_from_capabilities() {
        let session: Session = serde_json::from_value(json!({
            "capabilities": {
                CAPABILITY_WEB_PUSH_VAPID: {
                    "applicationServerKey": BASE64URL.encode([4u8; 65])
                }
            }
        }))
        .unwrap();
        assert_eq!(session.application_server_key(), Some(vec![4u8; 65]));
    }

    #[test]
    fn absent_or_malformed_key_reads_as_none() {
        let session = Session::default();
        assert_eq!(session.application_server_key(), None);

        let session: Session = serde_json::from_value(json!({
            "capabilities": {
                CAPABILITY_WEB_PUSH_VAPID: { "applicationServerKey": "%%%not-base64%%%" }
            }
        }))
        .unwrap();
        assert_eq!(session.application_server_key(), None);
    }

    #[test]
    fn set_request_serializes_camel_case_and_skips_empty_sections() {
        let mut create = BTreeMap::new();
        create.insert(
            CREATE_REF.to_string(),
            PushSubscriptionCreate {
                device_client_id: "d-1".into(),
                url: "https://push.example.com/ep/1".into(),
                keys: Some(SubscriptionKeys {
                    p256dh: "pk".into(),
                    auth: "auth".into(),
                }),
            },
        );
        let request = SetSubscriptionRequest {
            destroy: vec!["old".into()],
            create,
            update: BTreeMap::new(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["create"]["ps0"]["deviceClientId"], "d-1");
        assert_eq!(value["destroy"][0], "old");
        assert!(value.get("update").is_none());
    }
}
