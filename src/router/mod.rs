//! Inbound push message routing
//!
//! Decrypts and dispatches raw push payloads delivered by a transport, and
//! handles the transport lifecycle callbacks (late endpoints, provider
//! failures, unregistration). One malformed message never takes down the
//! receive path; it is logged and dropped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registrar::PushRegistrar;
use crate::scheduler::{main_refresh_key, DedupPolicy, FallbackScheduler, JobRequest, JobScheduler};
use crate::store::accounts::AccountStore;
use crate::store::{PushSubscriptionRecord, SubscriptionStore};
use crate::types::error::{PushError, Result};
use crate::webpush;

/// Decoded push payload.
///
/// Unknown `@type` values are a hard parse error; silently misrouting a
/// message the server considered meaningful would be worse than dropping
/// it loudly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum PushMessage {
    /// Server challenge proving the subscription's delivery path works.
    #[serde(rename_all = "camelCase")]
    PushVerification {
        push_subscription_id: String,
        verification_code: String,
    },
    /// State digest: per remote account id, changed object types and their
    /// new state strings.
    StateChange {
        changed: BTreeMap<String, BTreeMap<String, String>>,
    },
}

/// Parse a cleartext push payload.
pub fn deserialize(payload: &[u8]) -> Result<PushMessage> {
    serde_json::from_slice(payload)
        .map_err(|e| PushError::MalformedPushPayload(e.to_string()))
}

pub struct PushRouter {
    store: Arc<SubscriptionStore>,
    accounts: Arc<dyn AccountStore>,
    scheduler: Arc<dyn JobScheduler>,
    fallback: FallbackScheduler,
    registrar: Arc<PushRegistrar>,
}

impl PushRouter {
    pub fn new(
        store: Arc<SubscriptionStore>,
        accounts: Arc<dyn AccountStore>,
        scheduler: Arc<dyn JobScheduler>,
        fallback: FallbackScheduler,
        registrar: Arc<PushRegistrar>,
    ) -> Self {
        Self {
            store,
            accounts,
            scheduler,
            fallback,
            registrar,
        }
    }

    /// Handle one raw inbound push message.
    ///
    /// Messages for unknown subscriptions are dropped; they are expected
    /// after an unregister raced an in-flight delivery. Payloads are
    /// decrypted when the subscription has complete key material and
    /// treated as cleartext otherwise.
    pub fn on_receive(
        &self,
        device_client_id: Uuid,
        distributor: Option<&str>,
        payload: &[u8],
    ) {
        let subscription = match self.store.subscription(device_client_id, distributor) {
            Ok(Some(subscription)) => subscription,
            Ok(None) => {
                warn!("Dropping push message for unknown subscription {device_client_id}");
                return;
            }
            Err(e) => {
                warn!("Could not look up subscription {device_client_id}: {e}");
                return;
            }
        };
        let cleartext = match self.store.key_material(subscription.id) {
            Ok(Some(material)) => match webpush::decrypt(payload, &material) {
                Ok(cleartext) => cleartext,
                Err(e) => {
                    warn!("Dropping undecryptable push message: {e}");
                    return;
                }
            },
            Ok(None) => payload.to_vec(),
            Err(e) => {
                warn!("Could not load key material for subscription {}: {e}", subscription.id);
                return;
            }
        };
        match deserialize(&cleartext) {
            Ok(message) => self.dispatch(&subscription, message),
            Err(e) => warn!("Dropping push message: {e}"),
        }
    }

    fn dispatch(&self, subscription: &PushSubscriptionRecord, message: PushMessage) {
        match message {
            PushMessage::PushVerification {
                push_subscription_id,
                verification_code,
            } => {
                debug!("Received verification for subscription {push_subscription_id}");
                if let Err(e) = self.scheduler.enqueue_once(JobRequest::PushVerification {
                    credentials_id: subscription.credentials_id,
                    push_subscription_id,
                    verification_code,
                }) {
                    warn!("Could not enqueue verification job: {e}");
                }
            }
            PushMessage::StateChange { changed } => {
                for (jmap_account_id, types) in changed {
                    let account = match self
                        .accounts
                        .account(subscription.device_client_id, &jmap_account_id)
                    {
                        Ok(Some(account)) => account,
                        Ok(None) => {
                            warn!("State change for unknown account {jmap_account_id}");
                            continue;
                        }
                        Err(e) => {
                            warn!("Could not resolve account {jmap_account_id}: {e}");
                            continue;
                        }
                    };
                    debug!(
                        "State change for {} ({} object types)",
                        account.name,
                        types.len()
                    );
                    if let Err(e) = self.scheduler.enqueue_unique_one_off(
                        &main_refresh_key(account.id),
                        JobRequest::MainQueryRefresh {
                            account_id: account.id,
                        },
                        DedupPolicy::KeepExisting,
                    ) {
                        warn!("Could not enqueue refresh for {}: {e}", account.name);
                    }
                }
            }
        }
    }

    /// A provider delivered (or rotated) the endpoint after registration.
    /// Finishes the pending registration with the remote server.
    pub async fn on_new_endpoint(&self, device_client_id: Uuid, distributor: &str, url: &str) {
        let subscription = match self.store.subscription(device_client_id, Some(distributor)) {
            Ok(Some(subscription)) => subscription,
            Ok(None) => {
                warn!("Endpoint for unknown subscription {device_client_id}");
                return;
            }
            Err(e) => {
                warn!("Could not look up subscription {device_client_id}: {e}");
                return;
            }
        };
        let account = match self.accounts.any_account(subscription.credentials_id) {
            Ok(Some(account)) => account,
            Ok(None) => {
                warn!(
                    "No account left for credentials {}",
                    subscription.credentials_id
                );
                return;
            }
            Err(e) => {
                warn!("Could not resolve credentials {}: {e}", subscription.credentials_id);
                return;
            }
        };
        info!("Received endpoint for credentials {}", subscription.credentials_id);
        match self.registrar.register_endpoint(&account, url, distributor).await {
            Ok(true) => {
                if let Ok(account_ids) = self.accounts.account_ids(subscription.credentials_id) {
                    if let Err(e) = self.fallback.disarm_all(&account_ids) {
                        warn!("Could not disarm fallback: {e}");
                    }
                }
            }
            Ok(false) => self.arm_for_credentials(&subscription),
            Err(e) => {
                warn!(
                    "Could not register endpoint for credentials {}: {e}",
                    subscription.credentials_id
                );
                self.arm_for_credentials(&subscription);
            }
        }
    }

    /// A provider reported the registration failed or got unregistered.
    /// Push delivery is gone; polling takes over for every affected
    /// account.
    pub fn on_registration_gone(&self, device_client_id: Uuid, distributor: &str) {
        let subscription = match self.store.subscription(device_client_id, Some(distributor)) {
            Ok(Some(subscription)) => subscription,
            Ok(None) => {
                warn!("Failure callback for unknown subscription {device_client_id}");
                return;
            }
            Err(e) => {
                warn!("Could not look up subscription {device_client_id}: {e}");
                return;
            }
        };
        warn!(
            "Push delivery lost for credentials {}; arming fallback",
            subscription.credentials_id
        );
        self.arm_for_credentials(&subscription);
    }

    fn arm_for_credentials(&self, subscription: &PushSubscriptionRecord) {
        match self.accounts.account_ids(subscription.credentials_id) {
            Ok(account_ids) => {
                if let Err(e) = self.fallback.arm_all(&account_ids) {
                    warn!("Could not arm fallback: {e}");
                }
            }
            Err(e) => warn!(
                "Could not enumerate accounts for credentials {}: {e}",
                subscription.credentials_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PushConfig;
    use crate::registrar::testing::StubApi;
    use crate::registrar::MainThreadMarker;
    use crate::scheduler::testing::RecordingScheduler;
    use crate::store::accounts::InMemoryAccountStore;
    use crate::types::{AccountId, AccountWithCredentials, Credentials, CredentialsId};
    use serde_json::json;

    fn account(id: i64, credentials_id: i64, device: Uuid) -> AccountWithCredentials {
        AccountWithCredentials {
            id: AccountId(id),
            jmap_account_id: format!("u{id}"),
            name: format!("account {id}"),
            device_client_id: device,
            credentials: Credentials {
                id: CredentialsId(credentials_id),
                session_resource: "https://mail.example.com/jmap/session".into(),
            },
        }
    }

    struct Harness {
        router: PushRouter,
        scheduler: Arc<RecordingScheduler>,
        store: Arc<SubscriptionStore>,
    }

    fn harness(accounts: &[AccountWithCredentials]) -> Harness {
        let scheduler = Arc::new(RecordingScheduler::default());
        let store = Arc::new(SubscriptionStore::in_memory().unwrap());
        let account_store = Arc::new(InMemoryAccountStore::default());
        for account in accounts {
            account_store.insert(account.clone());
        }
        let config = PushConfig::default();
        let registrar = Arc::new(PushRegistrar::new(
            Arc::new(StubApi::accepting()),
            store.clone(),
            account_store.clone(),
            scheduler.clone(),
            Vec::new(),
            config.clone(),
            MainThreadMarker::unrestricted(),
        ));
        let fallback = FallbackScheduler::new(scheduler.clone(), &config);
        let router = PushRouter::new(
            store.clone(),
            account_store,
            scheduler.clone(),
            fallback,
            registrar,
        );
        Harness {
            router,
            scheduler,
            store,
        }
    }

    fn seed_subscription(store: &SubscriptionStore, account: &AccountWithCredentials) {
        store
            .insert_registration(
                account.credentials.id,
                account.device_client_id,
                "org.example.distributor",
            )
            .unwrap();
    }

    #[test]
    fn verification_message_enqueues_a_verification_job() {
        let device = Uuid::new_v4();
        let account = account(1, 10, device);
        let harness = harness(std::slice::from_ref(&account));
        seed_subscription(&harness.store, &account);

        let payload = json!({
            "@type": "PushVerification",
            "pushSubscriptionId": "ps-remote-1",
            "verificationCode": "code-123",
        });
        harness
            .router
            .on_receive(device, None, payload.to_string().as_bytes());

        let once = harness.scheduler.once.lock().unwrap();
        assert_eq!(
            once.as_slice(),
            &[JobRequest::PushVerification {
                credentials_id: CredentialsId(10),
                push_subscription_id: "ps-remote-1".into(),
                verification_code: "code-123".into(),
            }]
        );
    }

    #[test]
    fn state_change_enqueues_one_deduped_refresh_per_account() {
        let device = Uuid::new_v4();
        let first = account(1, 10, device);
        let second = account(2, 10, device);
        let harness = harness(&[first.clone(), second]);
        seed_subscription(&harness.store, &first);

        let payload = json!({
            "@type": "StateChange",
            "changed": {
                "u1": { "Email": "s1", "Mailbox": "s2" },
                "u2": { "Email": "s7" },
            }
        });
        harness
            .router
            .on_receive(device, None, payload.to_string().as_bytes());
        harness
            .router
            .on_receive(device, None, payload.to_string().as_bytes());

        let one_off = harness.scheduler.one_off.lock().unwrap();
        assert_eq!(one_off.len(), 2);
        assert_eq!(
            one_off.get(&main_refresh_key(AccountId(1))),
            Some(&JobRequest::MainQueryRefresh {
                account_id: AccountId(1)
            })
        );
        assert_eq!(
            one_off.get(&main_refresh_key(AccountId(2))),
            Some(&JobRequest::MainQueryRefresh {
                account_id: AccountId(2)
            })
        );
    }

    #[test]
    fn unresolvable_account_does_not_stop_the_others() {
        let device = Uuid::new_v4();
        let account = account(1, 10, device);
        let harness = harness(std::slice::from_ref(&account));
        seed_subscription(&harness.store, &account);

        let payload = json!({
            "@type": "StateChange",
            "changed": {
                "u-gone": { "Email": "s1" },
                "u1": { "Email": "s2" },
            }
        });
        harness
            .router
            .on_receive(device, None, payload.to_string().as_bytes());

        let one_off = harness.scheduler.one_off.lock().unwrap();
        assert_eq!(one_off.len(), 1);
        assert!(one_off.contains_key(&main_refresh_key(AccountId(1))));
    }

    #[test]
    fn malformed_payloads_are_dropped_without_side_effects() {
        let device = Uuid::new_v4();
        let account = account(1, 10, device);
        let harness = harness(std::slice::from_ref(&account));
        seed_subscription(&harness.store, &account);

        harness.router.on_receive(device, None, b"not json");
        harness
            .router
            .on_receive(device, None, br#"{"@type": "SomethingElse"}"#);

        assert!(harness.scheduler.once.lock().unwrap().is_empty());
        assert!(harness.scheduler.one_off.lock().unwrap().is_empty());
        assert!(harness.scheduler.armed_keys().is_empty());
    }

    #[test]
    fn messages_for_unknown_subscriptions_are_dropped() {
        let harness = harness(&[]);
        harness
            .router
            .on_receive(Uuid::new_v4(), None, br#"{"@type": "StateChange", "changed": {}}"#);
        assert!(harness.scheduler.one_off.lock().unwrap().is_empty());
    }

    #[test]
    fn encrypted_payloads_are_decrypted_with_stored_key_material() {
        let device = Uuid::new_v4();
        let account = account(1, 10, device);
        let harness = harness(std::slice::from_ref(&account));
        let material = webpush::generate_key_material().unwrap();
        harness
            .store
            .store_remote_subscription(
                account.credentials.id,
                device,
                "org.example.distributor",
                "ps-remote-1",
                "https://push.example.com/ep/1",
                &material,
                None,
            )
            .unwrap();

        let payload = json!({
            "@type": "PushVerification",
            "pushSubscriptionId": "ps-remote-1",
            "verificationCode": "code-enc",
        });
        let ciphertext = webpush::encrypt(payload.to_string().as_bytes(), &material).unwrap();
        harness.router.on_receive(device, None, &ciphertext);

        let once = harness.scheduler.once.lock().unwrap();
        assert_eq!(once.len(), 1);

        // tampered ciphertext is dropped, not dispatched
        drop(once);
        let mut tampered = webpush::encrypt(payload.to_string().as_bytes(), &material).unwrap();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        harness.router.on_receive(device, None, &tampered);
        assert_eq!(harness.scheduler.once.lock().unwrap().len(), 1);
    }

    #[test]
    fn lost_registration_arms_fallback_for_all_accounts() {
        let device = Uuid::new_v4();
        let first = account(1, 10, device);
        let second = account(2, 10, device);
        let harness = harness(&[first.clone(), second]);
        seed_subscription(&harness.store, &first);

        harness
            .router
            .on_registration_gone(device, "org.example.distributor");

        let mut keys = harness.scheduler.armed_keys();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                main_refresh_key(AccountId(1)),
                main_refresh_key(AccountId(2))
            ]
        );
    }

    #[tokio::test]
    async fn late_endpoint_finishes_registration_and_disarms_fallback() {
        let device = Uuid::new_v4();
        let account = account(1, 10, device);
        let harness = harness(std::slice::from_ref(&account));
        seed_subscription(&harness.store, &account);
        harness.router.fallback.arm(account.id).unwrap();

        harness
            .router
            .on_new_endpoint(device, "org.example.distributor", "https://push.example.com/ep/1")
            .await;

        assert!(harness.scheduler.armed_keys().is_empty());
        let record = harness.store.subscription(device, None).unwrap().unwrap();
        assert_eq!(record.remote_subscription_id.as_deref(), Some("ps-remote-1"));
        assert_eq!(record.url.as_deref(), Some("https://push.example.com/ep/1"));
    }
}
