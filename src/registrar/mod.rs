//! Push registration orchestration
//!
//! Drives one registration attempt per credential set: fetch the session
//! resource, pick a transport, obtain a delivery endpoint, then replace any
//! stale remote subscriptions with a freshly-keyed one in a single set
//! call. Success disarms the periodic polling fallback for every account of
//! the credential set; anything less keeps it armed.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use tracing::{debug, info, warn};

use crate::config::PushConfig;
use crate::registrar::api::{
    PushSubscriptionCreate, SetSubscriptionRequest, SubscriptionApi, SubscriptionKeys, CREATE_REF,
};
use crate::scheduler::{renewal_key, DedupPolicy, FallbackScheduler, JobRequest, JobScheduler};
use crate::store::accounts::AccountStore;
use crate::store::SubscriptionStore;
use crate::transport::{select_transport, PushTransport};
use crate::types::error::{PushError, Result};
use crate::types::AccountWithCredentials;
use crate::webpush;

pub mod api;

/// Remembers the primary execution thread so blocking registration work
/// can refuse to run on it.
#[derive(Clone, Default)]
pub struct MainThreadMarker {
    main: Arc<OnceLock<ThreadId>>,
}

impl MainThreadMarker {
    /// Mark the calling thread as the primary thread.
    pub fn install() -> Self {
        let marker = Self::default();
        let _ = marker.main.set(thread::current().id());
        marker
    }

    /// Marker for embeddings without a designated primary thread; the
    /// assertion then always passes.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn assert_off_main(&self) -> Result<()> {
        match self.main.get() {
            Some(main) if *main == thread::current().id() => {
                Err(PushError::WrongExecutionContext)
            }
            _ => Ok(()),
        }
    }
}

pub struct PushRegistrar {
    api: Arc<dyn SubscriptionApi>,
    store: Arc<SubscriptionStore>,
    accounts: Arc<dyn AccountStore>,
    scheduler: Arc<dyn JobScheduler>,
    fallback: FallbackScheduler,
    transports: Vec<PushTransport>,
    config: PushConfig,
    main_thread: MainThreadMarker,
}

impl PushRegistrar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn SubscriptionApi>,
        store: Arc<SubscriptionStore>,
        accounts: Arc<dyn AccountStore>,
        scheduler: Arc<dyn JobScheduler>,
        transports: Vec<PushTransport>,
        config: PushConfig,
        main_thread: MainThreadMarker,
    ) -> Self {
        let fallback = FallbackScheduler::new(scheduler.clone(), &config);
        Self {
            api,
            store,
            accounts,
            scheduler,
            fallback,
            transports,
            config,
            main_thread,
        }
    }

    pub fn fallback(&self) -> &FallbackScheduler {
        &self.fallback
    }

    /// Register push for every credential set in `accounts`, once per set.
    ///
    /// A hard success for a set disarms the polling fallback for all of its
    /// accounts; a soft or hard failure arms it. One failing set never
    /// prevents the others from registering.
    pub async fn register_all(&self, accounts: &[AccountWithCredentials]) -> Result<()> {
        self.main_thread.assert_off_main()?;
        let mut seen = BTreeSet::new();
        for account in accounts {
            if !seen.insert(account.credentials.id) {
                continue;
            }
            let account_ids = self.accounts.account_ids(account.credentials.id)?;
            match self.register(account).await {
                Ok(true) => self.fallback.disarm_all(&account_ids)?,
                Ok(false) => self.fallback.arm_all(&account_ids)?,
                Err(e) => {
                    warn!(
                        "Push registration for credentials {} failed: {e}",
                        account.credentials.id
                    );
                    self.fallback.arm_all(&account_ids)?;
                }
            }
        }
        Ok(())
    }

    /// One registration attempt for the account's credential set.
    ///
    /// `Ok(true)` means a remote subscription exists and push delivery is
    /// expected; `Ok(false)` means registration was skipped or is still
    /// pending and polling must cover the gap.
    pub async fn register(&self, account: &AccountWithCredentials) -> Result<bool> {
        let session = self.api.session(account).await?;
        let application_server_key = session.application_server_key();
        let Some(transport) = select_transport(
            &self.transports,
            &self.config.transport_preference,
            application_server_key.is_some(),
        ) else {
            warn!(
                "No usable push transport for credentials {}; falling back to polling",
                account.credentials.id
            );
            return Ok(false);
        };
        info!(
            "Registering credentials {} via {:?}",
            account.credentials.id,
            transport.kind()
        );
        let endpoint = transport
            .register(application_server_key.as_deref(), account.device_client_id)
            .await?;
        self.store.insert_registration(
            account.credentials.id,
            account.device_client_id,
            &endpoint.distributor,
        )?;
        match endpoint.url {
            Some(url) => self.register_endpoint(account, &url, &endpoint.distributor).await,
            None => {
                // Provider accepted but has no endpoint yet. The endpoint
                // callback finishes the registration later.
                debug!(
                    "Endpoint for credentials {} is delayed",
                    account.credentials.id
                );
                Ok(false)
            }
        }
    }

    /// Finish a registration once a delivery endpoint is known: mint fresh
    /// key material and swap the remote subscription in one set call.
    pub async fn register_endpoint(
        &self,
        account: &AccountWithCredentials,
        url: &str,
        distributor: &str,
    ) -> Result<bool> {
        let key_material = webpush::generate_key_material()?;
        let destroy = self.store.existing_subscription_ids(account.credentials.id)?;
        let mut request = SetSubscriptionRequest {
            destroy,
            ..Default::default()
        };
        request.create.insert(
            CREATE_REF.to_string(),
            PushSubscriptionCreate {
                device_client_id: account.device_client_id.to_string(),
                url: url.to_string(),
                keys: Some(SubscriptionKeys {
                    p256dh: key_material.encoded_public_key(),
                    auth: key_material.encoded_authentication_secret(),
                }),
            },
        );
        let response = self.api.set_subscription(account, request).await?;
        let Some(created) = response.created.get(CREATE_REF).filter(|c| !c.id.is_empty())
        else {
            warn!(
                "Server did not create a push subscription for credentials {}",
                account.credentials.id
            );
            return Ok(false);
        };
        self.store.store_remote_subscription(
            account.credentials.id,
            account.device_client_id,
            distributor,
            &created.id,
            url,
            &key_material,
            created.expires,
        )?;
        info!(
            "Registered push subscription {} for credentials {}",
            created.id, account.credentials.id
        );
        if let Some(expires) = created.expires {
            let horizon = chrono::Utc::now() + self.config.minimum_expiry();
            if expires < horizon {
                debug!(
                    "Subscription {} expires {expires}; scheduling renewal",
                    created.id
                );
                self.scheduler.enqueue_unique_one_off(
                    &renewal_key(account.credentials.id),
                    JobRequest::PushRegistration {
                        account_id: account.id,
                    },
                    DedupPolicy::KeepExisting,
                )?;
            }
        }
        Ok(true)
    }
}
