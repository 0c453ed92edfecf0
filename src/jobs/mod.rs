//! Durable job bodies executed by the external job system
//!
//! The scheduler boundary only carries [`crate::scheduler::JobRequest`]
//! descriptions; the embedding runs these bodies when a request comes due
//! and feeds the outcome back into its retry machinery.

use std::sync::Arc;
use tracing::{info, warn};

use crate::registrar::api::{SetSubscriptionRequest, SubscriptionApi};
use crate::store::accounts::AccountStore;
use crate::store::SubscriptionStore;
use crate::types::CredentialsId;

/// How the external job system should treat a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    /// Transient failure; run again with backoff.
    Retry,
    /// Terminal failure; do not run again.
    Failure,
}

/// Confirms a received verification code with the remote server, proving
/// the subscription's delivery path end to end.
pub struct PushVerificationJob {
    api: Arc<dyn SubscriptionApi>,
    store: Arc<SubscriptionStore>,
    accounts: Arc<dyn AccountStore>,
}

impl PushVerificationJob {
    pub fn new(
        api: Arc<dyn SubscriptionApi>,
        store: Arc<SubscriptionStore>,
        accounts: Arc<dyn AccountStore>,
    ) -> Self {
        Self {
            api,
            store,
            accounts,
        }
    }

    pub async fn run(
        &self,
        credentials_id: CredentialsId,
        push_subscription_id: &str,
        verification_code: &str,
    ) -> JobOutcome {
        if push_subscription_id.is_empty() || verification_code.is_empty() {
            warn!("Verification job ran without subscription id or code");
            return JobOutcome::Failure;
        }
        let account = match self.accounts.any_account(credentials_id) {
            Ok(Some(account)) => account,
            Ok(None) => {
                // Credentials were removed while the job was queued.
                warn!("No account left for credentials {credentials_id}");
                return JobOutcome::Failure;
            }
            Err(e) => {
                warn!("Could not resolve credentials {credentials_id}: {e}");
                return JobOutcome::Failure;
            }
        };
        let mut request = SetSubscriptionRequest::default();
        request.update.insert(
            push_subscription_id.to_string(),
            [(
                "verificationCode".to_string(),
                serde_json::Value::String(verification_code.to_string()),
            )]
            .into_iter()
            .collect(),
        );
        match self.api.set_subscription(&account, request).await {
            Ok(response) if response.updated.iter().any(|id| id == push_subscription_id) => {
                if let Err(e) = self.store.set_verification_code(
                    credentials_id,
                    push_subscription_id,
                    verification_code,
                ) {
                    warn!("Could not persist verification code: {e}");
                    return JobOutcome::Retry;
                }
                info!("Verified push subscription {push_subscription_id}");
                JobOutcome::Success
            }
            Ok(_) => {
                warn!("Server did not accept verification for {push_subscription_id}");
                JobOutcome::Failure
            }
            Err(e) if e.is_network() => {
                warn!("Verification of {push_subscription_id} hit the network: {e}");
                JobOutcome::Retry
            }
            Err(e) => {
                warn!("Verification of {push_subscription_id} failed: {e}");
                JobOutcome::Failure
            }
        }
    }
}
