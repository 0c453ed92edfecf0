//! Background job scheduler boundary
//!
//! The push core never runs periodic or durable work itself; it hands job
//! requests to an external scheduler (WorkManager-equivalent) through this
//! boundary. The fallback scheduler keeps mailboxes synchronizing by
//! periodic polling whenever push delivery cannot be guaranteed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::PushConfig;
use crate::types::error::Result;
use crate::types::{AccountId, CredentialsId};

/// Work the push core asks the external job system to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobRequest {
    /// Confirm a verification code with the remote server, durably and
    /// at least once.
    PushVerification {
        credentials_id: CredentialsId,
        push_subscription_id: String,
        verification_code: String,
    },
    /// Refresh the account's primary mailbox view.
    MainQueryRefresh { account_id: AccountId },
    /// Re-run push registration for the account's credentials.
    PushRegistration { account_id: AccountId },
}

impl JobRequest {
    /// Stable job kind identifier for the external system's bookkeeping.
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::PushVerification { .. } => "push_verification",
            Self::MainQueryRefresh { .. } => "main_query_refresh",
            Self::PushRegistration { .. } => "push_registration",
        }
    }
}

/// What happens when a uniquely-keyed one-off job is enqueued while an
/// identical key is already pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DedupPolicy {
    /// Collapse into the pending job; enqueuing twice runs once.
    KeepExisting,
    /// Cancel the pending job and schedule this one.
    Replace,
}

/// Schedule of a uniquely-keyed periodic job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicSpec {
    pub interval: Duration,
    pub tolerance: Duration,
    /// Only run while network connectivity is available.
    pub requires_network: bool,
    /// Replace any existing schedule under the same key.
    pub replace: bool,
}

/// Boundary to the external background job system.
///
/// All operations are idempotent and safe to call redundantly.
pub trait JobScheduler: Send + Sync {
    fn enqueue_once(&self, request: JobRequest) -> Result<()>;

    fn enqueue_unique_one_off(
        &self,
        key: &str,
        request: JobRequest,
        dedup: DedupPolicy,
    ) -> Result<()>;

    fn enqueue_unique_periodic(
        &self,
        key: &str,
        request: JobRequest,
        spec: PeriodicSpec,
    ) -> Result<()>;

    fn cancel_unique(&self, key: &str) -> Result<()>;
}

/// Unique key of the periodic fallback refresh for one account.
pub fn main_refresh_key(account_id: AccountId) -> String {
    format!("main-query-refresh-{account_id}")
}

/// Unique key of the re-registration one-off for one credential set.
pub fn renewal_key(credentials_id: CredentialsId) -> String {
    format!("push-registration-{credentials_id}")
}

/// Arms and disarms periodic polling as the guaranteed-delivery fallback.
#[derive(Clone)]
pub struct FallbackScheduler {
    scheduler: Arc<dyn JobScheduler>,
    interval: Duration,
    tolerance: Duration,
}

impl FallbackScheduler {
    pub fn new(scheduler: Arc<dyn JobScheduler>, config: &PushConfig) -> Self {
        Self {
            scheduler,
            interval: config.fallback_interval(),
            tolerance: config.fallback_tolerance(),
        }
    }

    /// Request periodic mailbox refresh for the account, replacing any
    /// existing schedule under the same key.
    pub fn arm(&self, account_id: AccountId) -> Result<()> {
        info!("Arming fallback refresh for account {account_id}");
        self.scheduler.enqueue_unique_periodic(
            &main_refresh_key(account_id),
            JobRequest::MainQueryRefresh { account_id },
            PeriodicSpec {
                interval: self.interval,
                tolerance: self.tolerance,
                requires_network: true,
                replace: true,
            },
        )
    }

    pub fn arm_all(&self, account_ids: &[AccountId]) -> Result<()> {
        for account_id in account_ids {
            self.arm(*account_id)?;
        }
        Ok(())
    }

    /// Cancel the periodic refresh for the account.
    pub fn disarm(&self, account_id: AccountId) -> Result<()> {
        debug!("Disarming fallback refresh for account {account_id}");
        self.scheduler.cancel_unique(&main_refresh_key(account_id))
    }

    pub fn disarm_all(&self, account_ids: &[AccountId]) -> Result<()> {
        for account_id in account_ids {
            self.disarm(*account_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Records every scheduler call and models unique-key semantics.
    #[derive(Default)]
    pub struct RecordingScheduler {
        pub once: Mutex<Vec<JobRequest>>,
        pub one_off: Mutex<BTreeMap<String, JobRequest>>,
        pub periodic: Mutex<BTreeMap<String, (JobRequest, PeriodicSpec)>>,
    }

    impl RecordingScheduler {
        pub fn armed_keys(&self) -> Vec<String> {
            self.periodic.lock().unwrap().keys().cloned().collect()
        }
    }

    impl JobScheduler for RecordingScheduler {
        fn enqueue_once(&self, request: JobRequest) -> Result<()> {
            self.once.lock().unwrap().push(request);
            Ok(())
        }

        fn enqueue_unique_one_off(
            &self,
            key: &str,
            request: JobRequest,
            dedup: DedupPolicy,
        ) -> Result<()> {
            let mut one_off = self.one_off.lock().unwrap();
            match dedup {
                DedupPolicy::KeepExisting => {
                    one_off.entry(key.to_string()).or_insert(request);
                }
                DedupPolicy::Replace => {
                    one_off.insert(key.to_string(), request);
                }
            }
            Ok(())
        }

        fn enqueue_unique_periodic(
            &self,
            key: &str,
            request: JobRequest,
            spec: PeriodicSpec,
        ) -> Result<()> {
            self.periodic
                .lock()
                .unwrap()
                .insert(key.to_string(), (request, spec));
            Ok(())
        }

        fn cancel_unique(&self, key: &str) -> Result<()> {
            self.periodic.lock().unwrap().remove(key);
            self.one_off.lock().unwrap().remove(key);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingScheduler;
    use super::*;

    fn fallback(scheduler: &Arc<RecordingScheduler>) -> FallbackScheduler {
        FallbackScheduler::new(scheduler.clone(), &PushConfig::default())
    }

    #[test]
    fn arm_schedules_unique_periodic_refresh() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let fallback = fallback(&scheduler);
        fallback.arm(AccountId(7)).unwrap();

        let periodic = scheduler.periodic.lock().unwrap();
        let (request, spec) = periodic.get("main-query-refresh-7").unwrap();
        assert_eq!(
            request,
            &JobRequest::MainQueryRefresh {
                account_id: AccountId(7)
            }
        );
        assert_eq!(spec.interval, Duration::from_secs(15 * 60));
        assert_eq!(spec.tolerance, Duration::from_secs(20 * 60));
        assert!(spec.requires_network);
        assert!(spec.replace);
    }

    #[test]
    fn arm_and_disarm_are_idempotent() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let fallback = fallback(&scheduler);
        fallback.arm(AccountId(1)).unwrap();
        fallback.arm(AccountId(1)).unwrap();
        assert_eq!(scheduler.armed_keys(), vec!["main-query-refresh-1"]);

        fallback.disarm(AccountId(1)).unwrap();
        fallback.disarm(AccountId(1)).unwrap();
        assert!(scheduler.armed_keys().is_empty());
    }

    #[test]
    fn keep_existing_dedup_collapses_to_one_job() {
        let scheduler = RecordingScheduler::default();
        let first = JobRequest::MainQueryRefresh {
            account_id: AccountId(3),
        };
        scheduler
            .enqueue_unique_one_off("k", first.clone(), DedupPolicy::KeepExisting)
            .unwrap();
        scheduler
            .enqueue_unique_one_off(
                "k",
                JobRequest::PushRegistration {
                    account_id: AccountId(9),
                },
                DedupPolicy::KeepExisting,
            )
            .unwrap();
        assert_eq!(scheduler.one_off.lock().unwrap().get("k"), Some(&first));
    }

    #[test]
    fn job_kind_identifiers_are_stable() {
        assert_eq!(
            JobRequest::MainQueryRefresh {
                account_id: AccountId(1)
            }
            .type_str(),
            "main_query_refresh"
        );
        assert_eq!(
            JobRequest::PushVerification {
                credentials_id: CredentialsId(1),
                push_subscription_id: "ps".into(),
                verification_code: "code".into(),
            }
            .type_str(),
            "push_verification"
        );
    }
}
