//! Broadcast-distributor push transport
//!
//! Talks the open distributor protocol: eligible providers are discovered
//! by enumerating installed packages that declare the registration action,
//! filtered to those supporting byte messages. The registration broadcast
//! carries the application identity, a correlation token (the device client
//! id) and the requested features; the provider answers once over a
//! single-shot channel, or never.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Endpoint, RegistrationState};
use crate::config::PushConfig;
use crate::types::error::{PushError, Result};

pub const ACTION_REGISTER: &str = "org.unifiedpush.android.distributor.REGISTER";
pub const ACTION_MESSAGE: &str = "org.unifiedpush.android.connector.MESSAGE";
pub const ACTION_NEW_ENDPOINT: &str = "org.unifiedpush.android.connector.NEW_ENDPOINT";
pub const ACTION_REGISTRATION_FAILED: &str =
    "org.unifiedpush.android.connector.REGISTRATION_FAILED";

pub const FEATURE_BYTES_MESSAGE: &str =
    "org.unifiedpush.android.distributor.feature.BYTES_MESSAGE";
pub const FEATURE_MESSENGER: &str = "org.unifiedpush.android.distributor.feature.MESSENGER";
pub const FEATURE_APP_VALIDATION: &str =
    "org.unifiedpush.android.distributor.feature.APP_VALIDATION";

/// One installed distributor package and the features it declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributorInfo {
    pub package: String,
    pub features: Vec<String>,
}

impl DistributorInfo {
    pub fn bytes_message(&self) -> bool {
        self.features.iter().any(|f| f == FEATURE_BYTES_MESSAGE)
    }

    /// Provider can answer the registration over an ack channel. Without
    /// this the registration is fire-and-forget and the endpoint arrives
    /// later, if at all.
    pub fn messenger(&self) -> bool {
        self.features.iter().any(|f| f == FEATURE_MESSENGER)
    }

    /// Provider validates the registering application's identity. Trust is
    /// best-effort otherwise.
    pub fn app_validation(&self) -> bool {
        self.features.iter().any(|f| f == FEATURE_APP_VALIDATION)
    }
}

/// Registration broadcast payload.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    /// Identity of the registering application.
    pub application: String,
    /// Correlation token; the device client id routes the reply.
    pub token: Uuid,
    /// Requested features, always at least byte-message support.
    pub features: Vec<String>,
    /// Server-provided VAPID key, when one exists.
    pub application_server_key: Option<Vec<u8>>,
}

/// Single-shot provider reply to a registration broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationReply {
    NewEndpoint { url: String },
    Failed { message: String },
}

/// System boundary to the installed distributor packages.
///
/// An embedding platform implements discovery and broadcast delivery; the
/// reply sender, when given, must be used at most once.
pub trait DistributorBus: Send + Sync {
    fn distributors(&self) -> Vec<DistributorInfo>;

    fn send_register(
        &self,
        distributor: &str,
        request: RegisterRequest,
        reply: Option<flume::Sender<RegistrationReply>>,
    ) -> Result<()>;
}

pub struct DistributorTransport {
    bus: Arc<dyn DistributorBus>,
    application: String,
    timeout: Duration,
}

impl DistributorTransport {
    pub fn new(bus: Arc<dyn DistributorBus>, application: String, timeout: Duration) -> Self {
        Self {
            bus,
            application,
            timeout,
        }
    }

    /// Transport bounded by the configured registration wait.
    pub fn from_config(
        bus: Arc<dyn DistributorBus>,
        application: String,
        config: &PushConfig,
    ) -> Self {
        Self::new(bus, application, config.registration_timeout())
    }

    /// Installed providers that can carry our messages, app-validating ones
    /// first.
    fn supported_distributors(&self) -> Vec<DistributorInfo> {
        let mut supported: Vec<DistributorInfo> = self
            .bus
            .distributors()
            .into_iter()
            .inspect(|d| debug!("Discovered distributor {} ({:?})", d.package, d.features))
            .filter(DistributorInfo::bytes_message)
            .collect();
        supported.sort_by_key(|d| !d.app_validation());
        supported
    }

    pub fn is_available(&self) -> bool {
        !self.supported_distributors().is_empty()
    }

    pub async fn register(
        &self,
        application_server_key: Option<&[u8]>,
        device_client_id: Uuid,
    ) -> Result<Endpoint> {
        let Some(distributor) = self.supported_distributors().into_iter().next() else {
            // Availability can change between selection and registration.
            return Err(PushError::TransportUnavailable(
                "no compatible distributor installed".into(),
            ));
        };
        let request = RegisterRequest {
            application: self.application.clone(),
            token: device_client_id,
            features: vec![FEATURE_BYTES_MESSAGE.to_string()],
            application_server_key: application_server_key.map(<[u8]>::to_vec),
        };

        if !distributor.messenger() {
            // Fire-and-forget provider. The endpoint arrives later through
            // the new-endpoint callback, if it arrives at all.
            self.bus.send_register(&distributor.package, request, None)?;
            info!(
                "Registration with {} is {:?}",
                distributor.package,
                RegistrationState::Delayed
            );
            return Ok(Endpoint {
                url: None,
                distributor: distributor.package,
            });
        }

        let (reply_tx, reply_rx) = flume::bounded(1);
        self.bus
            .send_register(&distributor.package, request, Some(reply_tx))?;
        debug!(
            "Registration with {} is {:?}",
            distributor.package,
            RegistrationState::AwaitingProviderResponse
        );
        // Dropping reply_rx on timeout releases the registered listener.
        match tokio::time::timeout(self.timeout, reply_rx.recv_async()).await {
            Ok(Ok(RegistrationReply::NewEndpoint { url })) => {
                info!("Received endpoint {url} from {}", distributor.package);
                Ok(Endpoint {
                    url: Some(url),
                    distributor: distributor.package,
                })
            }
            Ok(Ok(RegistrationReply::Failed { message })) => {
                warn!(
                    "Registration with {} is {:?}: {message}",
                    distributor.package,
                    RegistrationState::Failed
                );
                Err(PushError::RegistrationFailed(message))
            }
            Ok(Err(_)) => Err(PushError::RegistrationFailed(
                "distributor dropped the reply channel".into(),
            )),
            Err(_) => {
                warn!(
                    "Registration with {} is {:?} after {:?}",
                    distributor.package,
                    RegistrationState::TimedOut,
                    self.timeout
                );
                Err(PushError::RegistrationTimeout(format!(
                    "{} did not answer within {:?}",
                    distributor.package, self.timeout
                )))
            }
        }
    }
}
