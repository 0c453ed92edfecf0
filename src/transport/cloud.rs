//! Vendor cloud-messaging push transport
//!
//! Registers against the platform's cloud messaging service. The service
//! cannot deliver to arbitrary application servers, so a server-provided
//! VAPID key is mandatory. A successful registration yields a registration
//! id from which the web push endpoint URL is derived.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL;
use base64::Engine;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Endpoint, RegistrationState};
use crate::config::PushConfig;
use crate::types::error::{PushError, Result};

const ENDPOINT_BASE: &str = "https://fcm.googleapis.com/fcm/send";
const DISTRIBUTOR: &str = "com.google.android.gms";

/// Registration request handed to the platform bridge.
#[derive(Debug, Clone)]
pub struct CloudRegisterRequest {
    /// base64url-encoded VAPID application server key.
    pub sender: String,
    /// `wp:{device client id}` routing tag echoed back on inbound messages.
    pub subtype: String,
}

/// Single-shot bridge reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudRegistrationReply {
    Registered { registration_id: String },
    Error { message: String },
}

/// System boundary to the vendor messaging service.
pub trait CloudMessagingBridge: Send + Sync {
    /// Whether the service is installed on this device.
    fn is_available(&self) -> bool;

    fn send_register(
        &self,
        request: CloudRegisterRequest,
        reply: flume::Sender<CloudRegistrationReply>,
    ) -> Result<()>;
}

pub struct CloudMessagingTransport {
    bridge: Arc<dyn CloudMessagingBridge>,
    timeout: Duration,
}

impl CloudMessagingTransport {
    pub fn new(bridge: Arc<dyn CloudMessagingBridge>, timeout: Duration) -> Self {
        Self { bridge, timeout }
    }

    /// Transport bounded by the configured registration wait.
    pub fn from_config(bridge: Arc<dyn CloudMessagingBridge>, config: &PushConfig) -> Self {
        Self::new(bridge, config.registration_timeout())
    }

    pub fn is_available(&self) -> bool {
        self.bridge.is_available()
    }

    /// Routing tag carried in the `subtype` field.
    pub fn subtype(device_client_id: Uuid) -> String {
        format!("wp:{device_client_id}")
    }

    /// Device client id recovered from an inbound message's subtype.
    pub fn parse_subtype(subtype: &str) -> Option<Uuid> {
        let id = subtype.strip_prefix("wp:")?;
        Uuid::parse_str(id).ok()
    }

    pub async fn register(
        &self,
        application_server_key: Option<&[u8]>,
        device_client_id: Uuid,
    ) -> Result<Endpoint> {
        let Some(key) = application_server_key.filter(|k| !k.is_empty()) else {
            return Err(PushError::RegistrationFailed(
                "cloud messaging requires a VAPID application server key".into(),
            ));
        };
        let request = CloudRegisterRequest {
            sender: BASE64URL.encode(key),
            subtype: Self::subtype(device_client_id),
        };
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.bridge.send_register(request, reply_tx)?;
        debug!(
            "Cloud messaging registration is {:?}",
            RegistrationState::AwaitingProviderResponse
        );
        match tokio::time::timeout(self.timeout, reply_rx.recv_async()).await {
            Ok(Ok(CloudRegistrationReply::Registered { registration_id })) => {
                if registration_id.is_empty() {
                    return Err(PushError::RegistrationFailed(
                        "reply did not contain a registration id".into(),
                    ));
                }
                info!("Received cloud messaging registration id {registration_id}");
                Ok(Endpoint {
                    url: Some(format!("{ENDPOINT_BASE}/{registration_id}")),
                    distributor: DISTRIBUTOR.to_string(),
                })
            }
            Ok(Ok(CloudRegistrationReply::Error { message })) => {
                warn!(
                    "Cloud messaging registration is {:?}: {message}",
                    RegistrationState::Failed
                );
                Err(PushError::RegistrationFailed(message))
            }
            Ok(Err(_)) => Err(PushError::RegistrationFailed(
                "cloud messaging bridge dropped the reply channel".into(),
            )),
            Err(_) => {
                warn!(
                    "Cloud messaging registration is {:?} after {:?}",
                    RegistrationState::TimedOut,
                    self.timeout
                );
                Err(PushError::RegistrationTimeout(format!(
                    "cloud messaging did not answer within {:?}",
                    self.timeout
                )))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scriptable cloud messaging bridge for tests.
    pub struct StubBridge {
        pub available: bool,
        pub reply: Mutex<Option<CloudRegistrationReply>>,
        pub requests: Mutex<Vec<CloudRegisterRequest>>,
        /// Senders kept alive so an unscripted bridge is silent instead of
        /// hanging up.
        pub held: Mutex<Vec<flume::Sender<CloudRegistrationReply>>>,
    }

    impl StubBridge {
        pub fn with_availability(available: bool) -> Self {
            Self {
                available,
                reply: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
                held: Mutex::new(Vec::new()),
            }
        }

        pub fn replying(reply: CloudRegistrationReply) -> Self {
            let bridge = Self::with_availability(true);
            *bridge.reply.lock().unwrap() = Some(reply);
            bridge
        }
    }

    impl CloudMessagingBridge for StubBridge {
        fn is_available(&self) -> bool {
            self.available
        }

        fn send_register(
            &self,
            request: CloudRegisterRequest,
            reply: flume::Sender<CloudRegistrationReply>,
        ) -> Result<()> {
            self.requests.lock().unwrap().push(request);
            match self.reply.lock().unwrap().clone() {
                Some(scripted) => {
                    let _ = reply.send(scripted);
                }
                None => self.held.lock().unwrap().push(reply),
            }
            Ok(())
        }
    }
}
