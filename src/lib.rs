//! Push-notification delivery and subscription lifecycle for a JMAP
//! email client.
//!
//! ## Module Organization
//!
//! - `config/`: Configuration with defaults and TOML overrides
//! - `types/`: Shared identities and the error taxonomy
//! - `webpush/`: RFC 8291 / RFC 8188 payload encryption
//! - `transport/`: Push transports and transport selection
//! - `registrar/`: Registration orchestration and the remote API boundary
//! - `router/`: Inbound message routing and lifecycle callbacks
//! - `scheduler/`: External job system boundary and the polling fallback
//! - `store/`: Subscription persistence and the account store boundary
//! - `jobs/`: Durable job bodies (verification)

pub mod config;
pub mod jobs;
pub mod registrar;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod types;
pub mod webpush;

pub use types::error::{PushError, Result};
