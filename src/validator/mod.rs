//! Event legitimacy checks
//!
//! Only [`ValidationOutcome::Approved`] permits a destination action. Every
//! failure mode of the check itself (timeouts, transport errors, unexpected
//! responses) is reported as `Indeterminate` so the event is retried later
//! rather than approved by default.

use async_trait::async_trait;

use crate::types::{BridgeEvent, ValidationOutcome};

pub mod oracle;

pub use oracle::OracleValidator;

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, event: &BridgeEvent) -> ValidationOutcome;
}
