//! Forwarding usage records to an accounting collector
//!
//! A forwarding session runs in a fixed order:
//! `configure` -> `handshake` -> `search_outstanding` ->
//! `reprocess_outstanding` -> `send`* -> `flush_bundle`.

pub mod collector;

use async_trait::async_trait;

use crate::error::Result;
use crate::record::UsageRecord;

pub use collector::{CollectorForwarder, CollectorSettings};

/// Outcome of handing one record to a forwarder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResponse {
    /// Held in the current bundle; delivered by the next flush
    Bundled { pending: usize },
    /// Delivered and acknowledged by the collector
    Sent { message: String },
}

impl std::fmt::Display for SendResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendResponse::Bundled { pending } => write!(f, "OK - bundled ({} pending)", pending),
            SendResponse::Sent { message } => write!(f, "{}", message),
        }
    }
}

/// Destination for usage records
#[async_trait]
pub trait Forwarder: Send {
    /// Set the site and probe identity reported with every record
    fn configure(&mut self, site_name: &str, probe_name: &str);

    /// Announce the probe to the collector
    async fn handshake(&mut self) -> Result<()>;

    /// Look for records left unacknowledged by an earlier run; returns how many
    async fn search_outstanding(&mut self) -> Result<usize>;

    /// Retry delivery of records found by [`Forwarder::search_outstanding`]
    async fn reprocess_outstanding(&mut self) -> Result<()>;

    async fn send(&mut self, record: &UsageRecord) -> Result<SendResponse>;

    /// Deliver everything still bundled
    async fn flush_bundle(&mut self) -> Result<()>;
}
