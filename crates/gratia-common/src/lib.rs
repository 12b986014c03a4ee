//! Gratia Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Client-side building blocks shared by Gratia accounting probes.
//!
//! # Overview
//!
//! - **Error Handling**: [`GratiaError`] and the crate [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by environment variables
//! - **VO Resolution**: lazily loaded user-vo-map lookups ([`vo::VoResolver`])
//! - **Usage Records**: the canonical record and its collector XML form
//! - **Forwarding**: the [`forwarder::Forwarder`] contract and an HTTP collector client
//!
//! # Example
//!
//! ```no_run
//! use gratia_common::vo::VoResolver;
//!
//! let resolver = VoResolver::new(Some("/var/lib/osg/user-vo-map".into()));
//! if let Some(info) = resolver.resolve_user_vo("uscms01") {
//!     println!("{} -> {}", info.vo_name, resolver.resolve_display_name(&info.vo_name));
//! }
//! ```

pub mod error;
pub mod forwarder;
pub mod logging;
pub mod record;
pub mod vo;

// Re-export commonly used types
pub use error::{GratiaError, Result};
pub use forwarder::{Forwarder, SendResponse};
pub use record::{ResourceType, UsageRecord};
pub use vo::{VoInfo, VoResolver};
