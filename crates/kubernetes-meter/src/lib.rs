//! Kubernetes Meter Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Forwards APEL accounting records written by the Kubernetes accounting
//! exporter to a Gratia collector.
//!
//! # Pipeline
//!
//! - **Queue**: [`dirq::DirQueue`], a directory queue with hard-link claims
//! - **Parsing**: [`apel::ApelRecord`] turns `key: value` payloads into usage records
//! - **Forwarding**: [`meter::Meter`] drains the queue in batches and deletes
//!   entries only after their batch was forwarded
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gratia_common::forwarder::CollectorForwarder;
//! use gratia_common::vo::VoResolver;
//! use kubernetes_meter::{DirQueue, Meter, MeterConfig, MeterOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = MeterConfig::from_env()?;
//!     let forwarder = CollectorForwarder::new(config.collector_settings())?;
//!     let resolver = Arc::new(VoResolver::new(config.user_vo_map.clone()));
//!     let queue = DirQueue::open(&config.queue_dir)?;
//!
//!     let summary = Meter::new(queue, forwarder, resolver, MeterOptions::from(&config))
//!         .run()
//!         .await?;
//!     println!("forwarded {} records", summary.forwarded);
//!     Ok(())
//! }
//! ```

pub mod apel;
pub mod config;
pub mod dirq;
pub mod meter;

pub use apel::ApelRecord;
pub use config::MeterConfig;
pub use dirq::{DirQueue, Lease};
pub use meter::{Meter, MeterOptions, RunSummary};
