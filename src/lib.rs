//! Canopy: a replicated coordination store.
//!
//! A cluster of servers agrees on an ordered log of commands and applies it
//! to a hierarchical namespace of directories and files. Clients issue reads
//! and conditional writes; the cluster keeps operating through crashes,
//! restarts, message loss, and leader changes.
//!
//! # Architecture
//!
//! - [`consensus`]: the Raft engine with weighted voting. Quorums are
//!   weighted sums; a server's weight can be reassigned at runtime through
//!   a replicated configuration entry, and weight zero makes it a learner.
//! - [`tree`]: the replicated state machine, a tree of directories and
//!   files with a compare-and-apply condition primitive.
//! - [`server`]: the service adapter wiring client requests and peer RPCs
//!   to the engine over HTTP.
//! - [`config`] / [`observability`]: node configuration and logging.
//!
//! # Example
//!
//! ```no_run
//! use canopy::config::CanopyConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CanopyConfig::development();
//!     canopy::run(config).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consensus;
pub mod error;
pub mod observability;
pub mod server;
pub mod tree;
pub mod types;

pub use config::CanopyConfig;
pub use error::{CanopyError, Result};

/// Run a coordination server with the given configuration.
pub async fn run(config: CanopyConfig) -> Result<()> {
    config.validate()?;
    server::run_server(config).await
}
