//! # LiveStyle Sync Transport
//!
//! Synchronizes live stylesheet edits between editors and patcher
//! processes in real time over a local WebSocket relay.
//!
//! ## Components
//!
//! - **Relay server**: broadcast hub that classifies peers by declared role
//!   and fans envelopes out to the right subset
//! - **Client connector**: establishes a session, self-hosting a relay when
//!   none is reachable, with silent reconnect on unexpected close
//! - **Diff scheduler**: one `calculate-diff` in flight at a time, queued
//!   requests deduplicated, stale locks recovered by timeout
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use livestyle::sync::{connect, ConnectOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = connect("ws://127.0.0.1:54000/livestyle", ConnectOptions::default()).await?;
//!     session.send("editor-connect", json!({"id": "atom"})).await?;
//!
//!     let mut incoming = session.subscribe();
//!     while let Ok(envelope) = incoming.recv().await {
//!         println!("{}: {:?}", envelope.name, envelope.data);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod diff;
pub mod error;
pub mod protocol;
pub mod server;
pub mod sync;

// Re-export main types for library consumers
pub use config::SyncConfig;
pub use diff::{DiffPayload, DiffScheduler, DocumentSource};
pub use protocol::Envelope;
pub use server::RelayServer;
pub use sync::{connect, ConnectOptions, Session};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
