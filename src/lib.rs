//! # shoal
//!
//! A decentralized file-sharing overlay for local networks.
//!
//! ## Features
//!
//! - **Zero configuration**: Nodes find each other through a UDP
//!   broadcast handshake, no tracker or coordinator
//! - **Gossip lookup**: Chunk requests flood peer-to-peer with a TTL and
//!   a visited set, so cycles in the topology cannot amplify traffic
//! - **Dual transfer paths**: Small chunks return inside a single
//!   datagram, large ones over a short-lived TCP stream
//! - **Verified end to end**: Every chunk and every merged file is
//!   checked against its SHA-256 digest
//! - **Async**: Built on Tokio, one lightweight task per listener and
//!   per in-flight chunk
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shoal::{Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::new(NodeConfig::default())?;
//!     node.connect().await?;
//!
//!     // Share a folder and watch the overlay react
//!     node.set_shared_root(std::path::Path::new("/data/shared")).await?;
//!
//!     let mut events = node.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//!
//!     Ok(())
//! }
//! ```

// Modules
pub mod config;
pub mod directory;
pub mod discovery;
pub mod download;
pub mod error;
pub mod lookup;
pub mod node;
pub mod store;
pub mod transfer;
pub mod transport;
pub mod types;
pub mod wire;

// Re-exports for convenience
pub use config::{NodeConfig, DEFAULT_BROADCAST_PORT};
pub use error::{NodeError, Result};
pub use node::{Node, EVENT_CHANNEL_CAPACITY};
pub use store::{chunk_count, CHUNK_SIZE};
pub use types::{CatalogKind, DownloadProgress, FileRecord, NodeEvent};
