//! dnsbridge: DNS TXT tunnel to a framed TCP backend
//!
//! Agents that can only resolve DNS names talk to a local backend service
//! through two reserved suffix domains:
//!
//! - **input domain**: the agent pushes data as base32 labels, spread over
//!   many queries and reassembled here before being forwarded as one frame
//! - **output domain**: the agent polls; frames read from the backend are
//!   base64-encoded, cached and served back one TXT chunk per query
//!
//! ## Label layouts
//!
//! ```text
//! <handle>.<input>                               open backend connection
//! <handle>.<count>.<session>.<input>             announce input session
//! <handle>.<pos>.<session>.<b32>[.<b32>...].<input>   input fragment
//! <handle>.<session>.<output>                    poll (answers chunk count)
//! <handle>.<pos>.<session>.<output>              fetch one chunk
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────┐  DNS   ┌───────────┐   ┌────────┐   ┌─────────────┐  TCP   ┌─────────┐
//! │ Agent │───────▶│ UDP server│──▶│ Router │──▶│ Input/Output│───────▶│ Backend │
//! └───────┘  TXT   └───────────┘   └────────┘   │  sessions   │ frames └─────────┘
//!                                               └─────────────┘
//! ```

pub mod backend;
pub mod config;
pub mod dns;
pub mod fragment;
pub mod input;
pub mod output;
pub mod router;
pub mod server;
pub mod store;
pub mod transform;

pub use backend::{BackendError, Connection, ConnectionRegistry, Received};
pub use config::BridgeConfig;
pub use dns::{DnsError, DnsQuery};
pub use fragment::FragmentError;
pub use input::InputSessions;
pub use output::OutputSessions;
pub use router::Router;
pub use server::DnsBridgeServer;
pub use store::{ChunkStore, MemoryChunkStore, SqliteChunkStore, StoreError};
pub use transform::{AesCbc, FrameTransform, Passthrough, TransformError};

/// dnsbridge error types
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    #[error("Fragment error: {0}")]
    Fragment(#[from] FragmentError),

    /// Chunk store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
