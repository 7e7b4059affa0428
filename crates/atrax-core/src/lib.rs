//! Core proxy fabric for Atrax: transport lifecycle, request/response
//! correlation, namespace merging, routing, and supervision for a reverse
//! proxy that aggregates many upstream MCP servers behind one downstream
//! MCP server.

pub mod config;
pub mod downstream;
pub mod error;
pub mod fake;
pub mod merger;
pub mod router;
pub mod rpc;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use config::{ConflictStrategy, ProxyConfig, ServerConfig, ServerConfigBody, TransportConfig};
pub use downstream::DownstreamServer;
pub use error::{AtraxError, Result};
pub use router::Router;
pub use session::{CapabilityKind, Capabilities, SessionState, UpstreamSession};
