//! Client for a single MCP server subprocess.
//!
//! The server is spawned from a validated launch spec and spoken to over
//! line-delimited JSON-RPC on its stdio. Three tasks own the transport: a
//! reader draining stdout into the pending-request map, a writer feeding
//! stdin from a FIFO queue, and the caller's task awaiting oneshot replies.
//! Tool calls from unrelated sessions are serialized by the writer queue, so
//! partial frames never interleave.

mod client;
mod error;

pub use client::ClientState;
pub use client::McpClient;
pub use client::SpawnSpec;
pub use error::McpClientError;
pub use error::Result;
