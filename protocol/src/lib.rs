//! Wire and data model shared by the gateway crates.
//!
//! Everything in this crate is plain data: the chat message shapes accepted
//! on the HTTP surface, the canonical stream events emitted to clients, and
//! the MCP server specifications users register.

mod chat;
mod events;
mod models;
mod server_spec;

pub use chat::ChatCompletionRequest;
pub use chat::ExtraParams;
pub use chat::ModelInfo;
pub use events::DoneReason;
pub use events::StreamErrorPayload;
pub use events::StreamEvent;
pub use events::ToolResultPayload;
pub use models::ContentBlock;
pub use models::Message;
pub use models::MessageContent;
pub use models::Role;
pub use server_spec::ServerSpec;
pub use server_spec::ServerStatus;
pub use server_spec::ServerSummary;
