//! Core of the agent gateway: spec validation, the per-user MCP supervisor,
//! model provider clients and their stream adapters, agent sessions and the
//! session directory. The HTTP surface lives in `relay-server`; this crate
//! has no opinion about transports beyond the provider SSE decoding.

mod chat_completions;
mod client;
pub mod client_common;
pub mod config;
pub mod error;
pub mod flags;
mod history;
mod messages_api;
pub mod model_provider_info;
pub mod secrets;
pub mod session;
pub mod session_manager;
pub mod store;
pub mod supervisor;
mod util;
pub mod validate;

pub use client::ModelClient;
pub use client_common::EventStream;
pub use client_common::MemoryMode;
pub use client_common::ModelEvent;
pub use client_common::Prompt;
pub use client_common::SamplingParams;
pub use client_common::StopReason;
pub use config::GatewayConfig;
pub use error::RelayErr;
pub use error::Result;
pub use model_provider_info::ModelProviderInfo;
pub use model_provider_info::WireApi;
pub use model_provider_info::built_in_model_providers;
pub use session::AgentSession;
pub use session_manager::SessionManager;
pub use supervisor::McpSupervisor;
pub use supervisor::QualifiedTool;
pub use supervisor::SupervisorTimeouts;
