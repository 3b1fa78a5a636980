use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// Connect-level retries against the model provider before giving up.
    pub RELAY_REQUEST_MAX_RETRIES: u64 = 4;

    /// A provider stream that stays completely silent for this long is
    /// treated as disconnected.
    pub RELAY_STREAM_IDLE_TIMEOUT_MS: Duration = Duration::from_millis(300_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Budget for spawn + initialize + first tools/list of an MCP server.
    pub RELAY_MCP_HANDSHAKE_TIMEOUT_MS: Duration = Duration::from_millis(30_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Wall-clock deadline for a single tool call.
    pub RELAY_MCP_TOOL_TIMEOUT_MS: Duration = Duration::from_millis(60_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Grace period between "close stdin" and force-kill on shutdown.
    pub RELAY_MCP_DRAIN_WINDOW_MS: Duration = Duration::from_millis(3_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Sessions idle longer than this are evicted by the sweeper.
    pub RELAY_SESSION_IDLE_TIMEOUT_MS: Duration = Duration::from_millis(30 * 60 * 1_000), |value| {
        value.parse().map(Duration::from_millis)
    };
}
