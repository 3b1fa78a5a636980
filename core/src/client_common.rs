use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use relay_protocol::Message;
use relay_protocol::StreamEvent;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::supervisor::QualifiedTool;

/// Memory-mode duality: with `Server` memory the session owns the history
/// and the request carries only the newest user message; with `Client`
/// memory the request carries the full trusted history each turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryMode {
    Server,
    #[default]
    Client,
}

/// Recognized sampling knobs. Everything is provider-clamped downstream;
/// `budget_tokens` is only meaningful while thinking is enabled and is
/// ignored otherwise.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub enable_thinking: bool,
    pub budget_tokens: Option<u32>,
    /// Images beyond the most recent N are elided from history before each
    /// upstream call; 0 strips all images from prior turns.
    pub only_n_most_recent_images: Option<usize>,
    pub memory_mode: MemoryMode,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: None,
            enable_thinking: false,
            budget_tokens: None,
            only_n_most_recent_images: None,
            memory_mode: MemoryMode::Client,
        }
    }
}

/// API request payload for a single model turn.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub system_prompt: Option<String>,
    /// Conversation context, oldest first.
    pub input: Vec<Message>,
    /// Tools available to the model, already qualified with their server id.
    pub tools: Vec<QualifiedTool>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub enable_thinking: bool,
    pub budget_tokens: Option<u32>,
}

/// Why the provider stopped emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Natural end of the assistant turn (includes token-limit stops).
    EndTurn,
    /// The model wants tool results before continuing.
    ToolUse,
}

/// Internal event alphabet produced by the provider adapters. The agent
/// session translates these into the canonical client-facing events, so the
/// rest of the pipeline stays agnostic of the upstream wire format.
#[derive(Debug)]
pub enum ModelEvent {
    TextDelta(String),
    ThinkingDelta(String),
    /// A tool call opened; `name` is the fully-qualified tool name.
    ToolCallBegin { call_id: String, name: String },
    /// Streamed fragment of the call's JSON arguments.
    ToolInputDelta(String),
    /// The call's arguments are complete.
    ToolCallEnd {
        call_id: String,
        name: String,
        arguments: String,
    },
    Completed { stop_reason: StopReason },
}

/// Stream of adapter events backed by the decode task's channel.
#[derive(Debug)]
pub struct ModelStream {
    pub(crate) rx_event: mpsc::Receiver<Result<ModelEvent>>,
}

impl Stream for ModelStream {
    type Item = Result<ModelEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_event.poll_recv(cx)
    }
}

/// Stream of canonical events handed to the HTTP surface.
pub struct EventStream {
    pub(crate) rx_event: mpsc::Receiver<StreamEvent>,
}

impl EventStream {
    pub fn new(rx_event: mpsc::Receiver<StreamEvent>) -> Self {
        Self { rx_event }
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_event.poll_recv(cx)
    }
}
