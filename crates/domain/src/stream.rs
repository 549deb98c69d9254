use serde::Serialize;
use std::pin::Pin;

use crate::tool::ToolCall;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted while streaming a chat completion (provider-agnostic).
///
/// Provider adapters assemble partial tool-call chunks internally and only
/// surface fully-formed [`ToolCall`]s, so consumers never see wire-level
/// argument fragments.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatChunk {
    /// A chunk of assistant text.
    TextDelta { text: String },

    /// A chunk of reasoning/thinking content, where the model exposes it.
    Reasoning { text: String },

    /// A fully-assembled tool call.
    ToolCall(ToolCall),

    /// The stream finished.
    Completed {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },

    /// The provider reported an error mid-stream.
    Error { message: String },
}

/// Token usage for a completion.
#[derive(Debug, Clone, Copy, Default, Serialize, serde::Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}
