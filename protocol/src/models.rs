use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One entry of a conversation. `content` is either a bare string (the common
/// case for text-only clients) or an ordered list of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Flattens the textual portion of the message, ignoring non-text blocks.
    pub fn text_content(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Typed content blocks. Images arrive either as a URL or as inline base64
/// (`data:` URLs are carried verbatim in `image_url`); files are inline
/// base64 or an opaque reference the upstream provider understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        image_url: String,
    },
    File {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    ToolUse {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn string_content_round_trips() {
        let msg: Message = serde_json::from_str(r#"{"role":"user","content":"hi"}"#)
            .expect("deserialize message");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text_content(), "hi");
    }

    #[test]
    fn block_content_round_trips() {
        let json = r#"{
            "role": "user",
            "content": [
                {"type": "text", "text": "look at "},
                {"type": "image", "image_url": "data:image/png;base64,AAAA"},
                {"type": "text", "text": "this"}
            ]
        }"#;
        let msg: Message = serde_json::from_str(json).expect("deserialize message");
        assert_eq!(msg.text_content(), "look at this");
        let MessageContent::Blocks(blocks) = &msg.content else {
            panic!("expected block content");
        };
        assert_eq!(blocks.len(), 3);
    }
}
