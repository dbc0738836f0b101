use serde::{Deserialize, Serialize};

/// Structured fragment of a finalized assistant response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePacket {
    Answer { content: String },
    Error { message: String },
    ToolResult { tool: String, output: String },
}

impl ResponsePacket {
    pub fn answer(content: impl Into<String>) -> Self {
        Self::Answer {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Text a history builder or title deriver should see for this packet.
    pub fn text(&self) -> &str {
        match self {
            Self::Answer { content } => content,
            Self::Error { message } => message,
            Self::ToolResult { output, .. } => output,
        }
    }
}

/// Joins the answer text of a packet list, skipping error and tool fragments.
pub fn answer_text(packets: &[ResponsePacket]) -> String {
    packets
        .iter()
        .filter_map(|packet| match packet {
            ResponsePacket::Answer { content } => Some(content.as_str()),
            ResponsePacket::Error { .. } | ResponsePacket::ToolResult { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
