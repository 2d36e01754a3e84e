use serde::{Deserialize, Serialize};

/// The role of the participant that authored a [`Message`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A human end-user.
    User,
    /// The AI assistant.
    Assistant,
    /// A system-level instruction or prompt.
    System,
}

impl Role {
    /// Lowercase wire name shared by every supported backend.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Where an image block's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    /// A remote image fetched by the backend.
    Url {
        /// Absolute URL of the image.
        url: String,
    },
    /// Inline base64-encoded bytes.
    Base64 {
        /// MIME type, e.g. `image/png`.
        media_type: String,
        /// Base64 payload.
        data: String,
    },
}

/// A typed piece of message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// An image.
    Image {
        /// Image location or bytes.
        source: ImageSource,
    },
}

/// Message content: plain text or an ordered sequence of blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    /// Plain text content.
    Text(String),
    /// Ordered typed blocks.
    Blocks(Vec<ContentBlock>),
}

impl Content {
    /// Text view of the content; image blocks are skipped and text blocks
    /// are joined with newlines.
    pub fn text(&self) -> String {
        match self {
            Content::Text(t) => t.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Number of characters of text content, used for token estimates.
    pub fn char_count(&self) -> usize {
        match self {
            Content::Text(t) => t.chars().count(),
            Content::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.chars().count(),
                    ContentBlock::Image { .. } => 0,
                })
                .sum(),
        }
    }

    /// Whether any block is an image.
    pub fn has_images(&self) -> bool {
        matches!(self, Content::Blocks(blocks) if blocks.iter().any(|b| matches!(b, ContentBlock::Image { .. })))
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

/// A single message of a conversation.
///
/// Messages are values: nothing in the gateway mutates a message after it has
/// been built, which is why the fields are read through accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    content: Content,
}

impl Message {
    /// Creates a new message with the given role and content.
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Creates a new message with [`Role::User`].
    pub fn user(content: impl Into<Content>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates a new message with [`Role::Assistant`].
    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates a new message with [`Role::System`].
    pub fn system(content: impl Into<Content>) -> Self {
        Self::new(Role::System, content)
    }

    /// The role of the message author.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The message content.
    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Text view of the content.
    pub fn text(&self) -> String {
        self.content.text()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role(), Role::User);
        assert_eq!(msg.text(), "Hello");
    }

    #[test]
    fn test_block_content_text_skips_images() {
        let msg = Message::user(Content::Blocks(vec![
            ContentBlock::Text {
                text: "describe".into(),
            },
            ContentBlock::Image {
                source: ImageSource::Url {
                    url: "https://example.com/cat.png".into(),
                },
            },
            ContentBlock::Text {
                text: "this".into(),
            },
        ]));
        assert_eq!(msg.text(), "describe\nthis");
        assert_eq!(msg.content().char_count(), 12);
        assert!(msg.content().has_images());
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::system("be brief");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "system");
        assert_eq!(json["content"], "be brief");
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }
}
