use serde::{Deserialize, Serialize};

use super::ResourceContents;

/// A content block inside tool results, prompt messages and sampling
/// messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Content {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        /// Base64-encoded image payload.
        data: String,
        mime_type: String,
    },
    Resource {
        resource: ResourceContents,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Content::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn resource(resource: ResourceContents) -> Self {
        Content::Resource { resource }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_text_content_wire_format() {
        let content = Content::text("hello");
        assert_eq!(
            serde_json::to_value(&content).unwrap(),
            json!({"type": "text", "text": "hello"})
        );
    }

    #[test]
    fn test_image_content_wire_format() {
        let content = Content::image("aGk=", "image/png");
        assert_eq!(
            serde_json::to_value(&content).unwrap(),
            json!({"type": "image", "data": "aGk=", "mimeType": "image/png"})
        );
    }
}
