//! Request payload assembly: system instruction plus history.

use serde::Serialize;

use crate::chatbot::conversation::{MediaHandle, MediaRef, Role, Turn};
use crate::chatbot::language::{detect_language, LanguageDetector};

/// Persona used when the config doesn't override it.
pub const DEFAULT_PERSONA: &str = "You are a helpful Telegram bot. \
You have access to Google Search to find real-time information. \
If asked for current events, news, or specific data, USE SEARCH to find it. \
When analyzing images, describe them in detail if asked. \
Only state facts about chat members that appear in the member list you are given; \
never invent members, names, or online status.";

/// Part of a content block, in Gemini wire form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    File {
        #[serde(rename = "fileData")]
        file_data: FileData,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(rename = "fileUri")]
    pub file_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn media(media: &MediaRef) -> Self {
        match &media.handle {
            MediaHandle::Uri(uri) => Part::File {
                file_data: FileData {
                    mime_type: media.mime_type.clone(),
                    file_uri: uri.clone(),
                },
            },
            MediaHandle::Inline(data) => Part::Inline {
                inline_data: InlineData {
                    mime_type: media.mime_type.clone(),
                    data: data.clone(),
                },
            },
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Part::Text { .. })
    }
}

/// One role-tagged content block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

/// Everything a backend needs for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    /// System turn: persona, language directive, and roster facts.
    pub system: String,
    pub contents: Vec<Content>,
}

/// Which structural form the history takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// Every turn carries its media parts followed by its text.
    Full,
    /// History is plain text; only the final user turn carries media.
    Vision,
}

/// Builds payloads from a persona and a language heuristic.
#[derive(Clone)]
pub struct PromptBuilder {
    persona: String,
    detector: LanguageDetector,
}

impl PromptBuilder {
    pub fn new(persona: Option<String>) -> Self {
        Self {
            persona: persona.unwrap_or_else(|| DEFAULT_PERSONA.to_string()),
            detector: detect_language,
        }
    }

    pub fn with_detector(mut self, detector: LanguageDetector) -> Self {
        self.detector = detector;
        self
    }

    /// System instruction for a trigger text and the live roster facts.
    ///
    /// Facts go in verbatim; nothing is added beyond what the caller supplied.
    pub fn system_instruction(&self, trigger_text: &str, facts: &str) -> String {
        let language = (self.detector)(trigger_text);
        format!(
            "{}\n\n{}\n\nChat members right now:\n{}",
            self.persona,
            language.directive(),
            facts
        )
    }

    /// Assemble the payload for a conversation whose last turn is the new
    /// user turn.
    pub fn build(&self, turns: &[Turn], facts: &str, shape: PayloadShape) -> Payload {
        let trigger_text = turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .and_then(|t| t.text())
            .unwrap_or("");

        let system = self.system_instruction(trigger_text, facts);

        let last = turns.len().saturating_sub(1);
        let contents = turns
            .iter()
            .enumerate()
            .filter(|(_, t)| t.role != Role::System)
            .filter_map(|(i, turn)| match shape {
                PayloadShape::Full => full_content(turn),
                PayloadShape::Vision if i == last => vision_content(turn),
                PayloadShape::Vision => text_only_content(turn),
            })
            .collect();

        Payload { system, contents }
    }
}

/// Media parts first, then text. `None` for an empty turn.
fn full_content(turn: &Turn) -> Option<Content> {
    let mut parts: Vec<Part> = turn.media.iter().map(Part::media).collect();
    if let Some(text) = turn.text() {
        parts.push(Part::text(text));
    }
    wrap(turn.role, parts)
}

fn text_only_content(turn: &Turn) -> Option<Content> {
    let parts = turn.text().map(|t| vec![Part::text(t)]).unwrap_or_default();
    wrap(turn.role, parts)
}

/// A single image becomes an `[image, text]` pair; anything else falls back
/// to the full mapping.
fn vision_content(turn: &Turn) -> Option<Content> {
    if turn.image_count() != 1 {
        return full_content(turn);
    }
    let image = turn.media.iter().find(|m| m.is_image())?;
    let mut parts = vec![Part::media(image)];
    if let Some(text) = turn.text() {
        parts.push(Part::text(text));
    }
    wrap(turn.role, parts)
}

fn wrap(role: Role, parts: Vec<Part>) -> Option<Content> {
    if parts.is_empty() {
        return None;
    }
    Some(Content {
        role: role.as_str().to_string(),
        parts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatbot::language::Language;

    fn image(uri: &str) -> MediaRef {
        MediaRef {
            handle: MediaHandle::Uri(uri.to_string()),
            mime_type: "image/png".to_string(),
        }
    }

    fn pdf(uri: &str) -> MediaRef {
        MediaRef {
            handle: MediaHandle::Uri(uri.to_string()),
            mime_type: "application/pdf".to_string(),
        }
    }

    #[test]
    fn test_system_instruction_is_deterministic() {
        let builder = PromptBuilder::new(None);
        let a = builder.system_instruction("Alice: hi", "Online: Alice");
        let b = builder.system_instruction("Alice: hi", "Online: Alice");
        assert_eq!(a, b);
        assert!(a.starts_with(DEFAULT_PERSONA));
        assert!(a.contains("Reply in English."));
        assert!(a.ends_with("Online: Alice"));
    }

    #[test]
    fn test_language_follows_trigger() {
        let builder = PromptBuilder::new(Some("Persona.".to_string()));
        let turns = vec![
            Turn::user("Alice: hello", vec![]),
            Turn::model("Hi!"),
            Turn::user("Борис: привет", vec![]),
        ];
        let payload = builder.build(&turns, "", PayloadShape::Full);
        assert!(payload.system.contains(Language::Russian.directive()));
        assert!(payload.system.starts_with("Persona."));
    }

    #[test]
    fn test_custom_detector() {
        fn always_russian(_: &str) -> Language {
            Language::Russian
        }
        let builder = PromptBuilder::new(None).with_detector(always_russian);
        assert!(builder
            .system_instruction("plain ascii", "")
            .contains(Language::Russian.directive()));
    }

    #[test]
    fn test_media_before_text() {
        let builder = PromptBuilder::new(None);
        let turns = vec![Turn::user("Alice: look", vec![image("u1"), pdf("u2")])];
        let payload = builder.build(&turns, "", PayloadShape::Full);

        let parts = &payload.contents[0].parts;
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], Part::media(&image("u1")));
        assert_eq!(parts[1], Part::media(&pdf("u2")));
        assert_eq!(parts[2], Part::text("Alice: look"));
        assert_eq!(payload.contents[0].role, "user");
    }

    #[test]
    fn test_empty_turns_are_omitted() {
        let builder = PromptBuilder::new(None);
        let turns = vec![
            Turn {
                role: Role::User,
                text: None,
                media: vec![],
            },
            Turn::model("ok"),
            Turn::user("Alice: next", vec![]),
        ];
        let payload = builder.build(&turns, "", PayloadShape::Full);
        assert_eq!(payload.contents.len(), 2);
        assert_eq!(payload.contents[0].role, "model");
    }

    #[test]
    fn test_vision_restructures_only_final_turn() {
        let builder = PromptBuilder::new(None);
        let turns = vec![
            Turn::user("Alice: earlier", vec![pdf("old")]),
            Turn::model("noted"),
            Turn::user("Alice: what is this?", vec![image("new")]),
        ];
        let payload = builder.build(&turns, "", PayloadShape::Vision);

        // Earlier history is plain text, media dropped
        assert_eq!(payload.contents[0].parts, vec![Part::text("Alice: earlier")]);
        assert_eq!(payload.contents[1].parts, vec![Part::text("noted")]);
        // Final turn is [image, text]
        assert_eq!(
            payload.contents[2].parts,
            vec![Part::media(&image("new")), Part::text("Alice: what is this?")]
        );
    }

    #[test]
    fn test_vision_single_image_ignores_other_media() {
        let builder = PromptBuilder::new(None);
        let turns = vec![Turn::user("Alice: hm", vec![pdf("doc"), image("img")])];
        let payload = builder.build(&turns, "", PayloadShape::Vision);
        assert_eq!(
            payload.contents[0].parts,
            vec![Part::media(&image("img")), Part::text("Alice: hm")]
        );
    }

    #[test]
    fn test_vision_multiple_images_keeps_all() {
        let builder = PromptBuilder::new(None);
        let turns = vec![Turn::user("Alice: compare", vec![image("a"), image("b")])];
        let payload = builder.build(&turns, "", PayloadShape::Vision);
        assert_eq!(payload.contents[0].parts.len(), 3);
        assert!(payload.contents[0].parts[2].is_text());
    }

    #[test]
    fn test_parts_serialize_to_gemini_shape() {
        let file = serde_json::to_value(Part::media(&image("files/abc"))).unwrap();
        assert_eq!(
            file,
            serde_json::json!({"fileData": {"mimeType": "image/png", "fileUri": "files/abc"}})
        );

        let inline = MediaRef {
            handle: MediaHandle::Inline("AAAA".to_string()),
            mime_type: "image/jpeg".to_string(),
        };
        let value = serde_json::to_value(Part::media(&inline)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"inlineData": {"mimeType": "image/jpeg", "data": "AAAA"}})
        );

        let text = serde_json::to_value(Part::text("hi")).unwrap();
        assert_eq!(text, serde_json::json!({"text": "hi"}));
    }
}
