//! Chat history bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::i18n::Translations;

/// Titles longer than this are shortened.
const TITLE_MAX_CHARS: usize = 30;
/// Characters kept before the ellipsis when shortening.
const TITLE_KEEP_CHARS: usize = 27;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: String,
}

impl Message {
    pub fn user(parts: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: parts.into(),
        }
    }

    pub fn model(parts: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: parts.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Only the welcome message so far.
    pub fn is_fresh(&self) -> bool {
        self.messages.len() == 1
    }
}

/// Title derived from the first user message.
pub fn conversation_title(text: &str) -> String {
    if text.chars().count() > TITLE_MAX_CHARS {
        let kept: String = text.chars().take(TITLE_KEEP_CHARS).collect();
        format!("{kept}...")
    } else {
        text.to_string()
    }
}

/// User message body with attachment names appended.
pub fn compose_user_message(text: &str, attachments: &[String], strings: &Translations) -> String {
    if attachments.is_empty() {
        text.to_string()
    } else {
        format!(
            "{text}\n\n[{}: {}]",
            strings.attached_files,
            attachments.join(", ")
        )
    }
}

/// All conversations, newest first, plus the active selection.
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    conversations: Vec<Conversation>,
    active: Option<String>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a conversation greeted by the welcome message and make it active.
    pub fn new_conversation(&mut self, strings: &Translations) -> &Conversation {
        let id = uuid::Uuid::new_v4().to_string();
        self.conversations.insert(
            0,
            Conversation {
                id: id.clone(),
                title: strings.new_chat.to_string(),
                messages: vec![Message::model(strings.welcome_message)],
                created_at: Utc::now(),
            },
        );
        self.active = Some(id);
        &self.conversations[0]
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active(&self) -> Option<&Conversation> {
        let id = self.active.as_deref()?;
        self.conversations.iter().find(|c| c.id == id)
    }

    fn active_mut(&mut self) -> Option<&mut Conversation> {
        let id = self.active.as_deref()?;
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    /// Switch to `id`. Returns false for unknown ids.
    pub fn select(&mut self, id: &str) -> bool {
        if self.conversations.iter().any(|c| c.id == id) {
            self.active = Some(id.to_string());
            true
        } else {
            false
        }
    }

    /// Append the user's message to the active conversation, retitling a
    /// fresh conversation after `text`.
    pub fn push_user_message(&mut self, text: &str, attachments: &[String], strings: &Translations) {
        let message = Message::user(compose_user_message(text, attachments, strings));
        if let Some(conversation) = self.active_mut() {
            if conversation.is_fresh() {
                conversation.title = conversation_title(text);
            }
            conversation.messages.push(message);
        }
    }

    /// Open an empty model message for streaming into.
    pub fn begin_reply(&mut self) {
        if let Some(conversation) = self.active_mut() {
            conversation.messages.push(Message::model(String::new()));
        }
    }

    /// Extend the in-progress model message.
    pub fn append_reply(&mut self, fragment: &str) {
        if let Some(message) = self
            .active_mut()
            .and_then(|c| c.messages.last_mut())
            .filter(|m| m.role == Role::Model)
        {
            message.parts.push_str(fragment);
        }
    }

    /// Replace the in-progress reply with `text`, or add one if the request
    /// failed before the reply opened.
    pub fn fail_reply(&mut self, text: &str) {
        if let Some(conversation) = self.active_mut() {
            match conversation.messages.last_mut() {
                Some(last) if last.role == Role::Model => last.parts = text.to_string(),
                _ => conversation.messages.push(Message::model(text)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i18n::Language;

    fn strings() -> &'static Translations {
        Language::En.translations()
    }

    #[test]
    fn title_is_shortened_past_thirty_chars() {
        assert_eq!(conversation_title("Run diagnostics"), "Run diagnostics");
        let exact = "a".repeat(30);
        assert_eq!(conversation_title(&exact), exact);
        let long = "Summarise the quarterly report for Stark Industries";
        assert_eq!(conversation_title(long), "Summarise the quarterly rep...");
        assert_eq!(conversation_title(long).chars().count(), 30);
    }

    #[test]
    fn title_counts_characters_not_bytes() {
        let text = "é".repeat(31);
        assert_eq!(conversation_title(&text), format!("{}...", "é".repeat(27)));
    }

    #[test]
    fn attachments_are_listed() {
        let body = compose_user_message(
            "see these",
            &["a.pdf".to_string(), "b.png".to_string()],
            strings(),
        );
        assert_eq!(body, "see these\n\n[Attached Files: a.pdf, b.png]");
    }

    #[test]
    fn new_conversation_greets_and_activates() {
        let mut history = ChatHistory::new();
        let first = history.new_conversation(strings()).id.clone();
        let second = history.new_conversation(strings()).id.clone();
        assert_eq!(history.conversations()[0].id, second);
        assert_eq!(history.active_id(), Some(second.as_str()));

        let active = history.active().unwrap();
        assert_eq!(active.title, strings().new_chat);
        assert_eq!(active.messages, vec![Message::model(strings().welcome_message)]);
        assert!(history.select(&first));
        assert!(!history.select("missing"));
    }

    #[test]
    fn first_message_retitles_only_once() {
        let mut history = ChatHistory::new();
        history.new_conversation(strings());
        history.push_user_message("Hello JARVIS", &[], strings());
        history.begin_reply();
        history.append_reply("Hello, ");
        history.append_reply("sir.");
        history.push_user_message("Second question", &[], strings());

        let active = history.active().unwrap();
        assert_eq!(active.title, "Hello JARVIS");
        assert_eq!(active.messages[2], Message::model("Hello, sir."));
        assert_eq!(active.messages.len(), 4);
    }

    #[test]
    fn failure_replaces_partial_reply() {
        let mut history = ChatHistory::new();
        history.new_conversation(strings());
        history.push_user_message("hi", &[], strings());
        history.begin_reply();
        history.append_reply("partial");
        history.fail_reply(strings().error_sending_message);
        let messages = &history.active().unwrap().messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].parts, strings().error_sending_message);
    }

    #[test]
    fn failure_before_reply_adds_message() {
        let mut history = ChatHistory::new();
        history.new_conversation(strings());
        history.push_user_message("hi", &[], strings());
        history.fail_reply("offline");
        let messages = &history.active().unwrap().messages;
        assert_eq!(messages.last(), Some(&Message::model("offline")));
    }
}
