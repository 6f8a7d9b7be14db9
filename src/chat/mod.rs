//! Streaming text chat.
//!
//! [`ChatService`] keeps one [`ChatSession`] per conversation, enforces the
//! upload quota before a message is recorded, and streams the reply into
//! the history as it arrives.

pub mod client;
pub mod conversation;

pub use client::{ChatSession, Content, GeminiChatClient, Part};
pub use conversation::{ChatHistory, Conversation, Message, Role};

use std::collections::HashMap;

use crate::error::{VoiceError, VoiceResult};
use crate::i18n::Language;
use crate::profile::Account;

/// What happened to a message handed to [`ChatService::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing to send.
    Empty,
    /// The full reply.
    Replied(String),
    /// The request failed; the reply was replaced with the localized error.
    Failed,
}

pub struct ChatService {
    client: GeminiChatClient,
    language: Language,
    history: ChatHistory,
    sessions: HashMap<String, ChatSession>,
}

impl ChatService {
    pub fn new(client: GeminiChatClient, language: Language) -> Self {
        Self {
            client,
            language,
            history: ChatHistory::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// Affects conversations opened after the change.
    pub fn set_language(&mut self, language: Language) {
        self.language = language;
    }

    /// Open and activate a new conversation. Returns its id.
    pub fn new_conversation(&mut self) -> String {
        let strings = self.language.translations();
        let id = self.history.new_conversation(strings).id.clone();
        let session = self
            .client
            .start_chat(strings.system_instruction(self.language));
        self.sessions.insert(id.clone(), session);
        tracing::debug!(conversation = %id, "Conversation opened");
        id
    }

    pub fn select(&mut self, id: &str) -> bool {
        self.history.select(id)
    }

    /// Send a message with optional attachment names.
    ///
    /// Attachments are charged against `account`'s quota first; a refusal
    /// returns [`VoiceError::UploadLimitReached`] and records nothing.
    /// Other failures are reported through [`SendOutcome::Failed`].
    pub async fn send_message(
        &mut self,
        account: &mut Account,
        text: &str,
        attachments: &[String],
        mut on_fragment: impl FnMut(&str),
    ) -> VoiceResult<SendOutcome> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Ok(SendOutcome::Empty);
        }
        if self.history.active().is_none() {
            self.new_conversation();
        }
        let Some(id) = self.history.active_id().map(str::to_string) else {
            return Ok(SendOutcome::Empty);
        };

        let files = u32::try_from(attachments.len()).unwrap_or(u32::MAX);
        account.authorize_uploads(files)?;

        let strings = self.language.translations();
        self.history.push_user_message(text, attachments, strings);

        let Some(session) = self.sessions.get_mut(&id) else {
            self.history.fail_reply(strings.error_sending_message);
            return Ok(SendOutcome::Failed);
        };

        self.history.begin_reply();
        let history = &mut self.history;
        let result = session
            .send_message_stream(text, |fragment| {
                history.append_reply(fragment);
                on_fragment(fragment);
            })
            .await;

        match result {
            Ok(reply) => Ok(SendOutcome::Replied(reply)),
            Err(e) => {
                tracing::error!(conversation = %id, error = %e, "Error sending message");
                self.history.fail_reply(strings.error_sending_message);
                Ok(SendOutcome::Failed)
            }
        }
    }
}

/// Localized notice for an error surfaced by the chat flow.
pub fn user_notice(error: &VoiceError, language: Language) -> &'static str {
    let strings = language.translations();
    match error {
        VoiceError::UploadLimitReached { .. } => strings.upload_limit_reached,
        _ => strings.error_sending_message,
    }
}
