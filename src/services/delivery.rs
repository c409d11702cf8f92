//! Outbound message delivery.
//!
//! [`DeliveryClient`] is the seam between the dispatcher and the messaging
//! platform. Every failure is classified as permanent (the recipient will
//! never accept the message) or transient (worth retrying).

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{InputFile, ParseMode as TgParseMode};
use teloxide::{ApiError, RequestError};
use thiserror::Error;

use crate::database::models::{ParseMode, Payload, RecipientId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("permanent delivery failure [{class}]: {message}")]
    Permanent { class: String, message: String },
    #[error("transient delivery failure [{class}]: {message}")]
    Transient {
        class: String,
        message: String,
        retry_after: Option<Duration>,
    },
}

impl DeliveryError {
    pub fn permanent(class: impl Into<String>, message: impl Into<String>) -> Self {
        DeliveryError::Permanent {
            class: class.into(),
            message: message.into(),
        }
    }

    pub fn transient(class: impl Into<String>, message: impl Into<String>) -> Self {
        DeliveryError::Transient {
            class: class.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// A transient failure that names how long to wait before retrying.
    pub fn rate_limited(retry_after: Duration) -> Self {
        DeliveryError::Transient {
            class: "rate_limited".to_string(),
            message: format!("retry after {}s", retry_after.as_secs()),
            retry_after: Some(retry_after),
        }
    }

    pub fn class(&self) -> &str {
        match self {
            DeliveryError::Permanent { class, .. } | DeliveryError::Transient { class, .. } => class,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Permanent { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryError::Transient { retry_after, .. } => *retry_after,
            DeliveryError::Permanent { .. } => None,
        }
    }
}

#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn send(&self, recipient: RecipientId, payload: &Payload) -> Result<(), DeliveryError>;
}

/// Delivers payloads through the Telegram Bot API.
#[derive(Clone)]
pub struct TelegramDelivery {
    bot: Bot,
}

impl TelegramDelivery {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl DeliveryClient for TelegramDelivery {
    async fn send(&self, recipient: RecipientId, payload: &Payload) -> Result<(), DeliveryError> {
        let chat = ChatId(recipient);
        let parse_mode = payload.parse_mode.map(|mode| match mode {
            ParseMode::Html => TgParseMode::Html,
            ParseMode::MarkdownV2 => TgParseMode::MarkdownV2,
        });

        let photo = match (&payload.photo, &payload.photo_path) {
            (Some(file_id), _) => Some(InputFile::file_id(file_id.clone())),
            (None, Some(path)) => Some(InputFile::file(PathBuf::from(path))),
            (None, None) => None,
        };

        let result = match photo {
            Some(photo) => {
                let mut request = self.bot.send_photo(chat, photo);
                if let Some(caption) = &payload.text {
                    request = request.caption(caption.clone());
                }
                if let Some(mode) = parse_mode {
                    request = request.parse_mode(mode);
                }
                request.await.map(|_| ())
            }
            None => {
                let text = payload
                    .text
                    .clone()
                    .ok_or_else(|| DeliveryError::permanent("empty_payload", "payload has no text"))?;
                let mut request = self.bot.send_message(chat, text);
                if let Some(mode) = parse_mode {
                    request = request.parse_mode(mode);
                }
                request.await.map(|_| ())
            }
        };

        result.map_err(classify)
    }
}

const RATE_LIMIT_MARGIN: Duration = Duration::from_secs(1);

/// Maps a Bot API failure onto the permanent/transient split.
pub fn classify(error: RequestError) -> DeliveryError {
    match error {
        RequestError::Api(api) => {
            let class = match api {
                ApiError::BotBlocked => "bot_blocked",
                ApiError::ChatNotFound => "chat_not_found",
                ApiError::UserDeactivated => "user_deactivated",
                ApiError::BotKicked | ApiError::BotKickedFromSupergroup => "bot_kicked",
                ApiError::CantInitiateConversation => "cant_initiate_conversation",
                ApiError::CantTalkWithBots => "recipient_is_bot",
                _ => "api_error",
            };
            DeliveryError::permanent(class, api.to_string())
        }
        RequestError::MigrateToChatId(_) => {
            DeliveryError::permanent("invalid_target", "chat migrated to a supergroup")
        }
        // One second on top of the flood-wait hint, which is whole seconds.
        RequestError::RetryAfter(wait) => DeliveryError::rate_limited(wait + RATE_LIMIT_MARGIN),
        RequestError::Network(e) => DeliveryError::transient("network", e.to_string()),
        RequestError::Io(e) => DeliveryError::transient("io", e.to_string()),
        other => DeliveryError::transient("request_error", other.to_string()),
    }
}
