use anyhow::{anyhow, Result};

use crate::database::models::Payload;

/// Telegram's limit for a text message body.
pub const MAX_TEXT_CHARS: usize = 4096;
/// Telegram's limit for a media caption.
pub const MAX_CAPTION_CHARS: usize = 1024;

pub fn validate_payload(payload: &Payload) -> Result<()> {
    let text = payload.text.as_deref().map(str::trim).filter(|t| !t.is_empty());

    if payload.photo.is_some() && payload.photo_path.is_some() {
        return Err(anyhow!("Payload cannot carry both a photo file id and a photo path"));
    }

    if payload.has_media() {
        if let Some(caption) = text {
            if caption.chars().count() > MAX_CAPTION_CHARS {
                return Err(anyhow!(
                    "Caption cannot be longer than {} characters",
                    MAX_CAPTION_CHARS
                ));
            }
        }
        return Ok(());
    }

    let Some(text) = text else {
        return Err(anyhow!("Payload needs text or a photo"));
    };

    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(anyhow!(
            "Message text cannot be longer than {} characters",
            MAX_TEXT_CHARS
        ));
    }

    Ok(())
}

pub fn validate_recipient_id(chat_id: i64) -> Result<()> {
    if chat_id == 0 {
        return Err(anyhow!("Recipient ID cannot be zero"));
    }

    // Private chats are positive; group and supergroup ids are negative and
    // never go below this bound.
    if chat_id < -2000000000000 {
        return Err(anyhow!("Recipient ID out of valid range"));
    }

    Ok(())
}

/// Postgres channel names are plain identifiers of at most 63 bytes.
pub fn validate_channel_name(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(anyhow!("Notification channel cannot be empty"));
    }

    if channel.len() > 63 {
        return Err(anyhow!("Notification channel cannot be longer than 63 characters"));
    }

    if !channel.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(anyhow!(
            "Notification channel can only contain letters, numbers, and underscores"
        ));
    }

    if channel.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return Err(anyhow!("Notification channel must start with a letter or underscore"));
    }

    Ok(())
}
