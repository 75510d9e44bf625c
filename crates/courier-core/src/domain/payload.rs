//! JobPayload - タスク固有のデータ
//!
//! payload はタグ付きの variant です。`record_type` の識別子は payload と一緒に
//! シリアライズされ（カラムを持つエンジンでは専用カラムにも保存）、
//! デシリアライズはこの識別子で分岐します。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
pub enum JobPayload {
    MessageSend(MessageSendPayload),
    SessionReset(SessionResetPayload),
}

/// メッセージを 1 件送信する
///
/// `message_id` で呼び出し側が永続化したメッセージを参照するか、
/// `invisible_message` にインラインで持つ（会話に表示されないメッセージ、例: receipt）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSendPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invisible_message: Option<serde_json::Value>,

    /// Delete the referenced message once it has been sent.
    #[serde(default)]
    pub remove_message_after_sending: bool,
}

/// Reset the secure session with a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResetPayload {
    pub contact_thread_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("message send payload needs a message_id or an invisible_message")]
    MissingMessage,
}

impl JobPayload {
    /// Payload for a message the caller has already persisted.
    pub fn persisted_message(message_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        JobPayload::MessageSend(MessageSendPayload {
            message_id: Some(message_id.into()),
            thread_id: Some(thread_id.into()),
            invisible_message: None,
            remove_message_after_sending: false,
        })
    }

    /// Payload for a message carried inline.
    pub fn invisible_message(thread_id: impl Into<String>, message: serde_json::Value) -> Self {
        JobPayload::MessageSend(MessageSendPayload {
            message_id: None,
            thread_id: Some(thread_id.into()),
            invisible_message: Some(message),
            remove_message_after_sending: false,
        })
    }

    pub fn session_reset(contact_thread_id: impl Into<String>) -> Self {
        JobPayload::SessionReset(SessionResetPayload {
            contact_thread_id: contact_thread_id.into(),
        })
    }

    /// The discriminator persisted alongside the label.
    pub fn record_type(&self) -> &'static str {
        match self {
            JobPayload::MessageSend(_) => "message_send",
            JobPayload::SessionReset(_) => "session_reset",
        }
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        match self {
            JobPayload::MessageSend(p)
                if p.message_id.is_none() && p.invisible_message.is_none() =>
            {
                Err(PayloadError::MissingMessage)
            }
            _ => Ok(()),
        }
    }
}
