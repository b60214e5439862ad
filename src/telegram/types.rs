//! The subset of Bot API objects the relay reads.

use std::time::Duration;

use serde::Deserialize;

use super::TelegramError;

/// Envelope around every Bot API result.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseParameters {
    pub retry_after: Option<u64>,
}

impl<T> ApiResponse<T> {
    pub fn into_result(self) -> Result<T, TelegramError> {
        if self.ok {
            return self.result.ok_or_else(|| TelegramError::Api {
                code: 0,
                description: "Response carried no result".to_string(),
            });
        }
        if let Some(retry_after) = self.parameters.and_then(|p| p.retry_after) {
            return Err(TelegramError::RateLimited {
                retry_after: Duration::from_secs(retry_after),
            });
        }
        Err(TelegramError::Api {
            code: self.error_code.unwrap_or_default(),
            description: self
                .description
                .unwrap_or_else(|| "Unknown error".to_string()),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
    pub document: Option<FileMeta>,
    pub video: Option<FileMeta>,
    pub audio: Option<FileMeta>,
}

impl Message {
    /// The relayable file attached to this message, if any.
    pub fn attachment(&self) -> Option<&FileMeta> {
        self.document
            .as_ref()
            .or(self.video.as_ref())
            .or(self.audio.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
}

/// Document, video, or audio metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct FileMeta {
    pub file_id: String,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
}

/// Result of `getFile`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFile {
    pub file_id: String,
    pub file_size: Option<u64>,
    /// Relative download path, or an absolute local path when talking to a
    /// self-hosted Bot API server in `--local` mode.
    pub file_path: Option<String>,
}
