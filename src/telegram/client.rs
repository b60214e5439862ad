use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio_util::io::ReaderStream;

use super::types::{ApiResponse, Message, RemoteFile, Update, User};
use super::TelegramError;
use crate::notifier::{LinkButton, MessageHandle, Notifier, NotifierError};
use crate::transfer::{ByteStream, ContentSource, TransferError};

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Headroom on top of the long-poll timeout before the request itself gives up.
const POLL_GRACE: Duration = Duration::from_secs(10);

/// Minimal Telegram Bot API client.
#[derive(Clone)]
pub struct BotApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl BotApi {
    pub fn new(base_url: &str, token: &str) -> Result<Self, TelegramError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.base_url, self.token, file_path)
    }

    async fn call<P, T>(&self, method: &str, params: &P, timeout: Duration) -> Result<T, TelegramError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.method_url(method))
            .timeout(timeout)
            .json(params)
            .send()
            .await?;

        // error statuses still carry the JSON envelope
        let body: ApiResponse<T> = response.json().await?;
        body.into_result()
    }

    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", &json!({}), REQUEST_TIMEOUT).await
    }

    /// Long-poll for new messages starting at `offset`.
    pub async fn get_updates(&self, offset: i64, timeout: Duration) -> Result<Vec<Update>, TelegramError> {
        let params = json!({
            "offset": offset,
            "timeout": timeout.as_secs(),
            "allowed_updates": ["message"],
        });
        self.call("getUpdates", &params, timeout + POLL_GRACE).await
    }

    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<Message, TelegramError> {
        let params = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        self.call("sendMessage", &params, REQUEST_TIMEOUT).await
    }

    pub async fn edit_message_text(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
        buttons: &[LinkButton],
    ) -> Result<(), TelegramError> {
        let mut params = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if !buttons.is_empty() {
            let rows: Vec<_> = buttons
                .iter()
                .map(|button| json!([{ "text": button.label, "url": button.url }]))
                .collect();
            params["reply_markup"] = json!({ "inline_keyboard": rows });
        }

        match self
            .call::<_, serde_json::Value>("editMessageText", &params, REQUEST_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            Err(TelegramError::Api { description, .. })
                if description.contains("message is not modified") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_file(&self, file_id: &str) -> Result<RemoteFile, TelegramError> {
        self.call("getFile", &json!({ "file_id": file_id }), REQUEST_TIMEOUT)
            .await
    }

    /// Stream a file previously resolved with [`BotApi::get_file`].
    pub async fn download(&self, file_path: &str) -> Result<ByteStream, TransferError> {
        // a local Bot API server hands out paths on its own disk
        if Path::new(file_path).is_absolute() {
            let file = tokio::fs::File::open(file_path).await?;
            return Ok(ReaderStream::new(file)
                .map(|chunk| chunk.map_err(TransferError::Io))
                .boxed());
        }

        let response = self
            .http
            .get(self.file_url(file_path))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TransferError::Source(e.without_url().to_string()))?;

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransferError::Source(e.without_url().to_string())))
            .boxed())
    }
}

#[async_trait]
impl Notifier for BotApi {
    async fn send(&self, chat_id: &str, text: &str) -> Result<MessageHandle, NotifierError> {
        let message = self.send_message(chat_id, text).await?;
        Ok(MessageHandle {
            chat_id: message.chat.id.to_string(),
            message_id: message.message_id.to_string(),
        })
    }

    async fn edit(
        &self,
        message: &MessageHandle,
        text: &str,
        buttons: &[LinkButton],
    ) -> Result<(), NotifierError> {
        let message_id = message
            .message_id
            .parse()
            .map_err(|_| NotifierError::Api(format!("Invalid message id {}", message.message_id)))?;
        self.edit_message_text(&message.chat_id, message_id, text, buttons)
            .await?;
        Ok(())
    }
}

/// A Telegram attachment as a relay content source.
pub struct TelegramDownload {
    api: BotApi,
    file_id: String,
}

impl TelegramDownload {
    pub fn new(api: BotApi, file_id: impl Into<String>) -> Self {
        Self {
            api,
            file_id: file_id.into(),
        }
    }
}

#[async_trait]
impl ContentSource for TelegramDownload {
    async fn open(&self) -> Result<ByteStream, TransferError> {
        let file = self
            .api
            .get_file(&self.file_id)
            .await
            .map_err(|e| TransferError::Source(e.to_string()))?;
        let path = file
            .file_path
            .ok_or_else(|| TransferError::Source("Telegram returned no file path".to_string()))?;
        self.api.download(&path).await
    }
}
