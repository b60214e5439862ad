use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::client::{BotApi, TelegramDownload};
use super::types::{FileMeta, Message};
use super::TelegramError;
use crate::format::human_size;
use crate::notifier::code_span;
use crate::transfer::{CancelOutcome, JobSnapshot, OwnerId, Rejection, Relay, UploadRequest};

pub const POLL_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Cancel,
    Status,
}

impl Command {
    /// Parse `/name` or `/name@botname` at the start of a message.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?;
        let name = word.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name);
        match name.to_ascii_lowercase().as_str() {
            "start" => Some(Command::Start),
            "help" => Some(Command::Help),
            "cancel" => Some(Command::Cancel),
            "status" => Some(Command::Status),
            _ => None,
        }
    }
}

fn help_text(max_file_size: u64) -> String {
    format!(
        "🚀 *High-Speed Upload Bot*\n\n\
         Send me any file (up to {max}) and I'll upload it to cloud storage \
         and generate streaming links for VLC/MX Player.\n\n\
         *Features:*\n\
         • High-speed uploads via multipart\n\
         • Direct streaming links\n\
         • Progress tracking\n\n\
         *Commands:*\n\
         /start - Show this message\n\
         /cancel - Cancel current upload\n\
         /status - Check upload status",
        max = human_size(max_file_size as f64),
    )
}

fn rejection_text(rejection: &Rejection) -> String {
    match rejection {
        Rejection::TooLarge { max, .. } => {
            format!("❌ File size exceeds {} limit.", human_size(*max as f64))
        }
        Rejection::AlreadyActive => {
            "⏳ You already have an upload in progress. Use /cancel to stop it first.".to_string()
        }
    }
}

fn status_text(snapshot: &JobSnapshot) -> String {
    let progress = &snapshot.progress;
    format!(
        "*Upload Status:*\n\
         File: {name}\n\
         Phase: `{phase}`\n\
         Progress: `{percent:.1}%`\n\
         Speed: `{speed}/s`\n\
         Elapsed: `{elapsed:.1}s`",
        name = code_span(&snapshot.file_name),
        phase = snapshot.phase.label(),
        percent = progress.percent,
        speed = human_size(progress.rate),
        elapsed = progress.elapsed_seconds,
    )
}

/// Long-polls the Bot API and turns messages into relay calls.
pub struct Bot {
    api: BotApi,
    relay: Arc<Relay>,
    poll_timeout: Duration,
}

impl Bot {
    pub fn new(api: BotApi, relay: Arc<Relay>) -> Self {
        Self {
            api,
            relay,
            poll_timeout: POLL_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Poll until `shutdown` fires. Fails only if the bot cannot identify
    /// itself at startup, which usually means a bad token.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), TelegramError> {
        let me = self.api.get_me().await?;
        tracing::info!(
            username = me.username.as_deref().unwrap_or("unknown"),
            "Bot started"
        );

        let mut offset = 0;
        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.api.get_updates(offset, self.poll_timeout) => polled,
            };

            let updates = match polled {
                Ok(updates) => updates,
                Err(e) => {
                    let delay = match &e {
                        TelegramError::RateLimited { retry_after } => *retry_after,
                        _ => RETRY_DELAY,
                    };
                    tracing::warn!(
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "Polling for updates failed"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                if let Some(message) = update.message {
                    self.handle(message).await;
                }
            }
        }

        tracing::info!("Bot stopped");
        Ok(())
    }

    pub async fn handle(&self, message: Message) {
        let Some(user) = message.from.as_ref() else {
            return;
        };
        let owner_id = OwnerId::from(user.id);
        let chat_id = message.chat.id.to_string();

        if let Some(file) = message.attachment() {
            self.handle_file(owner_id, &chat_id, file).await;
            return;
        }

        let Some(command) = message.text.as_deref().and_then(Command::parse) else {
            return;
        };
        tracing::debug!(owner_id = %owner_id, command = ?command, "Received command");

        let reply = match command {
            Command::Start | Command::Help => help_text(self.relay.settings().max_file_size),
            Command::Cancel => match self.relay.cancel(&owner_id) {
                CancelOutcome::Signalled => "🛑 Cancelling your upload...".to_string(),
                CancelOutcome::NotFound => "❌ No active upload to cancel.".to_string(),
            },
            Command::Status => match self.relay.status(&owner_id) {
                Some(snapshot) => status_text(&snapshot),
                None => "No active uploads.".to_string(),
            },
        };
        self.reply(&chat_id, &reply).await;
    }

    async fn handle_file(&self, owner_id: OwnerId, chat_id: &str, file: &FileMeta) {
        let request = UploadRequest {
            owner_id: owner_id.clone(),
            chat_id: chat_id.to_string(),
            file_name: file.file_name.clone(),
            size: file.file_size.unwrap_or(0),
            source: Box::new(TelegramDownload::new(self.api.clone(), file.file_id.clone())),
        };

        match self.relay.submit(request) {
            Ok(accepted) => {
                tracing::debug!(owner_id = %owner_id, job_id = %accepted.job_id, "Upload started");
            }
            Err(rejection) => {
                tracing::info!(owner_id = %owner_id, reason = %rejection, "Upload rejected");
                self.reply(chat_id, &rejection_text(&rejection)).await;
            }
        }
    }

    async fn reply(&self, chat_id: &str, text: &str) {
        if let Err(e) = self.api.send_message(chat_id, text).await {
            tracing::warn!(chat_id = %chat_id, error = %e, "Failed to send reply");
        }
    }
}
