use crate::attachment::{AttachmentKind, OCTET_STREAM};
use crate::config::ChatConfig;
use crate::error::{DeliveryError, RelayError};
use crate::format::{FormattedAttachment, FormattedEmail};
use anyhow::Context;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::future::Future;

/// Replace carriage returns and newlines with their escaped spelling so the
/// text fits in a single SMTP reply line.
pub fn escape_multiline(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}

pub fn sanitize_bot_token(s: &str, bot_token: &str) -> String {
    if bot_token.is_empty() {
        return s.to_string();
    }
    s.replace(bot_token, "***")
}

/// A text message accepted by the chat API; attachments reply to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    ok: bool,
    result: Option<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: serde_json::Value,
}

/// Decode the body of a successful `sendMessage` call.
pub fn parse_send_message_response(body: &[u8]) -> Result<SentMessage, DeliveryError> {
    let response: ApiResponse =
        serde_json::from_slice(body).map_err(|e| DeliveryError::Json(e.to_string()))?;
    if !response.ok {
        return Err(DeliveryError::NotOk(String::from_utf8_lossy(body).into_owned()));
    }
    let message = response
        .result
        .ok_or_else(|| DeliveryError::Json("missing field `result`".to_string()))?;
    let message_id = match message.message_id {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    };
    Ok(SentMessage { message_id })
}

/// Multipart request for `sendDocument` or `sendPhoto`.
#[derive(Debug, Clone)]
pub struct AttachmentUpload<'a> {
    pub method: &'static str,
    pub file_field: &'static str,
    pub chat_id: &'a str,
    pub reply_to_message_id: &'a str,
    pub caption: &'a str,
    pub filename: &'a str,
    pub content: &'a [u8],
}

impl<'a> AttachmentUpload<'a> {
    pub fn new(chat_id: &'a str, reply_to: &'a SentMessage, attachment: &'a FormattedAttachment) -> Self {
        let (method, file_field) = match attachment.kind {
            AttachmentKind::Document => ("sendDocument", "document"),
            AttachmentKind::Photo => ("sendPhoto", "photo"),
        };
        AttachmentUpload {
            method,
            file_field,
            chat_id,
            reply_to_message_id: &reply_to.message_id,
            caption: &attachment.caption,
            filename: &attachment.filename,
            content: &attachment.content,
        }
    }

    pub fn into_form(self) -> Result<Form, DeliveryError> {
        let file = Part::bytes(self.content.to_vec())
            .file_name(self.filename.to_string())
            .mime_str(OCTET_STREAM)
            .map_err(|e| DeliveryError::Form(e.to_string()))?;
        Ok(Form::new()
            .text("chat_id", self.chat_id.to_string())
            .text("reply_to_message_id", self.reply_to_message_id.to_string())
            .text("caption", self.caption.to_string())
            .part(self.file_field, file))
    }
}

/// The two bot API calls the relay needs.
pub trait ChatApi: Send + Sync {
    fn send_text(
        &self,
        chat_id: &str,
        text: &str,
    ) -> impl Future<Output = Result<SentMessage, DeliveryError>> + Send;

    fn send_attachment(
        &self,
        chat_id: &str,
        reply_to: &SentMessage,
        attachment: &FormattedAttachment,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// HTTP client for the Telegram Bot API.
#[derive(Debug, Clone)]
pub struct BotApi {
    client: reqwest::Client,
    api_prefix: String,
    bot_token: String,
}

impl BotApi {
    pub fn new(config: &ChatConfig) -> anyhow::Result<Self> {
        let prefix = url::Url::parse(&config.api_prefix)
            .with_context(|| format!("invalid Telegram API prefix '{}'", config.api_prefix))?;
        if prefix.cannot_be_a_base() {
            anyhow::bail!("invalid Telegram API prefix '{}'", config.api_prefix);
        }
        let client = reqwest::Client::builder()
            .timeout(config.api_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(BotApi {
            client,
            api_prefix: config.api_prefix.clone(),
            bot_token: config.bot_token.clone(),
        })
    }

    fn method_url(&self, method: &str, query: &str) -> String {
        format!("{}bot{}/{}?{}", self.api_prefix, self.bot_token, method, query)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DeliveryError> {
        let status = response.status();
        if status == StatusCode::OK {
            return Ok(response);
        }
        let body = response.bytes().await.unwrap_or_default();
        Err(DeliveryError::Status {
            status: status.as_u16(),
            body: escape_multiline(&body),
        })
    }
}

impl ChatApi for BotApi {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<SentMessage, DeliveryError> {
        let response = self
            .client
            .post(self.method_url("sendMessage", "disable_web_page_preview=true"))
            .form(&[("chat_id", chat_id), ("text", text)])
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| DeliveryError::Json(format!("failed to read body: {}", e.without_url())))?;
        parse_send_message_response(&body)
    }

    async fn send_attachment(
        &self,
        chat_id: &str,
        reply_to: &SentMessage,
        attachment: &FormattedAttachment,
    ) -> Result<(), DeliveryError> {
        let upload = AttachmentUpload::new(chat_id, reply_to, attachment);
        let url = self.method_url(upload.method, "disable_notification=true");
        let form = upload.into_form()?;
        let response = self.client.post(url).multipart(form).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }
}

/// Send the text and then every attachment to each configured chat, in order.
///
/// A failed text send rejects the whole email. A failed attachment rejects it
/// only when `forwarded_attachment_respect_errors` is set.
pub async fn deliver<A: ChatApi>(
    api: &A,
    email: &FormattedEmail,
    config: &ChatConfig,
) -> Result<(), RelayError> {
    for chat_id in config.chat_ids() {
        let sent = api
            .send_text(chat_id, &email.text)
            .await
            .map_err(|e| RelayError::Delivery(e.sanitized(&config.bot_token)))?;
        log::debug!("Sent message {} to chat {}", sent.message_id, chat_id);

        for attachment in &email.attachments {
            if let Err(e) = api.send_attachment(chat_id, &sent, attachment).await {
                let message = e.sanitized(&config.bot_token);
                if config.forwarded_attachment_respect_errors {
                    return Err(RelayError::Delivery(message));
                }
                log::error!("Ignoring attachment sending error: {}", message);
            }
        }
    }
    Ok(())
}
