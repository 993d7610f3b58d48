use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::ballots::VoterId;
use crate::gate::{MembershipOracle, MembershipStatus};
use crate::logging::{debug, obj, v_str, Domain};
use crate::retry::{is_retryable_http_error, is_retryable_network_error};

#[derive(Deserialize, Debug, Clone)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Chat {
    pub id: i64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ChatMember {
    pub status: String,
    #[serde(default)]
    pub is_member: Option<bool>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl InlineButton {
    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self { text: text.into(), callback_data: Some(data.into()), url: None }
    }

    pub fn link(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self { text: text.into(), callback_data: None, url: Some(url.into()) }
    }
}

pub type Keyboard = Vec<Vec<InlineButton>>;

#[derive(Deserialize, Debug)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
#[error("bot api {method} failed ({code}): {description}")]
pub struct ApiError {
    pub method: String,
    pub code: u16,
    pub description: String,
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        is_retryable_http_error(self.code)
    }
}

/// Whether a failed Bot API call may succeed if repeated. Rejections such as
/// a bad token (401) or a competing poller (409) are permanent.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(api) = err.downcast_ref::<ApiError>() {
        return api.is_retryable();
    }
    match err.downcast_ref::<reqwest::Error>() {
        Some(net) => is_retryable_network_error(net),
        None => false,
    }
}

/// Thin Bot API client over HTTPS.
pub struct BotApi {
    client: Client,
    base: String,
}

impl BotApi {
    /// `request_timeout` must exceed the long-poll timeout.
    pub fn new(api_base: &str, token: &str, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(request_timeout).build()?,
            base: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T> {
        let url = format!("{}/{}", self.base, method);
        let resp = self.client.post(&url).json(body).send().await?;
        Self::unwrap_response(method, resp).await
    }

    async fn unwrap_response<T: DeserializeOwned>(method: &str, resp: reqwest::Response) -> Result<T> {
        let status = resp.status().as_u16();
        let api: ApiResponse<T> = resp.json().await?;
        if !api.ok {
            return Err(ApiError {
                method: method.to_string(),
                code: api.error_code.unwrap_or(status),
                description: api.description.unwrap_or_default(),
            }
            .into());
        }
        api.result.ok_or_else(|| anyhow!("bot api {} returned no result", method))
    }

    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await
    }

    pub async fn send_message(&self, chat_id: i64, text: &str, keyboard: Option<&Keyboard>) -> Result<Message> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(kb) = keyboard {
            body["reply_markup"] = json!({ "inline_keyboard": kb });
        }
        self.call("sendMessage", &body).await
    }

    pub async fn edit_reply_markup(&self, chat_id: i64, message_id: i64, keyboard: &Keyboard) -> Result<()> {
        let _: Value = self
            .call(
                "editMessageReplyMarkup",
                &json!({
                    "chat_id": chat_id,
                    "message_id": message_id,
                    "reply_markup": { "inline_keyboard": keyboard },
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn answer_callback(&self, callback_id: &str, text: &str, show_alert: bool) -> Result<()> {
        let _: bool = self
            .call(
                "answerCallbackQuery",
                &json!({ "callback_query_id": callback_id, "text": text, "show_alert": show_alert }),
            )
            .await?;
        Ok(())
    }

    pub async fn send_document(&self, chat_id: i64, file_name: &str, bytes: Vec<u8>, caption: &str) -> Result<Message> {
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("document", Part::bytes(bytes).file_name(file_name.to_string()));
        let url = format!("{}/sendDocument", self.base);
        let resp = self.client.post(&url).multipart(form).send().await?;
        Self::unwrap_response("sendDocument", resp).await
    }

    pub async fn get_chat_member(&self, chat_id: &str, user_id: i64) -> Result<ChatMember> {
        self.call("getChatMember", &json!({ "chat_id": chat_id, "user_id": user_id })).await
    }
}

/// Map a Bot API member status onto the engine's three states.
pub fn membership_from(member: &ChatMember) -> Result<MembershipStatus> {
    match member.status.as_str() {
        "creator" | "administrator" | "member" => Ok(MembershipStatus::Member),
        "restricted" if member.is_member.unwrap_or(false) => Ok(MembershipStatus::Member),
        "restricted" | "left" => Ok(MembershipStatus::Left),
        "kicked" => Ok(MembershipStatus::Removed),
        other => Err(anyhow!("unknown member status: {}", other)),
    }
}

#[async_trait]
impl MembershipOracle for BotApi {
    async fn status(&self, group_id: &str, voter_id: VoterId) -> Result<MembershipStatus> {
        let member = self.get_chat_member(group_id, voter_id).await?;
        debug(
            Domain::Gate,
            "member_status",
            obj(&[("group_id", v_str(group_id)), ("status", v_str(&member.status))]),
        );
        membership_from(&member)
    }
}
