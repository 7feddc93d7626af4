use anyhow::{Context, Result};
use commsync_common::{Message, RoomId};
use serde::Deserialize;
use serde_json::json;

use crate::config::ClientConfig;

/// Response of `GET /projects/get-messages/{id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesPage {
    pub success: bool,
    /// Newest first.
    pub messages: Vec<Message>,
    pub project_id: i64,
    pub project_name: String,
}

#[derive(Debug, Deserialize)]
struct AddMessageResponse {
    message: Message,
}

/// Historical fetch over HTTP.
#[derive(Clone)]
pub struct HistoryClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HistoryClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            token: config.token.clone(),
        }
    }

    /// The authoritative log of `room`, newest first.
    pub async fn fetch(&self, room: RoomId) -> Result<MessagesPage> {
        self.http
            .get(format!("{}/projects/get-messages/{}", self.base_url, room))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("Failed to send history request")?
            .error_for_status()
            .context("History endpoint returned error status")?
            .json()
            .await
            .context("Failed to parse history response")
    }

    /// Store a message without broadcasting it.
    pub async fn post_message(&self, room: RoomId, text: &str) -> Result<Message> {
        let resp: AddMessageResponse = self
            .http
            .post(format!("{}/projects/add-message/{}", self.base_url, room))
            .bearer_auth(&self.token)
            .json(&json!({ "message": text, "messageType": "user" }))
            .send()
            .await
            .context("Failed to send add-message request")?
            .error_for_status()
            .context("add-message returned error status")?
            .json()
            .await
            .context("Failed to parse add-message response")?;
        Ok(resp.message)
    }
}
