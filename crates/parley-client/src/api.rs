//! REST client for the parley server.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use parley_shared::constants::{USER_ID_HEADER, USER_ID_QUERY};
use parley_shared::protocol::{
    ContactsResponse, ConversationResponse, ErrorBody, MarkSeenResponse, RegisterUserRequest,
    SendMessageRequest,
};
use parley_shared::types::{MessageId, UserId};
use parley_shared::{Message, User};

use crate::error::{ClientError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    user: Option<UserId>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: None,
        })
    }

    /// Act as `user` on every subsequent call.
    pub fn with_user(mut self, user: UserId) -> Self {
        self.user = Some(user);
        self
    }

    /// WebSocket URL of the live endpoint for `user`.
    pub fn live_url(&self, user: UserId) -> Result<String> {
        let rest = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ClientError::Config(format!(
                "server URL must start with http:// or https://, got {}",
                self.base_url
            )));
        };
        Ok(format!("{rest}/ws?{USER_ID_QUERY}={user}"))
    }

    pub async fn register_user(&self, full_name: &str) -> Result<User> {
        let body = RegisterUserRequest {
            full_name: full_name.to_string(),
        };
        let resp = self.request(Method::POST, "/api/users").json(&body).send().await?;
        parse(resp).await
    }

    pub async fn contacts(&self) -> Result<ContactsResponse> {
        let resp = self.request(Method::GET, "/api/users").send().await?;
        parse(resp).await
    }

    /// Full conversation with `peer`.  The server marks it seen as a side
    /// effect.
    pub async fn history(&self, peer: UserId) -> Result<Vec<Message>> {
        let resp = self
            .request(Method::GET, &format!("/api/messages/{peer}"))
            .send()
            .await?;
        let conversation: ConversationResponse = parse(resp).await?;
        debug!(peer = %peer, count = conversation.messages.len(), "Fetched history");
        Ok(conversation.messages)
    }

    pub async fn send(&self, peer: UserId, request: &SendMessageRequest) -> Result<Message> {
        let resp = self
            .request(Method::POST, &format!("/api/messages/send/{peer}"))
            .json(request)
            .send()
            .await?;
        parse(resp).await
    }

    pub async fn mark_seen(&self, id: MessageId) -> Result<bool> {
        let resp = self
            .request(Method::PUT, &format!("/api/messages/mark/{id}"))
            .send()
            .await?;
        let body: MarkSeenResponse = parse(resp).await?;
        Ok(body.updated)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        match self.user {
            Some(user) => builder.header(USER_ID_HEADER, user.to_string()),
            None => builder,
        }
    }
}

async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let message = match resp.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
    };
    Err(ClientError::Server {
        status: status.as_u16(),
        message,
    })
}
