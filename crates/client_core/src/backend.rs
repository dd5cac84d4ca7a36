//! Request/response surface of the collaboration backend.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{MessageId, SurfaceId},
    error::{ApiError, ErrorCode},
    protocol::{
        CreateMessageRequest, DeleteMessageRequest, EditMessageRequest, HistoryPage,
        MarkReadRequest, MessagePayload, ReactionAck, ReactionRequest,
    },
};

use crate::{config::ClientSettings, error::BackendError};

#[async_trait]
pub trait MessageBackend: Send + Sync {
    async fn create_message(
        &self,
        surface: SurfaceId,
        request: CreateMessageRequest,
    ) -> Result<MessagePayload, BackendError>;
    async fn edit_message(
        &self,
        surface: SurfaceId,
        message_id: MessageId,
        request: EditMessageRequest,
    ) -> Result<MessagePayload, BackendError>;
    async fn delete_message(
        &self,
        surface: SurfaceId,
        message_id: MessageId,
        request: DeleteMessageRequest,
    ) -> Result<MessagePayload, BackendError>;
    async fn add_reaction(
        &self,
        surface: SurfaceId,
        message_id: MessageId,
        request: ReactionRequest,
    ) -> Result<ReactionAck, BackendError>;
    async fn remove_reaction(
        &self,
        surface: SurfaceId,
        message_id: MessageId,
        request: ReactionRequest,
    ) -> Result<ReactionAck, BackendError>;
    /// Messages strictly older than `before` (or the newest when `None`), oldest first.
    async fn fetch_history(
        &self,
        surface: SurfaceId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<HistoryPage, BackendError>;
    async fn mark_read(
        &self,
        surface: SurfaceId,
        request: MarkReadRequest,
    ) -> Result<(), BackendError>;
}

#[derive(Serialize)]
struct HistoryQuery {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<i64>,
}

pub struct HttpBackend {
    http: Client,
    server_url: String,
    token: String,
}

impl HttpBackend {
    pub fn new(settings: &ClientSettings, token: impl Into<String>) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            http,
            server_url: settings.server_url.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn surface_url(&self, surface: SurfaceId) -> String {
        format!(
            "{}/{}/{}",
            self.server_url,
            surface.kind().path_segment(),
            surface.raw_id()
        )
    }

    fn message_url(&self, surface: SurfaceId, message_id: MessageId) -> String {
        format!("{}/messages/{}", self.surface_url(surface), message_id.0)
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(&self.token)
    }
}

#[async_trait]
impl MessageBackend for HttpBackend {
    async fn create_message(
        &self,
        surface: SurfaceId,
        request: CreateMessageRequest,
    ) -> Result<MessagePayload, BackendError> {
        let url = format!("{}/messages", self.surface_url(surface));
        let response = self.request(Method::POST, url).json(&request).send().await?;
        decode(response).await
    }

    async fn edit_message(
        &self,
        surface: SurfaceId,
        message_id: MessageId,
        request: EditMessageRequest,
    ) -> Result<MessagePayload, BackendError> {
        let url = self.message_url(surface, message_id);
        let response = self.request(Method::PATCH, url).json(&request).send().await?;
        decode(response).await
    }

    async fn delete_message(
        &self,
        surface: SurfaceId,
        message_id: MessageId,
        request: DeleteMessageRequest,
    ) -> Result<MessagePayload, BackendError> {
        let url = self.message_url(surface, message_id);
        let response = self.request(Method::DELETE, url).json(&request).send().await?;
        decode(response).await
    }

    async fn add_reaction(
        &self,
        surface: SurfaceId,
        message_id: MessageId,
        request: ReactionRequest,
    ) -> Result<ReactionAck, BackendError> {
        let url = format!("{}/reactions", self.message_url(surface, message_id));
        let response = self.request(Method::POST, url).json(&request).send().await?;
        decode(response).await
    }

    async fn remove_reaction(
        &self,
        surface: SurfaceId,
        message_id: MessageId,
        request: ReactionRequest,
    ) -> Result<ReactionAck, BackendError> {
        let url = format!("{}/reactions", self.message_url(surface, message_id));
        let response = self.request(Method::DELETE, url).json(&request).send().await?;
        decode(response).await
    }

    async fn fetch_history(
        &self,
        surface: SurfaceId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<HistoryPage, BackendError> {
        let url = format!("{}/messages", self.surface_url(surface));
        let query = HistoryQuery {
            limit,
            before: before.map(|id| id.0),
        };
        let response = self.request(Method::GET, url).query(&query).send().await?;
        decode(response).await
    }

    async fn mark_read(
        &self,
        surface: SurfaceId,
        request: MarkReadRequest,
    ) -> Result<(), BackendError> {
        let url = format!("{}/read", self.surface_url(surface));
        let response = self.request(Method::POST, url).json(&request).send().await?;
        check_status(response).await.map(|_| ())
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    check_status(response)
        .await?
        .json::<T>()
        .await
        .map_err(|err| BackendError::Transport(format!("invalid response body: {err}")))
}

/// Client errors are rejections carrying the server's reason. Timeouts, throttling and server
/// errors are transport failures and stay retryable.
async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    let body = response.text().await.unwrap_or_default();
    if retryable {
        return Err(BackendError::Transport(format!("server returned {status}")));
    }
    let error = serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
        let message = if body.trim().is_empty() {
            status.to_string()
        } else {
            body
        };
        ApiError::new(ErrorCode::from_status(status.as_u16()), message)
    });
    Err(BackendError::Rejected(error))
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
