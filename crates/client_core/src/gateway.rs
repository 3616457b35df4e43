use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use shared::{
    domain::{ChatMessage, ConversationId, MessageId, ReadReceipt, UserId},
    error::ApiError,
    protocol::{
        AppendMessageRequest, AppendMessageResponse, AppendOutcome, ConversationSummary,
        LoginRequest, LoginResponse, MarkReadRequest, MarkReadResponse,
        OpenDirectConversationRequest, ReceiptsRequest, ReceiptsResponse, TransportTokenRequest,
        TransportTokenResponse, TypingRequest,
    },
};
use tracing::warn;

use crate::error::SyncError;

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn append_message(
        &self,
        conversation_id: ConversationId,
        message: &ChatMessage,
    ) -> Result<AppendOutcome, SyncError>;
    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>, SyncError>;
    async fn record_reads(
        &self,
        message_ids: &[MessageId],
        conversation_id: Option<ConversationId>,
    ) -> Result<u64, SyncError>;
    async fn get_receipts(
        &self,
        message_ids: &[MessageId],
    ) -> Result<HashMap<MessageId, Vec<ReadReceipt>>, SyncError>;
    async fn open_direct_conversation(
        &self,
        other_user_id: UserId,
    ) -> Result<ConversationSummary, SyncError>;
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, SyncError>;
    async fn send_typing(
        &self,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<(), SyncError>;
    async fn channel_token(
        &self,
        conversation_id: ConversationId,
    ) -> Result<TransportTokenResponse, SyncError>;
}

#[derive(Clone)]
pub struct HttpGateway {
    http: Client,
    server_url: String,
    token: String,
}

impl HttpGateway {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub async fn login(
        server_url: &str,
        username: &str,
    ) -> Result<(Self, LoginResponse), SyncError> {
        let server_url = server_url.trim_end_matches('/');
        let response = Client::new()
            .post(format!("{server_url}/login"))
            .json(&LoginRequest {
                username: username.to_string(),
            })
            .send()
            .await?;
        let login: LoginResponse = check(response).await?.json().await?;
        Ok((Self::new(server_url, login.token.clone()), login))
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http
            .get(format!("{}{path}", self.server_url))
            .bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(format!("{}{path}", self.server_url))
            .bearer_auth(&self.token)
    }
}

async fn check(response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|err| err.message)
        .unwrap_or_else(|_| format!("{status}: {body}"));
    warn!(%status, %message, "gateway: request rejected");
    Err(match status {
        StatusCode::UNAUTHORIZED => SyncError::Auth(message),
        StatusCode::FORBIDDEN => SyncError::AccessDenied(message),
        _ => SyncError::Persistence(message),
    })
}

#[async_trait]
impl PersistenceGateway for HttpGateway {
    async fn append_message(
        &self,
        conversation_id: ConversationId,
        message: &ChatMessage,
    ) -> Result<AppendOutcome, SyncError> {
        let request = AppendMessageRequest {
            id: message.id.clone(),
            conversation_id,
            content: message.content.clone(),
            kind: message.kind,
            timestamp: message.timestamp,
        };
        let response = self.post("/messages").json(&request).send().await?;
        let body: AppendMessageResponse = check(response).await?.json().await?;
        Ok(body.outcome)
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>, SyncError> {
        let mut query = vec![("limit", i64::from(limit))];
        if let Some(before) = before {
            query.push(("before", before.timestamp_millis()));
        }
        let response = self
            .get(&format!("/conversations/{}/messages", conversation_id.0))
            .query(&query)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn record_reads(
        &self,
        message_ids: &[MessageId],
        conversation_id: Option<ConversationId>,
    ) -> Result<u64, SyncError> {
        let request = MarkReadRequest {
            message_ids: message_ids.to_vec(),
            conversation_id,
        };
        let response = self.post("/messages/read").json(&request).send().await?;
        let body: MarkReadResponse = check(response).await?.json().await?;
        Ok(body.read_count)
    }

    async fn get_receipts(
        &self,
        message_ids: &[MessageId],
    ) -> Result<HashMap<MessageId, Vec<ReadReceipt>>, SyncError> {
        let request = ReceiptsRequest {
            message_ids: message_ids.to_vec(),
        };
        let response = self
            .post("/messages/receipts")
            .json(&request)
            .send()
            .await?;
        let body: ReceiptsResponse = check(response).await?.json().await?;
        Ok(body.receipts)
    }

    async fn open_direct_conversation(
        &self,
        other_user_id: UserId,
    ) -> Result<ConversationSummary, SyncError> {
        let response = self
            .post("/conversations/direct")
            .json(&OpenDirectConversationRequest { other_user_id })
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, SyncError> {
        let response = self.get("/conversations").send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn send_typing(
        &self,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<(), SyncError> {
        let response = self
            .post("/messages/typing")
            .json(&TypingRequest {
                conversation_id,
                is_typing,
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn channel_token(
        &self,
        conversation_id: ConversationId,
    ) -> Result<TransportTokenResponse, SyncError> {
        let response = self
            .post("/transport/token")
            .json(&TransportTokenRequest { conversation_id })
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}
