//! HTTP transport built on `reqwest`.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{PushReply, SyncTransport};
use async_trait::async_trait;
use fieldsync_core::EntityType;
use fieldsync_protocol::{
    ConflictBody, Endpoint, PullBatch, PushAck, ResolveReply, ResolveRequest, CONFLICT_STATUS,
    GONE_STATUS,
};
use parking_lot::RwLock;
use serde_json::Value;

const MAX_LOG_BODY_CHARS: usize = 512;

fn map_reqwest_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        SyncError::transport_retryable(err.to_string())
    } else if err.is_decode() {
        SyncError::Protocol(err.to_string())
    } else {
        SyncError::transport_fatal(err.to_string())
    }
}

fn message_of(body: &Value, fallback: &str) -> String {
    body.get("message")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

/// Transport speaking the JSON wire contract over HTTP.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpTransport {
    /// Creates a transport for `config.server_url` with the configured
    /// request timeout.
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::transport_fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    /// Sets the bearer token sent with every request.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    /// Returns the server base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.read().as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> SyncResult<(u16, Value)> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(map_reqwest_error)?;
        if !(200..300).contains(&status) {
            let preview: String = text.chars().take(MAX_LOG_BODY_CHARS).collect();
            tracing::debug!(status, body = %preview, "sync server returned error status");
        }
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status, body))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, entity_type: EntityType, row: &Value) -> SyncResult<PushReply> {
        let url = Endpoint::Push(entity_type).url(&self.base_url);
        let (status, body) = self.send(self.client.post(url).json(row)).await?;
        match status {
            200..=299 => Ok(PushReply::Accepted(PushAck::from_body(entity_type, &body)?)),
            CONFLICT_STATUS => Ok(PushReply::Conflict(ConflictBody::from_body(&body)?)),
            _ => Ok(PushReply::Rejected {
                status,
                message: message_of(&body, "push rejected"),
            }),
        }
    }

    async fn pull(&self, entity_type: EntityType, actor_id: &str) -> SyncResult<Vec<Value>> {
        let url = Endpoint::Pull(entity_type).url(&self.base_url);
        let request = self.client.get(url).query(&[("actor_id", actor_id)]);
        let (status, body) = self.send(request).await?;
        if !(200..300).contains(&status) {
            return Err(SyncError::ServerError {
                status,
                message: message_of(&body, "pull failed"),
            });
        }
        Ok(PullBatch::collection_from_body(entity_type, &body)?)
    }

    async fn pull_batch(
        &self,
        collections: &[EntityType],
        actor_id: &str,
    ) -> SyncResult<PullBatch> {
        let url = Endpoint::PullAll.url(&self.base_url);
        let request = self.client.get(url).query(&[("actor_id", actor_id)]);
        let (status, body) = self.send(request).await?;
        if !(200..300).contains(&status) {
            return Err(SyncError::ServerError {
                status,
                message: message_of(&body, "bulk pull failed"),
            });
        }
        let mut received = PullBatch::from_body(&body)?;
        let mut batch = PullBatch::new();
        for &entity_type in collections {
            batch.insert(entity_type, received.take(entity_type));
        }
        Ok(batch)
    }

    async fn resolve(&self, request: &ResolveRequest) -> SyncResult<ResolveReply> {
        let url = Endpoint::Resolve.url(&self.base_url);
        let (status, body) = self.send(self.client.post(url).json(request)).await?;
        match status {
            200..=299 | GONE_STATUS => Ok(ResolveReply::from_body(status, &body)?),
            // A second conflict on resolve means someone else got there first.
            CONFLICT_STATUS => Ok(ResolveReply::AlreadyResolved {
                message: message_of(&body, "conflict already resolved"),
            }),
            _ => Err(SyncError::ServerError {
                status,
                message: message_of(&body, "resolve failed"),
            }),
        }
    }
}
