//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use fieldsync_core::EntityType;
use fieldsync_protocol::{ConflictBody, PullBatch, PushAck, ResolveReply, ResolveRequest};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Classified server reply to a push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushReply {
    /// 2xx response.
    Accepted(PushAck),
    /// 409 response.
    Conflict(ConflictBody),
    /// Any other non-success status.
    Rejected {
        /// HTTP status.
        status: u16,
        /// Server message.
        message: String,
    },
}

/// A sync transport handles network communication with the sync server.
///
/// Transport-level failures (timeouts, refused connections) are returned
/// as errors; anything the server actually answered is a reply.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Pushes one entity row.
    async fn push(&self, entity_type: EntityType, row: &Value) -> SyncResult<PushReply>;

    /// Fetches the authoritative rows of one collection visible to `actor_id`.
    async fn pull(&self, entity_type: EntityType, actor_id: &str) -> SyncResult<Vec<Value>>;

    /// Fetches several collections at once.
    ///
    /// The default issues one [`pull`](Self::pull) per collection and fails
    /// on the first error. Transports with a bulk endpoint override it.
    async fn pull_batch(
        &self,
        collections: &[EntityType],
        actor_id: &str,
    ) -> SyncResult<PullBatch> {
        let mut batch = PullBatch::new();
        for &entity_type in collections {
            let rows = self.pull(entity_type, actor_id).await?;
            batch.insert(entity_type, rows);
        }
        Ok(batch)
    }

    /// Submits a conflict resolution.
    async fn resolve(&self, request: &ResolveRequest) -> SyncResult<ResolveReply>;
}

/// Callback run once while a push is in flight.
pub struct PushHook(Box<dyn FnOnce() + Send>);

impl PushHook {
    /// Wraps `hook`.
    pub fn new(hook: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(hook))
    }

    /// Runs the hook.
    pub fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for PushHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PushHook")
    }
}

/// A scripted transport for testing.
///
/// Push and resolve replies are served from queues; once a queue is empty
/// a default success is returned. Pull rows are per collection.
#[derive(Debug, Default)]
pub struct MockTransport {
    disconnected: AtomicBool,
    push_replies: Mutex<VecDeque<SyncResult<PushReply>>>,
    resolve_replies: Mutex<VecDeque<SyncResult<ResolveReply>>>,
    pull_rows: Mutex<HashMap<EntityType, Vec<Value>>>,
    pull_errors: Mutex<HashMap<EntityType, SyncError>>,
    pushed: Mutex<Vec<(EntityType, Value)>>,
    pulled: Mutex<Vec<EntityType>>,
    resolved: Mutex<Vec<ResolveRequest>>,
    push_hook: Mutex<Option<PushHook>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the reply for the next push.
    pub fn queue_push(&self, reply: SyncResult<PushReply>) {
        self.push_replies.lock().push_back(reply);
    }

    /// Queues a success acknowledgement carrying `server_id`.
    pub fn queue_push_ack(&self, server_id: Option<&str>) {
        self.queue_push(Ok(PushReply::Accepted(PushAck::new(
            "Saved successfully",
            server_id.map(str::to_string),
        ))));
    }

    /// Queues the reply for the next resolve.
    pub fn queue_resolve(&self, reply: SyncResult<ResolveReply>) {
        self.resolve_replies.lock().push_back(reply);
    }

    /// Sets the rows returned when pulling `entity_type`.
    pub fn set_pull_rows(&self, entity_type: EntityType, rows: Vec<Value>) {
        self.pull_rows.lock().insert(entity_type, rows);
    }

    /// Makes pulling `entity_type` fail.
    pub fn fail_pull(&self, entity_type: EntityType, error: SyncError) {
        self.pull_errors.lock().insert(entity_type, error);
    }

    /// Runs `hook` during the next push, after the row has been sent and
    /// before the reply is returned.
    pub fn on_next_push(&self, hook: impl FnOnce() + Send + 'static) {
        *self.push_hook.lock() = Some(PushHook::new(hook));
    }

    /// Simulates losing connectivity.
    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    /// Rows pushed so far.
    pub fn pushed(&self) -> Vec<(EntityType, Value)> {
        self.pushed.lock().clone()
    }

    /// Collections pulled so far.
    pub fn pulled(&self) -> Vec<EntityType> {
        self.pulled.lock().clone()
    }

    /// Resolve requests received so far.
    pub fn resolved(&self) -> Vec<ResolveRequest> {
        self.resolved.lock().clone()
    }

    fn check_connected(&self) -> SyncResult<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(SyncError::NotConnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn push(&self, entity_type: EntityType, row: &Value) -> SyncResult<PushReply> {
        self.check_connected()?;
        self.pushed.lock().push((entity_type, row.clone()));
        let reply = self.push_replies.lock().pop_front().unwrap_or_else(|| {
            Ok(PushReply::Accepted(PushAck::new("Saved successfully", None)))
        });
        let hook = self.push_hook.lock().take();
        if let Some(hook) = hook {
            hook.run();
        }
        reply
    }

    async fn pull(&self, entity_type: EntityType, _actor_id: &str) -> SyncResult<Vec<Value>> {
        self.check_connected()?;
        self.pulled.lock().push(entity_type);
        if let Some(error) = self.pull_errors.lock().get(&entity_type) {
            return Err(error.clone());
        }
        Ok(self
            .pull_rows
            .lock()
            .get(&entity_type)
            .cloned()
            .unwrap_or_default())
    }

    async fn resolve(&self, request: &ResolveRequest) -> SyncResult<ResolveReply> {
        self.check_connected()?;
        self.resolved.lock().push(request.clone());
        self.resolve_replies
            .lock()
            .pop_front()
            .unwrap_or(Ok(ResolveReply::Resolved { data: None }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn mock_transport_default_reply() {
        let transport = MockTransport::new();
        let reply = transport
            .push(EntityType::Supply, &json!({"id": "s1"}))
            .await
            .unwrap();
        assert!(matches!(reply, PushReply::Accepted(ack) if ack.is_success()));
        assert_eq!(transport.pushed().len(), 1);
    }

    #[tokio::test]
    async fn mock_transport_not_connected_error() {
        let transport = MockTransport::new();
        transport.set_connected(false);

        let result = transport.pull(EntityType::Task, "u1").await;
        assert!(matches!(result, Err(SyncError::NotConnected)));
        assert!(transport.pulled().is_empty());
    }

    #[tokio::test]
    async fn mock_transport_scripted_replies() {
        let transport = MockTransport::new();
        transport.queue_push_ack(Some("srv-1"));
        transport.queue_push(Err(SyncError::Timeout));

        let first = transport.push(EntityType::User, &json!({})).await.unwrap();
        assert!(matches!(first, PushReply::Accepted(ack) if ack.server_id.as_deref() == Some("srv-1")));
        let second = transport.push(EntityType::User, &json!({})).await;
        assert!(matches!(second, Err(SyncError::Timeout)));
    }

    #[tokio::test]
    async fn push_hook_runs_once() {
        let transport = MockTransport::new();
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        transport.on_next_push(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        transport.push(EntityType::Task, &json!({})).await.unwrap();
        transport.push(EntityType::Task, &json!({})).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn default_batch_pull_collects_each_collection() {
        let transport = MockTransport::new();
        transport.set_pull_rows(EntityType::Task, vec![json!({"id": "t1"})]);

        let batch = transport
            .pull_batch(&[EntityType::Location, EntityType::Task], "u1")
            .await
            .unwrap();
        assert_eq!(batch.rows(EntityType::Task).len(), 1);
        assert!(batch.rows(EntityType::Location).is_empty());
        assert_eq!(transport.pulled(), vec![EntityType::Location, EntityType::Task]);

        transport.fail_pull(EntityType::Task, SyncError::Timeout);
        let err = transport
            .pull_batch(&[EntityType::Task], "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
    }
}
