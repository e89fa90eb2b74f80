//! Best-effort notification fan-out.
//!
//! The engine and the task manager emit milestone events through a
//! [`Notifier`], which broadcasts them concurrently to every registered
//! [`NotificationSink`]. Delivery is fire-and-forget: a sink failure is
//! logged and never propagates to the caller, so execution success never
//! depends on delivery success.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use weft_db::queries::notifications as notification_db;

/// Milestone events the system notifies about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    TaskAssigned,
    TaskCompleted,
    TaskOverdue,
    TaskEscalated,
    WorkflowExecution,
}

impl NotifyEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskAssigned => "task_assigned",
            Self::TaskCompleted => "task_completed",
            Self::TaskOverdue => "task_overdue",
            Self::TaskEscalated => "task_escalated",
            Self::WorkflowExecution => "workflow_execution",
        }
    }
}

/// One notification to fan out.
#[derive(Debug, Clone)]
pub struct NotifyMessage {
    pub tenant_id: Uuid,
    pub event: NotifyEvent,
    pub title: String,
    pub body: Option<String>,
    /// User ids (or role strings) to deliver to.
    pub recipients: Vec<String>,
    pub payload: Value,
}

/// A delivery channel (in-app, email, chat). Implementations must be
/// prepared to be called concurrently.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, message: &NotifyMessage) -> anyhow::Result<()>;
}

/// The fan-out multiplexer.
#[derive(Clone, Default)]
pub struct Notifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Notifier {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    /// A notifier that drops everything (tests, tooling).
    pub fn noop() -> Self {
        Self::default()
    }

    /// Fan a message out to every sink. Returns immediately; deliveries run
    /// as detached tasks and log on failure.
    pub fn notify(&self, message: NotifyMessage) {
        let message = Arc::new(message);
        for sink in &self.sinks {
            let sink = Arc::clone(sink);
            let message = Arc::clone(&message);
            tokio::spawn(async move {
                if let Err(e) = sink.deliver(&message).await {
                    tracing::warn!(
                        sink = sink.name(),
                        event = message.event.as_str(),
                        error = %e,
                        "notification delivery failed (best-effort)"
                    );
                }
            });
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("sinks", &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Sink that records every event in the structured log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, message: &NotifyMessage) -> anyhow::Result<()> {
        tracing::info!(
            event = message.event.as_str(),
            tenant_id = %message.tenant_id,
            recipients = message.recipients.len(),
            "{}",
            message.title
        );
        Ok(())
    }
}

/// In-app sink: one `notifications` row per recipient plus a realtime push
/// on the per-user broadcast channel (`notifications:<user_id>`) for any
/// connected session.
pub struct InAppSink {
    pool: PgPool,
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl InAppSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a user's realtime notification stream.
    pub async fn subscribe(&self, user_id: &str) -> broadcast::Receiver<Value> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(user_id.to_owned())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }

    async fn push_realtime(&self, user_id: &str, payload: &Value) {
        let channels = self.channels.lock().await;
        if let Some(sender) = channels.get(user_id) {
            // Errors just mean no connected session.
            let _ = sender.send(payload.clone());
        }
    }
}

#[async_trait]
impl NotificationSink for InAppSink {
    fn name(&self) -> &'static str {
        "in_app"
    }

    async fn deliver(&self, message: &NotifyMessage) -> anyhow::Result<()> {
        for recipient in &message.recipients {
            notification_db::insert_notification(
                &self.pool,
                message.tenant_id,
                recipient,
                message.event.as_str(),
                &message.title,
                message.body.as_deref(),
                Some(&message.payload),
            )
            .await?;

            self.push_realtime(recipient, &message.payload).await;
        }
        Ok(())
    }
}
