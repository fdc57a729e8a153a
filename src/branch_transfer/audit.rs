//! Audit trail and requester notifications
//!
//! Both are side channels: they run after a transition has committed and
//! are delivered through [`super::delivery`], never inline.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;

use super::error::BranchTransferError;
use super::state::TransferStatus;
use super::types::{Actor, Role, StudentId, TransferRecord, TransferRequestId, UserId};

/// Immutable record of one status change (or of creation, with no `from`)
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEvent {
    /// Deduplication key for at-least-once delivery
    pub event_id: ulid::Ulid,
    pub request_id: TransferRequestId,
    pub student_id: StudentId,
    pub requested_by: UserId,
    pub from_status: Option<TransferStatus>,
    pub to_status: TransferStatus,
    pub actor_id: UserId,
    pub actor_role: Role,
    /// Manager notes, rejection reason and auto-cancel remarks
    pub notes: Option<String>,
    pub refunded_amount: Option<Decimal>,
    pub occurred_at: DateTime<Utc>,
}

impl TransitionEvent {
    pub fn new(
        record: &TransferRecord,
        from_status: Option<TransferStatus>,
        actor: Actor,
        notes: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: ulid::Ulid::new(),
            request_id: record.request_id,
            student_id: record.student_id,
            requested_by: record.requested_by,
            from_status,
            to_status: record.status,
            actor_id: actor.user_id,
            actor_role: actor.role,
            notes,
            refunded_amount: record.refunded_amount,
            occurred_at,
        }
    }
}

/// Wire shape for webhook notifications
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub event_id: String,
    pub request_id: String,
    pub student_id: StudentId,
    pub recipient_user_id: UserId,
    pub from_status: Option<&'static str>,
    pub to_status: &'static str,
    pub actor_role: &'static str,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl From<&TransitionEvent> for NotificationPayload {
    fn from(event: &TransitionEvent) -> Self {
        Self {
            event_id: event.event_id.to_string(),
            request_id: event.request_id.to_string(),
            student_id: event.student_id,
            recipient_user_id: event.requested_by,
            from_status: event.from_status.map(|s| s.as_str()),
            to_status: event.to_status.as_str(),
            actor_role: event.actor_role.as_str(),
            notes: event.notes.clone(),
            occurred_at: event.occurred_at,
        }
    }
}

/// Append-only audit trail
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Must tolerate the same event twice
    async fn record(&self, event: &TransitionEvent) -> Result<(), BranchTransferError>;
}

/// Tells the requester about a transition
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &TransitionEvent) -> Result<(), BranchTransferError>;
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<TransitionEvent>>,
    #[cfg(test)]
    failures_left: std::sync::atomic::AtomicUsize,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransitionEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn events_for(&self, request_id: TransferRequestId) -> Vec<TransitionEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.request_id == request_id)
            .collect()
    }

    /// Fail the next `n` record calls
    #[cfg(test)]
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures_left
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_failure(&self) -> bool {
        use std::sync::atomic::Ordering;
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, event: &TransitionEvent) -> Result<(), BranchTransferError> {
        #[cfg(test)]
        if self.take_failure() {
            return Err(BranchTransferError::DatabaseError(
                "audit store unavailable".to_string(),
            ));
        }
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if !events.iter().any(|e| e.event_id == event.event_id) {
            events.push(event.clone());
        }
        Ok(())
    }
}

/// Keeps notifications in memory
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<TransitionEvent>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<TransitionEvent> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, event: &TransitionEvent) -> Result<(), BranchTransferError> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

/// Notifier that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &TransitionEvent) -> Result<(), BranchTransferError> {
        tracing::info!(
            request_id = %event.request_id,
            recipient = event.requested_by,
            to_status = %event.to_status,
            "Requester notification"
        );
        Ok(())
    }
}

// ============================================================================
// PostgreSQL audit
// ============================================================================

pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, event: &TransitionEvent) -> Result<(), BranchTransferError> {
        sqlx::query(
            r#"
            INSERT INTO branch_transfer_audit_tb
                (event_id, request_id, from_status, to_status, actor_id, actor_role,
                 notes, refunded_amount, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id.to_string())
        .bind(event.request_id.to_string())
        .bind(event.from_status.map(|s| s.id()))
        .bind(event.to_status.id())
        .bind(event.actor_id)
        .bind(event.actor_role.as_str())
        .bind(&event.notes)
        .bind(event.refunded_amount)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// Webhook notifier
// ============================================================================

/// POSTs a JSON [`NotificationPayload`] to the platform's notification service
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, BranchTransferError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                BranchTransferError::SystemError(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &TransitionEvent) -> Result<(), BranchTransferError> {
        let payload = NotificationPayload::from(event);
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| {
                BranchTransferError::SystemError(format!("Notification webhook failed: {}", e))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch_transfer::types::NewTransferRequest;

    fn event() -> TransitionEvent {
        let req = NewTransferRequest {
            student_id: 42,
            target_branch_id: 2,
            ..Default::default()
        };
        let record = TransferRecord::new(&req, 1, None, 7, Utc::now());
        TransitionEvent::new(&record, None, Actor::parent(7), None, Utc::now())
    }

    #[tokio::test]
    async fn test_memory_audit_dedups_by_event_id() {
        let log = MemoryAuditLog::new();
        let e = event();
        log.record(&e).await.unwrap();
        log.record(&e).await.unwrap();
        assert_eq!(log.events().len(), 1);
        assert_eq!(log.events_for(e.request_id).len(), 1);
    }

    #[tokio::test]
    async fn test_memory_audit_fault_injection() {
        let log = MemoryAuditLog::new();
        log.fail_next(1);
        assert!(log.record(&event()).await.is_err());
        assert!(log.record(&event()).await.is_ok());
        assert_eq!(log.events().len(), 1);
    }

    #[test]
    fn test_notification_payload_shape() {
        let e = event();
        let json = serde_json::to_value(NotificationPayload::from(&e)).unwrap();
        assert_eq!(json["toStatus"], "PENDING");
        assert_eq!(json["recipientUserId"], 7);
        assert_eq!(json["actorRole"], "parent");
        assert!(json["fromStatus"].is_null());
    }
}
