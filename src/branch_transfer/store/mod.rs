//! Transfer Request Store
//!
//! Persistence contract for transfer requests and the operational side
//! effects of an approval. Every status transition runs inside one
//! [`TransferTx`]:
//!
//! 1. `lock_request` - read the row and hold it against concurrent writers
//! 2. verify the guard (status, authorization, conflicts)
//! 3. side effects (cancellations, refunds, enrollment)
//! 4. `update_status_if` - compare-and-swap on status
//! 5. `stage_event` - transition event into the outbox
//! 6. `commit`
//!
//! Dropping a transaction without committing rolls every step back,
//! including the staged event. The outbox is drained by the delivery
//! worker through [`EventOutbox`].

pub mod memory;
pub mod postgres;

pub use memory::{MemoryState, MemoryTransferStore};
pub use postgres::PgTransferStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;

use super::audit::TransitionEvent;
use super::conflicts::ConflictSnapshot;
use super::error::BranchTransferError;
use super::state::TransferStatus;
use super::types::{
    BranchId, RequestFilter, SchoolId, StatusChange, StudentId, StudentLevelId, TransferRecord,
    TransferRequestId,
};

/// Refund issued for a cancelled subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundEntry {
    pub request_id: TransferRequestId,
    pub subscription_id: i64,
    pub student_id: StudentId,
    pub branch_id: BranchId,
    pub amount: Decimal,
    pub issued_at: DateTime<Utc>,
}

/// New student record at the target branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrollment {
    pub request_id: TransferRequestId,
    /// Student record at the old branch
    pub source_student_id: StudentId,
    pub branch_id: BranchId,
    pub school_id: Option<SchoolId>,
    pub student_level_id: Option<StudentLevelId>,
    pub enrolled_at: DateTime<Utc>,
}

/// Side channel a staged event is delivered to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryLeg {
    Audit,
    Notify,
}

impl DeliveryLeg {
    pub const ALL: [DeliveryLeg; 2] = [DeliveryLeg::Audit, DeliveryLeg::Notify];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryLeg::Audit => "audit",
            DeliveryLeg::Notify => "notify",
        }
    }
}

/// Transition event committed together with its status change
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub event: TransitionEvent,
    pub audited: bool,
    pub notified: bool,
}

impl OutboxEntry {
    pub fn new(event: TransitionEvent) -> Self {
        Self {
            event,
            audited: false,
            notified: false,
        }
    }

    pub fn is_delivered(&self, leg: DeliveryLeg) -> bool {
        match leg {
            DeliveryLeg::Audit => self.audited,
            DeliveryLeg::Notify => self.notified,
        }
    }

    pub fn mark_delivered(&mut self, leg: DeliveryLeg) {
        match leg {
            DeliveryLeg::Audit => self.audited = true,
            DeliveryLeg::Notify => self.notified = true,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.audited && self.notified
    }
}

/// Durable queue of committed transition events
#[async_trait]
pub trait EventOutbox: Send + Sync {
    /// Entries with at least one leg still undelivered, oldest first
    async fn undelivered(&self, limit: usize) -> Result<Vec<OutboxEntry>, BranchTransferError>;

    /// Unknown event ids are ignored
    async fn mark_delivered(
        &self,
        event_id: ulid::Ulid,
        leg: DeliveryLeg,
    ) -> Result<(), BranchTransferError>;
}

/// One unit of work against the store
#[async_trait]
pub trait TransferTx: Send {
    /// Read a request and lock it for the rest of the transaction
    async fn lock_request(
        &mut self,
        request_id: TransferRequestId,
    ) -> Result<Option<TransferRecord>, BranchTransferError>;

    /// Open (PENDING / READY_TO_TRANSFER) request for a student, if any
    async fn open_request_for_student(
        &mut self,
        student_id: StudentId,
    ) -> Result<Option<TransferRecord>, BranchTransferError>;

    async fn insert_request(&mut self, record: &TransferRecord) -> Result<(), BranchTransferError>;

    /// Conflict snapshot read inside this transaction
    async fn conflicts(
        &mut self,
        student_id: StudentId,
        branch_id: BranchId,
        local_now: NaiveDateTime,
    ) -> Result<ConflictSnapshot, BranchTransferError>;

    async fn cancel_subscription(&mut self, subscription_id: i64)
    -> Result<(), BranchTransferError>;

    async fn cancel_slot(&mut self, slot_id: i64) -> Result<(), BranchTransferError>;

    async fn cancel_order(&mut self, order_id: i64) -> Result<(), BranchTransferError>;

    async fn issue_refund(&mut self, refund: &RefundEntry) -> Result<(), BranchTransferError>;

    /// Create the student record at the target branch, returning its id
    async fn enroll_student(
        &mut self,
        enrollment: &Enrollment,
    ) -> Result<StudentId, BranchTransferError>;

    /// Atomic CAS: apply `change` only if the current status is `expected`
    ///
    /// Returns false if the status no longer matches (lost race).
    async fn update_status_if(
        &mut self,
        request_id: TransferRequestId,
        expected: TransferStatus,
        change: &StatusChange,
    ) -> Result<bool, BranchTransferError>;

    /// Write the event to the outbox; it commits or rolls back with the
    /// transition
    ///
    /// A failure here must leave the rest of the transaction usable.
    async fn stage_event(&mut self, event: &TransitionEvent) -> Result<(), BranchTransferError>;

    async fn commit(self: Box<Self>) -> Result<(), BranchTransferError>;
}

/// Transfer request persistence
#[async_trait]
pub trait TransferStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn TransferTx>, BranchTransferError>;

    async fn get(
        &self,
        request_id: TransferRequestId,
    ) -> Result<Option<TransferRecord>, BranchTransferError>;

    /// Newest first
    async fn list(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<TransferRecord>, BranchTransferError>;

    /// Read-only conflict snapshot taken as one consistent read
    async fn conflicts(
        &self,
        student_id: StudentId,
        branch_id: BranchId,
        local_now: NaiveDateTime,
    ) -> Result<ConflictSnapshot, BranchTransferError> {
        let mut tx = self.begin().await?;
        let snapshot = tx.conflicts(student_id, branch_id, local_now).await?;
        tx.commit().await?;
        Ok(snapshot)
    }
}
