//! Transfer Coordinator
//!
//! The single authority over request status. Every transition runs as one
//! store transaction: lock the row, check status, authorize, read conflicts,
//! apply side effects, CAS the status, stage the transition event in the
//! outbox, commit. Audit and notification happen after commit, driven from
//! the outbox by the delivery worker; the [`EventDispatcher`] only wakes it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use super::audit::TransitionEvent;
use super::conflicts::{Clock, ConflictCounts, ConflictDetector, ConflictSnapshot};
use super::delivery::EventDispatcher;
use super::directory::Directory;
use super::documents::DocumentStore;
use super::error::{BranchTransferError, ValidationError};
use super::refund;
use super::state::TransferStatus;
use super::store::{Enrollment, RefundEntry, TransferStore, TransferTx};
use super::types::{
    Actor, ApprovalDecision, BranchId, DocumentId, DocumentInput, ListQuery, NewTransferRequest,
    RejectionDecision, RequestFilter, Role, StatusChange, TransferRecord, TransferRequestId,
};
use super::validation::{self, StepContext};

/// Page size when the caller does not ask for one
pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 500;

/// What the current-branch approval did to the student's old-branch data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoCancelSummary {
    pub cancelled: ConflictCounts,
    /// Conflicts whose auto-cancel flag was off; they stay at the old branch
    pub untouched: ConflictCounts,
    pub refunded_amount: Decimal,
}

impl AutoCancelSummary {
    /// Note for the audit trail when records were left behind
    pub fn untouched_remark(&self) -> Option<String> {
        (self.untouched.total() > 0)
            .then(|| format!("Left at old branch: {}", self.untouched))
    }
}

/// Result of an approve call
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalOutcome {
    pub record: TransferRecord,
    /// Present for the current-branch step only
    pub auto_cancel: Option<AutoCancelSummary>,
}

pub struct TransferCoordinator {
    store: Arc<dyn TransferStore>,
    directory: Arc<dyn Directory>,
    documents: Arc<dyn DocumentStore>,
    detector: ConflictDetector,
    events: EventDispatcher,
}

impl TransferCoordinator {
    pub fn new(
        store: Arc<dyn TransferStore>,
        directory: Arc<dyn Directory>,
        documents: Arc<dyn DocumentStore>,
        detector: ConflictDetector,
        events: EventDispatcher,
    ) -> Self {
        Self {
            store,
            directory,
            documents,
            detector,
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn TransferStore> {
        &self.store
    }

    fn now(&self) -> DateTime<Utc> {
        self.detector.clock().now()
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Submit a new request in PENDING
    ///
    /// Runs every wizard step before anything is written; an uploaded
    /// document is stored only once the request is known to be valid and is
    /// removed again when the request cannot be written.
    pub async fn create(
        &self,
        actor: Actor,
        request: NewTransferRequest,
    ) -> Result<TransferRecord, BranchTransferError> {
        let ctx = StepContext {
            student: self.directory.student(request.student_id).await?,
            target_branch: self.directory.branch(request.target_branch_id).await?,
        };
        validation::validate_all(&request, &ctx)?;

        let Some(student) = ctx.student else {
            return Err(BranchTransferError::NotFound(format!(
                "Student {}",
                request.student_id
            )));
        };
        if !student.is_guardian(actor.user_id) {
            return Err(BranchTransferError::Authorization(format!(
                "user {} is not a guardian of student {}",
                actor.user_id, request.student_id
            )));
        }

        if let DocumentInput::Existing(document_id) = request.document
            && !self.documents.exists(document_id).await?
        {
            return Err(BranchTransferError::NotFound(format!(
                "Document {}",
                document_id
            )));
        }

        let mut tx = self.store.begin().await?;

        if let Some(open) = tx.open_request_for_student(request.student_id).await? {
            return Err(ValidationError::OpenRequestExists(open.request_id.to_string()).into());
        }

        let document_id: Option<DocumentId> = match request.document {
            DocumentInput::None => None,
            DocumentInput::Existing(id) => Some(id),
            DocumentInput::Upload(ref upload) => {
                Some(self.documents.save(upload.clone(), actor.user_id).await?)
            }
        };

        let record = TransferRecord::new(
            &request,
            student.branch_id,
            document_id,
            actor.user_id,
            self.now(),
        );
        let written = insert_new(tx, &record, actor).await;
        let staged = match written {
            Ok(staged) => staged,
            Err(e) => {
                if matches!(request.document, DocumentInput::Upload(_))
                    && let Some(document_id) = document_id
                {
                    self.discard_upload(document_id).await;
                }
                return Err(e);
            }
        };

        info!(
            request_id = %record.request_id,
            student_id = record.student_id,
            from_branch = record.current_branch_id,
            to_branch = record.target_branch_id,
            requested_by = actor.user_id,
            "Transfer request created"
        );
        self.dispatch(staged);

        Ok(record)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get(
        &self,
        actor: Actor,
        request_id: TransferRequestId,
    ) -> Result<TransferRecord, BranchTransferError> {
        let record = self.load(request_id).await?;
        self.ensure_visible(actor, &record).await?;
        Ok(record)
    }

    /// Requests visible to the caller, newest first
    pub async fn list(
        &self,
        actor: Actor,
        query: ListQuery,
    ) -> Result<Vec<TransferRecord>, BranchTransferError> {
        let mut filter = RequestFilter {
            status: query.status,
            student_id: query.student_id,
            limit: Some(query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)),
            ..Default::default()
        };

        match actor.role {
            Role::Parent => {
                filter.requested_by = Some(actor.user_id);
                filter.branch_ids = query.branch_id.map(|b| vec![b]);
            }
            Role::Manager => {
                let managed = self.directory.managed_branches(actor.user_id).await?;
                filter.branch_ids = match query.branch_id {
                    Some(branch_id) if !managed.contains(&branch_id) => {
                        return Err(BranchTransferError::Authorization(format!(
                            "user {} does not manage branch {}",
                            actor.user_id, branch_id
                        )));
                    }
                    Some(branch_id) => Some(vec![branch_id]),
                    None if managed.is_empty() => return Ok(Vec::new()),
                    None => Some(managed),
                };
            }
            Role::Admin => {
                filter.branch_ids = query.branch_id.map(|b| vec![b]);
            }
            Role::Staff => {
                return Err(BranchTransferError::Authorization(
                    "staff cannot access transfer requests".to_string(),
                ));
            }
        }

        self.store.list(&filter).await
    }

    /// On-demand conflict snapshot at the student's old branch
    ///
    /// Display only: approvals recompute the snapshot inside their own
    /// transaction.
    pub async fn conflicts(
        &self,
        actor: Actor,
        request_id: TransferRequestId,
    ) -> Result<ConflictSnapshot, BranchTransferError> {
        let record = self.load(request_id).await?;
        self.ensure_visible(actor, &record).await?;
        self.store
            .conflicts(
                record.student_id,
                record.current_branch_id,
                self.detector.local_now(),
            )
            .await
    }

    /// Viewable URL for a supporting document
    pub async fn document_url(
        &self,
        actor: Actor,
        document_id: DocumentId,
    ) -> Result<String, BranchTransferError> {
        let filter = RequestFilter {
            document_id: Some(document_id),
            limit: Some(1),
            ..Default::default()
        };
        let record = self
            .store
            .list(&filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BranchTransferError::NotFound(format!("Document {}", document_id)))?;
        self.ensure_visible(actor, &record).await?;

        self.documents
            .view_url(document_id)
            .await?
            .ok_or_else(|| BranchTransferError::NotFound(format!("Document {}", document_id)))
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Approve whichever step the request is waiting on
    ///
    /// The observed status only picks the phase; the phase re-checks it
    /// under lock, so a caller that loses a race gets a state error.
    pub async fn approve(
        &self,
        actor: Actor,
        request_id: TransferRequestId,
        decision: ApprovalDecision,
    ) -> Result<ApprovalOutcome, BranchTransferError> {
        let record = self.load(request_id).await?;
        match record.status {
            TransferStatus::Pending => {
                self.approve_as_current_branch(actor, request_id, decision)
                    .await
            }
            TransferStatus::ReadyToTransfer => {
                self.approve_as_target_branch(actor, request_id, decision)
                    .await
            }
            status => Err(BranchTransferError::State(format!(
                "request {} is {} and cannot be approved",
                request_id, status
            ))),
        }
    }

    /// PENDING -> READY_TO_TRANSFER, by a manager of the current branch
    pub async fn approve_as_current_branch(
        &self,
        actor: Actor,
        request_id: TransferRequestId,
        decision: ApprovalDecision,
    ) -> Result<ApprovalOutcome, BranchTransferError> {
        validation::validate_approval(&decision)?;

        let mut tx = self.store.begin().await?;
        let mut record = lock(tx.as_mut(), request_id).await?;
        expect_status(&record, TransferStatus::Pending, "approved by the current branch")?;
        self.authorize_manager(actor, record.current_branch_id)
            .await?;

        // Always recomputed here, never taken from the caller
        let snapshot = self
            .detector
            .snapshot(tx.as_mut(), record.student_id, record.current_branch_id)
            .await?;

        if decision.approve_only_if_no_conflicts && !snapshot.is_empty() {
            warn!(
                request_id = %request_id,
                conflicts = %snapshot.counts(),
                "Approval blocked by conflicts"
            );
            return Err(BranchTransferError::ConflictBlocked(snapshot.counts()));
        }

        let now = self.now();
        let summary = auto_cancel(tx.as_mut(), &record, &snapshot, &decision, now).await?;

        let mut change = StatusChange::new(TransferStatus::ReadyToTransfer, actor.user_id, now)
            .with_notes(decision.manager_notes.clone());
        change.refunded_amount = Some(summary.refunded_amount);

        cas(tx.as_mut(), &record, &change).await?;
        record.apply(&change);
        let notes = join_notes(decision.manager_notes, summary.untouched_remark());
        let staged = stage(tx.as_mut(), &record, Some(TransferStatus::Pending), actor, notes).await;
        tx.commit().await?;

        if summary.untouched.total() > 0 {
            warn!(
                request_id = %request_id,
                untouched = %summary.untouched,
                "Conflicts left at the old branch"
            );
        }
        info!(
            request_id = %request_id,
            decided_by = actor.user_id,
            cancelled = %summary.cancelled,
            refunded = %summary.refunded_amount,
            "Current branch approved transfer"
        );
        self.dispatch(staged);

        Ok(ApprovalOutcome {
            record,
            auto_cancel: Some(summary),
        })
    }

    /// READY_TO_TRANSFER -> APPROVED, by a manager of the target branch
    pub async fn approve_as_target_branch(
        &self,
        actor: Actor,
        request_id: TransferRequestId,
        decision: ApprovalDecision,
    ) -> Result<ApprovalOutcome, BranchTransferError> {
        validation::validate_approval(&decision)?;

        let mut tx = self.store.begin().await?;
        let mut record = lock(tx.as_mut(), request_id).await?;
        expect_status(
            &record,
            TransferStatus::ReadyToTransfer,
            "approved by the target branch",
        )?;
        self.authorize_manager(actor, record.target_branch_id)
            .await?;

        let now = self.now();
        let enrollment = Enrollment {
            request_id,
            source_student_id: record.student_id,
            branch_id: record.target_branch_id,
            school_id: record.target_school_id,
            student_level_id: record.target_student_level_id,
            enrolled_at: now,
        };
        let enrolled_student_id = tx
            .enroll_student(&enrollment)
            .await
            .map_err(|e| BranchTransferError::transition_failed("enrolling student", e))?;

        let mut change = StatusChange::new(TransferStatus::Approved, actor.user_id, now)
            .with_notes(decision.manager_notes.clone());
        change.enrolled_student_id = Some(enrolled_student_id);

        cas(tx.as_mut(), &record, &change).await?;
        record.apply(&change);
        let staged = stage(
            tx.as_mut(),
            &record,
            Some(TransferStatus::ReadyToTransfer),
            actor,
            decision.manager_notes,
        )
        .await;
        tx.commit().await?;

        info!(
            request_id = %request_id,
            decided_by = actor.user_id,
            enrolled_student_id,
            branch_id = record.target_branch_id,
            "Target branch approved transfer"
        );
        self.dispatch(staged);

        Ok(ApprovalOutcome {
            record,
            auto_cancel: None,
        })
    }

    /// PENDING | READY_TO_TRANSFER -> REJECTED, by the responsible branch
    pub async fn reject(
        &self,
        actor: Actor,
        request_id: TransferRequestId,
        decision: RejectionDecision,
    ) -> Result<TransferRecord, BranchTransferError> {
        validation::validate_rejection(&decision)?;

        let mut tx = self.store.begin().await?;
        let mut record = lock(tx.as_mut(), request_id).await?;
        let from = record.status;
        let Some(branch_id) = record.responsible_branch() else {
            return Err(BranchTransferError::State(format!(
                "request {} is {} and cannot be rejected",
                request_id, from
            )));
        };
        self.authorize_manager(actor, branch_id).await?;

        let mut change = StatusChange::new(TransferStatus::Rejected, actor.user_id, self.now())
            .with_notes(decision.manager_notes.clone());
        change.rejection_reason = Some(decision.rejection_reason.clone());

        cas(tx.as_mut(), &record, &change).await?;
        record.apply(&change);
        let notes = join_notes(Some(decision.rejection_reason), decision.manager_notes);
        let staged = stage(tx.as_mut(), &record, Some(from), actor, notes).await;
        tx.commit().await?;

        info!(
            request_id = %request_id,
            from = %from,
            decided_by = actor.user_id,
            branch_id,
            "Transfer request rejected"
        );
        self.dispatch(staged);

        Ok(record)
    }

    /// PENDING -> CANCELLED, by the original requester
    pub async fn cancel(
        &self,
        actor: Actor,
        request_id: TransferRequestId,
    ) -> Result<TransferRecord, BranchTransferError> {
        let mut tx = self.store.begin().await?;
        let mut record = lock(tx.as_mut(), request_id).await?;
        expect_status(&record, TransferStatus::Pending, "cancelled")?;
        if record.requested_by != actor.user_id {
            return Err(BranchTransferError::Authorization(format!(
                "only the requester can cancel request {}",
                request_id
            )));
        }

        let change = StatusChange::new(TransferStatus::Cancelled, actor.user_id, self.now());
        cas(tx.as_mut(), &record, &change).await?;
        record.apply(&change);
        let staged = stage(tx.as_mut(), &record, Some(TransferStatus::Pending), actor, None).await;
        tx.commit().await?;

        info!(request_id = %request_id, "Transfer request cancelled by requester");
        self.dispatch(staged);

        Ok(record)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn load(&self, request_id: TransferRequestId) -> Result<TransferRecord, BranchTransferError> {
        self.store.get(request_id).await?.ok_or_else(|| {
            BranchTransferError::NotFound(format!("Transfer request {}", request_id))
        })
    }

    /// Manager role plus scope over the specific branch
    async fn authorize_manager(
        &self,
        actor: Actor,
        branch_id: BranchId,
    ) -> Result<(), BranchTransferError> {
        if actor.role != Role::Manager {
            return Err(BranchTransferError::Authorization(format!(
                "role {} cannot decide transfer requests",
                actor.role
            )));
        }
        if !self.directory.manages(actor.user_id, branch_id).await? {
            return Err(BranchTransferError::Authorization(format!(
                "user {} does not manage branch {}",
                actor.user_id, branch_id
            )));
        }
        Ok(())
    }

    async fn ensure_visible(
        &self,
        actor: Actor,
        record: &TransferRecord,
    ) -> Result<(), BranchTransferError> {
        let visible = match actor.role {
            Role::Admin => true,
            Role::Parent => record.requested_by == actor.user_id,
            Role::Manager => {
                let managed = self.directory.managed_branches(actor.user_id).await?;
                managed.contains(&record.current_branch_id)
                    || managed.contains(&record.target_branch_id)
            }
            Role::Staff => false,
        };
        if visible {
            Ok(())
        } else {
            Err(BranchTransferError::Authorization(format!(
                "user {} cannot view request {}",
                actor.user_id, record.request_id
            )))
        }
    }

    /// Hand a committed transition to the delivery worker
    fn dispatch(&self, staged: StagedEvent) {
        if staged.in_outbox {
            self.events.wake();
        } else {
            self.events.publish(staged.event);
        }
    }

    /// The upload belongs to a request that was never committed
    async fn discard_upload(&self, document_id: DocumentId) {
        match self.documents.remove(document_id).await {
            Ok(()) => info!(
                document_id = %document_id,
                "Removed upload of uncommitted transfer request"
            ),
            Err(e) => warn!(
                document_id = %document_id,
                error = %e,
                "Orphaned supporting document"
            ),
        }
    }
}

/// A transition event and whether it reached the outbox
struct StagedEvent {
    event: TransitionEvent,
    in_outbox: bool,
}

/// Write the transition event into the outbox of the open transaction
///
/// A failed write is logged and never fails the transition; the event then
/// goes to the worker in memory.
async fn stage(
    tx: &mut dyn TransferTx,
    record: &TransferRecord,
    from: Option<TransferStatus>,
    actor: Actor,
    notes: Option<String>,
) -> StagedEvent {
    let occurred_at = record.decided_time.unwrap_or(record.created_time);
    let event = TransitionEvent::new(record, from, actor, notes, occurred_at);
    let in_outbox = match tx.stage_event(&event).await {
        Ok(()) => true,
        Err(e) => {
            error!(
                request_id = %record.request_id,
                event_id = %event.event_id,
                error = %e,
                "Outbox write failed, delivering from memory"
            );
            false
        }
    };
    StagedEvent { event, in_outbox }
}

async fn insert_new(
    mut tx: Box<dyn TransferTx>,
    record: &TransferRecord,
    actor: Actor,
) -> Result<StagedEvent, BranchTransferError> {
    tx.insert_request(record).await?;
    let staged = stage(
        tx.as_mut(),
        record,
        None,
        actor,
        record.request_reason.clone(),
    )
    .await;
    tx.commit().await?;
    Ok(staged)
}

async fn lock(
    tx: &mut dyn TransferTx,
    request_id: TransferRequestId,
) -> Result<TransferRecord, BranchTransferError> {
    tx.lock_request(request_id)
        .await?
        .ok_or_else(|| BranchTransferError::NotFound(format!("Transfer request {}", request_id)))
}

fn expect_status(
    record: &TransferRecord,
    expected: TransferStatus,
    action: &str,
) -> Result<(), BranchTransferError> {
    if record.status != expected {
        return Err(BranchTransferError::State(format!(
            "request {} is {} and cannot be {} (requires {})",
            record.request_id, record.status, action, expected
        )));
    }
    Ok(())
}

/// Status CAS; losing it means another caller transitioned first
async fn cas(
    tx: &mut dyn TransferTx,
    record: &TransferRecord,
    change: &StatusChange,
) -> Result<(), BranchTransferError> {
    debug_assert!(record.status.can_transition_to(change.to));
    if !tx
        .update_status_if(record.request_id, record.status, change)
        .await?
    {
        warn!(
            request_id = %record.request_id,
            expected = %record.status,
            to = %change.to,
            "Status CAS lost"
        );
        return Err(BranchTransferError::State(format!(
            "request {} changed concurrently",
            record.request_id
        )));
    }
    Ok(())
}

/// Cancel the flagged conflict categories and refund cancelled subscriptions
///
/// Any failure aborts the whole transition; the caller drops the transaction.
async fn auto_cancel(
    tx: &mut dyn TransferTx,
    record: &TransferRecord,
    snapshot: &ConflictSnapshot,
    decision: &ApprovalDecision,
    now: DateTime<Utc>,
) -> Result<AutoCancelSummary, BranchTransferError> {
    let counts = snapshot.counts();
    let mut summary = AutoCancelSummary::default();

    if decision.auto_cancel_subscriptions {
        for sub in &snapshot.active_subscriptions {
            tx.cancel_subscription(sub.subscription_id)
                .await
                .map_err(|e| BranchTransferError::transition_failed("cancelling subscriptions", e))?;

            let amount = refund::subscription_refund(sub);
            if amount > Decimal::ZERO {
                let entry = RefundEntry {
                    request_id: record.request_id,
                    subscription_id: sub.subscription_id,
                    student_id: record.student_id,
                    branch_id: record.current_branch_id,
                    amount,
                    issued_at: now,
                };
                tx.issue_refund(&entry)
                    .await
                    .map_err(|e| BranchTransferError::transition_failed("issuing refunds", e))?;
                summary.refunded_amount += amount;
            }
        }
        summary.cancelled.subscriptions = counts.subscriptions;
    } else {
        summary.untouched.subscriptions = counts.subscriptions;
    }

    if decision.auto_cancel_slots {
        for slot in &snapshot.future_slots {
            tx.cancel_slot(slot.slot_id)
                .await
                .map_err(|e| BranchTransferError::transition_failed("cancelling slots", e))?;
        }
        summary.cancelled.slots = counts.slots;
    } else {
        summary.untouched.slots = counts.slots;
    }

    if decision.auto_cancel_orders {
        for order in &snapshot.pending_orders {
            tx.cancel_order(order.order_id)
                .await
                .map_err(|e| BranchTransferError::transition_failed("cancelling orders", e))?;
        }
        summary.cancelled.orders = counts.orders;
    } else {
        summary.untouched.orders = counts.orders;
    }

    Ok(summary)
}

fn join_notes(first: Option<String>, second: Option<String>) -> Option<String> {
    match (first, second) {
        (Some(a), Some(b)) => Some(format!("{}\n{}", a, b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untouched_remark() {
        let mut summary = AutoCancelSummary::default();
        assert_eq!(summary.untouched_remark(), None);

        summary.untouched.slots = 2;
        assert_eq!(
            summary.untouched_remark().as_deref(),
            Some("Left at old branch: 0 active subscription(s), 2 future slot(s), 0 pending order(s)")
        );
    }

    #[test]
    fn test_join_notes() {
        assert_eq!(join_notes(None, None), None);
        assert_eq!(join_notes(Some("a".into()), None).as_deref(), Some("a"));
        assert_eq!(join_notes(None, Some("b".into())).as_deref(), Some("b"));
        assert_eq!(
            join_notes(Some("a".into()), Some("b".into())).as_deref(),
            Some("a\nb")
        );
    }
}
