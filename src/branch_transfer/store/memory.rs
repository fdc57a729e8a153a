//! In-memory transfer store
//!
//! Used when no PostgreSQL URL is configured and by the test suites.
//! A transaction holds the store mutex for its whole lifetime and works on a
//! copy of the state; `commit` swaps the copy in, dropping discards it.
//! Staged events live in the same state, so they share the transaction's
//! fate.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    DeliveryLeg, Enrollment, EventOutbox, OutboxEntry, RefundEntry, TransferStore, TransferTx,
};
use crate::branch_transfer::audit::TransitionEvent;
use crate::branch_transfer::conflicts::{
    self, ConflictSnapshot, OrderRow, OrderStatus, SlotRow, SlotStatus, SubscriptionRow,
    SubscriptionStatus,
};
use crate::branch_transfer::error::BranchTransferError;
use crate::branch_transfer::state::TransferStatus;
use crate::branch_transfer::types::{
    BranchId, RequestFilter, StatusChange, StudentId, TransferRecord, TransferRequestId,
};

/// First id handed out for students enrolled through a transfer
const ENROLLED_STUDENT_ID_BASE: StudentId = 100_000;

/// Everything the in-memory store holds
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub requests: BTreeMap<TransferRequestId, TransferRecord>,
    pub subscriptions: Vec<SubscriptionRow>,
    pub slots: Vec<SlotRow>,
    pub orders: Vec<OrderRow>,
    pub refunds: Vec<RefundEntry>,
    pub enrollments: Vec<(StudentId, Enrollment)>,
    pub outbox: Vec<OutboxEntry>,
    enrolled_count: i64,
}

impl MemoryState {
    pub fn subscription(&self, subscription_id: i64) -> Option<&SubscriptionRow> {
        self.subscriptions
            .iter()
            .find(|s| s.subscription_id == subscription_id)
    }

    pub fn slot(&self, slot_id: i64) -> Option<&SlotRow> {
        self.slots.iter().find(|s| s.slot_id == slot_id)
    }

    pub fn order(&self, order_id: i64) -> Option<&OrderRow> {
        self.orders.iter().find(|o| o.order_id == order_id)
    }
}

/// Test hooks applied to transactions begun after they are set
#[cfg(test)]
#[derive(Debug, Default, Clone, Copy)]
struct FaultPlan {
    /// Fail the n-th cancellation inside a transaction
    fail_cancellation_at: Option<usize>,
    fail_inserts: bool,
    fail_outbox: bool,
}

/// In-memory [`TransferStore`]
#[derive(Clone, Default)]
pub struct MemoryTransferStore {
    state: Arc<Mutex<MemoryState>>,
    #[cfg(test)]
    faults: Arc<std::sync::Mutex<FaultPlan>>,
}

impl MemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: MemoryState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            #[cfg(test)]
            faults: Arc::default(),
        }
    }

    pub async fn seed_subscription(&self, row: SubscriptionRow) {
        self.state.lock().await.subscriptions.push(row);
    }

    pub async fn seed_slot(&self, row: SlotRow) {
        self.state.lock().await.slots.push(row);
    }

    pub async fn seed_order(&self, row: OrderRow) {
        self.state.lock().await.orders.push(row);
    }

    /// Copy of the committed state
    pub async fn snapshot_state(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    #[cfg(test)]
    pub(crate) fn fail_cancellation_at(&self, nth: Option<usize>) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_cancellation_at = nth;
    }

    #[cfg(test)]
    pub(crate) fn fail_inserts(&self, fail: bool) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).fail_inserts = fail;
    }

    #[cfg(test)]
    pub(crate) fn fail_outbox_writes(&self, fail: bool) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).fail_outbox = fail;
    }
}

#[async_trait]
impl TransferStore for MemoryTransferStore {
    async fn begin(&self) -> Result<Box<dyn TransferTx>, BranchTransferError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            cancellations: 0,
            #[cfg(test)]
            faults: *self.faults.lock().unwrap_or_else(|e| e.into_inner()),
        }))
    }

    async fn get(
        &self,
        request_id: TransferRequestId,
    ) -> Result<Option<TransferRecord>, BranchTransferError> {
        Ok(self.state.lock().await.requests.get(&request_id).cloned())
    }

    async fn list(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<TransferRecord>, BranchTransferError> {
        let state = self.state.lock().await;
        let mut records: Vec<&TransferRecord> = state
            .requests
            .values()
            .filter(|r| filter.matches(r))
            .collect();
        // Ids carry random low bits, so they only break ties
        records.sort_by(|a, b| {
            b.created_time
                .cmp(&a.created_time)
                .then_with(|| b.request_id.cmp(&a.request_id))
        });
        Ok(records
            .into_iter()
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EventOutbox for MemoryTransferStore {
    async fn undelivered(&self, limit: usize) -> Result<Vec<OutboxEntry>, BranchTransferError> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|entry| !entry.is_complete())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_delivered(
        &self,
        event_id: ulid::Ulid,
        leg: DeliveryLeg,
    ) -> Result<(), BranchTransferError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state
            .outbox
            .iter_mut()
            .find(|entry| entry.event.event_id == event_id)
        {
            entry.mark_delivered(leg);
        }
        Ok(())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    cancellations: usize,
    #[cfg(test)]
    faults: FaultPlan,
}

impl MemoryTx {
    fn next_cancellation(&mut self) -> Result<(), BranchTransferError> {
        self.cancellations += 1;
        #[cfg(test)]
        if self.faults.fail_cancellation_at == Some(self.cancellations) {
            return Err(BranchTransferError::DatabaseError(format!(
                "injected failure on cancellation #{}",
                self.cancellations
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TransferTx for MemoryTx {
    async fn lock_request(
        &mut self,
        request_id: TransferRequestId,
    ) -> Result<Option<TransferRecord>, BranchTransferError> {
        Ok(self.working.requests.get(&request_id).cloned())
    }

    async fn open_request_for_student(
        &mut self,
        student_id: StudentId,
    ) -> Result<Option<TransferRecord>, BranchTransferError> {
        Ok(self
            .working
            .requests
            .values()
            .find(|r| r.student_id == student_id && r.status.is_open())
            .cloned())
    }

    async fn insert_request(&mut self, record: &TransferRecord) -> Result<(), BranchTransferError> {
        #[cfg(test)]
        if self.faults.fail_inserts {
            return Err(BranchTransferError::DatabaseError(
                "injected insert failure".to_string(),
            ));
        }
        if self.working.requests.contains_key(&record.request_id) {
            return Err(BranchTransferError::SystemError(format!(
                "duplicate request id {}",
                record.request_id
            )));
        }
        self.working
            .requests
            .insert(record.request_id, record.clone());
        Ok(())
    }

    async fn conflicts(
        &mut self,
        student_id: StudentId,
        branch_id: BranchId,
        local_now: NaiveDateTime,
    ) -> Result<ConflictSnapshot, BranchTransferError> {
        Ok(conflicts::detect(
            &self.working.subscriptions,
            &self.working.slots,
            &self.working.orders,
            student_id,
            branch_id,
            local_now,
        ))
    }

    async fn cancel_subscription(
        &mut self,
        subscription_id: i64,
    ) -> Result<(), BranchTransferError> {
        self.next_cancellation()?;
        let row = self
            .working
            .subscriptions
            .iter_mut()
            .find(|s| s.subscription_id == subscription_id)
            .ok_or_else(|| {
                BranchTransferError::NotFound(format!("Subscription {}", subscription_id))
            })?;
        if row.status != SubscriptionStatus::Active {
            return Err(BranchTransferError::State(format!(
                "subscription {} is {}",
                subscription_id,
                row.status.as_str()
            )));
        }
        row.status = SubscriptionStatus::Cancelled;
        Ok(())
    }

    async fn cancel_slot(&mut self, slot_id: i64) -> Result<(), BranchTransferError> {
        self.next_cancellation()?;
        let row = self
            .working
            .slots
            .iter_mut()
            .find(|s| s.slot_id == slot_id)
            .ok_or_else(|| BranchTransferError::NotFound(format!("Slot {}", slot_id)))?;
        if row.status != SlotStatus::Booked {
            return Err(BranchTransferError::State(format!(
                "slot {} is {}",
                slot_id,
                row.status.as_str()
            )));
        }
        row.status = SlotStatus::Cancelled;
        Ok(())
    }

    async fn cancel_order(&mut self, order_id: i64) -> Result<(), BranchTransferError> {
        self.next_cancellation()?;
        let row = self
            .working
            .orders
            .iter_mut()
            .find(|o| o.order_id == order_id)
            .ok_or_else(|| BranchTransferError::NotFound(format!("Order {}", order_id)))?;
        if row.status != OrderStatus::Pending {
            return Err(BranchTransferError::State(format!(
                "order {} is {}",
                order_id,
                row.status.as_str()
            )));
        }
        row.status = OrderStatus::Cancelled;
        Ok(())
    }

    async fn issue_refund(&mut self, refund: &RefundEntry) -> Result<(), BranchTransferError> {
        self.working.refunds.push(refund.clone());
        Ok(())
    }

    async fn enroll_student(
        &mut self,
        enrollment: &Enrollment,
    ) -> Result<StudentId, BranchTransferError> {
        self.working.enrolled_count += 1;
        let student_id = ENROLLED_STUDENT_ID_BASE + self.working.enrolled_count;
        self.working
            .enrollments
            .push((student_id, enrollment.clone()));
        Ok(student_id)
    }

    async fn update_status_if(
        &mut self,
        request_id: TransferRequestId,
        expected: TransferStatus,
        change: &StatusChange,
    ) -> Result<bool, BranchTransferError> {
        match self.working.requests.get_mut(&request_id) {
            Some(record) if record.status == expected => {
                record.apply(change);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stage_event(&mut self, event: &TransitionEvent) -> Result<(), BranchTransferError> {
        #[cfg(test)]
        if self.faults.fail_outbox {
            return Err(BranchTransferError::DatabaseError(
                "injected outbox failure".to_string(),
            ));
        }
        self.working.outbox.push(OutboxEntry::new(event.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), BranchTransferError> {
        let MemoryTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch_transfer::types::{Actor, NewTransferRequest};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn record(student_id: StudentId) -> TransferRecord {
        let req = NewTransferRequest {
            student_id,
            target_branch_id: 2,
            ..Default::default()
        };
        TransferRecord::new(&req, 1, None, 7, Utc::now())
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = MemoryTransferStore::new();
        let rec = record(1);

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_request(&rec).await.unwrap();
            // dropped without commit
        }
        assert!(store.get(rec.request_id).await.unwrap().is_none());

        let mut tx = store.begin().await.unwrap();
        tx.insert_request(&rec).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.get(rec.request_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_expected_status() {
        let store = MemoryTransferStore::new();
        let rec = record(1);
        let mut tx = store.begin().await.unwrap();
        tx.insert_request(&rec).await.unwrap();

        let change = StatusChange::new(TransferStatus::ReadyToTransfer, 100, Utc::now());
        assert!(
            tx.update_status_if(rec.request_id, TransferStatus::Pending, &change)
                .await
                .unwrap()
        );
        // Second CAS from PENDING loses
        assert!(
            !tx.update_status_if(rec.request_id, TransferStatus::Pending, &change)
                .await
                .unwrap()
        );
        tx.commit().await.unwrap();

        let stored = store.get(rec.request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::ReadyToTransfer);
    }

    #[tokio::test]
    async fn test_cancel_twice_fails() {
        let store = MemoryTransferStore::new();
        store
            .seed_subscription(SubscriptionRow {
                subscription_id: 5,
                student_id: 1,
                branch_id: 1,
                package_name: "Monthly".to_string(),
                price_final: Decimal::from(100),
                used_slots: 0,
                total_slots: 4,
                status: SubscriptionStatus::Active,
            })
            .await;

        let mut tx = store.begin().await.unwrap();
        tx.cancel_subscription(5).await.unwrap();
        let err = tx.cancel_subscription(5).await.unwrap_err();
        assert!(matches!(err, BranchTransferError::State(_)));
        let err = tx.cancel_subscription(6).await.unwrap_err();
        assert!(matches!(err, BranchTransferError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_newest_first_with_limit() {
        let store = MemoryTransferStore::new();
        let base = Utc::now();
        let mut tx = store.begin().await.unwrap();
        let mut by_time = Vec::new();
        // Inserted out of time order; ids are unrelated to creation time
        for (student, offset_ms) in [(1, 20), (2, 0), (3, 10)] {
            let mut rec = record(student);
            rec.created_time = base + chrono::Duration::milliseconds(offset_ms);
            by_time.push((offset_ms, rec.request_id));
            tx.insert_request(&rec).await.unwrap();
        }
        tx.commit().await.unwrap();

        let filter = RequestFilter {
            limit: Some(2),
            ..Default::default()
        };
        let listed: Vec<_> = store
            .list(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.request_id)
            .collect();
        by_time.sort();
        assert_eq!(listed, vec![by_time[2].1, by_time[1].1]);
    }

    #[tokio::test]
    async fn test_list_same_millisecond_breaks_ties_by_id() {
        let store = MemoryTransferStore::new();
        let created = Utc::now();
        let mut tx = store.begin().await.unwrap();
        let mut ids = Vec::new();
        for student in 1..=50 {
            let mut rec = record(student);
            rec.created_time = created;
            ids.push(rec.request_id);
            tx.insert_request(&rec).await.unwrap();
        }
        tx.commit().await.unwrap();

        let listed: Vec<_> = store
            .list(&RequestFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.request_id)
            .collect();
        ids.sort_by(|a, b| b.cmp(a));
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn test_staged_event_follows_transaction() {
        let store = MemoryTransferStore::new();
        let rec = record(4);
        let event = TransitionEvent::new(&rec, None, Actor::parent(7), None, rec.created_time);

        {
            let mut tx = store.begin().await.unwrap();
            tx.stage_event(&event).await.unwrap();
            // dropped without commit
        }
        assert!(store.undelivered(10).await.unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.stage_event(&event).await.unwrap();
        tx.commit().await.unwrap();

        let pending = store.undelivered(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.event_id, event.event_id);

        store
            .mark_delivered(event.event_id, DeliveryLeg::Audit)
            .await
            .unwrap();
        assert_eq!(store.undelivered(10).await.unwrap().len(), 1);
        store
            .mark_delivered(event.event_id, DeliveryLeg::Notify)
            .await
            .unwrap();
        assert!(store.undelivered(10).await.unwrap().is_empty());

        // Unknown ids are ignored
        store
            .mark_delivered(ulid::Ulid::new(), DeliveryLeg::Audit)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_request_lookup_ignores_terminal() {
        let store = MemoryTransferStore::new();
        let mut closed = record(9);
        closed.status = TransferStatus::Cancelled;

        let mut tx = store.begin().await.unwrap();
        tx.insert_request(&closed).await.unwrap();
        assert!(tx.open_request_for_student(9).await.unwrap().is_none());

        let open = record(9);
        tx.insert_request(&open).await.unwrap();
        let found = tx.open_request_for_student(9).await.unwrap().unwrap();
        assert_eq!(found.request_id, open.request_id);
    }
}
