//! Conflict Detector
//!
//! Reads a student's live operational state at a branch (active subscriptions,
//! future slots, pending orders) and turns it into a [`ConflictSnapshot`].
//!
//! The snapshot is always read through a [`TransferTx`] so that the counts an
//! approval acts on are the counts it saw. "Future" is judged in the branch's
//! local time (fixed UTC offset, +7 by default).

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::error::BranchTransferError;
use super::refund;
use super::store::TransferTx;
use super::types::{BranchId, StudentId};

// ============================================================================
// Snapshot
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSubscription {
    pub subscription_id: i64,
    pub package_name: String,
    pub price_final: Decimal,
    pub used_slots: u32,
    pub total_slots: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FutureSlot {
    pub slot_id: i64,
    pub timeframe_name: String,
    pub room_name: String,
    /// Branch-local start of the slot
    pub scheduled_at: NaiveDateTime,
}

impl FutureSlot {
    pub fn date(&self) -> NaiveDate {
        self.scheduled_at.date()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOrder {
    pub order_id: i64,
    pub item_count: u32,
    pub total_amount: Decimal,
    pub created_date: DateTime<Utc>,
}

/// Operational data at the old branch that a transfer would disrupt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictSnapshot {
    pub active_subscriptions: Vec<ActiveSubscription>,
    pub future_slots: Vec<FutureSlot>,
    pub pending_orders: Vec<PendingOrder>,
    pub estimated_refund_amount: Decimal,
}

impl ConflictSnapshot {
    pub fn new(
        active_subscriptions: Vec<ActiveSubscription>,
        future_slots: Vec<FutureSlot>,
        pending_orders: Vec<PendingOrder>,
    ) -> Self {
        let estimated_refund_amount = refund::estimate_total(&active_subscriptions);
        Self {
            active_subscriptions,
            future_slots,
            pending_orders,
            estimated_refund_amount,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.active_subscriptions.is_empty()
            && self.future_slots.is_empty()
            && self.pending_orders.is_empty()
    }

    pub fn counts(&self) -> ConflictCounts {
        ConflictCounts {
            subscriptions: self.active_subscriptions.len(),
            slots: self.future_slots.len(),
            orders: self.pending_orders.len(),
        }
    }
}

/// Per-category conflict counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConflictCounts {
    pub subscriptions: usize,
    pub slots: usize,
    pub orders: usize,
}

impl ConflictCounts {
    pub fn total(&self) -> usize {
        self.subscriptions + self.slots + self.orders
    }

    /// Number of non-empty categories
    pub fn categories(&self) -> usize {
        [self.subscriptions, self.slots, self.orders]
            .iter()
            .filter(|n| **n > 0)
            .count()
    }
}

impl fmt::Display for ConflictCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} active subscription(s), {} future slot(s), {} pending order(s)",
            self.subscriptions, self.slots, self.orders
        )
    }
}

// ============================================================================
// Operational rows (owned by the wider platform, read here)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Booked,
    Attended,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
}

macro_rules! status_str {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($s => Some($ty::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

status_str!(SubscriptionStatus { Active => "active", Expired => "expired", Cancelled => "cancelled" });
status_str!(SlotStatus { Booked => "booked", Attended => "attended", Cancelled => "cancelled" });
status_str!(OrderStatus { Pending => "pending", Paid => "paid", Cancelled => "cancelled" });

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRow {
    pub subscription_id: i64,
    pub student_id: StudentId,
    pub branch_id: BranchId,
    pub package_name: String,
    pub price_final: Decimal,
    pub used_slots: u32,
    pub total_slots: u32,
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRow {
    pub slot_id: i64,
    pub student_id: StudentId,
    pub branch_id: BranchId,
    pub timeframe_name: String,
    pub room_name: String,
    pub scheduled_at: NaiveDateTime,
    pub status: SlotStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRow {
    pub order_id: i64,
    pub student_id: StudentId,
    pub branch_id: BranchId,
    pub item_count: u32,
    pub total_amount: Decimal,
    pub created_date: DateTime<Utc>,
    pub status: OrderStatus,
}

/// Select the conflicting rows for `student_id` at `branch_id`
///
/// Slots count only when they start strictly after `local_now`.
pub fn detect(
    subscriptions: &[SubscriptionRow],
    slots: &[SlotRow],
    orders: &[OrderRow],
    student_id: StudentId,
    branch_id: BranchId,
    local_now: NaiveDateTime,
) -> ConflictSnapshot {
    let active_subscriptions = subscriptions
        .iter()
        .filter(|s| s.student_id == student_id && s.branch_id == branch_id)
        .filter(|s| s.status == SubscriptionStatus::Active)
        .map(|s| ActiveSubscription {
            subscription_id: s.subscription_id,
            package_name: s.package_name.clone(),
            price_final: s.price_final,
            used_slots: s.used_slots,
            total_slots: s.total_slots,
        })
        .collect();

    let mut future_slots: Vec<FutureSlot> = slots
        .iter()
        .filter(|s| s.student_id == student_id && s.branch_id == branch_id)
        .filter(|s| s.status == SlotStatus::Booked && s.scheduled_at > local_now)
        .map(|s| FutureSlot {
            slot_id: s.slot_id,
            timeframe_name: s.timeframe_name.clone(),
            room_name: s.room_name.clone(),
            scheduled_at: s.scheduled_at,
        })
        .collect();
    future_slots.sort_by_key(|s| s.scheduled_at);

    let pending_orders = orders
        .iter()
        .filter(|o| o.student_id == student_id && o.branch_id == branch_id)
        .filter(|o| o.status == OrderStatus::Pending)
        .map(|o| PendingOrder {
            order_id: o.order_id,
            item_count: o.item_count,
            total_amount: o.total_amount,
            created_date: o.created_date,
        })
        .collect();

    ConflictSnapshot::new(active_subscriptions, future_slots, pending_orders)
}

// ============================================================================
// Clock / branch time zone
// ============================================================================

/// Source of "now"
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed UTC offset every branch operates in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchTimeZone(FixedOffset);

impl BranchTimeZone {
    pub const DEFAULT_OFFSET_HOURS: i32 = 7;

    pub fn from_utc_offset_hours(hours: i32) -> Option<Self> {
        FixedOffset::east_opt(hours * 3600).map(Self)
    }

    pub fn offset(&self) -> FixedOffset {
        self.0
    }

    /// Wall-clock time at the branch
    pub fn local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.0).naive_local()
    }
}

impl Default for BranchTimeZone {
    fn default() -> Self {
        Self::from_utc_offset_hours(Self::DEFAULT_OFFSET_HOURS).unwrap_or(Self(Utc.fix()))
    }
}

// ============================================================================
// Detector
// ============================================================================

/// Computes conflict snapshots inside a transaction
pub struct ConflictDetector {
    clock: std::sync::Arc<dyn Clock>,
    time_zone: BranchTimeZone,
}

impl ConflictDetector {
    pub fn new(clock: std::sync::Arc<dyn Clock>, time_zone: BranchTimeZone) -> Self {
        Self { clock, time_zone }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn local_now(&self) -> NaiveDateTime {
        self.time_zone.local(self.clock.now())
    }

    /// Read the snapshot for `student_id` at `branch_id` through `tx`
    pub async fn snapshot(
        &self,
        tx: &mut dyn TransferTx,
        student_id: StudentId,
        branch_id: BranchId,
    ) -> Result<ConflictSnapshot, BranchTransferError> {
        let local_now = self.local_now();
        let snapshot = tx.conflicts(student_id, branch_id, local_now).await?;
        tracing::debug!(
            student_id,
            branch_id,
            local_now = %local_now,
            conflicts = %snapshot.counts(),
            refund = %snapshot.estimated_refund_amount,
            "Conflict snapshot computed"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|date| date.and_hms_opt(h, min, 0))
            .unwrap()
    }

    fn slot(id: i64, scheduled_at: NaiveDateTime, status: SlotStatus) -> SlotRow {
        SlotRow {
            slot_id: id,
            student_id: 1,
            branch_id: 10,
            timeframe_name: "Morning".to_string(),
            room_name: "Room A".to_string(),
            scheduled_at,
            status,
        }
    }

    fn subscription(id: i64, branch_id: BranchId, status: SubscriptionStatus) -> SubscriptionRow {
        SubscriptionRow {
            subscription_id: id,
            student_id: 1,
            branch_id,
            package_name: "Monthly".to_string(),
            price_final: Decimal::from(1_000_000),
            used_slots: 5,
            total_slots: 10,
            status,
        }
    }

    #[test]
    fn test_only_strictly_future_booked_slots() {
        let now = at(2024, 6, 1, 9, 0);
        let slots = vec![
            slot(1, at(2024, 6, 1, 8, 0), SlotStatus::Booked),
            slot(2, now, SlotStatus::Booked),
            slot(3, at(2024, 6, 1, 9, 1), SlotStatus::Booked),
            slot(4, at(2024, 6, 2, 8, 0), SlotStatus::Cancelled),
        ];

        let snapshot = detect(&[], &slots, &[], 1, 10, now);
        let ids: Vec<i64> = snapshot.future_slots.iter().map(|s| s.slot_id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn test_only_active_subscriptions_at_branch() {
        let subs = vec![
            subscription(1, 10, SubscriptionStatus::Active),
            subscription(2, 10, SubscriptionStatus::Expired),
            subscription(3, 11, SubscriptionStatus::Active),
        ];

        let snapshot = detect(&subs, &[], &[], 1, 10, at(2024, 1, 1, 0, 0));
        assert_eq!(snapshot.active_subscriptions.len(), 1);
        assert_eq!(snapshot.active_subscriptions[0].subscription_id, 1);
        assert_eq!(snapshot.estimated_refund_amount, Decimal::from(500_000));
        assert_eq!(snapshot.counts().categories(), 1);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = detect(&[], &[], &[], 1, 10, at(2024, 1, 1, 0, 0));
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.estimated_refund_amount, Decimal::ZERO);
        assert_eq!(snapshot.counts().total(), 0);
    }

    #[test]
    fn test_branch_local_time_is_utc_plus_seven() {
        let tz = BranchTimeZone::default();
        let instant = Utc.with_ymd_and_hms(2024, 6, 1, 20, 30, 0).unwrap();
        assert_eq!(tz.local(instant), at(2024, 6, 2, 3, 30));
    }

    #[test]
    fn test_slot_later_today_in_branch_time_is_future() {
        // 02:00 UTC is 09:00 at the branch; a 10:00 slot is still ahead
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 2, 0, 0).unwrap());
        let tz = BranchTimeZone::default();
        let local_now = tz.local(clock.now());

        let slots = vec![
            slot(1, at(2024, 6, 1, 8, 30), SlotStatus::Booked),
            slot(2, at(2024, 6, 1, 10, 0), SlotStatus::Booked),
        ];
        let snapshot = detect(&[], &slots, &[], 1, 10, local_now);
        assert_eq!(snapshot.future_slots.len(), 1);
        assert_eq!(snapshot.future_slots[0].slot_id, 2);
    }

    #[test]
    fn test_conflict_counts_display() {
        let counts = ConflictCounts {
            subscriptions: 2,
            slots: 1,
            orders: 0,
        };
        assert_eq!(
            counts.to_string(),
            "2 active subscription(s), 1 future slot(s), 0 pending order(s)"
        );
        assert_eq!(counts.categories(), 2);
    }
}
