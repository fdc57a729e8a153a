//! Refund Estimator
//!
//! Pro-rata refund of unused slots:
//!
//! ```text
//! refund_i = priceFinal_i × max(0, totalSlots_i − usedSlots_i) / totalSlots_i
//! total    = Σ refund_i   (active subscriptions only)
//! ```
//!
//! Each term is rounded to 2 decimal places (midpoint away from zero).
//! A subscription with `totalSlots = 0` refunds nothing.

use rust_decimal::{Decimal, RoundingStrategy};

use super::conflicts::ActiveSubscription;

/// Decimal places kept on a refund amount
pub const REFUND_SCALE: u32 = 2;

/// Slots the student has paid for but not used
#[inline]
pub fn remaining_slots(used_slots: u32, total_slots: u32) -> u32 {
    total_slots.saturating_sub(used_slots)
}

/// Refund for a single subscription
pub fn subscription_refund(subscription: &ActiveSubscription) -> Decimal {
    if subscription.total_slots == 0 || subscription.price_final <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let remaining = remaining_slots(subscription.used_slots, subscription.total_slots);
    if remaining == 0 {
        return Decimal::ZERO;
    }

    // Multiply first so whole-unit prices stay exact
    let refund = subscription.price_final * Decimal::from(remaining)
        / Decimal::from(subscription.total_slots);
    refund.round_dp_with_strategy(REFUND_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Sum of refunds across all active subscriptions
pub fn estimate_total(subscriptions: &[ActiveSubscription]) -> Decimal {
    subscriptions.iter().map(subscription_refund).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(price: i64, used: u32, total: u32) -> ActiveSubscription {
        ActiveSubscription {
            subscription_id: 1,
            package_name: "Package".to_string(),
            price_final: Decimal::from(price),
            used_slots: used,
            total_slots: total,
        }
    }

    #[test]
    fn test_fully_used_refunds_nothing() {
        assert_eq!(subscription_refund(&sub(800_000, 8, 8)), Decimal::ZERO);
    }

    #[test]
    fn test_fully_unused_refunds_price() {
        assert_eq!(
            subscription_refund(&sub(500_000, 0, 5)),
            Decimal::from(500_000)
        );
    }

    #[test]
    fn test_overused_is_floored_at_zero() {
        assert_eq!(subscription_refund(&sub(300_000, 12, 10)), Decimal::ZERO);
    }

    #[test]
    fn test_zero_total_slots() {
        assert_eq!(subscription_refund(&sub(300_000, 0, 0)), Decimal::ZERO);
    }

    #[test]
    fn test_scenario_total() {
        // 1,000,000 × 5/10 + 500,000 × 5/5
        let subs = vec![sub(1_000_000, 5, 10), sub(500_000, 0, 5)];
        assert_eq!(estimate_total(&subs), Decimal::from(1_000_000));
    }

    #[test]
    fn test_rounding_to_two_places() {
        // 100 × 2/3 = 66.666…
        assert_eq!(subscription_refund(&sub(100, 1, 3)), Decimal::new(6667, 2));
    }

    #[test]
    fn test_empty_total() {
        assert_eq!(estimate_total(&[]), Decimal::ZERO);
    }
}
