//! Branch Transfer API Layer
//!
//! Request/response DTOs for the HTTP surface and the mapping from
//! [`BranchTransferError`] to status + numeric code. Money is rendered as
//! strings to avoid float precision issues.

use axum::http::StatusCode;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use super::conflicts::ConflictSnapshot;
use super::coordinator::{ApprovalOutcome, AutoCancelSummary};
use super::error::BranchTransferError;
use super::refund;
use super::state::TransferStatus;
use super::types::{
    ApprovalDecision, BranchId, ListQuery, RejectionDecision, StudentId, TransferRecord,
};

// ============================================================================
// Request bodies
// ============================================================================

/// Body of `POST /branch-transfer/requests/{id}/approve`
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequestBody {
    /// Must match the path id when present
    #[schema(example = "01JA0000000000000000000000")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub auto_cancel_subscriptions: bool,
    #[serde(default)]
    pub auto_cancel_slots: bool,
    #[serde(default)]
    pub auto_cancel_orders: bool,
    /// Refuse to approve while any conflict exists
    #[serde(default)]
    pub approve_only_if_no_conflicts: bool,
    #[validate(length(max = 2000))]
    pub manager_notes: Option<String>,
}

impl From<ApproveRequestBody> for ApprovalDecision {
    fn from(body: ApproveRequestBody) -> Self {
        Self {
            auto_cancel_subscriptions: body.auto_cancel_subscriptions,
            auto_cancel_slots: body.auto_cancel_slots,
            auto_cancel_orders: body.auto_cancel_orders,
            approve_only_if_no_conflicts: body.approve_only_if_no_conflicts,
            manager_notes: body.manager_notes,
        }
    }
}

/// Body of `POST /branch-transfer/requests/{id}/reject`
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RejectRequestBody {
    pub request_id: Option<String>,
    #[validate(length(max = 2000))]
    #[schema(example = "No capacity for this level")]
    #[serde(default)]
    pub rejection_reason: String,
    #[validate(length(max = 2000))]
    pub manager_notes: Option<String>,
}

impl From<RejectRequestBody> for RejectionDecision {
    fn from(body: RejectRequestBody) -> Self {
        Self {
            rejection_reason: body.rejection_reason,
            manager_notes: body.manager_notes,
        }
    }
}

/// Query string of `GET /branch-transfer/requests`
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ListRequestsParams {
    /// Only requests from or to this branch
    pub branch_id: Option<BranchId>,
    /// PENDING | READY_TO_TRANSFER | APPROVED | REJECTED | CANCELLED
    pub status: Option<String>,
    pub student_id: Option<StudentId>,
    pub limit: Option<usize>,
}

impl ListRequestsParams {
    pub fn into_query(self) -> Result<ListQuery, String> {
        let status = self
            .status
            .as_deref()
            .map(|s| TransferStatus::parse(s).ok_or_else(|| format!("Invalid status: {}", s)))
            .transpose()?;
        Ok(ListQuery {
            branch_id: self.branch_id,
            status,
            student_id: self.student_id,
            limit: self.limit,
        })
    }
}

// ============================================================================
// Response DTOs
// ============================================================================

/// Money on the wire: 2 decimal places
fn money(amount: Decimal) -> String {
    format!("{:.2}", amount)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequestDto {
    #[schema(example = "01JA0000000000000000000000")]
    pub request_id: String,
    pub student_id: StudentId,
    pub current_branch_id: BranchId,
    pub target_branch_id: BranchId,
    pub change_school: bool,
    pub target_school_id: Option<i64>,
    pub change_level: bool,
    pub target_student_level_id: Option<i64>,
    pub document_id: Option<String>,
    pub request_reason: Option<String>,
    #[schema(example = "PENDING")]
    pub status: String,
    pub rejection_reason: Option<String>,
    pub manager_notes: Option<String>,
    pub requested_by: i64,
    pub created_time: DateTime<Utc>,
    pub decided_by: Option<i64>,
    pub decided_time: Option<DateTime<Utc>>,
    #[schema(example = "1000000.00")]
    pub refunded_amount: Option<String>,
    pub enrolled_student_id: Option<StudentId>,
}

impl From<&TransferRecord> for TransferRequestDto {
    fn from(r: &TransferRecord) -> Self {
        Self {
            request_id: r.request_id.to_string(),
            student_id: r.student_id,
            current_branch_id: r.current_branch_id,
            target_branch_id: r.target_branch_id,
            change_school: r.change_school,
            target_school_id: r.target_school_id,
            change_level: r.change_level,
            target_student_level_id: r.target_student_level_id,
            document_id: r.document_id.map(|d| d.to_string()),
            request_reason: r.request_reason.clone(),
            status: r.status.as_str().to_string(),
            rejection_reason: r.rejection_reason.clone(),
            manager_notes: r.manager_notes.clone(),
            requested_by: r.requested_by,
            created_time: r.created_time,
            decided_by: r.decided_by,
            decided_time: r.decided_time,
            refunded_amount: r.refunded_amount.map(money),
            enrolled_student_id: r.enrolled_student_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSubscriptionDto {
    pub subscription_id: i64,
    pub package_name: String,
    pub price_final: String,
    pub used_slots: u32,
    pub total_slots: u32,
    /// Refund this subscription contributes
    pub estimated_refund: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FutureSlotDto {
    pub slot_id: i64,
    pub timeframe_name: String,
    pub room_name: String,
    pub date: NaiveDate,
    /// Branch-local start time
    pub scheduled_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrderDto {
    pub order_id: i64,
    pub item_count: u32,
    pub total_amount: String,
    pub created_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSnapshotDto {
    pub has_conflicts: bool,
    pub active_subscriptions: Vec<ActiveSubscriptionDto>,
    pub future_slots: Vec<FutureSlotDto>,
    pub pending_orders: Vec<PendingOrderDto>,
    #[schema(example = "1000000.00")]
    pub estimated_refund_amount: String,
}

impl From<&ConflictSnapshot> for ConflictSnapshotDto {
    fn from(s: &ConflictSnapshot) -> Self {
        Self {
            has_conflicts: !s.is_empty(),
            active_subscriptions: s
                .active_subscriptions
                .iter()
                .map(|sub| ActiveSubscriptionDto {
                    subscription_id: sub.subscription_id,
                    package_name: sub.package_name.clone(),
                    price_final: money(sub.price_final),
                    used_slots: sub.used_slots,
                    total_slots: sub.total_slots,
                    estimated_refund: money(refund::subscription_refund(sub)),
                })
                .collect(),
            future_slots: s
                .future_slots
                .iter()
                .map(|slot| FutureSlotDto {
                    slot_id: slot.slot_id,
                    timeframe_name: slot.timeframe_name.clone(),
                    room_name: slot.room_name.clone(),
                    date: slot.date(),
                    scheduled_at: slot.scheduled_at,
                })
                .collect(),
            pending_orders: s
                .pending_orders
                .iter()
                .map(|order| PendingOrderDto {
                    order_id: order.order_id,
                    item_count: order.item_count,
                    total_amount: money(order.total_amount),
                    created_date: order.created_date,
                })
                .collect(),
            estimated_refund_amount: money(s.estimated_refund_amount),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoCancelDto {
    pub cancelled_subscriptions: usize,
    pub cancelled_slots: usize,
    pub cancelled_orders: usize,
    pub untouched_subscriptions: usize,
    pub untouched_slots: usize,
    pub untouched_orders: usize,
    pub refunded_amount: String,
}

impl From<&AutoCancelSummary> for AutoCancelDto {
    fn from(s: &AutoCancelSummary) -> Self {
        Self {
            cancelled_subscriptions: s.cancelled.subscriptions,
            cancelled_slots: s.cancelled.slots,
            cancelled_orders: s.cancelled.orders,
            untouched_subscriptions: s.untouched.subscriptions,
            untouched_slots: s.untouched.slots,
            untouched_orders: s.untouched.orders,
            refunded_amount: money(s.refunded_amount),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponseDto {
    pub request: TransferRequestDto,
    /// Only for the current-branch approval
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_cancel: Option<AutoCancelDto>,
}

impl From<&ApprovalOutcome> for ApprovalResponseDto {
    fn from(o: &ApprovalOutcome) -> Self {
        Self {
            request: TransferRequestDto::from(&o.record),
            auto_cancel: o.auto_cancel.as_ref().map(AutoCancelDto::from),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUrlDto {
    pub document_id: String,
    pub url: String,
}

// ============================================================================
// Error Codes
// ============================================================================

pub mod error_codes {
    pub const VALIDATION_FAILED: i32 = 1001;
    pub const INVALID_PARAMETER: i32 = 1002;
    pub const OPEN_REQUEST_EXISTS: i32 = 1003;

    pub const MISSING_AUTH: i32 = 2001;
    pub const AUTH_FAILED: i32 = 2002;
    /// Authenticated, but not scoped to the branch or request
    pub const BRANCH_SCOPE_DENIED: i32 = 2003;

    pub const NOT_FOUND: i32 = 4004;
    pub const CONFLICT_BLOCKED: i32 = 4009;
    pub const INVALID_STATE_TRANSITION: i32 = 4010;

    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SERVICE_UNAVAILABLE: i32 = 5001;
    pub const TRANSITION_FAILED: i32 = 5002;
}

/// Map BranchTransferError to (StatusCode, error_code, message)
pub fn map_error(e: &BranchTransferError) -> (StatusCode, i32, String) {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let code = match e {
        BranchTransferError::Validation(v) if v.code() == "OPEN_REQUEST_EXISTS" => {
            error_codes::OPEN_REQUEST_EXISTS
        }
        BranchTransferError::Validation(_) => error_codes::VALIDATION_FAILED,
        BranchTransferError::Authorization(_) => error_codes::BRANCH_SCOPE_DENIED,
        BranchTransferError::NotFound(_) => error_codes::NOT_FOUND,
        BranchTransferError::ConflictBlocked(_) => error_codes::CONFLICT_BLOCKED,
        BranchTransferError::State(_) => error_codes::INVALID_STATE_TRANSITION,
        BranchTransferError::TransitionFailed { .. } => error_codes::TRANSITION_FAILED,
        BranchTransferError::DatabaseError(_) | BranchTransferError::SystemError(_) => {
            error_codes::INTERNAL_ERROR
        }
    };

    // Infrastructure details stay in the logs
    let msg = match e {
        BranchTransferError::DatabaseError(_) | BranchTransferError::SystemError(_) => {
            tracing::error!(error = %e, "Branch transfer internal error");
            "Internal error".to_string()
        }
        BranchTransferError::TransitionFailed { step, .. } => {
            tracing::error!(error = %e, "Branch transfer side effect failed");
            format!("Transition failed while {}; nothing was changed", step)
        }
        _ => format!("{}: {}", e.code(), e),
    };

    (status, code, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch_transfer::conflicts::ConflictCounts;
    use crate::branch_transfer::error::ValidationError;

    #[test]
    fn test_scope_denial_and_state_codes() {
        let (status, code, msg) =
            map_error(&BranchTransferError::Authorization("user 5 does not manage branch 2".into()));
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(code, error_codes::BRANCH_SCOPE_DENIED);
        assert!(msg.starts_with("BRANCH_SCOPE_DENIED"));

        let (status, code, _) = map_error(&BranchTransferError::State("x".into()));
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, error_codes::INVALID_STATE_TRANSITION);

        let (status, code, _) =
            map_error(&BranchTransferError::ConflictBlocked(ConflictCounts::default()));
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, error_codes::CONFLICT_BLOCKED);
    }

    #[test]
    fn test_validation_codes() {
        let (status, code, msg) = map_error(&ValidationError::MissingDocument.into());
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code, error_codes::VALIDATION_FAILED);
        assert!(msg.starts_with("MISSING_DOCUMENT"));

        let (_, code, _) = map_error(&ValidationError::OpenRequestExists("x".into()).into());
        assert_eq!(code, error_codes::OPEN_REQUEST_EXISTS);
    }

    #[test]
    fn test_internal_errors_are_masked() {
        let (status, code, msg) =
            map_error(&BranchTransferError::DatabaseError("password leaked".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(code, error_codes::INTERNAL_ERROR);
        assert_eq!(msg, "Internal error");
    }

    #[test]
    fn test_approve_body_defaults_and_caps() {
        let body: ApproveRequestBody =
            serde_json::from_str(r#"{"autoCancelSubscriptions": true}"#).unwrap();
        assert!(body.auto_cancel_subscriptions);
        assert!(!body.approve_only_if_no_conflicts);
        assert!(body.validate().is_ok());

        let body = ApproveRequestBody {
            manager_notes: Some("n".repeat(2001)),
            ..Default::default()
        };
        assert!(body.validate().is_err());
    }

    #[test]
    fn test_list_params_status_parsing() {
        let params = ListRequestsParams {
            status: Some("ready_to_transfer".into()),
            ..Default::default()
        };
        assert_eq!(
            params.into_query().unwrap().status,
            Some(TransferStatus::ReadyToTransfer)
        );

        let params = ListRequestsParams {
            status: Some("DONE".into()),
            ..Default::default()
        };
        assert!(params.into_query().is_err());
    }

    #[test]
    fn test_money_has_two_decimals() {
        assert_eq!(money(Decimal::from(500_000)), "500000.00");
        assert_eq!(money(Decimal::new(33333333, 2)), "333333.33");
        assert_eq!(money(Decimal::ZERO), "0.00");
    }
}
