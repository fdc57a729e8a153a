//! Branch transfer handlers
//!
//! Thin HTTP adapters over [`TransferCoordinator`](crate::branch_transfer::TransferCoordinator):
//! parse, call, wrap. Every status decision is made by the coordinator.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
};
use validator::Validate;

use crate::branch_transfer::api::{
    ApprovalResponseDto, ApproveRequestBody, ConflictSnapshotDto, DocumentUrlDto,
    ListRequestsParams, RejectRequestBody, TransferRequestDto,
};
use crate::branch_transfer::{
    Actor, DocumentId, DocumentInput, DocumentUpload, NewTransferRequest, TransferRequestId,
};

use super::super::state::AppState;
use super::super::types::{ApiError, ApiResult, error_codes, ok};

// ============================================================================
// Create (multipart)
// ============================================================================

/// Fields of the multipart create form, as received
#[derive(Debug, Default)]
pub struct CreateRequestForm {
    student_id: Option<String>,
    target_branch_id: Option<String>,
    change_school: Option<String>,
    change_level: Option<String>,
    target_school_id: Option<String>,
    target_student_level_id: Option<String>,
    request_reason: Option<String>,
    document_id: Option<String>,
    document: Option<DocumentUpload>,
}

impl CreateRequestForm {
    /// Record a text part; unknown parts are ignored
    pub fn set_text(&mut self, name: &str, value: String) {
        let slot = match name.to_ascii_lowercase().as_str() {
            "studentid" => &mut self.student_id,
            "targetbranchid" => &mut self.target_branch_id,
            "changeschool" => &mut self.change_school,
            "changelevel" => &mut self.change_level,
            "targetschoolid" => &mut self.target_school_id,
            "targetstudentlevelid" => &mut self.target_student_level_id,
            "requestreason" => &mut self.request_reason,
            "documentid" => &mut self.document_id,
            other => {
                tracing::debug!(field = other, "Ignoring unknown form field");
                return;
            }
        };
        *slot = Some(value);
    }

    pub fn set_document(&mut self, upload: DocumentUpload) {
        self.document = Some(upload);
    }

    pub fn into_request(self) -> Result<NewTransferRequest, ApiError> {
        let document = match (self.document, non_empty(self.document_id)) {
            (Some(upload), _) => DocumentInput::Upload(upload),
            (None, Some(id)) => DocumentInput::Existing(
                id.parse::<DocumentId>()
                    .map_err(|_| ApiError::bad_request("Invalid DocumentId format"))?,
            ),
            (None, None) => DocumentInput::None,
        };

        Ok(NewTransferRequest {
            student_id: required_id("StudentId", self.student_id)?,
            target_branch_id: required_id("TargetBranchId", self.target_branch_id)?,
            change_school: parse_flag("ChangeSchool", self.change_school)?,
            change_level: parse_flag("ChangeLevel", self.change_level)?,
            target_school_id: optional_id("TargetSchoolId", self.target_school_id)?,
            target_student_level_id: optional_id(
                "TargetStudentLevelId",
                self.target_student_level_id,
            )?,
            document,
            request_reason: non_empty(self.request_reason),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn optional_id(field: &str, value: Option<String>) -> Result<Option<i64>, ApiError> {
    non_empty(value)
        .map(|v| {
            v.trim()
                .parse::<i64>()
                .map_err(|_| ApiError::bad_request(format!("Invalid {}: {}", field, v)))
        })
        .transpose()
}

fn required_id(field: &str, value: Option<String>) -> Result<i64, ApiError> {
    optional_id(field, value)?.ok_or_else(|| ApiError::bad_request(format!("{} is required", field)))
}

fn parse_flag(field: &str, value: Option<String>) -> Result<bool, ApiError> {
    match non_empty(value) {
        None => Ok(false),
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "on" => Ok(true),
            "false" | "0" | "off" => Ok(false),
            _ => ApiError::bad_request(format!("Invalid {}: {}", field, v)).into_err(),
        },
    }
}

async fn read_form(mut multipart: Multipart) -> Result<CreateRequestForm, ApiError> {
    let mut form = CreateRequestForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Malformed multipart body: {}", e)))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };

        if name.eq_ignore_ascii_case("DocumentFile") {
            let file_name = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("Failed to read DocumentFile: {}", e)))?;
            // Browsers send an empty part when no file was picked
            if bytes.is_empty() && file_name.as_deref().is_none_or(str::is_empty) {
                continue;
            }
            form.set_document(DocumentUpload {
                file_name,
                content_type,
                bytes: bytes.to_vec(),
            });
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::bad_request(format!("Failed to read {}: {}", name, e)))?;
            form.set_text(&name, value);
        }
    }

    Ok(form)
}

/// Submit a transfer request
///
/// POST /api/v1/branch-transfer/request
#[utoipa::path(
    post,
    path = "/api/v1/branch-transfer/request",
    request_body(
        content = String,
        description = "Multipart form: StudentId, TargetBranchId, ChangeSchool, ChangeLevel, TargetSchoolId?, TargetStudentLevelId?, DocumentFile?, RequestReason?",
        content_type = "multipart/form-data"
    ),
    responses(
        (status = 200, description = "Request created in PENDING", body = TransferRequestDto),
        (status = 400, description = "Validation failed or an open request already exists"),
        (status = 401, description = "Not authenticated, or not a guardian of the student")
    ),
    security(("bearer_jwt" = [])),
    tag = "Branch Transfer"
)]
pub async fn create_request(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    multipart: Multipart,
) -> ApiResult<TransferRequestDto> {
    let request = read_form(multipart).await?.into_request()?;
    let record = state.coordinator.create(actor, request).await?;
    ok(TransferRequestDto::from(&record))
}

// ============================================================================
// Reads
// ============================================================================

/// List transfer requests visible to the caller
///
/// GET /api/v1/branch-transfer/requests
#[utoipa::path(
    get,
    path = "/api/v1/branch-transfer/requests",
    params(ListRequestsParams),
    responses(
        (status = 200, description = "Requests, newest first", body = Vec<TransferRequestDto>),
        (status = 400, description = "Invalid filter"),
        (status = 401, description = "Not authenticated or branch out of scope")
    ),
    security(("bearer_jwt" = [])),
    tag = "Branch Transfer"
)]
pub async fn list_requests(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Query(params): Query<ListRequestsParams>,
) -> ApiResult<Vec<TransferRequestDto>> {
    let query = params.into_query().map_err(ApiError::bad_request)?;
    let records = state.coordinator.list(actor, query).await?;
    ok(records.iter().map(TransferRequestDto::from).collect())
}

/// Get a single transfer request
///
/// GET /api/v1/branch-transfer/requests/{request_id}
#[utoipa::path(
    get,
    path = "/api/v1/branch-transfer/requests/{request_id}",
    params(("request_id" = String, Path, description = "Transfer request ID (ULID format)")),
    responses(
        (status = 200, description = "Request detail", body = TransferRequestDto),
        (status = 400, description = "Invalid request ID format"),
        (status = 401, description = "Not authenticated or not visible to the caller"),
        (status = 404, description = "Request not found")
    ),
    security(("bearer_jwt" = [])),
    tag = "Branch Transfer"
)]
pub async fn get_request(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(request_id): Path<String>,
) -> ApiResult<TransferRequestDto> {
    let request_id = parse_request_id(&request_id)?;
    let record = state.coordinator.get(actor, request_id).await?;
    ok(TransferRequestDto::from(&record))
}

/// Conflict snapshot at the student's current branch
///
/// GET /api/v1/branch-transfer/requests/{request_id}/conflicts
#[utoipa::path(
    get,
    path = "/api/v1/branch-transfer/requests/{request_id}/conflicts",
    params(("request_id" = String, Path, description = "Transfer request ID (ULID format)")),
    responses(
        (status = 200, description = "Active subscriptions, future slots, pending orders and estimated refund", body = ConflictSnapshotDto),
        (status = 401, description = "Not authenticated or not visible to the caller"),
        (status = 404, description = "Request not found")
    ),
    security(("bearer_jwt" = [])),
    tag = "Branch Transfer"
)]
pub async fn get_conflicts(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(request_id): Path<String>,
) -> ApiResult<ConflictSnapshotDto> {
    let request_id = parse_request_id(&request_id)?;
    let snapshot = state.coordinator.conflicts(actor, request_id).await?;
    ok(ConflictSnapshotDto::from(&snapshot))
}

/// Viewable URL of a supporting document
///
/// GET /api/v1/branch-transfer/documents/{document_id}/image
#[utoipa::path(
    get,
    path = "/api/v1/branch-transfer/documents/{document_id}/image",
    params(("document_id" = String, Path, description = "Document ID (ULID format)")),
    responses(
        (status = 200, description = "Document URL", body = DocumentUrlDto),
        (status = 401, description = "Not authenticated or not visible to the caller"),
        (status = 404, description = "Document not found")
    ),
    security(("bearer_jwt" = [])),
    tag = "Branch Transfer"
)]
pub async fn get_document_image(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(document_id): Path<String>,
) -> ApiResult<DocumentUrlDto> {
    let document_id: DocumentId = document_id
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid document ID format"))?;
    let url = state.coordinator.document_url(actor, document_id).await?;
    ok(DocumentUrlDto {
        document_id: document_id.to_string(),
        url,
    })
}

// ============================================================================
// Transitions
// ============================================================================

/// Requester cancels a PENDING request
///
/// DELETE /api/v1/branch-transfer/requests/{request_id}
#[utoipa::path(
    delete,
    path = "/api/v1/branch-transfer/requests/{request_id}",
    params(("request_id" = String, Path, description = "Transfer request ID (ULID format)")),
    responses(
        (status = 200, description = "Request cancelled", body = TransferRequestDto),
        (status = 401, description = "Not the requester"),
        (status = 404, description = "Request not found"),
        (status = 409, description = "Request is no longer PENDING")
    ),
    security(("bearer_jwt" = [])),
    tag = "Branch Transfer"
)]
pub async fn cancel_request(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(request_id): Path<String>,
) -> ApiResult<TransferRequestDto> {
    let request_id = parse_request_id(&request_id)?;
    let record = state.coordinator.cancel(actor, request_id).await?;
    ok(TransferRequestDto::from(&record))
}

/// Approve the step the request is waiting on
///
/// POST /api/v1/branch-transfer/requests/{request_id}/approve
#[utoipa::path(
    post,
    path = "/api/v1/branch-transfer/requests/{request_id}/approve",
    params(("request_id" = String, Path, description = "Transfer request ID (ULID format)")),
    request_body = ApproveRequestBody,
    responses(
        (status = 200, description = "Approved; includes the auto-cancel summary at the current-branch step", body = ApprovalResponseDto),
        (status = 400, description = "Invalid body"),
        (status = 401, description = "Caller does not manage the responsible branch"),
        (status = 404, description = "Request not found"),
        (status = 409, description = "Blocked by conflicts or invalid state"),
        (status = 500, description = "A side effect failed; nothing was changed")
    ),
    security(("bearer_jwt" = [])),
    tag = "Branch Transfer"
)]
pub async fn approve_request(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(request_id): Path<String>,
    Json(body): Json<ApproveRequestBody>,
) -> ApiResult<ApprovalResponseDto> {
    let request_id = parse_request_id(&request_id)?;
    validate_body(&body)?;
    check_body_id(body.request_id.as_deref(), request_id)?;

    let outcome = state
        .coordinator
        .approve(actor, request_id, body.into())
        .await?;
    ok(ApprovalResponseDto::from(&outcome))
}

/// Reject a PENDING or READY_TO_TRANSFER request
///
/// POST /api/v1/branch-transfer/requests/{request_id}/reject
#[utoipa::path(
    post,
    path = "/api/v1/branch-transfer/requests/{request_id}/reject",
    params(("request_id" = String, Path, description = "Transfer request ID (ULID format)")),
    request_body = RejectRequestBody,
    responses(
        (status = 200, description = "Request rejected", body = TransferRequestDto),
        (status = 400, description = "Missing rejection reason or invalid body"),
        (status = 401, description = "Caller does not manage the responsible branch"),
        (status = 404, description = "Request not found"),
        (status = 409, description = "Request is already terminal")
    ),
    security(("bearer_jwt" = [])),
    tag = "Branch Transfer"
)]
pub async fn reject_request(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(request_id): Path<String>,
    Json(body): Json<RejectRequestBody>,
) -> ApiResult<TransferRequestDto> {
    let request_id = parse_request_id(&request_id)?;
    validate_body(&body)?;
    check_body_id(body.request_id.as_deref(), request_id)?;

    let record = state
        .coordinator
        .reject(actor, request_id, body.into())
        .await?;
    ok(TransferRequestDto::from(&record))
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_request_id(raw: &str) -> Result<TransferRequestId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("Invalid request ID format"))
}

fn validate_body(body: &impl Validate) -> Result<(), ApiError> {
    body.validate().map_err(|e| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            error_codes::VALIDATION_FAILED,
            format!("VALIDATION_FAILED: {}", e),
        )
    })
}

/// The body may repeat the path id; it must not contradict it
fn check_body_id(body_id: Option<&str>, path_id: TransferRequestId) -> Result<(), ApiError> {
    match body_id {
        Some(raw) if !raw.is_empty() && parse_request_id(raw)? != path_id => {
            ApiError::bad_request("requestId in body does not match the path").into_err()
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch_transfer::conflicts::{SubscriptionRow, SubscriptionStatus};
    use crate::branch_transfer::directory::{BranchProfile, StudentProfile};
    use crate::branch_transfer::{
        BranchTimeZone, ConflictDetector, EventDispatcher, MemoryDocumentStore,
        MemoryTransferStore, StaticDirectory, SystemClock, TransferCoordinator,
    };
    use crate::gateway::auth::JwtVerifier;
    use rust_decimal::Decimal;

    const PARENT: i64 = 7;
    const OLD_MANAGER: i64 = 100;

    async fn test_state() -> Arc<AppState> {
        let directory = StaticDirectory::new()
            .with_branch(BranchProfile {
                branch_id: 1,
                name: "Downtown".to_string(),
                school_ids: vec![],
                student_level_ids: vec![],
            })
            .with_branch(BranchProfile {
                branch_id: 2,
                name: "Riverside".to_string(),
                school_ids: vec![200],
                student_level_ids: vec![3],
            })
            .with_student(StudentProfile {
                student_id: 42,
                branch_id: 1,
                guardian_ids: vec![PARENT],
            })
            .with_manager(OLD_MANAGER, 1);

        let store = MemoryTransferStore::new();
        store
            .seed_subscription(SubscriptionRow {
                subscription_id: 1,
                student_id: 42,
                branch_id: 1,
                package_name: "Monthly 10".to_string(),
                price_final: Decimal::from(1_000_000),
                used_slots: 5,
                total_slots: 10,
                status: SubscriptionStatus::Active,
            })
            .await;

        // Events go nowhere in these tests
        let (events, _rx) = EventDispatcher::channel();
        let coordinator = TransferCoordinator::new(
            Arc::new(store),
            Arc::new(directory),
            Arc::new(MemoryDocumentStore::default()),
            ConflictDetector::new(Arc::new(SystemClock), BranchTimeZone::default()),
            events,
        );

        Arc::new(AppState::new(
            Arc::new(coordinator),
            Arc::new(JwtVerifier::new("test-secret")),
        ))
    }

    fn form(fields: &[(&str, &str)]) -> CreateRequestForm {
        let mut form = CreateRequestForm::default();
        for (name, value) in fields {
            form.set_text(name, value.to_string());
        }
        form
    }

    async fn create(state: &Arc<AppState>) -> TransferRequestDto {
        let request = form(&[("StudentId", "42"), ("TargetBranchId", "2")])
            .into_request()
            .unwrap();
        let record = state
            .coordinator
            .create(Actor::parent(PARENT), request)
            .await
            .unwrap();
        TransferRequestDto::from(&record)
    }

    #[test]
    fn test_form_parsing() {
        let request = form(&[
            ("StudentId", "42"),
            ("TargetBranchId", "2"),
            ("ChangeSchool", "true"),
            ("TargetSchoolId", "200"),
            ("ChangeLevel", "False"),
            ("TargetStudentLevelId", ""),
            ("RequestReason", "Moving"),
            ("Unrelated", "x"),
        ])
        .into_request()
        .unwrap();

        assert_eq!(request.student_id, 42);
        assert!(request.change_school);
        assert_eq!(request.target_school_id, Some(200));
        assert!(!request.change_level);
        assert_eq!(request.target_student_level_id, None);
        assert_eq!(request.request_reason.as_deref(), Some("Moving"));
        assert!(!request.document.is_provided());
    }

    #[test]
    fn test_form_rejects_bad_input() {
        let err = form(&[("TargetBranchId", "2")]).into_request().unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.msg, "StudentId is required");

        let err = form(&[("StudentId", "abc"), ("TargetBranchId", "2")])
            .into_request()
            .unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_PARAMETER);

        assert!(
            form(&[
                ("StudentId", "42"),
                ("TargetBranchId", "2"),
                ("ChangeLevel", "maybe")
            ])
            .into_request()
            .is_err()
        );
    }

    #[test]
    fn test_form_document_sources() {
        let mut f = form(&[("StudentId", "42"), ("TargetBranchId", "2")]);
        f.set_document(DocumentUpload {
            file_name: Some("letter.pdf".to_string()),
            content_type: None,
            bytes: vec![1, 2, 3],
        });
        assert!(matches!(
            f.into_request().unwrap().document,
            DocumentInput::Upload(_)
        ));

        let id = DocumentId::new().to_string();
        let request = form(&[("StudentId", "42"), ("TargetBranchId", "2"), ("DocumentId", id.as_str())])
            .into_request()
            .unwrap();
        assert!(matches!(request.document, DocumentInput::Existing(_)));
    }

    #[test]
    fn test_body_id_must_match_path() {
        let path = TransferRequestId::new();
        assert!(check_body_id(None, path).is_ok());
        assert!(check_body_id(Some(""), path).is_ok());
        assert!(check_body_id(Some(&path.to_string()), path).is_ok());
        assert!(check_body_id(Some(&TransferRequestId::new().to_string()), path).is_err());
        assert!(check_body_id(Some("garbage"), path).is_err());
    }

    #[tokio::test]
    async fn test_approve_handler() {
        let state = test_state().await;
        let created = create(&state).await;

        let body = ApproveRequestBody {
            request_id: Some(created.request_id.clone()),
            auto_cancel_subscriptions: true,
            ..Default::default()
        };
        let Json(resp) = approve_request(
            State(state.clone()),
            Extension(Actor::manager(OLD_MANAGER)),
            Path(created.request_id.clone()),
            Json(body),
        )
        .await
        .unwrap();

        assert_eq!(resp.code, 0);
        let data = resp.data.unwrap();
        assert_eq!(data.request.status, "READY_TO_TRANSFER");
        assert_eq!(data.request.refunded_amount.as_deref(), Some("500000.00"));
        assert_eq!(data.auto_cancel.unwrap().cancelled_subscriptions, 1);
    }

    #[tokio::test]
    async fn test_reject_handler_requires_reason() {
        let state = test_state().await;
        let created = create(&state).await;

        let err = reject_request(
            State(state.clone()),
            Extension(Actor::manager(OLD_MANAGER)),
            Path(created.request_id.clone()),
            Json(RejectRequestBody::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, error_codes::VALIDATION_FAILED);

        let Json(resp) = get_request(
            State(state),
            Extension(Actor::parent(PARENT)),
            Path(created.request_id),
        )
        .await
        .unwrap();
        assert_eq!(resp.data.unwrap().status, "PENDING");
    }

    #[tokio::test]
    async fn test_conflicts_and_scope() {
        let state = test_state().await;
        let created = create(&state).await;

        let Json(resp) = get_conflicts(
            State(state.clone()),
            Extension(Actor::manager(OLD_MANAGER)),
            Path(created.request_id.clone()),
        )
        .await
        .unwrap();
        let snapshot = resp.data.unwrap();
        assert!(snapshot.has_conflicts);
        assert_eq!(snapshot.estimated_refund_amount, "500000.00");

        let err = get_conflicts(
            State(state),
            Extension(Actor::manager(999)),
            Path(created.request_id),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.code, error_codes::BRANCH_SCOPE_DENIED);
    }

    #[tokio::test]
    async fn test_cancel_and_list_handlers() {
        let state = test_state().await;
        let created = create(&state).await;

        let Json(resp) = cancel_request(
            State(state.clone()),
            Extension(Actor::parent(PARENT)),
            Path(created.request_id.clone()),
        )
        .await
        .unwrap();
        assert_eq!(resp.data.unwrap().status, "CANCELLED");

        let err = cancel_request(
            State(state.clone()),
            Extension(Actor::parent(PARENT)),
            Path(created.request_id),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, error_codes::INVALID_STATE_TRANSITION);

        let Json(resp) = list_requests(
            State(state.clone()),
            Extension(Actor::parent(PARENT)),
            Query(ListRequestsParams {
                status: Some("cancelled".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.data.unwrap().len(), 1);

        let err = list_requests(
            State(state),
            Extension(Actor::parent(PARENT)),
            Query(ListRequestsParams {
                status: Some("LOST".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_path_id() {
        let state = test_state().await;
        let err = get_request(
            State(state),
            Extension(Actor::parent(PARENT)),
            Path("not-a-ulid".to_string()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.msg, "Invalid request ID format");
    }
}
