//! Branch Transfer Error Types

use thiserror::Error;

use super::conflicts::ConflictCounts;
use super::types::{BranchId, SchoolId, StudentId, StudentLevelId};

/// Input rejected before any state is touched
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Target branch must differ from the current branch")]
    SameBranch,

    #[error("Student {0} not found")]
    UnknownStudent(StudentId),

    #[error("Branch {0} not found")]
    UnknownBranch(BranchId),

    #[error("Target school is required when changing school")]
    MissingTargetSchool,

    #[error("School {school_id} is not supported by branch {branch_id}")]
    UnsupportedTargetSchool {
        school_id: SchoolId,
        branch_id: BranchId,
    },

    #[error("Target student level is required when changing level")]
    MissingTargetLevel,

    #[error("Student level {level_id} is not supported by branch {branch_id}")]
    UnsupportedTargetLevel {
        level_id: StudentLevelId,
        branch_id: BranchId,
    },

    #[error("A supporting document is required when changing school or level")]
    MissingDocument,

    #[error("Document exceeds {max} bytes")]
    DocumentTooLarge { max: usize },

    #[error("{field} exceeds {max} characters")]
    TextTooLong { field: &'static str, max: usize },

    #[error("Rejection reason must not be empty")]
    MissingRejectionReason,

    #[error("Student already has an open transfer request ({0})")]
    OpenRequestExists(String),
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::SameBranch => "SAME_BRANCH",
            ValidationError::UnknownStudent(_) => "UNKNOWN_STUDENT",
            ValidationError::UnknownBranch(_) => "UNKNOWN_BRANCH",
            ValidationError::MissingTargetSchool => "MISSING_TARGET_SCHOOL",
            ValidationError::UnsupportedTargetSchool { .. } => "UNSUPPORTED_TARGET_SCHOOL",
            ValidationError::MissingTargetLevel => "MISSING_TARGET_LEVEL",
            ValidationError::UnsupportedTargetLevel { .. } => "UNSUPPORTED_TARGET_LEVEL",
            ValidationError::MissingDocument => "MISSING_DOCUMENT",
            ValidationError::DocumentTooLarge { .. } => "DOCUMENT_TOO_LARGE",
            ValidationError::TextTooLong { .. } => "TEXT_TOO_LONG",
            ValidationError::MissingRejectionReason => "MISSING_REJECTION_REASON",
            ValidationError::OpenRequestExists(_) => "OPEN_REQUEST_EXISTS",
        }
    }
}

/// Branch transfer error types
#[derive(Debug, Error)]
pub enum BranchTransferError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Caller is authenticated but not scoped to the branch (or request) involved
    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Approval blocked by outstanding conflicts: {0}")]
    ConflictBlocked(ConflictCounts),

    /// Incompatible or terminal status, including a lost race
    #[error("Invalid state transition: {0}")]
    State(String),

    #[error("{0} not found")]
    NotFound(String),

    /// A side effect failed; the whole transition was rolled back
    #[error("Transition failed while {step}: {source}")]
    TransitionFailed {
        step: &'static str,
        #[source]
        source: Box<BranchTransferError>,
    },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Internal system error: {0}")]
    SystemError(String),
}

impl BranchTransferError {
    /// Wrap a side-effect failure
    pub fn transition_failed(step: &'static str, source: BranchTransferError) -> Self {
        BranchTransferError::TransitionFailed {
            step,
            source: Box::new(source),
        }
    }

    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            BranchTransferError::Validation(v) => v.code(),
            BranchTransferError::Authorization(_) => "BRANCH_SCOPE_DENIED",
            BranchTransferError::ConflictBlocked(_) => "CONFLICT_BLOCKED",
            BranchTransferError::State(_) => "INVALID_STATE_TRANSITION",
            BranchTransferError::NotFound(_) => "NOT_FOUND",
            BranchTransferError::TransitionFailed { .. } => "TRANSITION_FAILED",
            BranchTransferError::DatabaseError(_) => "DATABASE_ERROR",
            BranchTransferError::SystemError(_) => "SYSTEM_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    ///
    /// 401 doubles as "not scoped to this branch"; the `code` tells it apart
    /// from an authentication failure.
    pub fn http_status(&self) -> u16 {
        match self {
            BranchTransferError::Validation(_) => 400,
            BranchTransferError::Authorization(_) => 401,
            BranchTransferError::NotFound(_) => 404,
            BranchTransferError::ConflictBlocked(_) | BranchTransferError::State(_) => 409,
            BranchTransferError::TransitionFailed { .. }
            | BranchTransferError::DatabaseError(_)
            | BranchTransferError::SystemError(_) => 500,
        }
    }
}

impl From<sqlx::Error> for BranchTransferError {
    fn from(e: sqlx::Error) -> Self {
        BranchTransferError::DatabaseError(e.to_string())
    }
}

impl From<anyhow::Error> for BranchTransferError {
    fn from(e: anyhow::Error) -> Self {
        BranchTransferError::SystemError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            BranchTransferError::from(ValidationError::SameBranch).code(),
            "SAME_BRANCH"
        );
        assert_eq!(
            BranchTransferError::Authorization("x".into()).code(),
            "BRANCH_SCOPE_DENIED"
        );
        assert_eq!(
            BranchTransferError::State("x".into()).code(),
            "INVALID_STATE_TRANSITION"
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            BranchTransferError::from(ValidationError::MissingDocument).http_status(),
            400
        );
        assert_eq!(
            BranchTransferError::Authorization("x".into()).http_status(),
            401
        );
        assert_eq!(BranchTransferError::NotFound("x".into()).http_status(), 404);
        assert_eq!(
            BranchTransferError::ConflictBlocked(ConflictCounts::default()).http_status(),
            409
        );
        assert_eq!(BranchTransferError::State("x".into()).http_status(), 409);
        assert_eq!(
            BranchTransferError::SystemError("x".into()).http_status(),
            500
        );
    }

    #[test]
    fn test_transition_failed_keeps_cause() {
        let err = BranchTransferError::transition_failed(
            "cancelling subscription 3",
            BranchTransferError::DatabaseError("connection reset".into()),
        );
        assert_eq!(err.code(), "TRANSITION_FAILED");
        assert_eq!(
            err.to_string(),
            "Transition failed while cancelling subscription 3: Database error: connection reset"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
