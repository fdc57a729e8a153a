//! Branch Transfer Core Types
//!
//! Type definitions for the branch-transfer request workflow.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::state::TransferStatus;

pub type UserId = i64;
pub type StudentId = i64;
pub type BranchId = i64;
pub type SchoolId = i64;
pub type StudentLevelId = i64;

/// Transfer request ID - ULID-based unique identifier
///
/// Sortable by creation millisecond; ids minted within one millisecond
/// order randomly, so listings sort on `created_time` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferRequestId(ulid::Ulid);

impl TransferRequestId {
    /// Generate a new unique TransferRequestId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Get the inner ULID value
    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for TransferRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferRequestId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Supporting document reference (ULID assigned by the document store)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentId(ulid::Ulid);

impl DocumentId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DocumentId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Platform role carried in the caller's token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Parent,
    Manager,
    Staff,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Parent => "parent",
            Role::Manager => "manager",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "parent" => Some(Role::Parent),
            "manager" | "branch_manager" => Some(Role::Manager),
            "staff" => Some(Role::Staff),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn parent(user_id: UserId) -> Self {
        Self::new(user_id, Role::Parent)
    }

    pub fn manager(user_id: UserId) -> Self {
        Self::new(user_id, Role::Manager)
    }
}

/// Raw document upload (multipart `DocumentFile`)
#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Supporting document supplied at creation
#[derive(Debug, Clone, Default)]
pub enum DocumentInput {
    #[default]
    None,
    /// Already stored (e.g. uploaded in an earlier wizard step)
    Existing(DocumentId),
    /// Stored by the coordinator once validation passes
    Upload(DocumentUpload),
}

impl DocumentInput {
    pub fn is_provided(&self) -> bool {
        !matches!(self, DocumentInput::None)
    }
}

/// Parent-submitted transfer request
#[derive(Debug, Clone, Default)]
pub struct NewTransferRequest {
    pub student_id: StudentId,
    pub target_branch_id: BranchId,
    pub change_school: bool,
    pub target_school_id: Option<SchoolId>,
    pub change_level: bool,
    pub target_student_level_id: Option<StudentLevelId>,
    pub document: DocumentInput,
    pub request_reason: Option<String>,
}

/// Manager decision for the approve action
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalDecision {
    /// Only meaningful at the current-branch step
    pub auto_cancel_subscriptions: bool,
    pub auto_cancel_slots: bool,
    pub auto_cancel_orders: bool,
    /// Refuse to approve while any conflict exists
    pub approve_only_if_no_conflicts: bool,
    pub manager_notes: Option<String>,
}

/// Manager decision for the reject action
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RejectionDecision {
    pub rejection_reason: String,
    pub manager_notes: Option<String>,
}

/// Transfer request record stored in PostgreSQL
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub request_id: TransferRequestId,
    pub student_id: StudentId,
    pub current_branch_id: BranchId,
    pub target_branch_id: BranchId,
    pub change_school: bool,
    pub target_school_id: Option<SchoolId>,
    pub change_level: bool,
    pub target_student_level_id: Option<StudentLevelId>,
    pub document_id: Option<DocumentId>,
    pub request_reason: Option<String>,
    pub status: TransferStatus,
    /// Present only when status = REJECTED
    pub rejection_reason: Option<String>,
    /// Notes from the most recent decision; the audit trail keeps every one
    pub manager_notes: Option<String>,
    pub requested_by: UserId,
    pub created_time: DateTime<Utc>,
    pub decided_by: Option<UserId>,
    pub decided_time: Option<DateTime<Utc>>,
    /// Sum of refunds issued at the current-branch approval
    pub refunded_amount: Option<Decimal>,
    /// Student record created at the target branch
    pub enrolled_student_id: Option<StudentId>,
}

impl TransferRecord {
    /// Create a new record in PENDING status
    pub fn new(
        request: &NewTransferRequest,
        current_branch_id: BranchId,
        document_id: Option<DocumentId>,
        requested_by: UserId,
        created_time: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: TransferRequestId::new(),
            student_id: request.student_id,
            current_branch_id,
            target_branch_id: request.target_branch_id,
            change_school: request.change_school,
            target_school_id: request.target_school_id.filter(|_| request.change_school),
            change_level: request.change_level,
            target_student_level_id: request
                .target_student_level_id
                .filter(|_| request.change_level),
            document_id,
            request_reason: request.request_reason.clone(),
            status: TransferStatus::Pending,
            rejection_reason: None,
            manager_notes: None,
            requested_by,
            created_time,
            decided_by: None,
            decided_time: None,
            refunded_amount: None,
            enrolled_student_id: None,
        }
    }

    /// Branch whose manager must act on the current status
    pub fn responsible_branch(&self) -> Option<BranchId> {
        match self.status {
            TransferStatus::Pending => Some(self.current_branch_id),
            TransferStatus::ReadyToTransfer => Some(self.target_branch_id),
            _ => None,
        }
    }

    /// Apply a committed status change to the in-memory copy
    pub fn apply(&mut self, change: &StatusChange) {
        self.status = change.to;
        self.decided_by = Some(change.decided_by);
        self.decided_time = Some(change.decided_time);
        if change.manager_notes.is_some() {
            self.manager_notes = change.manager_notes.clone();
        }
        if change.rejection_reason.is_some() {
            self.rejection_reason = change.rejection_reason.clone();
        }
        if change.refunded_amount.is_some() {
            self.refunded_amount = change.refunded_amount;
        }
        if change.enrolled_student_id.is_some() {
            self.enrolled_student_id = change.enrolled_student_id;
        }
    }
}

impl fmt::Display for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransferRequest[{}] student={} branch {} -> {} status={}",
            self.request_id,
            self.student_id,
            self.current_branch_id,
            self.target_branch_id,
            self.status
        )
    }
}

/// Fields written together with a status compare-and-swap
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub to: TransferStatus,
    pub decided_by: UserId,
    pub decided_time: DateTime<Utc>,
    pub manager_notes: Option<String>,
    pub rejection_reason: Option<String>,
    pub refunded_amount: Option<Decimal>,
    pub enrolled_student_id: Option<StudentId>,
}

impl StatusChange {
    pub fn new(to: TransferStatus, decided_by: UserId, decided_time: DateTime<Utc>) -> Self {
        Self {
            to,
            decided_by,
            decided_time,
            manager_notes: None,
            rejection_reason: None,
            refunded_amount: None,
            enrolled_student_id: None,
        }
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.manager_notes = notes;
        self
    }
}

/// Store-level listing filter
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub requested_by: Option<UserId>,
    /// Matches either the current or the target branch
    pub branch_ids: Option<Vec<BranchId>>,
    pub status: Option<TransferStatus>,
    pub student_id: Option<StudentId>,
    pub document_id: Option<DocumentId>,
    pub limit: Option<usize>,
}

impl RequestFilter {
    pub fn matches(&self, record: &TransferRecord) -> bool {
        if let Some(user) = self.requested_by
            && record.requested_by != user
        {
            return false;
        }
        if let Some(ref branches) = self.branch_ids
            && !branches.contains(&record.current_branch_id)
            && !branches.contains(&record.target_branch_id)
        {
            return false;
        }
        if let Some(status) = self.status
            && record.status != status
        {
            return false;
        }
        if let Some(student) = self.student_id
            && record.student_id != student
        {
            return false;
        }
        if let Some(doc) = self.document_id
            && record.document_id != Some(doc)
        {
            return false;
        }
        true
    }
}

/// Caller-facing listing query (`GET /branch-transfer/requests`)
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub branch_id: Option<BranchId>,
    pub status: Option<TransferStatus>,
    pub student_id: Option<StudentId>,
    pub limit: Option<usize>,
}
