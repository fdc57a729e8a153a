//! Branch Transfer Workflow
//!
//! Moves a student from one daycare branch to another through two
//! independent approvals: the current branch clears the student's data,
//! the target branch enrolls them.
//!
//! # State Machine
//!
//! ```text
//! PENDING ──(current branch approves)──▶ READY_TO_TRANSFER ──(target branch approves)──▶ APPROVED
//!    │  │                                        │
//!    │  └──(current branch rejects)──▶ REJECTED ◀┘(target branch rejects)
//!    └──(requester cancels)──▶ CANCELLED
//! ```
//!
//! # Safety Invariants
//!
//! 1. **One transaction per transition**: status check, authorization,
//!    conflict snapshot, side effects and status write commit together
//! 2. **CAS on status**: a transition that loses a race fails with a state
//!    error instead of overwriting
//! 3. **All-or-nothing auto-cancel**: one failed cancellation rolls back
//!    every cancellation and refund of that approval
//! 4. **Side channels after commit**: audit and notification never undo a
//!    committed transition and are retried until delivered

pub mod api;
pub mod audit;
pub mod conflicts;
pub mod coordinator;
pub mod delivery;
pub mod directory;
pub mod documents;
pub mod error;
pub mod refund;
pub mod state;
pub mod store;
pub mod types;
pub mod validation;


// Re-exports for convenience
pub use audit::{
    AuditSink, LogNotifier, MemoryAuditLog, MemoryNotifier, Notifier, PgAuditSink,
    TransitionEvent, WebhookNotifier,
};
pub use conflicts::{
    BranchTimeZone, Clock, ConflictCounts, ConflictDetector, ConflictSnapshot, FixedClock,
    SystemClock,
};
pub use coordinator::{ApprovalOutcome, AutoCancelSummary, TransferCoordinator};
pub use delivery::{DeliveryConfig, DeliveryWorker, EventDispatcher, Published};
pub use directory::{Directory, Fixtures, PgDirectory, StaticDirectory};
pub use documents::{DocumentStore, LocalDocumentStore, MemoryDocumentStore};
pub use error::{BranchTransferError, ValidationError};
pub use state::TransferStatus;
pub use store::{
    DeliveryLeg, EventOutbox, MemoryTransferStore, OutboxEntry, PgTransferStore, TransferStore,
};
pub use types::{
    Actor, ApprovalDecision, DocumentId, DocumentInput, DocumentUpload, ListQuery,
    NewTransferRequest, RejectionDecision, Role, TransferRecord, TransferRequestId,
};
