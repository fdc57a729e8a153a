//! Request wizard validation
//!
//! The parent-facing form is three steps. Each step is a pure check over the
//! draft and the directory data the coordinator loaded for it, so a client
//! can validate step by step and the final submit re-runs all of them.

use super::directory::{BranchProfile, StudentProfile};
use super::error::ValidationError;
use super::types::{ApprovalDecision, NewTransferRequest, RejectionDecision};

/// Cap on every free-text field
pub const MAX_TEXT_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardStep {
    /// Which child, which branch
    StudentAndBranch,
    /// Optional school / level change at the target branch
    SchoolAndLevel,
    /// Supporting document and free-text reason
    DocumentAndReason,
}

impl WizardStep {
    pub const ALL: [WizardStep; 3] = [
        WizardStep::StudentAndBranch,
        WizardStep::SchoolAndLevel,
        WizardStep::DocumentAndReason,
    ];

    pub fn validate(
        &self,
        draft: &NewTransferRequest,
        ctx: &StepContext,
    ) -> Result<(), ValidationError> {
        match self {
            WizardStep::StudentAndBranch => student_and_branch(draft, ctx),
            WizardStep::SchoolAndLevel => school_and_level(draft, ctx),
            WizardStep::DocumentAndReason => document_and_reason(draft),
        }
    }
}

/// Directory data the steps are checked against
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub student: Option<StudentProfile>,
    pub target_branch: Option<BranchProfile>,
}

/// Run every step in order, stopping at the first failure
pub fn validate_all(draft: &NewTransferRequest, ctx: &StepContext) -> Result<(), ValidationError> {
    WizardStep::ALL
        .iter()
        .try_for_each(|step| step.validate(draft, ctx))
}

fn student_and_branch(draft: &NewTransferRequest, ctx: &StepContext) -> Result<(), ValidationError> {
    let student = ctx
        .student
        .as_ref()
        .ok_or(ValidationError::UnknownStudent(draft.student_id))?;

    if draft.target_branch_id == student.branch_id {
        return Err(ValidationError::SameBranch);
    }

    match ctx.target_branch {
        Some(ref branch) if branch.branch_id == draft.target_branch_id => Ok(()),
        _ => Err(ValidationError::UnknownBranch(draft.target_branch_id)),
    }
}

fn school_and_level(draft: &NewTransferRequest, ctx: &StepContext) -> Result<(), ValidationError> {
    let branch = ctx
        .target_branch
        .as_ref()
        .ok_or(ValidationError::UnknownBranch(draft.target_branch_id))?;

    if draft.change_school {
        let school_id = draft
            .target_school_id
            .ok_or(ValidationError::MissingTargetSchool)?;
        if !branch.supports_school(school_id) {
            return Err(ValidationError::UnsupportedTargetSchool {
                school_id,
                branch_id: branch.branch_id,
            });
        }
    }

    if draft.change_level {
        let level_id = draft
            .target_student_level_id
            .ok_or(ValidationError::MissingTargetLevel)?;
        if !branch.supports_level(level_id) {
            return Err(ValidationError::UnsupportedTargetLevel {
                level_id,
                branch_id: branch.branch_id,
            });
        }
    }

    Ok(())
}

fn document_and_reason(draft: &NewTransferRequest) -> Result<(), ValidationError> {
    if (draft.change_school || draft.change_level) && !draft.document.is_provided() {
        return Err(ValidationError::MissingDocument);
    }
    check_text("requestReason", draft.request_reason.as_deref())
}

/// Enforce [`MAX_TEXT_CHARS`] on an optional free-text field
pub fn check_text(field: &'static str, value: Option<&str>) -> Result<(), ValidationError> {
    match value {
        Some(text) if text.chars().count() > MAX_TEXT_CHARS => Err(ValidationError::TextTooLong {
            field,
            max: MAX_TEXT_CHARS,
        }),
        _ => Ok(()),
    }
}

pub fn validate_approval(decision: &ApprovalDecision) -> Result<(), ValidationError> {
    check_text("managerNotes", decision.manager_notes.as_deref())
}

pub fn validate_rejection(decision: &RejectionDecision) -> Result<(), ValidationError> {
    if decision.rejection_reason.trim().is_empty() {
        return Err(ValidationError::MissingRejectionReason);
    }
    check_text("rejectionReason", Some(&decision.rejection_reason))?;
    check_text("managerNotes", decision.manager_notes.as_deref())
}
