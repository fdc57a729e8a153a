//! Transfer Request Status Definitions
//!
//! Status IDs are stored in PostgreSQL as SMALLINT.

use std::fmt;

/// Branch-transfer request status
///
/// ```text
/// PENDING ──▶ READY_TO_TRANSFER ──▶ APPROVED
///    │  │              │
///    │  └──────────────┴──▶ REJECTED
///    └──▶ CANCELLED
/// ```
///
/// Terminal states: APPROVED (20), REJECTED (-10), CANCELLED (-20)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum TransferStatus {
    /// Initial state - waiting for the current branch to clear the student
    Pending = 0,

    /// Current branch approved; waiting for the target branch to enroll
    ReadyToTransfer = 10,

    /// Terminal: student enrolled at the target branch
    Approved = 20,

    /// Terminal: rejected by the branch responsible for the pending step
    Rejected = -10,

    /// Terminal: withdrawn by the requester while pending
    Cancelled = -20,
}

impl TransferStatus {
    /// Check if this is a terminal status (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Approved | TransferStatus::Rejected | TransferStatus::Cancelled
        )
    }

    /// Whether the request still blocks a new request for the same student
    #[inline]
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    /// The only edges of the workflow graph
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, ReadyToTransfer)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (ReadyToTransfer, Approved)
                | (ReadyToTransfer, Rejected)
        )
    }

    /// Get the numeric status ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL status ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransferStatus::Pending),
            10 => Some(TransferStatus::ReadyToTransfer),
            20 => Some(TransferStatus::Approved),
            -10 => Some(TransferStatus::Rejected),
            -20 => Some(TransferStatus::Cancelled),
            _ => None,
        }
    }

    /// Get human-readable status name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::ReadyToTransfer => "READY_TO_TRANSFER",
            TransferStatus::Approved => "APPROVED",
            TransferStatus::Rejected => "REJECTED",
            TransferStatus::Cancelled => "CANCELLED",
        }
    }

    /// Parse a status name as used in query strings (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(TransferStatus::Pending),
            "READY_TO_TRANSFER" | "READYTOTRANSFER" => Some(TransferStatus::ReadyToTransfer),
            "APPROVED" => Some(TransferStatus::Approved),
            "REJECTED" => Some(TransferStatus::Rejected),
            "CANCELLED" | "CANCELED" => Some(TransferStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for TransferStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransferStatus::from_id(value).ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TransferStatus; 5] = [
        TransferStatus::Pending,
        TransferStatus::ReadyToTransfer,
        TransferStatus::Approved,
        TransferStatus::Rejected,
        TransferStatus::Cancelled,
    ];

    #[test]
    fn test_terminal_states() {
        assert!(TransferStatus::Approved.is_terminal());
        assert!(TransferStatus::Rejected.is_terminal());
        assert!(TransferStatus::Cancelled.is_terminal());

        assert!(!TransferStatus::Pending.is_terminal());
        assert!(!TransferStatus::ReadyToTransfer.is_terminal());
    }

    #[test]
    fn test_status_id_roundtrip() {
        for status in ALL {
            assert_eq!(TransferStatus::from_id(status.id()), Some(status));
            assert_eq!(TransferStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TransferStatus::from_id(99), None);
        assert_eq!(TransferStatus::parse("done"), None);
    }

    #[test]
    fn test_only_forward_edges_are_allowed() {
        let allowed = [
            (TransferStatus::Pending, TransferStatus::ReadyToTransfer),
            (TransferStatus::Pending, TransferStatus::Rejected),
            (TransferStatus::Pending, TransferStatus::Cancelled),
            (TransferStatus::ReadyToTransfer, TransferStatus::Approved),
            (TransferStatus::ReadyToTransfer, TransferStatus::Rejected),
        ];

        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            assert!(ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
    }
}
