// ============================================================================
// Commit State
// ============================================================================
//
// Lifecycle of the logical transaction carried by a connection:
//
//   None ──commit──> Precommit ──storage commit──> Postcommit ──> None
//                        │
//                        └──failure──> rollback ──> None
//
// Uncommitable is entered when a business rule failure escaped a data
// operation and the caller kept going; only rollback() leaves it.
//
// ============================================================================

use std::fmt;

/// Identifier of a committed transaction with undoable actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitState {
    /// No commit running
    #[default]
    None,

    /// Firing precommit events, storage not committed yet
    Precommit,

    /// Storage committed, firing postcommit events
    Postcommit,

    /// A failure was swallowed by the caller; the transaction may only be
    /// rolled back
    Uncommitable,
}

impl CommitState {
    /// Check if a commit is currently running
    pub fn is_committing(&self) -> bool {
        matches!(self, CommitState::Precommit | CommitState::Postcommit)
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitState::None => write!(f, "NONE"),
            CommitState::Precommit => write!(f, "PRECOMMIT"),
            CommitState::Postcommit => write!(f, "POSTCOMMIT"),
            CommitState::Uncommitable => write!(f, "UNCOMMITABLE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_state_classification() {
        assert!(!CommitState::None.is_committing());
        assert!(CommitState::Precommit.is_committing());
        assert!(CommitState::Postcommit.is_committing());
        assert!(!CommitState::Uncommitable.is_committing());
        assert_eq!(CommitState::default(), CommitState::None);
    }

    #[test]
    fn test_display() {
        assert_eq!(TransactionId(7).to_string(), "txn_7");
        assert_eq!(CommitState::Uncommitable.to_string(), "UNCOMMITABLE");
    }
}
