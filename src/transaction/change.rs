// ============================================================================
// Undo Records
// ============================================================================
//
// Each data operation of a connection records the action needed to revert
// it. When undo support is enabled, the actions of a committed transaction
// are kept in the repository undo log under a fresh TransactionId.
//
// ============================================================================

use super::TransactionId;
use crate::core::{Eid, Result, Value};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A reversible data action, as recorded while the transaction runs
#[derive(Debug, Clone, PartialEq)]
pub enum UndoAction {
    CreateEntity {
        eid: Eid,
        etype: String,
    },

    /// `previous` holds the values the edited attributes had before
    UpdateEntity {
        eid: Eid,
        etype: String,
        previous: BTreeMap<String, Value>,
    },

    DeleteEntity {
        eid: Eid,
        etype: String,
        attributes: BTreeMap<String, Value>,
    },

    AddRelation {
        eidfrom: Eid,
        rtype: String,
        eidto: Eid,
    },

    DeleteRelation {
        eidfrom: Eid,
        rtype: String,
        eidto: Eid,
    },
}

impl UndoAction {
    /// Entity the action applies to (the subject for relations)
    pub fn eid(&self) -> Eid {
        match self {
            UndoAction::CreateEntity { eid, .. }
            | UndoAction::UpdateEntity { eid, .. }
            | UndoAction::DeleteEntity { eid, .. } => *eid,
            UndoAction::AddRelation { eidfrom, .. } | UndoAction::DeleteRelation { eidfrom, .. } => {
                *eidfrom
            }
        }
    }

    pub fn is_relation_action(&self) -> bool {
        matches!(
            self,
            UndoAction::AddRelation { .. } | UndoAction::DeleteRelation { .. }
        )
    }
}

/// A committed transaction kept for undo
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub user: String,
    pub time: DateTime<Utc>,
    pub actions: Vec<UndoAction>,
}

/// Repository wide store of committed undoable transactions
#[derive(Debug)]
pub struct UndoLog {
    next_id: AtomicU64,
    records: Mutex<BTreeMap<TransactionId, TransactionRecord>>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record(&self, user: &str, actions: Vec<UndoAction>) -> Result<TransactionId> {
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let record = TransactionRecord {
            id,
            user: user.to_string(),
            time: Utc::now(),
            actions,
        };
        self.records.lock()?.insert(id, record);
        Ok(id)
    }

    pub fn get(&self, id: TransactionId) -> Result<Option<TransactionRecord>> {
        Ok(self.records.lock()?.get(&id).cloned())
    }

    /// Transactions of `user`, most recent first.
    pub fn transactions_of(&self, user: &str) -> Result<Vec<TransactionId>> {
        Ok(self
            .records
            .lock()?
            .values()
            .rev()
            .filter(|record| record.user == user)
            .map(|record| record.id)
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.records.lock()?.len())
    }
}

impl Default for UndoLog {
    fn default() -> Self {
        Self::new()
    }
}
