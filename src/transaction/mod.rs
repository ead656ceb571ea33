// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Transaction scoped machinery of a connection: the commit state, the
// ordered queue of deferred operations and the undo records of committed
// transactions. The commit/rollback algorithms themselves live on the
// Connection, which owns all of this state.
//
// ============================================================================

pub mod change;
pub mod operation;
pub mod queue;
pub mod state;

pub use change::{TransactionRecord, UndoAction, UndoLog};
pub use operation::{
    AsAny, Operation, OperationEvent, OperationHandler, PermissionCheck, Placement,
    RequiredRelationCheck,
};
pub use queue::OperationQueue;
pub use state::{CommitState, TransactionId};
