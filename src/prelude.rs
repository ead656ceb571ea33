//! Everything an application needs to set up a repository, write hooks and
//! operations, and drive sessions.
//!
//! ```ignore
//! use cubicweb_core::prelude::*;
//! ```

pub use crate::connection::Connection;
pub use crate::connection::auth::{Credentials, IdentitySource, PasswordSource, TokenSource, User};
pub use crate::connection::config::RepositoryConfig;
pub use crate::core::{Args, DataType, Eid, RepoError, Result, ResultSet, Role, Value};
pub use crate::hook::builtin::{INTEGRITY, SECURITY};
pub use crate::hook::{Hook, HookContext, HookEvent, HooksRegistry};
pub use crate::querier::Querier;
pub use crate::repository::Repository;
pub use crate::schema::{
    Action, Cardinality, EntitySchema, MANAGERS, GUESTS, Permissions, RelationDefinition, Schema,
    USERS,
};
pub use crate::session::Session;
pub use crate::transaction::{Operation, OperationHandler, Placement, TransactionId};
pub use crate::worker::{MailMessage, Mailer, spawn_mail_worker};
