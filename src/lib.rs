// ============================================================================
// CubicWeb Core Library
// ============================================================================
//
// Transactional session core of a CubicWeb-style repository: a pool of
// storage handles, connections carrying one transaction each, hooks fired
// around data changes, operations fired around commit/rollback, and
// authenticated sessions on top.
//
// ============================================================================

pub mod cache;
pub mod connection;
pub mod context;
pub mod core;
pub mod entity;
pub mod hook;
pub mod prelude;
pub mod querier;
pub mod repository;
pub mod schema;
pub mod session;
pub mod source;
pub mod transaction;
pub mod worker;

// Re-export main types for convenience
pub use core::{Args, DataType, Eid, RepoError, Result, ResultSet, Role, StorageError, Value};

pub use connection::{
    Connection,
    auth::{Credentials, IdentitySource, PasswordSource, TokenSource, User},
    config::RepositoryConfig,
    control::{HooksGuard, HooksMode, HooksState, SecurityGuard},
    pool::{ConnectionSetPool, PoolStats},
};

pub use hook::{Hook, HookContext, HookEvent, HooksManager, HooksRegistry};
pub use repository::{Repository, RepositoryBuilder, RepositoryCore};
pub use session::Session;
pub use transaction::{
    CommitState, Operation, OperationEvent, OperationHandler, Placement, TransactionId,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, MANAGERS, Permissions, Schema, USERS};
    use crate::schema::Action;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn repository() -> Arc<Repository> {
        let passwords = Arc::new(PasswordSource::with_cost(4));
        passwords.create_user("admin", "adminpass", &[MANAGERS]).unwrap();
        passwords.create_user("bob", "bobsecret", &[USERS]).unwrap();

        let schema = Schema::new().entity(
            EntitySchema::new("Note")
                .attribute("title", DataType::String, true)
                .permissions(
                    Permissions::none()
                        .grant(Action::Add, &[MANAGERS, USERS])
                        .grant(Action::Update, &[MANAGERS])
                        .grant(Action::Delete, &[MANAGERS]),
                ),
        );
        Repository::builder(RepositoryConfig::new("lib-test").pool_size(2))
            .schema(schema)
            .identity_source(passwords)
            .build()
            .unwrap()
    }

    #[test]
    fn test_session_roundtrip() {
        let repo = repository();
        let sessionid = repo
            .connect("bob", &Credentials::Password("bobsecret".into()))
            .unwrap();

        let session = repo.session(&sessionid).unwrap();
        let eid = {
            let mut session = session.lock().unwrap();
            let cnx = session.connection(repo.core()).unwrap();
            let mut attrs = BTreeMap::new();
            attrs.insert("title".to_string(), Value::Text("hello".into()));
            cnx.create_entity("Note", attrs).unwrap()
        };
        repo.commit(&sessionid).unwrap();

        assert_eq!(repo.type_and_source_from_eid(eid).unwrap().etype, "Note");
        assert_eq!(repo.pool_stats().outstanding, 0);

        repo.close(&sessionid).unwrap();
        assert!(matches!(
            repo.session(&sessionid),
            Err(RepoError::BadConnectionId(_))
        ));
    }

    #[test]
    fn test_bad_credentials() {
        let repo = repository();
        let result = repo.connect("bob", &Credentials::Password("nope".into()));
        assert!(matches!(result, Err(RepoError::Authentication(_))));
        assert_eq!(repo.session_count().unwrap(), 0);
    }
}
