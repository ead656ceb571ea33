// ============================================================================
// Operations
// ============================================================================
//
// Deferred work attached to a transaction. Built-in kinds carry a typed
// payload and are dispatched with a plain match; application kinds go
// through the OperationHandler trait object.
//
// Events fired by Connection::commit / Connection::rollback:
//   precommit -> (failure) revertprecommit on processed ops, reverse order
//             -> rollback on every queued op
//   precommit -> storage commit -> postcommit
//
// ============================================================================

use crate::connection::Connection;
use crate::core::{Eid, RepoError, Result, Role};
use crate::schema::Action;
use crate::worker::MailMessage;
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::mem;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationEvent {
    Precommit,
    RevertPrecommit,
    Postcommit,
    Rollback,
}

impl fmt::Display for OperationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationEvent::Precommit => write!(f, "precommit"),
            OperationEvent::RevertPrecommit => write!(f, "revertprecommit"),
            OperationEvent::Postcommit => write!(f, "postcommit"),
            OperationEvent::Rollback => write!(f, "rollback"),
        }
    }
}

/// Where an operation lands in the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Placement {
    /// Insertion order, before any late or single-last operation
    Normal,
    /// After every normal operation
    Late,
    /// At most one per kind, after everything else
    SingleLast,
}

/// Lets a handler be recovered as its concrete type, e.g. to merge the
/// payload of a replaced single-last instance.
pub trait AsAny {
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Send> AsAny for T {
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Application defined operation
///
/// Every event defaults to a no-op. `name` identifies the kind: two
/// single-last handlers with the same name are the same kind.
pub trait OperationHandler: AsAny + fmt::Debug + Send {
    fn name(&self) -> &str;

    fn placement(&self) -> Placement {
        Placement::Normal
    }

    fn precommit_event(&mut self, _cnx: &mut Connection) -> Result<()> {
        Ok(())
    }

    fn revertprecommit_event(&mut self, _cnx: &mut Connection) -> Result<()> {
        Ok(())
    }

    fn postcommit_event(&mut self, _cnx: &mut Connection) -> Result<()> {
        Ok(())
    }

    fn rollback_event(&mut self, _cnx: &mut Connection) -> Result<()> {
        Ok(())
    }

    /// Called on the operation whose precommit event failed.
    fn mark_failed(&mut self) {}

    /// Take over the payload of the single-last instance being replaced.
    fn absorb(&mut self, _previous: Box<dyn OperationHandler>) {}
}

/// A mandatory relation to verify at precommit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredRelationCheck {
    pub eid: Eid,
    pub etype: String,
    pub rtype: String,
    pub role: Role,
}

/// A write permission to verify at precommit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionCheck {
    pub eid: Eid,
    pub etype: String,
    pub action: Action,
}

#[derive(Debug)]
pub enum Operation {
    /// Forget eids created by a rolled back transaction
    CleanupNewEids(BTreeSet<Eid>),

    /// Forget eids deleted by a committed transaction
    CleanupDeletedEids(BTreeSet<Eid>),

    CheckRequiredRelations(Vec<RequiredRelationCheck>),

    CheckPermissions(Vec<PermissionCheck>),

    /// Hand messages to the mail worker once the data is committed
    SendMail(Vec<MailMessage>),

    Custom(Box<dyn OperationHandler>),
}

impl Operation {
    pub fn custom(handler: impl OperationHandler + 'static) -> Self {
        Operation::Custom(Box::new(handler))
    }

    pub fn name(&self) -> &str {
        match self {
            Operation::CleanupNewEids(_) => "cleanup_new_eids",
            Operation::CleanupDeletedEids(_) => "cleanup_deleted_eids",
            Operation::CheckRequiredRelations(_) => "check_required_relations",
            Operation::CheckPermissions(_) => "check_permissions",
            Operation::SendMail(_) => "send_mail",
            Operation::Custom(handler) => handler.name(),
        }
    }

    pub fn placement(&self) -> Placement {
        match self {
            Operation::Custom(handler) => handler.placement(),
            _ => Placement::SingleLast,
        }
    }

    pub fn same_kind(&self, other: &Operation) -> bool {
        match (self, other) {
            (Operation::Custom(a), Operation::Custom(b)) => a.name() == b.name(),
            _ => mem::discriminant(self) == mem::discriminant(other),
        }
    }

    /// Merge the payload of `previous`, the instance this one replaces.
    /// Earlier entries keep their place in front.
    pub fn absorb(&mut self, previous: Operation) {
        match (self, previous) {
            (Operation::CleanupNewEids(eids), Operation::CleanupNewEids(old))
            | (Operation::CleanupDeletedEids(eids), Operation::CleanupDeletedEids(old)) => {
                eids.extend(old)
            }
            (Operation::CheckRequiredRelations(checks), Operation::CheckRequiredRelations(old)) => {
                checks.splice(0..0, old);
            }
            (Operation::CheckPermissions(checks), Operation::CheckPermissions(old)) => {
                checks.splice(0..0, old);
            }
            (Operation::SendMail(messages), Operation::SendMail(old)) => {
                messages.splice(0..0, old);
            }
            (Operation::Custom(handler), Operation::Custom(old)) => handler.absorb(old),
            (op, old) => warn!(
                operation = op.name(),
                previous = old.name(),
                "cannot merge operations of different kinds"
            ),
        }
    }

    pub fn mark_failed(&mut self) {
        if let Operation::Custom(handler) = self {
            handler.mark_failed();
        }
    }

    pub fn fire(&mut self, event: OperationEvent, cnx: &mut Connection) -> Result<()> {
        debug!(operation = self.name(), %event, "firing operation");
        match self {
            Operation::Custom(handler) => match event {
                OperationEvent::Precommit => handler.precommit_event(cnx),
                OperationEvent::RevertPrecommit => handler.revertprecommit_event(cnx),
                OperationEvent::Postcommit => handler.postcommit_event(cnx),
                OperationEvent::Rollback => handler.rollback_event(cnx),
            },
            Operation::CleanupNewEids(eids) if event == OperationEvent::Rollback => {
                cnx.repo().type_cache().remove(eids.iter())
            }
            Operation::CleanupDeletedEids(eids) if event == OperationEvent::Postcommit => {
                cnx.repo().type_cache().remove(eids.iter())
            }
            Operation::CheckRequiredRelations(checks) if event == OperationEvent::Precommit => {
                check_required_relations(checks, cnx)
            }
            Operation::CheckPermissions(checks) if event == OperationEvent::Precommit => {
                check_permissions(checks, cnx)
            }
            Operation::SendMail(messages) if event == OperationEvent::Postcommit => {
                send_mail(mem::take(messages), cnx)
            }
            _ => Ok(()),
        }
    }
}

fn check_required_relations(checks: &[RequiredRelationCheck], cnx: &mut Connection) -> Result<()> {
    for check in checks {
        if cnx.deleted_in_transaction(check.eid) {
            continue;
        }
        if cnx.related(check.eid, &check.rtype, check.role)?.is_empty() {
            let field = match check.role {
                Role::Subject => check.rtype.clone(),
                Role::Object => format!("{}_object", check.rtype),
            };
            return Err(RepoError::validation(
                check.eid,
                field,
                format!("at least one relation {} is required on {}", check.rtype, check.etype),
            ));
        }
    }
    Ok(())
}

fn check_permissions(checks: &[PermissionCheck], cnx: &mut Connection) -> Result<()> {
    let repo = cnx.repo().clone();
    let schema = repo.schema();
    for check in checks {
        if check.action != Action::Delete && cnx.deleted_in_transaction(check.eid) {
            continue;
        }
        let allowed = schema
            .entity_schema(&check.etype)?
            .entity_permissions()
            .allows(check.action, cnx.user().groups());
        if !allowed {
            return Err(RepoError::Unauthorized(format!(
                "{} may not {} {} #{}",
                cnx.user().login(),
                check.action,
                check.etype,
                check.eid
            )));
        }
    }
    Ok(())
}

fn send_mail(messages: Vec<MailMessage>, cnx: &mut Connection) -> Result<()> {
    match cnx.repo().mail_queue() {
        Some(queue) => {
            for message in messages {
                queue.send(message)?;
            }
            Ok(())
        }
        None => {
            warn!(count = messages.len(), "no mail queue configured, dropping messages");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Collect {
        items: Vec<u32>,
    }

    impl OperationHandler for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        fn placement(&self) -> Placement {
            Placement::SingleLast
        }

        fn absorb(&mut self, previous: Box<dyn OperationHandler>) {
            if let Ok(previous) = previous.into_any().downcast::<Collect>() {
                self.items.splice(0..0, previous.items);
            }
        }
    }

    #[derive(Debug)]
    struct Noop;

    impl OperationHandler for Noop {
        fn name(&self) -> &str {
            "noop"
        }
    }

    #[test]
    fn test_builtin_kinds_are_single_last() {
        let op = Operation::CleanupNewEids(BTreeSet::from([1]));
        assert_eq!(op.placement(), Placement::SingleLast);
        assert_eq!(Operation::custom(Noop).placement(), Placement::Normal);
    }

    #[test]
    fn test_same_kind() {
        let a = Operation::CleanupNewEids(BTreeSet::new());
        let b = Operation::CleanupNewEids(BTreeSet::from([2]));
        let c = Operation::CleanupDeletedEids(BTreeSet::new());
        assert!(a.same_kind(&b));
        assert!(!a.same_kind(&c));
        assert!(Operation::custom(Noop).same_kind(&Operation::custom(Noop)));
        assert!(!Operation::custom(Noop).same_kind(&Operation::custom(Collect { items: vec![] })));
    }

    #[test]
    fn test_absorb_builtin_payload() {
        let mut op = Operation::CheckPermissions(vec![PermissionCheck {
            eid: 2,
            etype: "Blog".into(),
            action: Action::Update,
        }]);
        op.absorb(Operation::CheckPermissions(vec![PermissionCheck {
            eid: 1,
            etype: "Blog".into(),
            action: Action::Add,
        }]));

        match op {
            Operation::CheckPermissions(checks) => {
                let eids: Vec<Eid> = checks.iter().map(|c| c.eid).collect();
                assert_eq!(eids, vec![1, 2]);
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn test_absorb_custom_payload() {
        let mut op = Operation::custom(Collect { items: vec![3] });
        op.absorb(Operation::custom(Collect { items: vec![1, 2] }));

        let Operation::Custom(handler) = op else {
            panic!("expected a custom operation");
        };
        let collect = handler.into_any().downcast::<Collect>().unwrap();
        assert_eq!(collect.items, vec![1, 2, 3]);
    }
}
