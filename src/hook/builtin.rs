//! Hooks every repository runs: mandatory relation checks ("integrity")
//! and write permission checks ("security").

use super::{Hook, HookContext, HookEvent};
use crate::connection::Connection;
use crate::core::{RepoError, Result, Role};
use crate::schema::Action;
use crate::transaction::{Operation, PermissionCheck, RequiredRelationCheck};

pub const INTEGRITY: &str = "integrity";
pub const SECURITY: &str = "security";

/// Registers a precommit check for relations with a `1` or `+`
/// cardinality, on new entities and on entities losing such a relation.
pub struct CheckRequiredRelationsHook;

impl Hook for CheckRequiredRelationsHook {
    fn id(&self) -> &str {
        "integrity.check_required_relations"
    }

    fn events(&self) -> &[HookEvent] {
        &[HookEvent::AfterAddEntity, HookEvent::AfterDeleteRelation]
    }

    fn category(&self) -> &str {
        INTEGRITY
    }

    fn call(&self, cnx: &mut Connection, _event: HookEvent, ctx: &HookContext) -> Result<()> {
        let repo = cnx.repo().clone();
        let schema = repo.schema();
        let mut checks = Vec::new();

        match ctx {
            HookContext::Entity { eid, etype, .. } => {
                for role in [Role::Subject, Role::Object] {
                    for rdef in schema.relations_of(etype, role) {
                        let required = rdef.cardinality_for(role).is_required();
                        let known = checks.iter().any(|c: &RequiredRelationCheck| {
                            c.rtype == rdef.rtype && c.role == role
                        });
                        if required && !known {
                            checks.push(RequiredRelationCheck {
                                eid: *eid,
                                etype: etype.clone(),
                                rtype: rdef.rtype.clone(),
                                role,
                            });
                        }
                    }
                }
            }
            HookContext::Relation {
                eidfrom,
                rtype,
                eidto,
            } => {
                let subject = cnx.describe(*eidfrom)?.etype;
                let object = cnx.describe(*eidto)?.etype;
                if let Some(rdef) = schema.relation_definition(&subject, rtype, &object) {
                    let ends = [
                        (*eidfrom, subject.clone(), Role::Subject),
                        (*eidto, object.clone(), Role::Object),
                    ];
                    for (eid, etype, role) in ends {
                        if rdef.cardinality_for(role).is_required() {
                            checks.push(RequiredRelationCheck {
                                eid,
                                etype,
                                rtype: rtype.clone(),
                                role,
                            });
                        }
                    }
                }
            }
            _ => {}
        }

        if !checks.is_empty() {
            cnx.add_operation(Operation::CheckRequiredRelations(checks))?;
        }
        Ok(())
    }
}

/// Enforces the schema write permissions of the connection's user.
///
/// Entity permissions are checked at precommit time, once the entity
/// holds its final values; relation permissions are checked immediately.
/// Does not apply to internal connections or when write security is off.
pub struct CheckPermissionHook;

impl Hook for CheckPermissionHook {
    fn id(&self) -> &str {
        "security.check_permission"
    }

    fn events(&self) -> &[HookEvent] {
        &[
            HookEvent::AfterAddEntity,
            HookEvent::BeforeUpdateEntity,
            HookEvent::BeforeDeleteEntity,
            HookEvent::BeforeAddRelation,
            HookEvent::BeforeDeleteRelation,
        ]
    }

    fn category(&self) -> &str {
        SECURITY
    }

    fn order(&self) -> i32 {
        -100
    }

    fn score(&self, cnx: &Connection, _ctx: &HookContext) -> u32 {
        u32::from(cnx.write_security() && !cnx.is_internal())
    }

    fn call(&self, cnx: &mut Connection, event: HookEvent, ctx: &HookContext) -> Result<()> {
        match ctx {
            HookContext::Entity { eid, etype, .. } => {
                let action = match event {
                    HookEvent::AfterAddEntity => Action::Add,
                    HookEvent::BeforeUpdateEntity => Action::Update,
                    _ => Action::Delete,
                };
                cnx.add_operation(Operation::CheckPermissions(vec![PermissionCheck {
                    eid: *eid,
                    etype: etype.clone(),
                    action,
                }]))
            }
            HookContext::Relation {
                eidfrom,
                rtype,
                eidto,
            } => {
                let action = match event {
                    HookEvent::BeforeAddRelation => Action::Add,
                    _ => Action::Delete,
                };
                let subject = cnx.describe(*eidfrom)?.etype;
                let object = cnx.describe(*eidto)?.etype;
                let repo = cnx.repo().clone();
                let allowed = repo
                    .schema()
                    .relation_definition(&subject, rtype, &object)
                    .is_some_and(|rdef| rdef.permissions.allows(action, cnx.user().groups()));
                if allowed {
                    Ok(())
                } else {
                    Err(RepoError::Unauthorized(format!(
                        "{} may not {} relation {} between #{} and #{}",
                        cnx.user().login(),
                        action,
                        rtype,
                        eidfrom,
                        eidto
                    )))
                }
            }
            _ => Ok(()),
        }
    }
}
