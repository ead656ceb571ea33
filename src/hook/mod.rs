//! Business rule hooks.
//!
//! Hooks are registered once at startup in a [`HooksRegistry`] and frozen
//! into a [`HooksManager`] table. Data operations of a connection fire
//! events; the manager selects the hooks that apply and calls them in a
//! deterministic order.

pub mod builtin;
pub mod manager;

use crate::connection::Connection;
use crate::core::{Eid, Result, Value};
use std::collections::BTreeMap;
use std::fmt;

pub use manager::{HooksManager, HooksRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookEvent {
    BeforeAddEntity,
    AfterAddEntity,
    BeforeUpdateEntity,
    AfterUpdateEntity,
    BeforeDeleteEntity,
    AfterDeleteEntity,
    BeforeAddRelation,
    AfterAddRelation,
    BeforeDeleteRelation,
    AfterDeleteRelation,
    ServerStartup,
    ServerShutdown,
    SessionOpen,
    SessionClose,
}

impl HookEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::BeforeAddEntity => "before_add_entity",
            HookEvent::AfterAddEntity => "after_add_entity",
            HookEvent::BeforeUpdateEntity => "before_update_entity",
            HookEvent::AfterUpdateEntity => "after_update_entity",
            HookEvent::BeforeDeleteEntity => "before_delete_entity",
            HookEvent::AfterDeleteEntity => "after_delete_entity",
            HookEvent::BeforeAddRelation => "before_add_relation",
            HookEvent::AfterAddRelation => "after_add_relation",
            HookEvent::BeforeDeleteRelation => "before_delete_relation",
            HookEvent::AfterDeleteRelation => "after_delete_relation",
            HookEvent::ServerStartup => "server_startup",
            HookEvent::ServerShutdown => "server_shutdown",
            HookEvent::SessionOpen => "session_open",
            HookEvent::SessionClose => "session_close",
        }
    }

    pub fn is_entity_event(&self) -> bool {
        matches!(
            self,
            HookEvent::BeforeAddEntity
                | HookEvent::AfterAddEntity
                | HookEvent::BeforeUpdateEntity
                | HookEvent::AfterUpdateEntity
                | HookEvent::BeforeDeleteEntity
                | HookEvent::AfterDeleteEntity
        )
    }

    pub fn is_relation_event(&self) -> bool {
        matches!(
            self,
            HookEvent::BeforeAddRelation
                | HookEvent::AfterAddRelation
                | HookEvent::BeforeDeleteRelation
                | HookEvent::AfterDeleteRelation
        )
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What an event is about.
#[derive(Debug, Clone, PartialEq)]
pub enum HookContext {
    /// `edited` holds the attribute values being written (empty on delete)
    Entity {
        eid: Eid,
        etype: String,
        edited: BTreeMap<String, Value>,
    },
    Relation {
        eidfrom: Eid,
        rtype: String,
        eidto: Eid,
    },
    Session {
        session_id: String,
        login: String,
    },
    Server,
}

impl HookContext {
    pub fn entity(eid: Eid, etype: &str, edited: BTreeMap<String, Value>) -> Self {
        HookContext::Entity {
            eid,
            etype: etype.to_string(),
            edited,
        }
    }

    pub fn relation(eidfrom: Eid, rtype: &str, eidto: Eid) -> Self {
        HookContext::Relation {
            eidfrom,
            rtype: rtype.to_string(),
            eidto,
        }
    }

    /// Entity type or relation type used to narrow hook selection.
    pub fn type_key(&self) -> Option<&str> {
        match self {
            HookContext::Entity { etype, .. } => Some(etype),
            HookContext::Relation { rtype, .. } => Some(rtype),
            HookContext::Session { .. } | HookContext::Server => None,
        }
    }
}

/// A business rule reacting to repository events.
pub trait Hook: Send + Sync {
    /// Unique identifier, for logs and debugging
    fn id(&self) -> &str;

    fn events(&self) -> &[HookEvent];

    /// Category used by hook control (`deny_all_hooks_but` and friends)
    fn category(&self) -> &str;

    /// Entity or relation types the hook is restricted to; empty means any.
    fn types(&self) -> &[&'static str] {
        &[]
    }

    /// Lower runs first. Hooks with the same order run in registration order.
    fn order(&self) -> i32 {
        0
    }

    /// Zero means the hook does not apply.
    fn score(&self, _cnx: &Connection, _ctx: &HookContext) -> u32 {
        1
    }

    fn call(&self, cnx: &mut Connection, event: HookEvent, ctx: &HookContext) -> Result<()>;
}
