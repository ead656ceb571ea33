//! Storage adapter interface.
//!
//! A [`Source`] hands out [`CnxSet`]s, the physical handles pooled by the
//! repository. Every write of a transaction goes through the cnxset bound
//! to its connection and becomes durable on [`CnxSet::commit`].

pub mod memory;

use crate::cache::EidInfo;
use crate::core::{Eid, Role, StorageError, Value};
use crate::entity::Entity;
use std::collections::BTreeMap;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

pub trait CnxSet: Send {
    fn commit(&mut self) -> StorageResult<()>;

    fn rollback(&mut self) -> StorageResult<()>;

    /// Re-establish a lost physical connection. Uncommitted work is lost.
    fn reconnect(&mut self) -> StorageResult<()>;

    fn add_entity(&mut self, entity: &Entity, info: &EidInfo) -> StorageResult<()>;

    /// Write the `edited` attributes of `entity`.
    fn update_entity(&mut self, entity: &Entity, edited: &[String]) -> StorageResult<()>;

    fn delete_entities(&mut self, eids: &[Eid]) -> StorageResult<()>;

    fn add_relation(&mut self, eidfrom: Eid, rtype: &str, eidto: Eid) -> StorageResult<()>;

    fn delete_relation(&mut self, eidfrom: Eid, rtype: &str, eidto: Eid) -> StorageResult<()>;

    /// Eids related to `eid` through `rtype`, `eid` standing on `role`.
    fn related(&mut self, eid: Eid, rtype: &str, role: Role) -> StorageResult<Vec<Eid>>;

    fn entity_attributes(&mut self, eid: Eid) -> StorageResult<Option<BTreeMap<String, Value>>>;

    fn eid_info(&mut self, eid: Eid) -> StorageResult<Option<EidInfo>>;

    fn eid_for_extid(&mut self, source: &str, extid: &str) -> StorageResult<Option<Eid>>;

    /// Called once when the pool shuts down.
    fn close(&mut self) {}
}

impl std::fmt::Debug for dyn CnxSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CnxSet")
    }
}

pub trait Source: Send + Sync {
    fn uri(&self) -> &str;

    fn open_cnxset(&self) -> StorageResult<Box<dyn CnxSet>>;

    /// Allocate a fresh eid, outside of any transaction.
    fn create_id(&self) -> StorageResult<Eid>;
}
