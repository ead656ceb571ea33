//! In-memory system source.
//!
//! Committed data lives behind one shared lock; every cnxset buffers its
//! writes and only publishes them on commit, so uncommitted work is only
//! visible through the cnxset that wrote it.

use super::{CnxSet, Source, StorageResult};
use crate::cache::EidInfo;
use crate::core::{Eid, Role, StorageError, Value};
use crate::entity::Entity;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone)]
struct StoredEntity {
    info: EidInfo,
    attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct Store {
    entities: HashMap<Eid, StoredEntity>,
    relations: BTreeSet<(Eid, String, Eid)>,
}

impl Store {
    fn apply(&mut self, write: Write) {
        match write {
            Write::AddEntity {
                eid,
                info,
                attributes,
            } => {
                self.entities.insert(eid, StoredEntity { info, attributes });
            }
            Write::UpdateEntity { eid, attributes } => {
                if let Some(stored) = self.entities.get_mut(&eid) {
                    stored.attributes.extend(attributes);
                }
            }
            Write::DeleteEntities(eids) => {
                for eid in &eids {
                    self.entities.remove(eid);
                }
                self.relations
                    .retain(|(from, _, to)| !eids.contains(from) && !eids.contains(to));
            }
            Write::AddRelation(from, rtype, to) => {
                self.relations.insert((from, rtype, to));
            }
            Write::DeleteRelation(from, rtype, to) => {
                self.relations.remove(&(from, rtype, to));
            }
        }
    }
}

/// Buffered write of a cnxset, replayed on commit.
#[derive(Debug, Clone)]
enum Write {
    AddEntity {
        eid: Eid,
        info: EidInfo,
        attributes: BTreeMap<String, Value>,
    },
    UpdateEntity {
        eid: Eid,
        attributes: BTreeMap<String, Value>,
    },
    DeleteEntities(Vec<Eid>),
    AddRelation(Eid, String, Eid),
    DeleteRelation(Eid, String, Eid),
}

#[derive(Debug, Default)]
struct SourceStats {
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    reconnects: AtomicUsize,
    cnxsets_opened: AtomicUsize,
}

/// Counters of physical operations, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceStatsSnapshot {
    pub commits: usize,
    pub rollbacks: usize,
    pub reconnects: usize,
    pub cnxsets_opened: usize,
}

#[derive(Debug, Default)]
struct Faults {
    lose_connection: usize,
    fail_commit: Option<String>,
}

pub struct MemorySource {
    uri: String,
    store: Arc<RwLock<Store>>,
    next_eid: AtomicU64,
    stats: Arc<SourceStats>,
    faults: Arc<Mutex<Faults>>,
}

impl MemorySource {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            store: Arc::new(RwLock::new(Store::default())),
            next_eid: AtomicU64::new(1),
            stats: Arc::new(SourceStats::default()),
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    pub fn stats(&self) -> SourceStatsSnapshot {
        SourceStatsSnapshot {
            commits: self.stats.commits.load(Ordering::SeqCst),
            rollbacks: self.stats.rollbacks.load(Ordering::SeqCst),
            reconnects: self.stats.reconnects.load(Ordering::SeqCst),
            cnxsets_opened: self.stats.cnxsets_opened.load(Ordering::SeqCst),
        }
    }

    /// Make the next `count` cnxset calls fail as if the server went away.
    pub fn inject_connection_loss(&self, count: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.lose_connection += count;
        }
    }

    /// Make the next physical commit fail with `reason`.
    pub fn fail_next_commit(&self, reason: impl Into<String>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.fail_commit = Some(reason.into());
        }
    }

    /// Committed attributes of `eid`, bypassing any transaction.
    pub fn committed_attributes(&self, eid: Eid) -> Option<BTreeMap<String, Value>> {
        let store = self.store.read().ok()?;
        store.entities.get(&eid).map(|stored| stored.attributes.clone())
    }

    pub fn committed_entity_count(&self) -> usize {
        self.store.read().map(|store| store.entities.len()).unwrap_or(0)
    }

    pub fn committed_relation(&self, eidfrom: Eid, rtype: &str, eidto: Eid) -> bool {
        self.store
            .read()
            .map(|store| store.relations.contains(&(eidfrom, rtype.to_string(), eidto)))
            .unwrap_or(false)
    }
}

impl Source for MemorySource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn open_cnxset(&self) -> StorageResult<Box<dyn CnxSet>> {
        self.stats.cnxsets_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryCnxSet {
            store: Arc::clone(&self.store),
            pending: Vec::new(),
            connected: true,
            stats: Arc::clone(&self.stats),
            faults: Arc::clone(&self.faults),
        }))
    }

    fn create_id(&self) -> StorageResult<Eid> {
        Ok(self.next_eid.fetch_add(1, Ordering::SeqCst))
    }
}

struct MemoryCnxSet {
    store: Arc<RwLock<Store>>,
    pending: Vec<Write>,
    connected: bool,
    stats: Arc<SourceStats>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryCnxSet {
    fn check_connection(&mut self) -> StorageResult<()> {
        if !self.connected {
            return Err(StorageError::ConnectionLost("not connected".into()));
        }
        let mut faults = self
            .faults
            .lock()
            .map_err(|err| StorageError::Other(err.to_string()))?;
        if faults.lose_connection > 0 {
            faults.lose_connection -= 1;
            self.connected = false;
            self.pending.clear();
            return Err(StorageError::ConnectionLost("server closed the connection".into()));
        }
        Ok(())
    }

    fn read_store(&self) -> StorageResult<RwLockReadGuard<'_, Store>> {
        self.store
            .read()
            .map_err(|err| StorageError::Other(err.to_string()))
    }

    fn write_store(&self) -> StorageResult<RwLockWriteGuard<'_, Store>> {
        self.store
            .write()
            .map_err(|err| StorageError::Other(err.to_string()))
    }

    /// Entity state as seen by this cnxset: committed data overlaid with
    /// its own pending writes.
    fn current_entity(&self, eid: Eid) -> StorageResult<Option<StoredEntity>> {
        let mut current = self.read_store()?.entities.get(&eid).cloned();
        for write in &self.pending {
            match write {
                Write::AddEntity {
                    eid: added,
                    info,
                    attributes,
                } if *added == eid => {
                    current = Some(StoredEntity {
                        info: info.clone(),
                        attributes: attributes.clone(),
                    });
                }
                Write::UpdateEntity {
                    eid: updated,
                    attributes,
                } if *updated == eid => {
                    if let Some(stored) = current.as_mut() {
                        stored
                            .attributes
                            .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                }
                Write::DeleteEntities(eids) if eids.contains(&eid) => current = None,
                _ => {}
            }
        }
        Ok(current)
    }
}

impl CnxSet for MemoryCnxSet {
    fn commit(&mut self) -> StorageResult<()> {
        self.check_connection()?;
        let failure = self
            .faults
            .lock()
            .map_err(|err| StorageError::Other(err.to_string()))?
            .fail_commit
            .take();
        if let Some(reason) = failure {
            return Err(StorageError::Other(reason));
        }

        let pending = std::mem::take(&mut self.pending);
        let mut store = self.write_store()?;
        for write in pending {
            store.apply(write);
        }
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> StorageResult<()> {
        self.pending.clear();
        self.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reconnect(&mut self) -> StorageResult<()> {
        self.pending.clear();
        self.connected = true;
        self.stats.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn add_entity(&mut self, entity: &Entity, info: &EidInfo) -> StorageResult<()> {
        self.check_connection()?;
        if self.current_entity(entity.eid())?.is_some() {
            return Err(StorageError::Constraint(format!(
                "entity {} already exists",
                entity.eid()
            )));
        }
        self.pending.push(Write::AddEntity {
            eid: entity.eid(),
            info: info.clone(),
            attributes: entity.attributes().clone(),
        });
        Ok(())
    }

    fn update_entity(&mut self, entity: &Entity, edited: &[String]) -> StorageResult<()> {
        self.check_connection()?;
        let attributes = edited
            .iter()
            .filter_map(|name| entity.get(name).map(|value| (name.clone(), value.clone())))
            .collect();
        self.pending.push(Write::UpdateEntity {
            eid: entity.eid(),
            attributes,
        });
        Ok(())
    }

    fn delete_entities(&mut self, eids: &[Eid]) -> StorageResult<()> {
        self.check_connection()?;
        self.pending.push(Write::DeleteEntities(eids.to_vec()));
        Ok(())
    }

    fn add_relation(&mut self, eidfrom: Eid, rtype: &str, eidto: Eid) -> StorageResult<()> {
        self.check_connection()?;
        self.pending
            .push(Write::AddRelation(eidfrom, rtype.to_string(), eidto));
        Ok(())
    }

    fn delete_relation(&mut self, eidfrom: Eid, rtype: &str, eidto: Eid) -> StorageResult<()> {
        self.check_connection()?;
        self.pending
            .push(Write::DeleteRelation(eidfrom, rtype.to_string(), eidto));
        Ok(())
    }

    fn related(&mut self, eid: Eid, rtype: &str, role: Role) -> StorageResult<Vec<Eid>> {
        self.check_connection()?;
        let mut links: BTreeSet<(Eid, Eid)> = self
            .read_store()?
            .relations
            .iter()
            .filter(|(_, r, _)| r == rtype)
            .map(|(from, _, to)| (*from, *to))
            .collect();

        for write in &self.pending {
            match write {
                Write::AddRelation(from, r, to) if r == rtype => {
                    links.insert((*from, *to));
                }
                Write::DeleteRelation(from, r, to) if r == rtype => {
                    links.remove(&(*from, *to));
                }
                Write::DeleteEntities(eids) => {
                    links.retain(|(from, to)| !eids.contains(from) && !eids.contains(to));
                }
                _ => {}
            }
        }

        Ok(links
            .into_iter()
            .filter_map(|(from, to)| match role {
                Role::Subject if from == eid => Some(to),
                Role::Object if to == eid => Some(from),
                _ => None,
            })
            .collect())
    }

    fn entity_attributes(&mut self, eid: Eid) -> StorageResult<Option<BTreeMap<String, Value>>> {
        self.check_connection()?;
        Ok(self.current_entity(eid)?.map(|stored| stored.attributes))
    }

    fn eid_info(&mut self, eid: Eid) -> StorageResult<Option<EidInfo>> {
        self.check_connection()?;
        Ok(self.current_entity(eid)?.map(|stored| stored.info))
    }

    fn eid_for_extid(&mut self, source: &str, extid: &str) -> StorageResult<Option<Eid>> {
        self.check_connection()?;
        let matches = |info: &EidInfo| info.source == source && info.extid.as_deref() == Some(extid);

        let committed = self
            .read_store()?
            .entities
            .iter()
            .find(|(_, stored)| matches(&stored.info))
            .map(|(eid, _)| *eid);
        let added = self.pending.iter().find_map(|write| match write {
            Write::AddEntity { eid, info, .. } if matches(info) => Some(*eid),
            _ => None,
        });

        match added.or(committed) {
            Some(eid) if self.current_entity(eid)?.is_some() => Ok(Some(eid)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(eid: Eid, name: &str) -> Entity {
        Entity::new(
            eid,
            "Person",
            BTreeMap::from([("name".to_string(), Value::from(name))]),
        )
    }

    #[test]
    fn test_writes_are_private_until_commit() {
        let source = MemorySource::new("system");
        let mut writer = source.open_cnxset().unwrap();
        let mut reader = source.open_cnxset().unwrap();
        let eid = source.create_id().unwrap();

        writer
            .add_entity(&person(eid, "ann"), &EidInfo::new("Person", "system"))
            .unwrap();
        assert!(writer.entity_attributes(eid).unwrap().is_some());
        assert!(reader.entity_attributes(eid).unwrap().is_none());

        writer.commit().unwrap();
        assert!(reader.entity_attributes(eid).unwrap().is_some());
        assert_eq!(source.stats().commits, 1);
    }

    #[test]
    fn test_rollback_discards_pending_writes() {
        let source = MemorySource::new("system");
        let mut cnxset = source.open_cnxset().unwrap();
        cnxset
            .add_entity(&person(1, "ann"), &EidInfo::new("Person", "system"))
            .unwrap();
        cnxset.rollback().unwrap();
        cnxset.commit().unwrap();

        assert_eq!(source.committed_entity_count(), 0);
        assert_eq!(source.stats().rollbacks, 1);
    }

    #[test]
    fn test_duplicate_eid_is_a_constraint_violation() {
        let source = MemorySource::new("system");
        let mut cnxset = source.open_cnxset().unwrap();
        let info = EidInfo::new("Person", "system");
        cnxset.add_entity(&person(1, "ann"), &info).unwrap();

        let err = cnxset.add_entity(&person(1, "bob"), &info).unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)));
    }

    #[test]
    fn test_related_sees_pending_relations_and_deletions() {
        let source = MemorySource::new("system");
        let mut cnxset = source.open_cnxset().unwrap();
        cnxset.add_relation(1, "knows", 2).unwrap();
        cnxset.add_relation(1, "knows", 3).unwrap();
        cnxset.commit().unwrap();

        cnxset.delete_relation(1, "knows", 2).unwrap();
        cnxset.add_relation(4, "knows", 3).unwrap();

        assert_eq!(cnxset.related(1, "knows", Role::Subject).unwrap(), vec![3]);
        assert_eq!(cnxset.related(3, "knows", Role::Object).unwrap(), vec![1, 4]);

        cnxset.delete_entities(&[4]).unwrap();
        assert_eq!(cnxset.related(3, "knows", Role::Object).unwrap(), vec![1]);
    }

    #[test]
    fn test_connection_loss_until_reconnect() {
        let source = MemorySource::new("system");
        let mut cnxset = source.open_cnxset().unwrap();
        source.inject_connection_loss(1);

        let err = cnxset.entity_attributes(1).unwrap_err();
        assert!(matches!(err, StorageError::ConnectionLost(_)));
        assert!(cnxset.entity_attributes(1).is_err());

        cnxset.reconnect().unwrap();
        assert!(cnxset.entity_attributes(1).unwrap().is_none());
        assert_eq!(source.stats().reconnects, 1);
    }

    #[test]
    fn test_extid_lookup() {
        let source = MemorySource::new("system");
        let mut cnxset = source.open_cnxset().unwrap();
        let info = EidInfo::new("Person", "ldap").with_extid("uid=ann");
        cnxset.add_entity(&person(9, "ann"), &info).unwrap();

        assert_eq!(cnxset.eid_for_extid("ldap", "uid=ann").unwrap(), Some(9));
        assert_eq!(cnxset.eid_for_extid("ldap", "uid=bob").unwrap(), None);
        assert_eq!(cnxset.eid_info(9).unwrap(), Some(info));
    }
}
