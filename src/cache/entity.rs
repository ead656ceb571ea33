use crate::core::{Eid, RepoError, Result, Role};
use crate::entity::Entity;
use std::collections::HashMap;

/// One relation instance, with the entity types of both ends and whether
/// each side is single-valued according to the schema.
#[derive(Debug, Clone, Copy)]
pub struct RelationLink<'a> {
    pub rtype: &'a str,
    pub subject: (Eid, &'a str),
    pub object: (Eid, &'a str),
    pub subject_single: bool,
    pub object_single: bool,
}

/// Per-transaction cache of materialized entities.
///
/// Insertion is first-wins: once an eid is cached, that instance stays the
/// canonical one for the rest of the transaction.
#[derive(Debug, Default)]
pub struct EntityCache {
    entities: HashMap<Eid, Entity>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, eid: Eid) -> Result<&Entity> {
        self.entities
            .get(&eid)
            .ok_or_else(|| RepoError::NotFound(format!("entity {} is not cached", eid)))
    }

    pub fn get_mut(&mut self, eid: Eid) -> Result<&mut Entity> {
        self.entities
            .get_mut(&eid)
            .ok_or_else(|| RepoError::NotFound(format!("entity {} is not cached", eid)))
    }

    pub fn contains(&self, eid: Eid) -> bool {
        self.entities.contains_key(&eid)
    }

    /// Returns false when an entity was already cached for that eid, in
    /// which case `entity` is dropped.
    pub fn put(&mut self, entity: Entity) -> bool {
        match self.entities.entry(entity.eid()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(entity);
                true
            }
        }
    }

    pub fn drop_entity(&mut self, eid: Eid) -> Option<Entity> {
        let removed = self.entities.remove(&eid);
        if removed.is_some() {
            for entity in self.entities.values_mut() {
                entity.forget_target(eid);
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Patch relation caches after `link` was added.
    ///
    /// The subject's cache is extended when loaded. On the object side a
    /// single-valued reverse link is known exactly and gets set; a
    /// multi-valued one is dropped so it reloads on next access.
    pub fn relation_added(&mut self, link: RelationLink<'_>) {
        let (subject, subject_type) = link.subject;
        let (object, object_type) = link.object;

        if let Some(entity) = self.entities.get_mut(&subject) {
            if let Some(cache) = entity.related_cache_mut(link.rtype, Role::Subject) {
                if link.subject_single {
                    *cache = Default::default();
                }
                if !cache.targets.contains(&object) {
                    cache.push(object, object_type);
                }
            }
        }

        if let Some(entity) = self.entities.get_mut(&object) {
            if link.object_single {
                let mut cache = crate::entity::RelatedCache::default();
                cache.push(subject, subject_type);
                entity.set_related_cache(link.rtype, Role::Object, cache);
            } else {
                entity.clear_related_cache(Some((link.rtype, Role::Object)));
            }
        }
    }

    /// Patch relation caches after `link` was removed.
    pub fn relation_removed(&mut self, link: RelationLink<'_>) {
        let (subject, _) = link.subject;
        let (object, _) = link.object;

        if let Some(entity) = self.entities.get_mut(&subject) {
            if let Some(cache) = entity.related_cache_mut(link.rtype, Role::Subject) {
                cache.remove(object);
            }
        }

        if let Some(entity) = self.entities.get_mut(&object) {
            if link.object_single {
                if let Some(cache) = entity.related_cache_mut(link.rtype, Role::Object) {
                    cache.remove(subject);
                }
            } else {
                entity.clear_related_cache(Some((link.rtype, Role::Object)));
            }
        }
    }
}
