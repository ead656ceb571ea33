use crate::core::{Eid, ResultSet, Role, Value};
use std::collections::{BTreeMap, HashMap};

/// Cached content of one relation of an entity: the raw rows as the querier
/// would return them and the target eids in the same order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelatedCache {
    pub rows: ResultSet,
    pub targets: Vec<Eid>,
}

impl RelatedCache {
    pub fn new(targets: Vec<(Eid, String)>) -> Self {
        let mut cache = Self::default();
        for (eid, etype) in targets {
            cache.push(eid, &etype);
        }
        cache
    }

    pub fn push(&mut self, eid: Eid, etype: &str) {
        self.rows.rows.push(vec![Value::from(eid)]);
        self.rows.description.push(vec![etype.to_string()]);
        self.targets.push(eid);
    }

    pub fn remove(&mut self, eid: Eid) {
        if let Some(pos) = self.targets.iter().position(|target| *target == eid) {
            self.targets.remove(pos);
            self.rows.rows.remove(pos);
            self.rows.description.remove(pos);
        }
    }
}

/// Materialized entity living in a connection's entity cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    eid: Eid,
    etype: String,
    attributes: BTreeMap<String, Value>,
    related: HashMap<(String, Role), RelatedCache>,
}

impl Entity {
    pub fn new(eid: Eid, etype: impl Into<String>, attributes: BTreeMap<String, Value>) -> Self {
        Self {
            eid,
            etype: etype.into(),
            attributes,
            related: HashMap::new(),
        }
    }

    pub fn eid(&self) -> Eid {
        self.eid
    }

    pub fn etype(&self) -> &str {
        &self.etype
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.attributes.get(attr)
    }

    pub fn set(&mut self, attr: impl Into<String>, value: Value) -> Option<Value> {
        self.attributes.insert(attr.into(), value)
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn related_cache(&self, rtype: &str, role: Role) -> Option<&RelatedCache> {
        self.related.get(&(rtype.to_string(), role))
    }

    pub fn related_cache_mut(&mut self, rtype: &str, role: Role) -> Option<&mut RelatedCache> {
        self.related.get_mut(&(rtype.to_string(), role))
    }

    pub fn set_related_cache(&mut self, rtype: &str, role: Role, cache: RelatedCache) {
        self.related.insert((rtype.to_string(), role), cache);
    }

    /// Drop one relation cache, or all of them.
    pub fn clear_related_cache(&mut self, key: Option<(&str, Role)>) {
        match key {
            Some((rtype, role)) => {
                self.related.remove(&(rtype.to_string(), role));
            }
            None => self.related.clear(),
        }
    }

    /// Forget every cached relation pointing at `eid`.
    pub(crate) fn forget_target(&mut self, eid: Eid) {
        self.related
            .retain(|_, cache| !cache.targets.contains(&eid));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_related_cache_keeps_rows_and_targets_aligned() {
        let mut cache = RelatedCache::new(vec![(10, "Tag".into()), (11, "Tag".into())]);
        cache.push(12, "Tag");
        cache.remove(11);

        assert_eq!(cache.targets, vec![10, 12]);
        assert_eq!(cache.rows.eids(), vec![10, 12]);
        assert_eq!(cache.rows.description.len(), 2);
    }

    #[test]
    fn test_forget_target() {
        let mut entity = Entity::new(1, "Blog", BTreeMap::new());
        entity.set_related_cache("tags", Role::Subject, RelatedCache::new(vec![(5, "Tag".into())]));
        entity.set_related_cache("owned_by", Role::Subject, RelatedCache::new(vec![(6, "CWUser".into())]));

        entity.forget_target(5);

        assert!(entity.related_cache("tags", Role::Subject).is_none());
        assert!(entity.related_cache("owned_by", Role::Subject).is_some());
    }
}
