use crate::core::{Eid, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, RwLock};

/// Entity type and origin of an eid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EidInfo {
    pub etype: String,
    pub extid: Option<String>,
    pub source: String,
}

impl EidInfo {
    pub fn new(etype: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            etype: etype.into(),
            extid: None,
            source: source.into(),
        }
    }

    pub fn with_extid(mut self, extid: impl Into<String>) -> Self {
        self.extid = Some(extid.into());
        self
    }
}

/// Repository-wide `eid -> (type, extid, source)` cache, plus a bounded
/// `(source, extid) -> eid` cache for entities imported from external
/// sources.
pub struct TypeSourceCache {
    types: RwLock<HashMap<Eid, EidInfo>>,
    extids: Mutex<LruCache<(String, String), Eid>>,
}

impl TypeSourceCache {
    pub fn new(extid_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(extid_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            types: RwLock::new(HashMap::new()),
            extids: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, eid: Eid) -> Result<Option<EidInfo>> {
        Ok(self.types.read()?.get(&eid).cloned())
    }

    pub fn insert(&self, eid: Eid, info: EidInfo) -> Result<()> {
        if let Some(extid) = &info.extid {
            self.extids
                .lock()?
                .put((info.source.clone(), extid.clone()), eid);
        }
        self.types.write()?.insert(eid, info);
        Ok(())
    }

    pub fn extid_to_eid(&self, source: &str, extid: &str) -> Result<Option<Eid>> {
        let mut extids = self.extids.lock()?;
        Ok(extids.get(&(source.to_string(), extid.to_string())).copied())
    }

    /// Drop eids from both caches.
    pub fn remove<'a>(&self, eids: impl IntoIterator<Item = &'a Eid>) -> Result<()> {
        let mut types = self.types.write()?;
        let mut extids = self.extids.lock()?;
        for eid in eids {
            if let Some(EidInfo {
                extid: Some(extid),
                source,
                ..
            }) = types.remove(eid)
            {
                extids.pop(&(source, extid));
            }
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.types.write()?.clear();
        self.extids.lock()?.clear();
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.types.read()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_remove() {
        let cache = TypeSourceCache::new(10);
        cache.insert(1, EidInfo::new("Person", "system")).unwrap();
        cache
            .insert(2, EidInfo::new("Person", "ldap").with_extid("uid=bob"))
            .unwrap();

        assert_eq!(cache.get(1).unwrap().unwrap().etype, "Person");
        assert_eq!(cache.extid_to_eid("ldap", "uid=bob").unwrap(), Some(2));

        cache.remove(&[1, 2]).unwrap();
        assert!(cache.get(1).unwrap().is_none());
        assert_eq!(cache.extid_to_eid("ldap", "uid=bob").unwrap(), None);
        assert_eq!(cache.len().unwrap(), 0);
    }

    #[test]
    fn test_extid_cache_is_bounded() {
        let cache = TypeSourceCache::new(1);
        cache.insert(1, EidInfo::new("Person", "ldap").with_extid("a")).unwrap();
        cache.insert(2, EidInfo::new("Person", "ldap").with_extid("b")).unwrap();

        assert_eq!(cache.extid_to_eid("ldap", "a").unwrap(), None);
        assert_eq!(cache.extid_to_eid("ldap", "b").unwrap(), Some(2));
        // the type cache itself is not bounded
        assert_eq!(cache.len().unwrap(), 2);
    }
}
