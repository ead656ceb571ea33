pub mod auth;
pub mod config;
pub mod control;
pub mod pool;

use crate::cache::{EidInfo, EntityCache, RelationLink};
use crate::core::{Args, Eid, RepoError, Result, ResultSet, Role, StorageError, Value};
use crate::entity::{Entity, RelatedCache};
use crate::hook::{HookContext, HookEvent};
use crate::repository::RepositoryCore;
use crate::source::{CnxSet, StorageResult};
use crate::transaction::{
    CommitState, Operation, OperationEvent, OperationQueue, TransactionId, UndoAction,
};
use crate::worker::MailMessage;
use auth::User;
use control::{HooksControl, HooksGuard, HooksMode, HooksState, SecurityControl, SecurityGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Open,
    Closed,
}

/// Whether the running transaction wrote anything yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionMode {
    Read,
    Write,
}

/// Repository connection
///
/// Carries one logical transaction at a time: its storage handle, pending
/// operations, entity cache and security/hook settings. A connection is a
/// scoped resource; dropping an open one rolls back and gives its handle
/// back to the pool.
pub struct Connection {
    id: String,
    session_id: Option<String>,
    user: User,
    repo: Arc<RepositoryCore>,
    state: ConnectionState,
    mode: TransactionMode,
    is_internal: bool,
    lang: String,
    cnxset: Option<Box<dyn CnxSet>>,
    transaction_data: HashMap<String, serde_json::Value>,
    transaction_uuid: Option<String>,
    pending_operations: OperationQueue,
    commit_state: CommitState,
    hooks: HooksControl,
    security: SecurityControl,
    hooks_in_progress: bool,
    entity_cache: EntityCache,
    undo_actions: Vec<UndoAction>,
    deleted_eids: BTreeSet<Eid>,
    storage_dirty: bool,
}

impl Connection {
    /// Open a connection for `user`, bound to a storage handle.
    pub fn open(repo: Arc<RepositoryCore>, user: User, session_id: Option<String>) -> Result<Self> {
        let lang = user
            .language()
            .unwrap_or(repo.config().default_language.as_str())
            .to_string();
        let cnxset = repo.pool().acquire()?;
        let id = uuid::Uuid::new_v4().to_string();
        debug!(cnx = %id, login = user.login(), "connection opened");

        Ok(Self {
            id,
            session_id,
            user,
            repo,
            state: ConnectionState::Open,
            mode: TransactionMode::Read,
            is_internal: false,
            lang,
            cnxset: Some(cnxset),
            transaction_data: HashMap::new(),
            transaction_uuid: None,
            pending_operations: OperationQueue::new(),
            commit_state: CommitState::None,
            hooks: HooksControl::default(),
            security: SecurityControl::default(),
            hooks_in_progress: false,
            entity_cache: EntityCache::new(),
            undo_actions: Vec::new(),
            deleted_eids: BTreeSet::new(),
            storage_dirty: false,
        })
    }

    /// Connection of the internal manager, with security disabled.
    pub fn open_internal(repo: Arc<RepositoryCore>) -> Result<Self> {
        let mut cnx = Self::open(repo, User::internal(), None)?;
        cnx.is_internal = true;
        cnx.security = SecurityControl::disabled();
        Ok(cnx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn repo(&self) -> &Arc<RepositoryCore> {
        &self.repo
    }

    pub fn lang(&self) -> &str {
        &self.lang
    }

    pub fn set_lang(&mut self, lang: &str) {
        self.lang = lang.to_string();
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn is_internal(&self) -> bool {
        self.is_internal
    }

    pub fn commit_state(&self) -> CommitState {
        self.commit_state
    }

    /// Nothing written and nothing pending in the running transaction.
    pub fn is_read_only(&self) -> bool {
        self.mode == TransactionMode::Read && self.pending_operations.is_empty()
    }

    fn check_open(&self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(RepoError::Programming("connection is closed".into()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transaction scoped state
    // ------------------------------------------------------------------

    pub fn transaction_data(&self) -> &HashMap<String, serde_json::Value> {
        &self.transaction_data
    }

    pub fn transaction_data_mut(&mut self) -> &mut HashMap<String, serde_json::Value> {
        &mut self.transaction_data
    }

    /// Identifier of the running transaction, created on first use.
    pub fn transaction_uuid(&mut self) -> &str {
        self.transaction_uuid
            .get_or_insert_with(|| uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn pending_operations(&self) -> &OperationQueue {
        &self.pending_operations
    }

    pub fn add_operation(&mut self, operation: Operation) -> Result<()> {
        self.check_open()?;
        self.pending_operations.add(operation);
        Ok(())
    }

    /// Queue a message, sent by the mail worker once the transaction is
    /// committed.
    pub fn queue_mail(&mut self, message: MailMessage) -> Result<()> {
        self.add_operation(Operation::SendMail(vec![message]))
    }

    pub fn deleted_in_transaction(&self, eid: Eid) -> bool {
        self.deleted_eids.contains(&eid)
    }

    pub fn entity_cache(&self) -> &EntityCache {
        &self.entity_cache
    }

    /// Drop one cached entity, or the whole cache.
    pub fn drop_entity_cache(&mut self, eid: Option<Eid>) {
        match eid {
            Some(eid) => {
                self.entity_cache.drop_entity(eid);
            }
            None => self.entity_cache.clear(),
        }
    }

    // ------------------------------------------------------------------
    // Hooks and security control
    // ------------------------------------------------------------------

    pub fn hooks_state(&self) -> &HooksState {
        self.hooks.current()
    }

    pub fn is_hook_category_active(&self, category: &str) -> bool {
        self.hooks.current().is_category_active(category)
    }

    /// Only run hooks of the given categories until the guard is dropped.
    pub fn deny_all_hooks_but<I, S>(&mut self, categories: I) -> HooksGuard<'_>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        HooksGuard::enter(self, HooksState::new(HooksMode::DenyAll, categories))
    }

    /// Run every hook but those of the given categories until the guard is
    /// dropped.
    pub fn allow_all_hooks_but<I, S>(&mut self, categories: I) -> HooksGuard<'_>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        HooksGuard::enter(self, HooksState::new(HooksMode::AllowAll, categories))
    }

    /// Change read/write security until the guard is dropped. `None`
    /// keeps the current value.
    pub fn security_enabled(&mut self, read: Option<bool>, write: Option<bool>) -> SecurityGuard<'_> {
        SecurityGuard::enter(self, read, write)
    }

    pub fn read_security(&self) -> bool {
        self.security.current().read_enabled()
    }

    pub fn write_security(&self) -> bool {
        self.security.current().write_enabled()
    }

    pub fn hooks_in_progress(&self) -> bool {
        self.hooks_in_progress
    }

    pub(crate) fn set_hooks_in_progress(&mut self, value: bool) -> bool {
        std::mem::replace(&mut self.hooks_in_progress, value)
    }

    /// Depth of the (hooks, security) control stacks.
    pub fn control_depth(&self) -> (usize, usize) {
        (self.hooks.depth(), self.security.depth())
    }

    pub fn call_hooks(&mut self, event: HookEvent, ctx: &HookContext) -> Result<()> {
        let repo = Arc::clone(&self.repo);
        repo.hooks().call_hooks(self, event, ctx)
    }

    // ------------------------------------------------------------------
    // Storage handle
    // ------------------------------------------------------------------

    pub fn has_cnxset(&self) -> bool {
        self.cnxset.is_some()
    }

    fn cnxset(&mut self) -> Result<&mut (dyn CnxSet + 'static)> {
        if self.cnxset.is_none() {
            let cnxset = self.repo.pool().acquire()?;
            self.cnxset = Some(cnxset);
        }
        self.cnxset
            .as_deref_mut()
            .ok_or_else(|| RepoError::Programming("no connections set bound".into()))
    }

    /// Give the storage handle back to the pool before the end of a read
    /// only transaction. It is acquired again on next use.
    pub fn free_cnxset(&mut self) -> Result<()> {
        self.check_open()?;
        if self.mode == TransactionMode::Write || !self.pending_operations.is_empty() {
            return Err(RepoError::Programming(
                "cannot free the connections set of a writing transaction".into(),
            ));
        }
        if let Some(mut cnxset) = self.cnxset.take() {
            if let Err(err) = cnxset.rollback() {
                warn!(cnx = %self.id, %err, "rollback before freeing connections set failed");
            }
            self.repo.pool().release(cnxset);
        }
        Ok(())
    }

    fn release_cnxset(&mut self) {
        if let Some(cnxset) = self.cnxset.take() {
            self.repo.pool().release(cnxset);
        }
    }

    /// Run `f` on the bound storage handle. A lost connection is
    /// re-established and `f` retried once, as long as the transaction has
    /// not written to the storage yet; any other storage error, or a second
    /// failure, is returned.
    ///
    /// Reconnecting drops uncommitted writes, so a connection lost after a
    /// write is not retried and leaves the transaction uncommitable.
    pub fn with_cnxset<T>(
        &mut self,
        mut f: impl FnMut(&mut dyn CnxSet) -> StorageResult<T>,
    ) -> Result<T> {
        self.check_open()?;
        let cnxset = self.cnxset()?;
        let reason = match f(&mut *cnxset) {
            Err(StorageError::ConnectionLost(reason)) => reason,
            result => return Ok(result?),
        };

        if self.storage_dirty {
            error!(cnx = %self.id, %reason, "storage connection lost with uncommitted writes");
            if self.commit_state == CommitState::None {
                self.commit_state = CommitState::Uncommitable;
            }
            return Err(StorageError::ConnectionLost(reason).into());
        }

        warn!(cnx = %self.id, %reason, "storage connection lost, reconnecting");
        let cnxset = self.cnxset()?;
        cnxset.reconnect()?;
        Ok(f(&mut *cnxset)?)
    }

    /// [`Connection::with_cnxset`] for calls writing to the storage.
    fn write_with_cnxset<T>(
        &mut self,
        f: impl FnMut(&mut dyn CnxSet) -> StorageResult<T>,
    ) -> Result<T> {
        let value = self.with_cnxset(f)?;
        self.storage_dirty = true;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Queries and data operations
    // ------------------------------------------------------------------

    pub fn execute(&mut self, query: &str, args: &Args, build_descr: bool) -> Result<ResultSet> {
        let repo = Arc::clone(&self.repo);
        self.guard_business_rules(|cnx| repo.querier().execute(cnx, query, args, build_descr))
    }

    /// Business rule failures escaping a query or a data operation leave
    /// the transaction uncommitable.
    fn guard_business_rules<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.check_open()?;
        let result = f(self);
        if let Err(err) = &result {
            if err.is_business_rule() && self.commit_state == CommitState::None {
                warn!(cnx = %self.id, %err, "transaction marked uncommitable");
                self.commit_state = CommitState::Uncommitable;
            }
        }
        result
    }

    /// Type, extid and source of `eid`, from the repository cache or the
    /// storage.
    pub fn describe(&mut self, eid: Eid) -> Result<EidInfo> {
        if let Some(info) = self.repo.type_cache().get(eid)? {
            return Ok(info);
        }
        let info = self
            .with_cnxset(|cnxset| cnxset.eid_info(eid))?
            .ok_or(RepoError::UnknownEid(eid))?;
        self.repo.type_cache().insert(eid, info.clone())?;
        Ok(info)
    }

    pub fn extid2eid(&mut self, source: &str, extid: &str) -> Result<Option<Eid>> {
        if let Some(eid) = self.repo.type_cache().extid_to_eid(source, extid)? {
            return Ok(Some(eid));
        }
        let eid = self.with_cnxset(|cnxset| cnxset.eid_for_extid(source, extid))?;
        if let Some(eid) = eid {
            self.describe(eid)?;
        }
        Ok(eid)
    }

    pub fn eid2extid(&mut self, eid: Eid) -> Result<Option<String>> {
        Ok(self.describe(eid)?.extid)
    }

    /// The cached entity for `eid`, loaded from storage on first access.
    pub fn entity_from_eid(&mut self, eid: Eid) -> Result<&Entity> {
        if !self.entity_cache.contains(eid) {
            if self.deleted_in_transaction(eid) {
                return Err(RepoError::UnknownEid(eid));
            }
            let info = self.describe(eid)?;
            let attributes = self
                .with_cnxset(|cnxset| cnxset.entity_attributes(eid))?
                .ok_or(RepoError::UnknownEid(eid))?;
            self.entity_cache
                .put(Entity::new(eid, info.etype, attributes));
        }
        self.entity_cache.get(eid)
    }

    /// Eids related to `eid` through `rtype`, served from the entity's
    /// relation cache when loaded.
    pub fn related(&mut self, eid: Eid, rtype: &str, role: Role) -> Result<Vec<Eid>> {
        if let Ok(entity) = self.entity_cache.get(eid) {
            if let Some(cache) = entity.related_cache(rtype, role) {
                return Ok(cache.targets.clone());
            }
        }

        let targets = self.with_cnxset(|cnxset| cnxset.related(eid, rtype, role))?;
        if self.entity_cache.contains(eid) {
            let mut typed = Vec::with_capacity(targets.len());
            for target in &targets {
                typed.push((*target, self.describe(*target)?.etype));
            }
            self.entity_cache
                .get_mut(eid)?
                .set_related_cache(rtype, role, RelatedCache::new(typed));
        }
        Ok(targets)
    }

    pub fn create_entity(&mut self, etype: &str, attributes: BTreeMap<String, Value>) -> Result<Eid> {
        self.guard_business_rules(|cnx| cnx.create_entity_unchecked(etype, attributes))
    }

    fn create_entity_unchecked(
        &mut self,
        etype: &str,
        attributes: BTreeMap<String, Value>,
    ) -> Result<Eid> {
        let repo = Arc::clone(&self.repo);
        let eid = repo.source().create_id()?;
        repo.schema().check_attributes(eid, etype, &attributes, true)?;
        self.mode = TransactionMode::Write;

        let ctx = HookContext::entity(eid, etype, attributes.clone());
        self.call_hooks(HookEvent::BeforeAddEntity, &ctx)?;

        let entity = Entity::new(eid, etype, attributes);
        let info = EidInfo::new(etype, repo.source().uri());
        self.write_with_cnxset(|cnxset| cnxset.add_entity(&entity, &info))?;
        repo.type_cache().insert(eid, info)?;
        self.pending_operations
            .add(Operation::CleanupNewEids(BTreeSet::from([eid])));
        self.entity_cache.put(entity);
        self.undo_actions.push(UndoAction::CreateEntity {
            eid,
            etype: etype.to_string(),
        });

        self.call_hooks(HookEvent::AfterAddEntity, &ctx)?;
        debug!(eid, etype, "entity created");
        Ok(eid)
    }

    pub fn update_entity(&mut self, eid: Eid, attributes: BTreeMap<String, Value>) -> Result<()> {
        self.guard_business_rules(|cnx| cnx.update_entity_unchecked(eid, attributes))
    }

    fn update_entity_unchecked(
        &mut self,
        eid: Eid,
        attributes: BTreeMap<String, Value>,
    ) -> Result<()> {
        let etype = self.entity_from_eid(eid)?.etype().to_string();
        let repo = Arc::clone(&self.repo);
        repo.schema().check_attributes(eid, &etype, &attributes, false)?;
        self.mode = TransactionMode::Write;

        let ctx = HookContext::entity(eid, &etype, attributes.clone());
        self.call_hooks(HookEvent::BeforeUpdateEntity, &ctx)?;

        let edited: Vec<String> = attributes.keys().cloned().collect();
        self.entity_from_eid(eid)?;
        let entity = self.entity_cache.get_mut(eid)?;
        let mut previous = BTreeMap::new();
        for (name, value) in attributes {
            let old = entity.set(name.clone(), value).unwrap_or(Value::Null);
            previous.insert(name, old);
        }
        let entity = entity.clone();
        self.write_with_cnxset(|cnxset| cnxset.update_entity(&entity, &edited))?;
        self.undo_actions.push(UndoAction::UpdateEntity {
            eid,
            etype,
            previous,
        });

        self.call_hooks(HookEvent::AfterUpdateEntity, &ctx)
    }

    pub fn delete_entities(&mut self, eids: &[Eid]) -> Result<()> {
        self.guard_business_rules(|cnx| cnx.delete_entities_unchecked(eids))
    }

    fn delete_entities_unchecked(&mut self, eids: &[Eid]) -> Result<()> {
        let mut doomed = Vec::new();
        for &eid in eids {
            if self.deleted_in_transaction(eid) || doomed.iter().any(|(e, _)| *e == eid) {
                continue;
            }
            let entity = self.entity_from_eid(eid)?.clone();
            doomed.push((eid, entity));
        }
        if doomed.is_empty() {
            return Ok(());
        }
        self.mode = TransactionMode::Write;

        let contexts: Vec<HookContext> = doomed
            .iter()
            .map(|(eid, entity)| HookContext::entity(*eid, entity.etype(), BTreeMap::new()))
            .collect();
        for ctx in &contexts {
            self.call_hooks(HookEvent::BeforeDeleteEntity, ctx)?;
        }

        let doomed_eids: Vec<Eid> = doomed.iter().map(|(eid, _)| *eid).collect();
        self.write_with_cnxset(|cnxset| cnxset.delete_entities(&doomed_eids))?;

        for (eid, entity) in doomed {
            self.entity_cache.drop_entity(eid);
            self.deleted_eids.insert(eid);
            self.undo_actions.push(UndoAction::DeleteEntity {
                eid,
                etype: entity.etype().to_string(),
                attributes: entity.attributes().clone(),
            });
        }
        self.pending_operations.add(Operation::CleanupDeletedEids(
            doomed_eids.iter().copied().collect(),
        ));

        for ctx in &contexts {
            self.call_hooks(HookEvent::AfterDeleteEntity, ctx)?;
        }
        Ok(())
    }

    pub fn add_relation(&mut self, eidfrom: Eid, rtype: &str, eidto: Eid) -> Result<()> {
        self.guard_business_rules(|cnx| cnx.change_relation(eidfrom, rtype, eidto, true))
    }

    pub fn delete_relation(&mut self, eidfrom: Eid, rtype: &str, eidto: Eid) -> Result<()> {
        self.guard_business_rules(|cnx| cnx.change_relation(eidfrom, rtype, eidto, false))
    }

    fn change_relation(&mut self, eidfrom: Eid, rtype: &str, eidto: Eid, add: bool) -> Result<()> {
        for eid in [eidfrom, eidto] {
            if self.deleted_in_transaction(eid) {
                return Err(RepoError::UnknownEid(eid));
            }
        }
        let subject = self.describe(eidfrom)?.etype;
        let object = self.describe(eidto)?.etype;
        let repo = Arc::clone(&self.repo);
        let rdef = repo
            .schema()
            .relation_definition(&subject, rtype, &object)
            .ok_or_else(|| {
                RepoError::Execution(format!(
                    "no relation {} between {} and {}",
                    rtype, subject, object
                ))
            })?;
        self.mode = TransactionMode::Write;

        let (before, after) = if add {
            (HookEvent::BeforeAddRelation, HookEvent::AfterAddRelation)
        } else {
            (HookEvent::BeforeDeleteRelation, HookEvent::AfterDeleteRelation)
        };
        let ctx = HookContext::relation(eidfrom, rtype, eidto);
        self.call_hooks(before, &ctx)?;

        let link = RelationLink {
            rtype,
            subject: (eidfrom, &subject),
            object: (eidto, &object),
            subject_single: rdef.subject_cardinality.is_single(),
            object_single: rdef.object_cardinality.is_single(),
        };
        let rtype_owned = rtype.to_string();
        if add {
            self.write_with_cnxset(|cnxset| cnxset.add_relation(eidfrom, rtype, eidto))?;
            self.entity_cache.relation_added(link);
            self.undo_actions.push(UndoAction::AddRelation {
                eidfrom,
                rtype: rtype_owned,
                eidto,
            });
        } else {
            self.write_with_cnxset(|cnxset| cnxset.delete_relation(eidfrom, rtype, eidto))?;
            self.entity_cache.relation_removed(link);
            self.undo_actions.push(UndoAction::DeleteRelation {
                eidfrom,
                rtype: rtype_owned,
                eidto,
            });
        }

        self.call_hooks(after, &ctx)
    }

    // ------------------------------------------------------------------
    // Commit / rollback
    // ------------------------------------------------------------------

    /// Commit the running transaction.
    ///
    /// Operations run with read and write security off. Returns the undo transaction id when undo support is enabled and
    /// the transaction recorded undoable actions. Calling it while a commit
    /// is already running is logged and ignored.
    pub fn commit(&mut self) -> Result<Option<TransactionId>> {
        self.check_open()?;
        match self.commit_state {
            CommitState::None => {}
            CommitState::Uncommitable => {
                return Err(RepoError::Programming(
                    "transaction is uncommitable, it must be rolled back".into(),
                ));
            }
            state => {
                warn!(cnx = %self.id, %state, "commit() called during commit, ignored");
                return Ok(None);
            }
        }

        let span = info_span!(
            "commit",
            cnx = %self.id,
            login = self.user.login(),
            operations = self.pending_operations.len()
        );
        let _enter = span.enter();

        let result = {
            let mut cnx = self.security_enabled(Some(false), Some(false));
            cnx.run_commit()
        };
        self.clear_transaction_state();
        result
    }

    fn run_commit(&mut self) -> Result<Option<TransactionId>> {
        self.commit_state = CommitState::Precommit;
        let mut processed: Vec<Operation> = Vec::new();

        while let Some(mut operation) = self.pending_operations.pop_front() {
            if let Err(err) = operation.fire(OperationEvent::Precommit, self) {
                error!(operation = operation.name(), %err, "precommit failed, rolling back");
                operation.mark_failed();
                self.revert_precommit(&mut processed);
                processed.push(operation);
                self.abort_commit(processed);
                return Err(err);
            }
            processed.push(operation);
        }

        if let Some(cnxset) = self.cnxset.as_deref_mut() {
            if let Err(err) = cnxset.commit() {
                error!(%err, "storage commit failed, rolling back");
                self.abort_commit(processed);
                return Err(err.into());
            }
        }
        self.commit_state = CommitState::Postcommit;

        let txid = self.record_undo();
        self.run_postcommit(processed)?;
        debug!(?txid, "transaction committed");
        Ok(txid)
    }

    /// Fire revertprecommit on already processed operations, last first.
    /// Failures are logged only.
    fn revert_precommit(&mut self, processed: &mut [Operation]) {
        for operation in processed.iter_mut().rev() {
            if let Err(err) = operation.fire(OperationEvent::RevertPrecommit, self) {
                error!(operation = operation.name(), %err, "revertprecommit failed");
            }
        }
    }

    /// Put `processed` back in front of the queue and roll everything back.
    fn abort_commit(&mut self, processed: Vec<Operation>) {
        self.pending_operations.restore_front(processed);
        self.commit_state = CommitState::None;
        if let Err(err) = self.rollback_transaction() {
            error!(%err, "rollback after failed commit failed");
        }
    }

    fn run_postcommit(&mut self, processed: Vec<Operation>) -> Result<()> {
        let strict = self.repo.config().strict_postcommit;
        let mut pending = processed.into_iter();

        loop {
            let Some(mut operation) = pending
                .next()
                .or_else(|| self.pending_operations.pop_front())
            else {
                return Ok(());
            };
            if let Err(err) = operation.fire(OperationEvent::Postcommit, self) {
                error!(operation = operation.name(), %err, "postcommit failed");
                if strict {
                    return Err(err);
                }
            }
        }
    }

    fn record_undo(&mut self) -> Option<TransactionId> {
        if !self.repo.config().undo_support || self.undo_actions.is_empty() {
            return None;
        }
        let actions = std::mem::take(&mut self.undo_actions);
        match self.repo.undo_log().record(self.user.login(), actions) {
            Ok(txid) => Some(txid),
            Err(err) => {
                error!(%err, "failed to record undoable transaction");
                None
            }
        }
    }

    /// Roll back the running transaction.
    ///
    /// Every pending operation gets its rollback event, failures being
    /// logged. The storage rollback error, if any, is returned.
    pub fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        let span = info_span!("rollback", cnx = %self.id, operations = self.pending_operations.len());
        let _enter = span.enter();

        let result = {
            let mut cnx = self.security_enabled(Some(false), Some(false));
            cnx.rollback_transaction()
        };
        self.clear_transaction_state();
        result
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        while let Some(mut operation) = self.pending_operations.pop_front() {
            if let Err(err) = operation.fire(OperationEvent::Rollback, self) {
                error!(operation = operation.name(), %err, "rollback event failed");
            }
        }
        match self.cnxset.as_deref_mut() {
            Some(cnxset) => cnxset.rollback().map_err(Into::into),
            None => Ok(()),
        }
    }

    fn clear_transaction_state(&mut self) {
        self.transaction_data.clear();
        self.transaction_uuid = None;
        self.pending_operations.clear();
        self.entity_cache.clear();
        self.undo_actions.clear();
        self.deleted_eids.clear();
        self.storage_dirty = false;
        self.commit_state = CommitState::None;
        self.mode = TransactionMode::Read;
    }

    /// Roll back and give the storage handle back. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        let result = self.rollback();
        self.release_cnxset();
        self.state = ConnectionState::Closed;
        debug!(cnx = %self.id, "connection closed");
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(cnx = %self.id, %err, "error closing dropped connection");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("login", &self.user.login())
            .field("state", &self.state)
            .field("commit_state", &self.commit_state)
            .field("pending_operations", &self.pending_operations.len())
            .finish()
    }
}
