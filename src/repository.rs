//! Repository: the process wide entry point.
//!
//! [`RepositoryCore`] holds what connections need (context, storage, pool,
//! caches) and is shared with them; [`Repository`] adds authentication and
//! the session registry on top of it.

use crate::cache::{EidInfo, TypeSourceCache};
use crate::connection::Connection;
use crate::connection::auth::{Credentials, IdentitySource, User};
use crate::connection::config::RepositoryConfig;
use crate::connection::pool::{ConnectionSetPool, PoolStats};
use crate::context::ApplicationContext;
use crate::core::{Args, Eid, RepoError, Result, ResultSet};
use crate::hook::{HookContext, HookEvent, HooksManager, HooksRegistry};
use crate::querier::{Querier, UnavailableQuerier};
use crate::schema::Schema;
use crate::session::Session;
use crate::source::Source;
use crate::source::memory::MemorySource;
use crate::transaction::{TransactionId, TransactionRecord, UndoLog};
use crate::worker::{MailQueue, SessionSweeper, spawn_session_sweeper};
use chrono::{TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

pub struct RepositoryCore {
    context: ApplicationContext,
    source: Arc<dyn Source>,
    pool: ConnectionSetPool,
    type_cache: TypeSourceCache,
    undo_log: UndoLog,
    mail_queue: Option<MailQueue>,
}

impl RepositoryCore {
    pub fn context(&self) -> &ApplicationContext {
        &self.context
    }

    pub fn config(&self) -> &RepositoryConfig {
        self.context.config()
    }

    pub fn schema(&self) -> &Schema {
        self.context.schema()
    }

    pub fn hooks(&self) -> &HooksManager {
        self.context.hooks()
    }

    pub fn querier(&self) -> &Arc<dyn Querier> {
        self.context.querier()
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }

    pub fn pool(&self) -> &ConnectionSetPool {
        &self.pool
    }

    pub fn type_cache(&self) -> &TypeSourceCache {
        &self.type_cache
    }

    pub fn undo_log(&self) -> &UndoLog {
        &self.undo_log
    }

    pub fn mail_queue(&self) -> Option<&MailQueue> {
        self.mail_queue.as_ref()
    }
}

pub struct RepositoryBuilder {
    config: RepositoryConfig,
    schema: Schema,
    hooks: HooksRegistry,
    querier: Option<Arc<dyn Querier>>,
    source: Option<Arc<dyn Source>>,
    identity_sources: Vec<Arc<dyn IdentitySource>>,
    mail_queue: Option<MailQueue>,
}

impl RepositoryBuilder {
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Replace the hooks registry. The default one holds the built-in
    /// hooks.
    pub fn hooks(mut self, hooks: HooksRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn querier(mut self, querier: Arc<dyn Querier>) -> Self {
        self.querier = Some(querier);
        self
    }

    /// Storage of the repository, an in-memory source by default.
    pub fn source(mut self, source: Arc<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    /// Identity sources are tried in registration order.
    pub fn identity_source(mut self, source: Arc<dyn IdentitySource>) -> Self {
        self.identity_sources.push(source);
        self
    }

    pub fn mail_queue(mut self, queue: MailQueue) -> Self {
        self.mail_queue = Some(queue);
        self
    }

    /// Open the pool and fire `server_startup`.
    pub fn build(self) -> Result<Arc<Repository>> {
        self.config.validate()?;
        let source = self
            .source
            .unwrap_or_else(|| Arc::new(MemorySource::new("system")));
        let pool = ConnectionSetPool::new(
            source.as_ref(),
            self.config.pool_size,
            self.config.connect_timeout,
        )?;
        let type_cache = TypeSourceCache::new(self.config.extid_cache_size);
        let name = self.config.name.clone();
        let context = ApplicationContext::new(
            self.config,
            self.schema,
            self.hooks.build(),
            self.querier
                .unwrap_or_else(|| Arc::new(UnavailableQuerier)),
        );

        let repo = Arc::new(Repository {
            core: Arc::new(RepositoryCore {
                context,
                source,
                pool,
                type_cache,
                undo_log: UndoLog::new(),
                mail_queue: self.mail_queue,
            }),
            identity_sources: self.identity_sources,
            sessions: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        });

        let mut cnx = repo.internal_cnx()?;
        cnx.call_hooks(HookEvent::ServerStartup, &HookContext::Server)?;
        cnx.commit()?;
        cnx.close()?;

        info!(%name, pool_size = repo.core.pool.size(), "repository started");
        Ok(repo)
    }
}

pub struct Repository {
    core: Arc<RepositoryCore>,
    identity_sources: Vec<Arc<dyn IdentitySource>>,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    shutting_down: AtomicBool,
}

impl Repository {
    pub fn builder(config: RepositoryConfig) -> RepositoryBuilder {
        RepositoryBuilder {
            config,
            schema: Schema::new(),
            hooks: HooksRegistry::with_builtin_hooks(),
            querier: None,
            source: None,
            identity_sources: Vec::new(),
            mail_queue: None,
        }
    }

    pub fn core(&self) -> &Arc<RepositoryCore> {
        &self.core
    }

    pub fn config(&self) -> &RepositoryConfig {
        self.core.config()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.core.pool.stats()
    }

    fn check_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RepoError::Programming("repository is shutting down".into()));
        }
        Ok(())
    }

    /// Connection of the internal manager: security off, no session.
    pub fn internal_cnx(&self) -> Result<Connection> {
        Connection::open_internal(Arc::clone(&self.core))
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    fn authenticate(&self, login: &str, credentials: &Credentials) -> Result<User> {
        for source in &self.identity_sources {
            match source.authenticate(login, credentials) {
                Ok(user) => {
                    debug!(login, source = source.name(), "authenticated");
                    return Ok(user);
                }
                Err(RepoError::Authentication(reason)) => {
                    debug!(login, source = source.name(), %reason, "authentication refused");
                }
                Err(err) => {
                    warn!(login, source = source.name(), %err, "identity source failed");
                }
            }
        }
        Err(RepoError::Authentication(format!(
            "authentication failed for '{}'",
            login
        )))
    }

    /// Authenticate and open a session.
    ///
    /// `session_open` hooks run in their own transaction, committed before
    /// the session is registered.
    pub fn new_session(&self, login: &str, credentials: &Credentials) -> Result<Arc<Mutex<Session>>> {
        self.check_running()?;
        let user = self.authenticate(login, credentials)?;
        let id = uuid::Uuid::new_v4().to_string();

        let mut cnx = Connection::open(Arc::clone(&self.core), user.clone(), Some(id.clone()))?;
        let ctx = HookContext::Session {
            session_id: id.clone(),
            login: user.login().to_string(),
        };
        cnx.call_hooks(HookEvent::SessionOpen, &ctx)?;
        cnx.commit()?;
        cnx.close()?;

        let session = Arc::new(Mutex::new(Session::new(id.clone(), user)));
        self.sessions.write()?.insert(id.clone(), Arc::clone(&session));
        info!(login, session = %id, "session opened");
        Ok(session)
    }

    /// Open a session and return its id.
    pub fn connect(&self, login: &str, credentials: &Credentials) -> Result<String> {
        let session = self.new_session(login, credentials)?;
        let id = session.lock()?.id().to_string();
        Ok(id)
    }

    pub fn session(&self, sessionid: &str) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .read()?
            .get(sessionid)
            .cloned()
            .ok_or_else(|| RepoError::BadConnectionId(sessionid.to_string()))
    }

    pub fn session_count(&self) -> Result<usize> {
        Ok(self.sessions.read()?.len())
    }

    /// Run `f` on the session's connection. A read-only transaction gives
    /// its storage handle back once `f` returns.
    fn with_session_cnx<T>(
        &self,
        sessionid: &str,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let session = self.session(sessionid)?;
        let mut session = session.lock()?;
        session.touch();
        let cnx = session.connection(&self.core)?;
        let result = f(&mut *cnx);
        if cnx.is_read_only() && cnx.has_cnxset() {
            cnx.free_cnxset()?;
        }
        result
    }

    pub fn execute(&self, sessionid: &str, query: &str, args: &Args) -> Result<ResultSet> {
        self.check_running()?;
        self.with_session_cnx(sessionid, |cnx| cnx.execute(query, args, true))
    }

    pub fn commit(&self, sessionid: &str) -> Result<Option<TransactionId>> {
        self.with_session_cnx(sessionid, Connection::commit)
    }

    pub fn rollback(&self, sessionid: &str) -> Result<()> {
        self.with_session_cnx(sessionid, Connection::rollback)
    }

    /// Roll back pending work, fire `session_close` in a committed
    /// transaction and forget the session.
    pub fn close(&self, sessionid: &str) -> Result<()> {
        let session = self.session(sessionid)?;
        let result = {
            let mut session = session.lock()?;
            let ctx = HookContext::Session {
                session_id: session.id().to_string(),
                login: session.login().to_string(),
            };
            let cnx = match session.take_connection() {
                Some(mut cnx) => {
                    if let Err(err) = cnx.rollback() {
                        warn!(session = %sessionid, %err, "rollback on session close failed");
                    }
                    Ok(cnx)
                }
                None => Connection::open(
                    Arc::clone(&self.core),
                    session.user().clone(),
                    Some(sessionid.to_string()),
                ),
            };
            cnx.and_then(|mut cnx| {
                cnx.call_hooks(HookEvent::SessionClose, &ctx)?;
                cnx.commit()?;
                cnx.close()
            })
        };

        self.sessions.write()?.remove(sessionid);
        info!(session = %sessionid, "session closed");
        result
    }

    /// Close sessions idle for longer than the configured session time.
    /// Sessions in use are skipped. Returns the number of closed sessions.
    pub fn clean_sessions(&self) -> Result<usize> {
        let Some(session_time) = self.config().session_time else {
            return Ok(0);
        };
        let limit = TimeDelta::from_std(session_time)
            .map_err(|err| RepoError::Execution(format!("invalid session time: {}", err)))?;
        let now = Utc::now();

        let expired: Vec<String> = self
            .sessions
            .read()?
            .iter()
            .filter(|(_, session)| {
                session
                    .try_lock()
                    .map(|session| session.idle_for(now) > limit)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for sessionid in &expired {
            if let Err(err) = self.close(sessionid) {
                error!(session = %sessionid, %err, "error closing idle session");
            }
        }
        if !expired.is_empty() {
            debug!(closed = expired.len(), "cleaned idle sessions");
        }
        Ok(expired.len())
    }

    /// Spawn the periodic session sweep, unless sessions never expire.
    pub fn start_looping_tasks(self: &Arc<Self>, handle: &Handle) -> Option<SessionSweeper> {
        self.config().session_time?;
        let interval = self.config().cleanup_interval;
        Some(spawn_session_sweeper(handle, Arc::clone(self), interval))
    }

    /// Close every session, fire `server_shutdown` and close the pool.
    pub fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(name = %self.config().name, "shutting down repository");

        let sessionids: Vec<String> = self.sessions.read()?.keys().cloned().collect();
        for sessionid in &sessionids {
            if let Err(err) = self.close(sessionid) {
                error!(session = %sessionid, %err, "error closing session on shutdown");
            }
        }

        let result = self.internal_cnx().and_then(|mut cnx| {
            cnx.call_hooks(HookEvent::ServerShutdown, &HookContext::Server)?;
            cnx.commit()?;
            cnx.close()
        });
        if let Err(err) = &result {
            error!(%err, "server_shutdown hooks failed");
        }

        self.core.pool.close();
        result
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Eid lookups
    // ------------------------------------------------------------------

    pub fn type_and_source_from_eid(&self, eid: Eid) -> Result<EidInfo> {
        if let Some(info) = self.core.type_cache.get(eid)? {
            return Ok(info);
        }
        self.internal_cnx()?.describe(eid)
    }

    pub fn extid2eid(&self, source: &str, extid: &str) -> Result<Option<Eid>> {
        if let Some(eid) = self.core.type_cache.extid_to_eid(source, extid)? {
            return Ok(Some(eid));
        }
        self.internal_cnx()?.extid2eid(source, extid)
    }

    pub fn eid2extid(&self, eid: Eid) -> Result<Option<String>> {
        Ok(self.type_and_source_from_eid(eid)?.extid)
    }

    // ------------------------------------------------------------------
    // Undo log
    // ------------------------------------------------------------------

    pub fn transaction_info(&self, txid: TransactionId) -> Result<TransactionRecord> {
        self.core
            .undo_log
            .get(txid)?
            .ok_or_else(|| RepoError::NotFound(format!("transaction {}", txid)))
    }

    /// Undoable transactions of `login`, most recent first.
    pub fn undoable_transactions(&self, login: &str) -> Result<Vec<TransactionId>> {
        self.core.undo_log.transactions_of(login)
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        if !self.shutting_down.load(Ordering::SeqCst) {
            if let Err(err) = self.shutdown() {
                warn!(%err, "repository shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::auth::PasswordSource;
    use crate::schema::MANAGERS;
    use std::time::Duration;

    fn repo(session_time: Option<Duration>) -> Arc<Repository> {
        let passwords = Arc::new(PasswordSource::with_cost(4));
        passwords.create_user("admin", "adminpass", &[MANAGERS]).unwrap();
        Repository::builder(
            RepositoryConfig::new("test")
                .pool_size(2)
                .session_time(session_time),
        )
        .identity_source(passwords)
        .build()
        .unwrap()
    }

    fn admin() -> Credentials {
        Credentials::Password("adminpass".into())
    }

    #[test]
    fn test_clean_sessions_closes_idle_ones_only() {
        let repo = repo(Some(Duration::from_secs(60)));
        let idle = repo.new_session("admin", &admin()).unwrap();
        let active = repo.connect("admin", &admin()).unwrap();
        idle.lock()
            .unwrap()
            .set_last_usage(Utc::now() - TimeDelta::seconds(3600));

        assert_eq!(repo.clean_sessions().unwrap(), 1);
        assert_eq!(repo.session_count().unwrap(), 1);
        assert!(repo.session(&active).is_ok());
    }

    #[test]
    fn test_clean_sessions_disabled_without_session_time() {
        let repo = repo(None);
        let session = repo.new_session("admin", &admin()).unwrap();
        session
            .lock()
            .unwrap()
            .set_last_usage(Utc::now() - TimeDelta::days(30));

        assert_eq!(repo.clean_sessions().unwrap(), 0);
        assert_eq!(repo.session_count().unwrap(), 1);
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let repo = repo(None);
        repo.connect("admin", &admin()).unwrap();
        repo.shutdown().unwrap();

        assert!(repo.is_shutting_down());
        assert_eq!(repo.session_count().unwrap(), 0);
        assert_eq!(repo.pool_stats().available, 0);
        assert!(repo.connect("admin", &admin()).is_err());
    }
}
