use crate::connection::Connection;
use crate::connection::auth::User;
use crate::core::Result;
use crate::repository::RepositoryCore;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// An authenticated user session.
///
/// Outlives transactions: the connection used by the RPC-like entry points
/// of the repository is opened on first use and kept between calls.
pub struct Session {
    id: String,
    user: User,
    created_at: DateTime<Utc>,
    last_usage: DateTime<Utc>,
    data: HashMap<String, serde_json::Value>,
    cnx: Option<Connection>,
}

impl Session {
    pub(crate) fn new(id: String, user: User) -> Self {
        let now = Utc::now();
        Self {
            id,
            user,
            created_at: now,
            last_usage: now,
            data: HashMap::new(),
            cnx: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn login(&self) -> &str {
        self.user.login()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_usage(&self) -> DateTime<Utc> {
        self.last_usage
    }

    pub fn touch(&mut self) {
        self.last_usage = Utc::now();
    }

    /// Time elapsed since the last use, as of `now`.
    pub fn idle_for(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.last_usage
    }

    /// Session scoped data, kept across transactions.
    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut HashMap<String, serde_json::Value> {
        &mut self.data
    }

    pub fn has_connection(&self) -> bool {
        self.cnx.is_some()
    }

    /// The session's connection, opened on first use.
    pub(crate) fn connection(&mut self, repo: &Arc<RepositoryCore>) -> Result<&mut Connection> {
        let cnx = match self.cnx.take() {
            Some(cnx) => cnx,
            None => Connection::open(Arc::clone(repo), self.user.clone(), Some(self.id.clone()))?,
        };
        Ok(self.cnx.insert(cnx))
    }

    pub(crate) fn take_connection(&mut self) -> Option<Connection> {
        self.cnx.take()
    }

    #[cfg(test)]
    pub(crate) fn set_last_usage(&mut self, at: DateTime<Utc>) {
        self.last_usage = at;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("login", &self.user.login())
            .field("created_at", &self.created_at)
            .field("last_usage", &self.last_usage)
            .finish()
    }
}
