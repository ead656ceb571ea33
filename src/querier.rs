//! Query execution interface.
//!
//! Parsing and planning queries is not the business of the session core:
//! the application plugs its executor in through [`Querier`].

use crate::connection::Connection;
use crate::core::{Args, RepoError, Result, ResultSet};

pub trait Querier: Send + Sync {
    /// Run `query` within the connection's transaction. `build_descr`
    /// asks for the type description of the result rows.
    fn execute(
        &self,
        cnx: &mut Connection,
        query: &str,
        args: &Args,
        build_descr: bool,
    ) -> Result<ResultSet>;
}

/// Default querier of a repository built without one.
pub struct UnavailableQuerier;

impl Querier for UnavailableQuerier {
    fn execute(
        &self,
        _cnx: &mut Connection,
        query: &str,
        _args: &Args,
        _build_descr: bool,
    ) -> Result<ResultSet> {
        Err(RepoError::Execution(format!(
            "no querier configured to run '{}'",
            query
        )))
    }
}
