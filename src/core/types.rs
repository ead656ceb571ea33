use super::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier of an entity instance.
pub type Eid = u64;

pub type Row = Vec<Value>;

/// Named query arguments (`%(name)s` substitutions on the querier side).
pub type Args = HashMap<String, Value>;

/// Result of a query: ordered rows plus a parallel type description.
///
/// `description[i][j]` names the type of `rows[i][j]` (an entity type for
/// eid columns, a final type such as `String` otherwise).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub rows: Vec<Row>,
    pub description: Vec<Vec<String>>,
}

impl ResultSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(rows: Vec<Row>, description: Vec<Vec<String>>) -> Self {
        Self { rows, description }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First column of every row read as an eid.
    pub fn eids(&self) -> Vec<Eid> {
        self.rows
            .iter()
            .filter_map(|row| row.first().and_then(Value::as_i64))
            .map(|eid| eid as Eid)
            .collect()
    }
}

/// Side of a relation an entity stands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Subject,
    Object,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Self::Subject => Self::Object,
            Self::Object => Self::Subject,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subject => write!(f, "subject"),
            Self::Object => write!(f, "object"),
        }
    }
}
