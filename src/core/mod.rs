pub mod error;
pub mod types;
pub mod value;

pub use error::{RepoError, Result, StorageError};
pub use types::{Args, Eid, ResultSet, Role, Row};
pub use value::{DataType, Value};
