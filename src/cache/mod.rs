pub mod entity;
pub mod type_source;

pub use entity::{EntityCache, RelationLink};
pub use type_source::{EidInfo, TypeSourceCache};
