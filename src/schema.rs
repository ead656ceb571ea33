//! Minimal data model description consumed by the session core.
//!
//! Only what the core itself needs is described here: attribute types for
//! creation-time checks, relation definitions with their cardinalities (used
//! by integrity hooks and entity cache patching) and the per-action
//! permission groups enforced by the security hooks.

use crate::core::{DataType, Eid, RepoError, Result, Role, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

pub const MANAGERS: &str = "managers";
pub const USERS: &str = "users";
pub const GUESTS: &str = "guests";

/// Relation cardinality, seen from one side.
///
/// Written the usual way as a two characters string such as `"?*"`: the
/// first character constrains how many objects a subject may have, the
/// second how many subjects an object may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    /// `1`: exactly one
    One,
    /// `?`: zero or one
    ZeroOrOne,
    /// `+`: one or more
    OneOrMore,
    /// `*`: any number
    Any,
}

impl Cardinality {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '1' => Some(Self::One),
            '?' => Some(Self::ZeroOrOne),
            '+' => Some(Self::OneOrMore),
            '*' => Some(Self::Any),
            _ => None,
        }
    }

    /// Parse a `"?*"` style pair into (subject side, object side).
    pub fn parse_pair(pair: &str) -> Result<(Self, Self)> {
        let mut chars = pair.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some(s), Some(o), None) => match (Self::from_char(s), Self::from_char(o)) {
                (Some(s), Some(o)) => Ok((s, o)),
                _ => Err(RepoError::Execution(format!("invalid cardinality '{}'", pair))),
            },
            _ => Err(RepoError::Execution(format!("invalid cardinality '{}'", pair))),
        }
    }

    pub fn is_single(self) -> bool {
        matches!(self, Self::One | Self::ZeroOrOne)
    }

    pub fn is_required(self) -> bool {
        matches!(self, Self::One | Self::OneOrMore)
    }

    pub fn as_char(self) -> char {
        match self {
            Self::One => '1',
            Self::ZeroOrOne => '?',
            Self::OneOrMore => '+',
            Self::Any => '*',
        }
    }
}

/// Write actions guarded by permission groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Add,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Groups allowed to perform each write action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permissions {
    groups: BTreeMap<Action, BTreeSet<String>>,
}

impl Permissions {
    /// No group may do anything.
    pub fn none() -> Self {
        Self {
            groups: BTreeMap::new(),
        }
    }

    pub fn grant(mut self, action: Action, groups: &[&str]) -> Self {
        self.groups
            .entry(action)
            .or_default()
            .extend(groups.iter().map(|g| g.to_string()));
        self
    }

    pub fn allows<'a>(&self, action: Action, user_groups: impl IntoIterator<Item = &'a str>) -> bool {
        match self.groups.get(&action) {
            Some(allowed) => user_groups.into_iter().any(|g| allowed.contains(g)),
            None => false,
        }
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::none()
            .grant(Action::Add, &[MANAGERS, USERS])
            .grant(Action::Update, &[MANAGERS, USERS])
            .grant(Action::Delete, &[MANAGERS, USERS])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDef {
    pub name: String,
    pub data_type: DataType,
    pub required: bool,
}

#[derive(Debug, Clone)]
pub struct EntitySchema {
    name: String,
    attributes: Vec<AttributeDef>,
    permissions: Permissions,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            permissions: Permissions::default(),
        }
    }

    pub fn attribute(mut self, name: &str, data_type: DataType, required: bool) -> Self {
        self.attributes.push(AttributeDef {
            name: name.to_string(),
            data_type,
            required,
        });
        self
    }

    pub fn permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &[AttributeDef] {
        &self.attributes
    }

    pub fn get_attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    pub fn entity_permissions(&self) -> &Permissions {
        &self.permissions
    }
}

/// A relation type between one subject type and one object type.
#[derive(Debug, Clone)]
pub struct RelationDefinition {
    pub subject: String,
    pub rtype: String,
    pub object: String,
    pub subject_cardinality: Cardinality,
    pub object_cardinality: Cardinality,
    pub permissions: Permissions,
}

impl RelationDefinition {
    pub fn new(subject: &str, rtype: &str, object: &str) -> Self {
        Self {
            subject: subject.to_string(),
            rtype: rtype.to_string(),
            object: object.to_string(),
            subject_cardinality: Cardinality::Any,
            object_cardinality: Cardinality::Any,
            permissions: Permissions::none()
                .grant(Action::Add, &[MANAGERS, USERS])
                .grant(Action::Delete, &[MANAGERS, USERS]),
        }
    }

    pub fn cardinality(mut self, subject: Cardinality, object: Cardinality) -> Self {
        self.subject_cardinality = subject;
        self.object_cardinality = object;
        self
    }

    pub fn permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    /// Cardinality constraining the entity standing on `role`.
    pub fn cardinality_for(&self, role: Role) -> Cardinality {
        match role {
            Role::Subject => self.subject_cardinality,
            Role::Object => self.object_cardinality,
        }
    }

    pub fn etype_for(&self, role: Role) -> &str {
        match role {
            Role::Subject => &self.subject,
            Role::Object => &self.object,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: HashMap<String, EntitySchema>,
    relations: Vec<RelationDefinition>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, entity: EntitySchema) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    pub fn relation(mut self, rdef: RelationDefinition) -> Self {
        self.relations.push(rdef);
        self
    }

    pub fn entity_schema(&self, etype: &str) -> Result<&EntitySchema> {
        self.entities
            .get(etype)
            .ok_or_else(|| RepoError::NotFound(format!("entity type '{}'", etype)))
    }

    pub fn has_entity(&self, etype: &str) -> bool {
        self.entities.contains_key(etype)
    }

    pub fn relation_definition(
        &self,
        subject: &str,
        rtype: &str,
        object: &str,
    ) -> Option<&RelationDefinition> {
        self.relations
            .iter()
            .find(|rdef| rdef.rtype == rtype && rdef.subject == subject && rdef.object == object)
    }

    /// Relation definitions where `etype` stands on `role`.
    pub fn relations_of<'a>(
        &'a self,
        etype: &'a str,
        role: Role,
    ) -> impl Iterator<Item = &'a RelationDefinition> + 'a {
        self.relations
            .iter()
            .filter(move |rdef| rdef.etype_for(role) == etype)
    }

    /// Check creation/update values against the declared attributes.
    ///
    /// `creation` also enforces required attributes.
    pub fn check_attributes(
        &self,
        eid: Eid,
        etype: &str,
        values: &BTreeMap<String, Value>,
        creation: bool,
    ) -> Result<()> {
        let eschema = self.entity_schema(etype)?;
        let mut errors = BTreeMap::new();

        for (name, value) in values {
            match eschema.get_attribute(name) {
                None => {
                    errors.insert(name.clone(), format!("unknown attribute for {}", etype));
                }
                Some(attr) if !attr.data_type.is_compatible(value) => {
                    errors.insert(
                        name.clone(),
                        format!("expected {}, got {}", attr.data_type, value.type_name()),
                    );
                }
                Some(attr) if attr.required && value.is_null() => {
                    errors.insert(name.clone(), "required attribute".to_string());
                }
                Some(_) => {}
            }
        }

        if creation {
            for attr in eschema.attributes().iter().filter(|attr| attr.required) {
                if !values.contains_key(&attr.name) {
                    errors.insert(attr.name.clone(), "required attribute".to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RepoError::Validation { eid, errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new()
            .entity(
                EntitySchema::new("Person")
                    .attribute("name", DataType::String, true)
                    .attribute("age", DataType::Int, false),
            )
            .entity(EntitySchema::new("Company"))
            .relation(
                RelationDefinition::new("Person", "works_for", "Company")
                    .cardinality(Cardinality::ZeroOrOne, Cardinality::Any),
            )
    }

    #[test]
    fn test_parse_cardinality_pair() {
        assert_eq!(
            Cardinality::parse_pair("?*").unwrap(),
            (Cardinality::ZeroOrOne, Cardinality::Any)
        );
        assert!(Cardinality::parse_pair("x*").is_err());
        assert!(Cardinality::parse_pair("1").is_err());
        assert!(Cardinality::parse_pair("11+").is_err());
    }

    #[test]
    fn test_required_attribute_on_creation() {
        let schema = schema();
        let values = BTreeMap::from([("age".to_string(), Value::Integer(3))]);

        let err = schema.check_attributes(1, "Person", &values, true).unwrap_err();
        match err {
            RepoError::Validation { eid, errors } => {
                assert_eq!(eid, 1);
                assert!(errors.contains_key("name"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        // updates do not need every required attribute
        assert!(schema.check_attributes(1, "Person", &values, false).is_ok());
    }

    #[test]
    fn test_attribute_type_mismatch() {
        let schema = schema();
        let values = BTreeMap::from([
            ("name".to_string(), Value::from("ann")),
            ("age".to_string(), Value::from("old")),
        ]);
        assert!(schema.check_attributes(1, "Person", &values, true).is_err());
    }

    #[test]
    fn test_relation_lookup() {
        let schema = schema();
        let rdef = schema
            .relation_definition("Person", "works_for", "Company")
            .unwrap();
        assert!(rdef.cardinality_for(Role::Subject).is_single());
        assert!(!rdef.cardinality_for(Role::Object).is_single());
        assert_eq!(schema.relations_of("Company", Role::Object).count(), 1);
        assert!(schema.relation_definition("Company", "works_for", "Person").is_none());
    }

    #[test]
    fn test_default_permissions() {
        let perms = Permissions::default();
        assert!(perms.allows(Action::Add, ["users"]));
        assert!(!perms.allows(Action::Delete, ["guests"]));
        assert!(!Permissions::none().allows(Action::Add, ["managers"]));
    }
}
