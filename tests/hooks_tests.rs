/// Hooks tests
///
/// Hook selection and ordering, category control, and the built-in
/// integrity and security hooks.
/// Run with: cargo test --test hooks_tests

use cubicweb_core::prelude::*;
use cubicweb_core::{CommitState, HooksMode, HooksState};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

type Calls = Arc<Mutex<Vec<String>>>;

struct Probe {
    id: &'static str,
    category: &'static str,
    events: &'static [HookEvent],
    types: &'static [&'static str],
    order: i32,
    enabled: bool,
    calls: Calls,
}

impl Probe {
    fn new(id: &'static str, category: &'static str, calls: &Calls) -> Self {
        Self {
            id,
            category,
            events: &[HookEvent::AfterAddEntity],
            types: &[],
            order: 0,
            enabled: true,
            calls: Arc::clone(calls),
        }
    }

    fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    fn for_types(mut self, types: &'static [&'static str]) -> Self {
        self.types = types;
        self
    }

    fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl Hook for Probe {
    fn id(&self) -> &str {
        self.id
    }

    fn events(&self) -> &[HookEvent] {
        self.events
    }

    fn category(&self) -> &str {
        self.category
    }

    fn types(&self) -> &[&'static str] {
        self.types
    }

    fn order(&self) -> i32 {
        self.order
    }

    fn score(&self, _cnx: &Connection, _ctx: &HookContext) -> u32 {
        u32::from(self.enabled)
    }

    fn call(&self, cnx: &mut Connection, event: HookEvent, _ctx: &HookContext) -> Result<()> {
        self.calls.lock().unwrap().push(format!(
            "{}@{} read={} write={} nested={}",
            self.id,
            event,
            cnx.read_security(),
            cnx.write_security(),
            cnx.hooks_in_progress()
        ));
        Ok(())
    }
}

/// Counts how often it gets scored.
struct Counted {
    scored: Arc<Mutex<usize>>,
    calls: Calls,
}

impl Hook for Counted {
    fn id(&self) -> &str {
        "counted"
    }

    fn events(&self) -> &[HookEvent] {
        &[HookEvent::AfterAddEntity]
    }

    fn category(&self) -> &str {
        "email"
    }

    fn score(&self, _cnx: &Connection, _ctx: &HookContext) -> u32 {
        *self.scored.lock().unwrap() += 1;
        1
    }

    fn call(&self, _cnx: &mut Connection, _event: HookEvent, _ctx: &HookContext) -> Result<()> {
        self.calls.lock().unwrap().push("counted".into());
        Ok(())
    }
}

/// Retitles a note when the transaction commits.
#[derive(Debug)]
struct Stamp {
    note: Eid,
    calls: Calls,
}

impl OperationHandler for Stamp {
    fn name(&self) -> &str {
        "stamp"
    }

    fn precommit_event(&mut self, cnx: &mut Connection) -> Result<()> {
        self.calls.lock().unwrap().push(format!(
            "stamp read={} write={}",
            cnx.read_security(),
            cnx.write_security()
        ));
        cnx.update_entity(self.note, title("stamped"))
    }

    fn rollback_event(&mut self, cnx: &mut Connection) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("rollback write={}", cnx.write_security()));
        Ok(())
    }
}

fn schema() -> Schema {
    Schema::new()
        .entity(EntitySchema::new("Blog").attribute("title", DataType::String, true))
        .entity(EntitySchema::new("Entry").attribute("title", DataType::String, true))
        .entity(
            EntitySchema::new("Note")
                .attribute("title", DataType::String, false)
                .permissions(
                    Permissions::none()
                        .grant(Action::Add, &[MANAGERS, USERS])
                        .grant(Action::Update, &[MANAGERS])
                        .grant(Action::Delete, &[MANAGERS]),
                ),
        )
        .relation(
            RelationDefinition::new("Entry", "entry_of", "Blog")
                .cardinality(Cardinality::One, Cardinality::Any),
        )
        .relation(
            RelationDefinition::new("Note", "see_also", "Note")
                .permissions(Permissions::none().grant(Action::Add, &[MANAGERS])),
        )
}

fn repository(hooks: HooksRegistry) -> Arc<Repository> {
    Repository::builder(RepositoryConfig::new("hooks").pool_size(3))
        .schema(schema())
        .hooks(hooks)
        .build()
        .unwrap()
}

fn title(value: &str) -> BTreeMap<String, Value> {
    BTreeMap::from([("title".to_string(), Value::Text(value.to_string()))])
}

fn user_cnx(repo: &Arc<Repository>, login: &str, group: &str) -> Connection {
    Connection::open(Arc::clone(repo.core()), User::new(login, [group]), None).unwrap()
}

fn ids(calls: &Calls) -> Vec<String> {
    calls
        .lock()
        .unwrap()
        .iter()
        .map(|call| call.split('@').next().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn test_hooks_run_by_order_then_registration() {
    let calls = Calls::default();
    let repo = repository(
        HooksRegistry::new()
            .register(Probe::new("late", "app", &calls).with_order(10))
            .register(Probe::new("typed", "app", &calls).for_types(&["Blog"]))
            .register(Probe::new("plain", "app", &calls))
            .register(Probe::new("early", "app", &calls).with_order(-10))
            .register(Probe::new("entries", "app", &calls).for_types(&["Entry"]))
            .register(Probe::new("off", "app", &calls).disabled()),
    );

    let mut cnx = repo.internal_cnx().unwrap();
    cnx.create_entity("Blog", title("news")).unwrap();

    assert_eq!(ids(&calls), vec!["early", "typed", "plain", "late"]);
}

#[test]
fn test_hooks_run_without_security() {
    let calls = Calls::default();
    let repo = repository(HooksRegistry::new().register(Probe::new("probe", "app", &calls)));

    let mut cnx = user_cnx(&repo, "bob", USERS);
    assert!(cnx.read_security() && cnx.write_security());
    cnx.create_entity("Blog", title("news")).unwrap();

    assert_eq!(
        *calls.lock().unwrap(),
        vec!["probe@after_add_entity read=false write=false nested=true"]
    );
    assert!(cnx.read_security() && cnx.write_security());
    assert!(!cnx.hooks_in_progress());
}

#[test]
fn test_denied_categories_are_skipped() {
    let calls = Calls::default();
    let repo = repository(
        HooksRegistry::new()
            .register(Probe::new("integrity", INTEGRITY, &calls))
            .register(Probe::new("mail", "email", &calls)),
    );

    let mut cnx = repo.internal_cnx().unwrap();
    {
        let mut cnx = cnx.deny_all_hooks_but([INTEGRITY]);
        cnx.create_entity("Blog", title("one")).unwrap();
    }
    {
        let mut cnx = cnx.allow_all_hooks_but([INTEGRITY]);
        cnx.create_entity("Blog", title("two")).unwrap();
    }
    cnx.create_entity("Blog", title("three")).unwrap();

    assert_eq!(ids(&calls), vec!["integrity", "mail", "integrity", "mail"]);
}

#[test]
fn test_nested_hooks_control_restores_previous_state() {
    let repo = repository(HooksRegistry::new());
    let mut cnx = repo.internal_cnx().unwrap();
    let pristine = cnx.hooks_state().clone();
    assert_eq!(pristine, HooksState::default());

    {
        let mut outer = cnx.deny_all_hooks_but([INTEGRITY]);
        {
            let inner = outer.allow_all_hooks_but([INTEGRITY]);
            assert_eq!(inner.hooks_state().mode, HooksMode::AllowAll);
            assert!(!inner.is_hook_category_active(INTEGRITY));
            assert!(inner.is_hook_category_active("email"));
        }
        assert_eq!(
            outer.hooks_state(),
            &HooksState::new(HooksMode::DenyAll, [INTEGRITY])
        );
    }
    assert_eq!(cnx.hooks_state(), &pristine);
    assert_eq!(cnx.control_depth(), (0, 0));
}

#[test]
fn test_hooks_control_restored_on_error_path() {
    let repo = repository(HooksRegistry::new());
    let mut cnx = repo.internal_cnx().unwrap();

    fn failing(cnx: &mut Connection) -> Result<()> {
        let mut cnx = cnx.deny_all_hooks_but([SECURITY]);
        let _sec = cnx.security_enabled(Some(false), None);
        Err(RepoError::Execution("boom".into()))
    }

    assert!(failing(&mut cnx).is_err());
    assert_eq!(cnx.hooks_state(), &HooksState::default());
    assert_eq!(cnx.control_depth(), (0, 0));
    assert!(!cnx.read_security());
}

#[test]
fn test_security_guard_nesting() {
    let repo = repository(HooksRegistry::new());
    let mut cnx = user_cnx(&repo, "bob", USERS);
    {
        let mut cnx = cnx.security_enabled(Some(false), None);
        assert!(!cnx.read_security());
        assert!(cnx.write_security());
        {
            let cnx = cnx.security_enabled(None, Some(false));
            assert!(!cnx.read_security());
            assert!(!cnx.write_security());
        }
        assert!(cnx.write_security());
    }
    assert!(cnx.read_security() && cnx.write_security());
}

#[test]
fn test_missing_required_relation_fails_commit() {
    let repo = repository(HooksRegistry::with_builtin_hooks());
    let mut cnx = user_cnx(&repo, "bob", USERS);

    let entry = cnx.create_entity("Entry", title("orphan")).unwrap();
    match cnx.commit() {
        Err(RepoError::Validation { eid, errors }) => {
            assert_eq!(eid, entry);
            assert!(errors.contains_key("entry_of"));
        }
        other => panic!("expected a validation error, got {other:?}"),
    }

    let blog = cnx.create_entity("Blog", title("news")).unwrap();
    let entry = cnx.create_entity("Entry", title("linked")).unwrap();
    cnx.add_relation(entry, "entry_of", blog).unwrap();
    cnx.commit().unwrap();
    assert_eq!(cnx.related(entry, "entry_of", Role::Subject).unwrap(), vec![blog]);
}

#[test]
fn test_removing_required_relation_fails_commit() {
    let repo = repository(HooksRegistry::with_builtin_hooks());
    let mut cnx = user_cnx(&repo, "bob", USERS);
    let blog = cnx.create_entity("Blog", title("news")).unwrap();
    let entry = cnx.create_entity("Entry", title("linked")).unwrap();
    cnx.add_relation(entry, "entry_of", blog).unwrap();
    cnx.commit().unwrap();

    cnx.delete_relation(entry, "entry_of", blog).unwrap();
    assert!(matches!(cnx.commit(), Err(RepoError::Validation { .. })));

    // deleting the entry along with its relation is fine
    cnx.delete_relation(entry, "entry_of", blog).unwrap();
    cnx.delete_entities(&[entry]).unwrap();
    cnx.commit().unwrap();
}

#[test]
fn test_integrity_hooks_can_be_disabled() {
    let repo = repository(HooksRegistry::with_builtin_hooks());
    let mut cnx = user_cnx(&repo, "bob", USERS);
    {
        let mut cnx = cnx.allow_all_hooks_but([INTEGRITY]);
        cnx.create_entity("Entry", title("orphan")).unwrap();
    }
    cnx.commit().unwrap();
}

#[test]
fn test_entity_permissions_are_checked_at_precommit() {
    let repo = repository(HooksRegistry::with_builtin_hooks());
    let mut bob = user_cnx(&repo, "bob", USERS);

    let note = bob.create_entity("Note", title("mine")).unwrap();
    bob.commit().unwrap();

    bob.update_entity(note, title("edited")).unwrap();
    assert!(bob.pending_operations().names().contains(&"check_permissions"));
    assert!(matches!(bob.commit(), Err(RepoError::Unauthorized(_))));

    let mut admin = user_cnx(&repo, "admin", MANAGERS);
    admin.update_entity(note, title("edited")).unwrap();
    admin.commit().unwrap();
}

#[test]
fn test_relation_permissions_are_checked_immediately() {
    let repo = repository(HooksRegistry::with_builtin_hooks());
    let mut bob = user_cnx(&repo, "bob", USERS);
    let a = bob.create_entity("Note", title("a")).unwrap();
    let b = bob.create_entity("Note", title("b")).unwrap();

    assert!(matches!(
        bob.add_relation(a, "see_also", b),
        Err(RepoError::Unauthorized(_))
    ));
    assert_eq!(bob.commit_state(), CommitState::Uncommitable);
    bob.rollback().unwrap();

    // write security off skips the check
    let a = bob.create_entity("Note", title("a")).unwrap();
    let b = bob.create_entity("Note", title("b")).unwrap();
    {
        let mut bob = bob.security_enabled(None, Some(false));
        bob.add_relation(a, "see_also", b).unwrap();
    }
    bob.commit().unwrap();
}

#[test]
fn test_unknown_relation_is_rejected() {
    let repo = repository(HooksRegistry::with_builtin_hooks());
    let mut cnx = repo.internal_cnx().unwrap();
    let blog = cnx.create_entity("Blog", title("news")).unwrap();
    let note = cnx.create_entity("Note", title("n")).unwrap();

    assert!(matches!(
        cnx.add_relation(blog, "entry_of", note),
        Err(RepoError::Execution(_))
    ));
}

#[test]
fn test_operations_run_without_security() {
    let calls = Calls::default();
    let repo = repository(HooksRegistry::with_builtin_hooks());
    let mut bob = user_cnx(&repo, "bob", USERS);
    let note = bob.create_entity("Note", title("mine")).unwrap();
    bob.commit().unwrap();

    // only managers may update notes, but the system trusts its own writes
    bob.add_operation(Operation::custom(Stamp {
        note,
        calls: Arc::clone(&calls),
    }))
    .unwrap();
    bob.commit().unwrap();
    assert_eq!(*calls.lock().unwrap(), vec!["stamp read=false write=false"]);
    assert!(bob.read_security() && bob.write_security());
    assert_eq!(bob.control_depth(), (0, 0));
    assert_eq!(
        bob.entity_from_eid(note).unwrap().get("title"),
        Some(&Value::from("stamped"))
    );

    calls.lock().unwrap().clear();
    bob.add_operation(Operation::custom(Stamp {
        note,
        calls: Arc::clone(&calls),
    }))
    .unwrap();
    bob.rollback().unwrap();
    assert_eq!(*calls.lock().unwrap(), vec!["rollback write=false"]);
    assert!(bob.write_security());
}

#[test]
fn test_hooks_are_scored_before_category_filtering() {
    let scored = Arc::new(Mutex::new(0));
    let calls = Calls::default();
    let repo = repository(HooksRegistry::new().register(Counted {
        scored: Arc::clone(&scored),
        calls: Arc::clone(&calls),
    }));

    let mut cnx = repo.internal_cnx().unwrap();
    {
        let mut cnx = cnx.deny_all_hooks_but([INTEGRITY]);
        cnx.create_entity("Blog", title("quiet")).unwrap();
    }
    assert_eq!(*scored.lock().unwrap(), 1);
    assert!(calls.lock().unwrap().is_empty());

    cnx.create_entity("Blog", title("loud")).unwrap();
    assert_eq!(*scored.lock().unwrap(), 2);
    assert_eq!(*calls.lock().unwrap(), vec!["counted"]);
}
