use super::builtin::{CheckPermissionHook, CheckRequiredRelationsHook};
use super::{Hook, HookContext, HookEvent};
use crate::connection::Connection;
use crate::core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Hooks collected before the repository starts.
#[derive(Default)]
pub struct HooksRegistry {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HooksRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registration order breaks ties between hooks of equal order.
    pub fn register(mut self, hook: impl Hook + 'static) -> Self {
        debug!(hook = hook.id(), category = hook.category(), "registered hook");
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Registry holding the integrity and security hooks.
    pub fn with_builtin_hooks() -> Self {
        Self::new()
            .register(CheckRequiredRelationsHook)
            .register(CheckPermissionHook)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn build(self) -> HooksManager {
        HooksManager::new(self.hooks)
    }
}

#[derive(Clone)]
struct HookEntry {
    hook: Arc<dyn Hook>,
    index: usize,
}

impl HookEntry {
    fn sort_key(&self) -> (i32, usize) {
        (self.hook.order(), self.index)
    }
}

type TableKey = (HookEvent, Option<String>);

/// Frozen `(event, type) -> hooks` dispatch table
pub struct HooksManager {
    table: HashMap<TableKey, Vec<HookEntry>>,
    count: usize,
}

impl HooksManager {
    fn new(hooks: Vec<Arc<dyn Hook>>) -> Self {
        let count = hooks.len();
        let mut table: HashMap<TableKey, Vec<HookEntry>> = HashMap::new();

        for (index, hook) in hooks.into_iter().enumerate() {
            for event in hook.events() {
                let entry = HookEntry {
                    hook: Arc::clone(&hook),
                    index,
                };
                if hook.types().is_empty() {
                    table.entry((*event, None)).or_default().push(entry);
                } else {
                    for etype in hook.types() {
                        table
                            .entry((*event, Some(etype.to_string())))
                            .or_default()
                            .push(entry.clone());
                    }
                }
            }
        }

        for entries in table.values_mut() {
            entries.sort_by_key(HookEntry::sort_key);
        }

        Self { table, count }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Number of registered hooks
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn candidates(&self, event: HookEvent, ctx: &HookContext) -> Vec<&HookEntry> {
        let mut entries: Vec<&HookEntry> = self
            .table
            .get(&(event, None))
            .into_iter()
            .flatten()
            .collect();
        if let Some(key) = ctx.type_key() {
            if let Some(typed) = self.table.get(&(event, Some(key.to_string()))) {
                entries.extend(typed);
                entries.sort_by_key(|entry| entry.sort_key());
            }
        }
        entries
    }

    /// Hooks that would run for `event`, in call order.
    pub fn selected(
        &self,
        cnx: &Connection,
        event: HookEvent,
        ctx: &HookContext,
    ) -> Vec<Arc<dyn Hook>> {
        self.candidates(event, ctx)
            .into_iter()
            .filter(|entry| entry.hook.score(cnx, ctx) > 0)
            .filter(|entry| cnx.is_hook_category_active(entry.hook.category()))
            .map(|entry| Arc::clone(&entry.hook))
            .collect()
    }

    /// Select and call the hooks registered for `event`.
    ///
    /// Selection runs with read security off, the calls themselves with
    /// read and write security off. The first failing hook stops the
    /// dispatch and its error is returned.
    pub fn call_hooks(&self, cnx: &mut Connection, event: HookEvent, ctx: &HookContext) -> Result<()> {
        let hooks = {
            let cnx = cnx.security_enabled(Some(false), None);
            self.selected(&cnx, event, ctx)
        };
        if hooks.is_empty() {
            return Ok(());
        }

        let mut cnx = cnx.security_enabled(Some(false), Some(false));
        let previous = cnx.set_hooks_in_progress(true);
        let result = hooks.iter().try_for_each(|hook| {
            trace!(hook = hook.id(), %event, "calling hook");
            hook.call(&mut cnx, event, ctx)
        });
        cnx.set_hooks_in_progress(previous);
        result
    }
}
