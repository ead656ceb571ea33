//! Hook category and security toggling.
//!
//! Both are stacks living on the connection: entering a scope pushes the
//! current state and installs a new one, the returned guard restores the
//! previous state when dropped, whatever the exit path.

use super::Connection;
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HooksMode {
    /// Every category is active except the listed ones
    #[default]
    AllowAll,
    /// Only the listed categories are active
    DenyAll,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HooksState {
    pub mode: HooksMode,
    pub categories: BTreeSet<String>,
}

impl HooksState {
    pub fn new<I, S>(mode: HooksMode, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode,
            categories: categories.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_category_active(&self, category: &str) -> bool {
        match self.mode {
            HooksMode::AllowAll => !self.categories.contains(category),
            HooksMode::DenyAll => self.categories.contains(category),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct HooksControl {
    current: HooksState,
    stack: Vec<HooksState>,
}

impl HooksControl {
    pub(crate) fn current(&self) -> &HooksState {
        &self.current
    }

    pub(crate) fn push(&mut self, state: HooksState) {
        trace!(mode = ?state.mode, categories = ?state.categories, "entering hooks control");
        let previous = std::mem::replace(&mut self.current, state);
        self.stack.push(previous);
    }

    pub(crate) fn pop(&mut self) {
        if let Some(previous) = self.stack.pop() {
            self.current = previous;
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.stack.len()
    }
}

/// Read/write security flags. `None` stands for the default, enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityState {
    pub read: Option<bool>,
    pub write: Option<bool>,
}

impl SecurityState {
    pub fn read_enabled(&self) -> bool {
        self.read.unwrap_or(true)
    }

    pub fn write_enabled(&self) -> bool {
        self.write.unwrap_or(true)
    }
}

#[derive(Debug, Default)]
pub(crate) struct SecurityControl {
    current: SecurityState,
    stack: Vec<SecurityState>,
}

impl SecurityControl {
    /// Base state of internal connections.
    pub(crate) fn disabled() -> Self {
        Self {
            current: SecurityState {
                read: Some(false),
                write: Some(false),
            },
            stack: Vec::new(),
        }
    }

    pub(crate) fn current(&self) -> SecurityState {
        self.current
    }

    /// `None` leaves the corresponding flag untouched.
    pub(crate) fn push(&mut self, read: Option<bool>, write: Option<bool>) {
        self.stack.push(self.current);
        self.current = SecurityState {
            read: read.or(self.current.read),
            write: write.or(self.current.write),
        };
    }

    pub(crate) fn pop(&mut self) {
        if let Some(previous) = self.stack.pop() {
            self.current = previous;
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.stack.len()
    }
}

/// Scope of a hooks control change, derefs to the connection.
pub struct HooksGuard<'a> {
    cnx: &'a mut Connection,
}

impl<'a> HooksGuard<'a> {
    pub(super) fn enter(cnx: &'a mut Connection, state: HooksState) -> Self {
        cnx.hooks.push(state);
        Self { cnx }
    }
}

impl Deref for HooksGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.cnx
    }
}

impl DerefMut for HooksGuard<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.cnx
    }
}

impl Drop for HooksGuard<'_> {
    fn drop(&mut self) {
        self.cnx.hooks.pop();
    }
}

/// Scope of a security change, derefs to the connection.
pub struct SecurityGuard<'a> {
    cnx: &'a mut Connection,
}

impl<'a> SecurityGuard<'a> {
    pub(super) fn enter(cnx: &'a mut Connection, read: Option<bool>, write: Option<bool>) -> Self {
        cnx.security.push(read, write);
        Self { cnx }
    }
}

impl Deref for SecurityGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.cnx
    }
}

impl DerefMut for SecurityGuard<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.cnx
    }
}

impl Drop for SecurityGuard<'_> {
    fn drop(&mut self) {
        self.cnx.security.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_activity() {
        let allow = HooksState::new(HooksMode::AllowAll, ["integrity"]);
        assert!(!allow.is_category_active("integrity"));
        assert!(allow.is_category_active("security"));

        let deny = HooksState::new(HooksMode::DenyAll, ["integrity"]);
        assert!(deny.is_category_active("integrity"));
        assert!(!deny.is_category_active("security"));

        assert!(HooksState::default().is_category_active("anything"));
    }

    #[test]
    fn test_hooks_control_restores_nested_states() {
        let mut control = HooksControl::default();
        control.push(HooksState::new(HooksMode::DenyAll, ["a"]));
        control.push(HooksState::new(HooksMode::DenyAll, ["b"]));
        assert_eq!(control.depth(), 2);

        control.pop();
        assert_eq!(control.current(), &HooksState::new(HooksMode::DenyAll, ["a"]));
        control.pop();
        assert_eq!(control.current(), &HooksState::default());

        // unbalanced pops are ignored
        control.pop();
        assert_eq!(control.depth(), 0);
    }

    #[test]
    fn test_security_control_keeps_untouched_flags() {
        let mut control = SecurityControl::default();
        control.push(Some(false), None);
        control.push(None, Some(false));
        assert_eq!(
            control.current(),
            SecurityState {
                read: Some(false),
                write: Some(false)
            }
        );

        control.pop();
        assert!(!control.current().read_enabled());
        assert!(control.current().write_enabled());
        control.pop();
        assert_eq!(control.current(), SecurityState::default());
        assert_eq!(control.depth(), 0);
    }
}
