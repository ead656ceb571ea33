use crate::core::{RepoError, Result};
use crate::schema::MANAGERS;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// Login of the user behind internal connections.
pub const INTERNAL_LOGIN: &str = "__internal_manager__";

/// Authenticated user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    login: String,
    groups: BTreeSet<String>,
    properties: HashMap<String, String>,
}

impl User {
    pub fn new<'a>(login: &str, groups: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            login: login.to_string(),
            groups: groups.into_iter().map(str::to_string).collect(),
            properties: HashMap::new(),
        }
    }

    /// The internal manager, member of the managers group only.
    pub fn internal() -> Self {
        Self::new(INTERNAL_LOGIN, [MANAGERS])
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    #[inline]
    pub fn is_manager(&self) -> bool {
        self.has_group(MANAGERS)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Preferred UI language, if the user set one.
    pub fn language(&self) -> Option<&str> {
        self.property("ui.language")
    }
}

/// What a client presents to open a session.
#[derive(Debug, Clone)]
pub enum Credentials {
    Password(String),
    Token(String),
}

/// Authentication back end
///
/// The repository asks every registered source in turn; a source that does
/// not know the login or does not handle the credentials kind answers with
/// `RepoError::Authentication`.
pub trait IdentitySource: Send + Sync {
    fn name(&self) -> &str;

    fn authenticate(&self, login: &str, credentials: &Credentials) -> Result<User>;
}

struct Account {
    password_hash: String,
    user: User,
}

/// Login/password accounts hashed with bcrypt
pub struct PasswordSource {
    accounts: RwLock<HashMap<String, Account>>,
    cost: u32,
}

impl PasswordSource {
    pub fn new() -> Self {
        Self::with_cost(bcrypt::DEFAULT_COST)
    }

    /// Use a custom bcrypt cost factor. Low values are only meant for tests.
    pub fn with_cost(cost: u32) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            cost,
        }
    }

    /// Hashes a password using bcrypt
    ///
    /// Each hash includes a random salt, so the same password will produce
    /// different hashes.
    fn hash_password(&self, password: &str) -> Result<String> {
        bcrypt::hash(password, self.cost)
            .map_err(|err| RepoError::Execution(format!("failed to hash password: {}", err)))
    }

    fn verify_password(password: &str, hash: &str) -> bool {
        bcrypt::verify(password, hash).unwrap_or(false)
    }

    pub fn create_user(&self, login: &str, password: &str, groups: &[&str]) -> Result<()> {
        Self::validate_login(login)?;
        Self::validate_password(password)?;

        let mut accounts = self.accounts.write()?;
        if accounts.contains_key(login) {
            return Err(RepoError::Execution(format!(
                "User '{}' already exists",
                login
            )));
        }

        let account = Account {
            password_hash: self.hash_password(password)?,
            user: User::new(login, groups.iter().copied()),
        };
        accounts.insert(login.to_string(), account);
        Ok(())
    }

    pub fn set_property(&self, login: &str, key: &str, value: &str) -> Result<()> {
        let mut accounts = self.accounts.write()?;
        let account = accounts
            .get_mut(login)
            .ok_or_else(|| RepoError::NotFound(format!("user '{}'", login)))?;
        account
            .user
            .properties
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn update_password(&self, login: &str, new_password: &str) -> Result<()> {
        Self::validate_password(new_password)?;
        let hash = self.hash_password(new_password)?;

        let mut accounts = self.accounts.write()?;
        let account = accounts
            .get_mut(login)
            .ok_or_else(|| RepoError::NotFound(format!("user '{}'", login)))?;
        account.password_hash = hash;
        Ok(())
    }

    pub fn delete_user(&self, login: &str) -> Result<()> {
        let mut accounts = self.accounts.write()?;
        let account = accounts
            .get(login)
            .ok_or_else(|| RepoError::NotFound(format!("user '{}'", login)))?;

        if account.user.is_manager() {
            let managers = accounts.values().filter(|a| a.user.is_manager()).count();
            if managers <= 1 {
                return Err(RepoError::Execution("Cannot delete the last manager".into()));
            }
        }

        accounts.remove(login);
        Ok(())
    }

    pub fn list_users(&self) -> Result<Vec<String>> {
        let accounts = self.accounts.read()?;
        let mut logins: Vec<String> = accounts.keys().cloned().collect();
        logins.sort();
        Ok(logins)
    }

    pub fn user_count(&self) -> Result<usize> {
        Ok(self.accounts.read()?.len())
    }

    fn validate_login(login: &str) -> Result<()> {
        if login.is_empty() {
            return Err(RepoError::Execution("Login cannot be empty".into()));
        }
        if login.len() > 50 {
            return Err(RepoError::Execution(
                "Login too long (max 50 characters)".into(),
            ));
        }
        if login == INTERNAL_LOGIN {
            return Err(RepoError::Execution(format!("'{}' is reserved", login)));
        }
        Ok(())
    }

    fn validate_password(password: &str) -> Result<()> {
        if password.is_empty() {
            return Err(RepoError::Execution("Password cannot be empty".into()));
        }
        if password.len() < 8 {
            return Err(RepoError::Execution(
                "Password must be at least 8 characters long".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PasswordSource {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentitySource for PasswordSource {
    fn name(&self) -> &str {
        "password"
    }

    fn authenticate(&self, login: &str, credentials: &Credentials) -> Result<User> {
        let Credentials::Password(password) = credentials else {
            return Err(RepoError::Authentication(
                "password source only accepts passwords".into(),
            ));
        };

        let accounts = self.accounts.read()?;
        let account = accounts
            .get(login)
            .ok_or_else(|| RepoError::Authentication("Invalid login or password".into()))?;

        if !Self::verify_password(password, &account.password_hash) {
            return Err(RepoError::Authentication("Invalid login or password".into()));
        }

        Ok(account.user.clone())
    }
}

/// Pre-shared tokens bound to a user, for service accounts.
#[derive(Default)]
pub struct TokenSource {
    tokens: RwLock<HashMap<String, User>>,
}

impl TokenSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self, token: &str, user: User) -> Result<()> {
        self.tokens.write()?.insert(token.to_string(), user);
        Ok(())
    }

    pub fn revoke(&self, token: &str) -> Result<bool> {
        Ok(self.tokens.write()?.remove(token).is_some())
    }
}

impl IdentitySource for TokenSource {
    fn name(&self) -> &str {
        "token"
    }

    fn authenticate(&self, login: &str, credentials: &Credentials) -> Result<User> {
        let Credentials::Token(token) = credentials else {
            return Err(RepoError::Authentication(
                "token source only accepts tokens".into(),
            ));
        };

        match self.tokens.read()?.get(token) {
            Some(user) if user.login() == login => Ok(user.clone()),
            _ => Err(RepoError::Authentication("Invalid token".into())),
        }
    }
}
