//! Registered accounts backed by an append-only credentials file.
//!
//! Each line of the file is `email,password`. The whole file is read at
//! startup and every successful registration appends one line.
//!
//! Passwords are stored and compared in plain text. Anything beyond local
//! experimentation needs salted hashing here.

use regex::Regex;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result, ResultExt};

/// Registration and credential failures.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("You haven't specified a valid email for registration")]
    InvalidEmail,

    #[error("User is already registered")]
    AlreadyRegistered,

    #[error("User {0} does not exist")]
    UnknownUser(String),

    #[error("Incorrect email or password. Please enter again")]
    WrongPassword,

    /// The credentials file could not be updated
    #[error(transparent)]
    Storage(#[from] Error),
}

/// Known accounts, keyed by email.
#[derive(Debug)]
pub struct AccountStore {
    accounts: HashMap<String, String>,
    path: Option<PathBuf>,
    email_pattern: Regex,
}

impl AccountStore {
    /// Accounts kept only in memory.
    pub fn in_memory(email_pattern: &str) -> Result<Self> {
        Ok(Self {
            accounts: HashMap::new(),
            path: None,
            email_pattern: compile(email_pattern)?,
        })
    }

    /// Load accounts from `path`. A missing file means no accounts yet.
    pub fn open(path: &Path, email_pattern: &str) -> Result<Self> {
        let mut store = Self::in_memory(email_pattern)?;
        store.path = Some(path.to_path_buf());

        if !path.exists() {
            tracing::info!(target: "accounts", path = %path.display(), "No credentials file, starting empty");
            return Ok(store);
        }

        let contents = std::fs::read_to_string(path)
            .with_context(format!("reading credentials from {}", path.display()))?;
        for (n, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match line.split_once(',') {
                Some((email, password)) => {
                    store.accounts.insert(email.to_string(), password.to_string());
                }
                None => {
                    tracing::warn!(target: "accounts", line = n + 1, "Skipping malformed credentials line");
                }
            }
        }
        tracing::info!(target: "accounts", count = store.accounts.len(), "Accounts loaded");
        Ok(store)
    }

    pub fn contains(&self, email: &str) -> bool {
        self.accounts.contains_key(email)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Register a new account and persist it.
    pub fn register(&mut self, email: &str, password: &str) -> Result<(), AccountError> {
        if !self.email_pattern.is_match(email) {
            return Err(AccountError::InvalidEmail);
        }
        if self.contains(email) {
            return Err(AccountError::AlreadyRegistered);
        }
        if let Some(path) = &self.path {
            append_credentials(path, email, password)?;
        }
        self.accounts.insert(email.to_string(), password.to_string());
        tracing::info!(target: "accounts", user = %email, "Account registered");
        Ok(())
    }

    /// Check `password` against the stored one for `email`.
    pub fn authenticate(&self, email: &str, password: &str) -> Result<(), AccountError> {
        match self.accounts.get(email) {
            None => Err(AccountError::UnknownUser(email.to_string())),
            Some(stored) if stored != password => Err(AccountError::WrongPassword),
            Some(_) => Ok(()),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::config(format!("invalid email pattern: {e}")))
}

fn append_credentials(path: &Path, email: &str, password: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(format!("creating {}", dir.display()))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(format!("opening {}", path.display()))?;
    writeln!(file, "{email},{password}").with_context(format!("appending to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountsConfig;

    fn pattern() -> String {
        AccountsConfig::default().email_pattern
    }

    #[test]
    fn test_register_validates_email() {
        let mut store = AccountStore::in_memory(&pattern()).unwrap();
        assert!(matches!(
            store.register("not-an-email", "pw"),
            Err(AccountError::InvalidEmail)
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_register_twice() {
        let mut store = AccountStore::in_memory(&pattern()).unwrap();
        store.register("ana@example.com", "secret").unwrap();
        assert!(matches!(
            store.register("ana@example.com", "other"),
            Err(AccountError::AlreadyRegistered)
        ));
    }

    #[test]
    fn test_authenticate() {
        let mut store = AccountStore::in_memory(&pattern()).unwrap();
        store.register("ana@example.com", "secret").unwrap();

        assert!(store.authenticate("ana@example.com", "secret").is_ok());
        assert!(matches!(
            store.authenticate("ana@example.com", "nope"),
            Err(AccountError::WrongPassword)
        ));
        let err = store.authenticate("bob@example.com", "x").unwrap_err();
        assert_eq!(err.to_string(), "User bob@example.com does not exist");
    }

    #[test]
    fn test_register_appends_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authentication").join("users.csv");

        let mut store = AccountStore::open(&path, &pattern()).unwrap();
        store.register("ana@example.com", "secret").unwrap();
        store.register("bob@example.com", "hunter2").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "ana@example.com,secret\nbob@example.com,hunter2\n");

        let reloaded = AccountStore::open(&path, &pattern()).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.authenticate("bob@example.com", "hunter2").is_ok());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.csv");
        std::fs::write(&path, "ana@example.com,secret\ngarbage\n\n").unwrap();

        let store = AccountStore::open(&path, &pattern()).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_bad_pattern_is_config_error() {
        assert!(matches!(
            AccountStore::in_memory("(unclosed"),
            Err(Error::Config(_))
        ));
    }
}
