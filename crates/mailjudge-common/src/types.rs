//! Common types for mailjudge

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Server-assigned message identifier, unique within one mailbox
pub type Uid = u32;

/// Folder selected when an account does not name one
pub const DEFAULT_FOLDER: &str = "INBOX";

/// Secret used to log in; never printed
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// One mailbox account to judge. Immutable for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// User identity, also the login name
    pub user: String,
    /// `host` or `host:port`
    pub server: String,
    /// Folder to judge; `INBOX` when absent
    pub folder: Option<String>,
    pub credential: Option<Credential>,
}

impl Account {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            folder: None,
            credential: None,
        }
    }

    pub fn with_folder(mut self, folder: Option<String>) -> Self {
        self.folder = folder;
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Folder selected for the sweep
    pub fn folder(&self) -> &str {
        self.folder.as_deref().unwrap_or(DEFAULT_FOLDER)
    }

    /// Host and port to connect to; the port defaults to 993 (TLS) or 143.
    /// IPv6 addresses take a port only in brackets (`[::1]:1143`); a bare
    /// address with several colons is all host.
    pub fn endpoint(&self, secure: bool) -> (String, u16) {
        let default_port = if secure { 993 } else { 143 };
        let server = self.server.trim();

        if let Some(rest) = server.strip_prefix('[') {
            if let Some((host, tail)) = rest.split_once(']') {
                let port = tail
                    .strip_prefix(':')
                    .and_then(|port| port.parse().ok())
                    .unwrap_or(default_port);
                return (host.to_string(), port);
            }
        }

        match server.split_once(':') {
            Some((host, port)) if !port.contains(':') => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (server.to_string(), default_port),
            },
            _ => (server.to_string(), default_port),
        }
    }

    /// Name of the environment variable holding this account's password
    pub fn password_envar(&self) -> String {
        password_envar(&self.user)
    }
}

/// Format the password envar for a user: upper-cased, `@ . + -` replaced by
/// `_`, suffixed with `_PWD`
pub fn password_envar(user: &str) -> String {
    let mut envar: String = user
        .to_uppercase()
        .chars()
        .map(|c| match c {
            '@' | '.' | '+' | '-' => '_',
            c => c,
        })
        .collect();
    envar.push_str("_PWD");
    envar
}

/// An action directive: `action` or `action:folder`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionKey {
    pub action: String,
    pub folder: Option<String>,
}

impl ActionKey {
    pub fn new(action: impl Into<String>, folder: Option<String>) -> Self {
        Self {
            action: action.into(),
            folder,
        }
    }

    /// Parse a directive line such as `delete` or `move:Archives/2024`
    pub fn parse(directive: &str) -> Self {
        let directive = directive.trim();
        match directive.split_once(':') {
            Some((action, folder)) => {
                let folder = folder.trim();
                Self::new(
                    action.trim(),
                    (!folder.is_empty()).then(|| folder.to_string()),
                )
            }
            None => Self::new(directive, None),
        }
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.folder {
            Some(folder) => write!(f, "{}:{}", self.action, folder),
            None => write!(f, "{}", self.action),
        }
    }
}

/// Per-account action counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStats(BTreeMap<String, u64>);

impl ActionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `count` to the counter of `action`
    pub fn record(&mut self, action: &str, count: u64) {
        if count == 0 {
            return;
        }
        *self.0.entry(action.to_string()).or_insert(0) += count;
    }

    pub fn get(&self, action: &str) -> u64 {
        self.0.get(action).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &ActionStats) {
        for (action, count) in &other.0 {
            self.record(action, *count);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(action, count)| (action.as_str(), *count))
    }
}

/// Drop seconds and sub-seconds from a run timestamp
pub fn truncate_to_minute(at: NaiveDateTime) -> NaiveDateTime {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}
