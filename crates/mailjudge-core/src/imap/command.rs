//! IMAP Command definitions
//!
//! Defines the client commands issued during a sweep and their wire encoding.

use mailjudge_common::types::Uid;
use std::fmt;

/// IMAP command tag (client-generated identifier)
pub type Tag = String;

/// UID set for message selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceSet {
    /// Single UID
    Single(u32),
    /// Range of UIDs (start:end, inclusive)
    Range(u32, u32),
    /// Multiple sets
    Multiple(Vec<SequenceSet>),
}

impl SequenceSet {
    /// Build a compressed set from UIDs, e.g. `[1, 2, 3, 4, 7]` -> `1:4,7`
    pub fn from_uids(uids: &[Uid]) -> Option<Self> {
        let mut sorted = uids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut sets = Vec::new();
        let mut iter = sorted.into_iter();
        let first = iter.next()?;
        let (mut start, mut end) = (first, first);
        for uid in iter {
            if uid == end + 1 {
                end = uid;
                continue;
            }
            sets.push(Self::span(start, end));
            start = uid;
            end = uid;
        }
        sets.push(Self::span(start, end));

        if sets.len() == 1 {
            sets.pop()
        } else {
            Some(SequenceSet::Multiple(sets))
        }
    }

    fn span(start: u32, end: u32) -> Self {
        if start == end {
            SequenceSet::Single(start)
        } else {
            SequenceSet::Range(start, end)
        }
    }

    /// Check if a UID is in this set
    pub fn contains(&self, uid: u32) -> bool {
        match self {
            SequenceSet::Single(n) => uid == *n,
            SequenceSet::Range(start, end) => {
                let (low, high) = if start <= end { (*start, *end) } else { (*end, *start) };
                uid >= low && uid <= high
            }
            SequenceSet::Multiple(sets) => sets.iter().any(|s| s.contains(uid)),
        }
    }
}

impl fmt::Display for SequenceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceSet::Single(n) => write!(f, "{}", n),
            SequenceSet::Range(start, end) => write!(f, "{}:{}", start, end),
            SequenceSet::Multiple(sets) => {
                for (i, set) in sets.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", set)?;
                }
                Ok(())
            }
        }
    }
}

/// Search criteria used for candidate selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchCriteria {
    /// All messages
    All,
    /// Messages without the \Deleted flag
    NotDeleted,
}

impl fmt::Display for SearchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchCriteria::All => f.write_str("ALL"),
            SearchCriteria::NotDeleted => f.write_str("NOT DELETED"),
        }
    }
}

/// IMAP Command
#[derive(Debug, Clone)]
pub enum ImapCommand {
    Login { username: String, password: String },
    Select { mailbox: String },
    UidSearch { criteria: SearchCriteria },
    UidFetch { sequence: SequenceSet, items: String },
    UidCopy { sequence: SequenceSet, mailbox: String },
    UidStoreDeleted { sequence: SequenceSet },
    Expunge,
    Logout,
}

impl ImapCommand {
    /// Command name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            ImapCommand::Login { .. } => "LOGIN",
            ImapCommand::Select { .. } => "SELECT",
            ImapCommand::UidSearch { .. } => "UID SEARCH",
            ImapCommand::UidFetch { .. } => "UID FETCH",
            ImapCommand::UidCopy { .. } => "UID COPY",
            ImapCommand::UidStoreDeleted { .. } => "UID STORE",
            ImapCommand::Expunge => "EXPUNGE",
            ImapCommand::Logout => "LOGOUT",
        }
    }

    /// Encode the command as a tagged wire line
    pub fn encode(&self, tag: &str) -> String {
        let body = match self {
            ImapCommand::Login { username, password } => {
                format!("LOGIN {} {}", quote(username), quote(password))
            }
            ImapCommand::Select { mailbox } => format!("SELECT {}", quote(mailbox)),
            ImapCommand::UidSearch { criteria } => format!("UID SEARCH {}", criteria),
            ImapCommand::UidFetch { sequence, items } => {
                format!("UID FETCH {} (UID {})", sequence, items)
            }
            ImapCommand::UidCopy { sequence, mailbox } => {
                format!("UID COPY {} {}", sequence, quote(mailbox))
            }
            ImapCommand::UidStoreDeleted { sequence } => {
                format!("UID STORE {} +FLAGS.SILENT (\\Deleted)", sequence)
            }
            ImapCommand::Expunge => "EXPUNGE".to_string(),
            ImapCommand::Logout => "LOGOUT".to_string(),
        };
        format!("{} {}\r\n", tag, body)
    }

    /// Redacted form for logging
    pub fn redacted(&self, tag: &str) -> String {
        match self {
            ImapCommand::Login { username, .. } => {
                format!("{} LOGIN {} ***", tag, quote(username))
            }
            _ => self.encode(tag).trim_end().to_string(),
        }
    }
}

/// Quote a string for IMAP (escape backslash and quote)
pub fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Monotonic tag generator: A0001, A0002, ...
#[derive(Debug, Default)]
pub struct TagGenerator {
    next: u32,
}

impl TagGenerator {
    pub fn next_tag(&mut self) -> Tag {
        self.next += 1;
        format!("A{:04}", self.next)
    }
}
