//! Mailbox session abstraction
//!
//! A [`MailboxSession`] is one authenticated connection to one account with
//! its folder selected. Sessions are owned by a single account task and
//! are never shared.

use crate::imap::command::SearchCriteria;
use async_trait::async_trait;
use mailjudge_common::types::{Account, Uid};
use mailjudge_common::Result;

/// Candidate filter for a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Every message in the folder
    All,
    /// Messages not flagged for deletion
    NotDeleted,
}

impl SearchMode {
    pub fn from_full(full: bool) -> Self {
        if full {
            SearchMode::All
        } else {
            SearchMode::NotDeleted
        }
    }

    pub fn criteria(self) -> SearchCriteria {
        match self {
            SearchMode::All => SearchCriteria::All,
            SearchMode::NotDeleted => SearchCriteria::NotDeleted,
        }
    }
}

/// Raw message bytes as retrieved from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub uid: Uid,
    pub bytes: Vec<u8>,
}

impl RawMessage {
    pub fn new(uid: Uid, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            uid,
            bytes: bytes.into(),
        }
    }
}

/// Authenticated connection to one account's selected folder
#[async_trait]
pub trait MailboxSession: Send {
    /// Ordered identifiers matching the filter
    async fn search(&mut self, mode: SearchMode) -> Result<Vec<Uid>>;

    /// Retrieve raw bytes for `uids` without changing their seen state
    async fn fetch_batch(&mut self, uids: &[Uid], pattern: &str) -> Result<Vec<RawMessage>>;

    /// Copy messages to `folder`
    async fn copy(&mut self, uids: &[Uid], folder: &str) -> Result<()>;

    /// Flag messages for deletion
    async fn store_deleted(&mut self, uids: &[Uid]) -> Result<()>;

    /// Purge messages flagged for deletion
    async fn expunge(&mut self) -> Result<()>;

    /// Release the connection. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions for accounts
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect, authenticate and select the account folder
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailboxSession>>;
}
