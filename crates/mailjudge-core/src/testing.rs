//! In-memory mailbox double for engine, dispatcher and orchestrator tests

use crate::mailbox::{Connector, MailboxSession, RawMessage, SearchMode};
use async_trait::async_trait;
use mailjudge_common::types::{Account, Uid};
use mailjudge_common::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// One command issued against a [`MemoryMailbox`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Search(SearchMode),
    Fetch(Vec<Uid>),
    Copy(Vec<Uid>, String),
    StoreDeleted(Vec<Uid>),
    Expunge,
    Close,
}

/// A selected folder held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryMailbox {
    pub messages: BTreeMap<Uid, Vec<u8>>,
    pub deleted: BTreeSet<Uid>,
    pub folders: BTreeMap<String, Vec<Uid>>,
    pub ops: Vec<Op>,
    failing_folders: BTreeSet<String>,
    disconnect_after: Option<usize>,
}

impl MemoryMailbox {
    /// Mailbox holding minimal messages with the given UIDs
    pub fn with_messages(uids: &[Uid]) -> Self {
        let mut mailbox = Self::default();
        for uid in uids {
            mailbox.insert(*uid, &format!("Subject: message {}\r\n\r\nbody {}\r\n", uid, uid));
        }
        mailbox
    }

    pub fn insert(&mut self, uid: Uid, raw: &str) {
        self.messages.insert(uid, raw.as_bytes().to_vec());
    }

    /// `UID COPY` to this folder answers `NO`
    pub fn fail_copy_to(&mut self, folder: &str) {
        self.failing_folders.insert(folder.to_string());
    }

    /// Drop the connection once `commands` mutating commands have succeeded
    pub fn disconnect_after(&mut self, commands: usize) {
        self.disconnect_after = Some(commands);
    }

    /// UIDs still present in the selected folder
    pub fn remaining(&self) -> Vec<Uid> {
        self.messages.keys().copied().collect()
    }

    pub fn folder(&self, name: &str) -> Vec<Uid> {
        self.folders.get(name).cloned().unwrap_or_default()
    }

    fn check_connection(&mut self) -> Result<()> {
        match self.disconnect_after {
            Some(0) => Err(Error::Disconnected("server closed the connection".to_string())),
            Some(n) => {
                self.disconnect_after = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MailboxSession for MemoryMailbox {
    async fn search(&mut self, mode: SearchMode) -> Result<Vec<Uid>> {
        self.ops.push(Op::Search(mode));
        Ok(self
            .messages
            .keys()
            .filter(|uid| mode == SearchMode::All || !self.deleted.contains(uid))
            .copied()
            .collect())
    }

    async fn fetch_batch(&mut self, uids: &[Uid], _pattern: &str) -> Result<Vec<RawMessage>> {
        self.ops.push(Op::Fetch(uids.to_vec()));
        Ok(uids
            .iter()
            .filter_map(|uid| self.messages.get(uid).map(|bytes| RawMessage::new(*uid, bytes.clone())))
            .collect())
    }

    async fn copy(&mut self, uids: &[Uid], folder: &str) -> Result<()> {
        self.check_connection()?;
        if self.failing_folders.contains(folder) {
            return Err(Error::Protocol(format!("COPY failed: [TRYCREATE] {} does not exist", folder)));
        }
        self.ops.push(Op::Copy(uids.to_vec(), folder.to_string()));
        self.folders
            .entry(folder.to_string())
            .or_default()
            .extend_from_slice(uids);
        Ok(())
    }

    async fn store_deleted(&mut self, uids: &[Uid]) -> Result<()> {
        self.check_connection()?;
        self.ops.push(Op::StoreDeleted(uids.to_vec()));
        self.deleted.extend(uids.iter().copied());
        Ok(())
    }

    async fn expunge(&mut self) -> Result<()> {
        self.check_connection()?;
        self.ops.push(Op::Expunge);
        let deleted = std::mem::take(&mut self.deleted);
        self.messages.retain(|uid, _| !deleted.contains(uid));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.ops.push(Op::Close);
        Ok(())
    }
}

/// Session handed out by [`MemoryConnector`]; shares its mailbox with the test
pub struct SharedMailbox(pub Arc<Mutex<MemoryMailbox>>);

#[async_trait]
impl MailboxSession for SharedMailbox {
    async fn search(&mut self, mode: SearchMode) -> Result<Vec<Uid>> {
        let mut mailbox = self.0.lock().unwrap().clone();
        let result = mailbox.search(mode).await;
        *self.0.lock().unwrap() = mailbox;
        result
    }

    async fn fetch_batch(&mut self, uids: &[Uid], pattern: &str) -> Result<Vec<RawMessage>> {
        let mut mailbox = self.0.lock().unwrap().clone();
        let result = mailbox.fetch_batch(uids, pattern).await;
        *self.0.lock().unwrap() = mailbox;
        result
    }

    async fn copy(&mut self, uids: &[Uid], folder: &str) -> Result<()> {
        let mut mailbox = self.0.lock().unwrap().clone();
        let result = mailbox.copy(uids, folder).await;
        *self.0.lock().unwrap() = mailbox;
        result
    }

    async fn store_deleted(&mut self, uids: &[Uid]) -> Result<()> {
        let mut mailbox = self.0.lock().unwrap().clone();
        let result = mailbox.store_deleted(uids).await;
        *self.0.lock().unwrap() = mailbox;
        result
    }

    async fn expunge(&mut self) -> Result<()> {
        let mut mailbox = self.0.lock().unwrap().clone();
        let result = mailbox.expunge().await;
        *self.0.lock().unwrap() = mailbox;
        result
    }

    async fn close(&mut self) -> Result<()> {
        let mut mailbox = self.0.lock().unwrap().clone();
        let result = mailbox.close().await;
        *self.0.lock().unwrap() = mailbox;
        result
    }
}

/// Connector over in-memory mailboxes keyed by account
#[derive(Default)]
pub struct MemoryConnector {
    mailboxes: HashMap<String, Arc<Mutex<MemoryMailbox>>>,
    refused: BTreeSet<String>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mailbox(mut self, user: &str, mailbox: MemoryMailbox) -> Self {
        self.mailboxes
            .insert(user.to_string(), Arc::new(Mutex::new(mailbox)));
        self
    }

    /// Connections for this account fail before login
    pub fn refuse(mut self, user: &str) -> Self {
        self.refused.insert(user.to_string());
        self
    }

    pub fn mailbox(&self, user: &str) -> MemoryMailbox {
        self.mailboxes
            .get(user)
            .map(|m| m.lock().unwrap().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailboxSession>> {
        if account.credential.is_none() {
            return Err(Error::Auth(format!("No password set for {}", account.user)));
        }
        if self.refused.contains(&account.user) {
            return Err(Error::Disconnected(format!("Failed to connect to {}", account.server)));
        }
        let mailbox = self
            .mailboxes
            .get(&account.user)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(SharedMailbox(mailbox)))
    }
}
