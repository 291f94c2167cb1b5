//! IMAP Session management
//!
//! Client side of one IMAP connection: command tagging, response reading
//! with literal support, and the state of the connection.

use super::command::{ImapCommand, SequenceSet, TagGenerator};
use super::response::{decode_line, literal_len, ImapResponse, ResponseStatus};
use crate::mailbox::{MailboxSession, RawMessage, SearchMode};
use async_trait::async_trait;
use mailjudge_common::types::Uid;
use mailjudge_common::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

/// IMAP session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, greeting not yet read
    Connecting,
    /// Not authenticated
    NotAuthenticated,
    /// Authenticated but no mailbox selected
    Authenticated,
    /// Mailbox selected
    Selected,
    /// Session is closing or unusable
    Logout,
}

/// Default cap on a single `{n}` literal
pub const DEFAULT_MAX_LITERAL: usize = 64 * 1024 * 1024;

/// IMAP client session over any byte stream
pub struct ImapSession<S> {
    stream: BufReader<S>,
    state: SessionState,
    tags: TagGenerator,
    /// Account identity, for logs
    user: String,
    command_timeout: Duration,
    /// Number of ids per FETCH command
    commit_threshold: usize,
    max_literal: usize,
    closed: bool,
}

impl<S> ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, user: impl Into<String>, command_timeout: Duration, commit_threshold: usize) -> Self {
        Self {
            stream: BufReader::new(stream),
            state: SessionState::Connecting,
            tags: TagGenerator::default(),
            user: user.into(),
            command_timeout,
            commit_threshold: commit_threshold.max(1),
            max_literal: DEFAULT_MAX_LITERAL,
            closed: false,
        }
    }

    /// Refuse literals larger than `bytes`
    pub fn with_max_literal(mut self, bytes: usize) -> Self {
        self.max_literal = bytes;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Read the server greeting
    pub async fn read_greeting(&mut self) -> Result<()> {
        let response = match tokio::time::timeout(self.command_timeout, self.read_response()).await {
            Ok(response) => response?,
            Err(_) => return Err(self.broken("timed out waiting for greeting")),
        };

        match response.untagged_status() {
            Some(ResponseStatus::Ok) => self.state = SessionState::NotAuthenticated,
            Some(ResponseStatus::Preauth) => self.state = SessionState::Authenticated,
            Some(ResponseStatus::Bye) => return Err(self.broken(&response.text)),
            _ => {
                return Err(Error::Protocol(format!(
                    "Unexpected greeting: {}",
                    response.text
                )))
            }
        }

        debug!(user = %self.user, greeting = %response.text, "Connected");
        Ok(())
    }

    /// Authenticate with LOGIN
    pub async fn login(&mut self, password: &str) -> Result<()> {
        if self.state == SessionState::Authenticated {
            return Ok(());
        }
        let command = ImapCommand::Login {
            username: self.user.clone(),
            password: password.to_string(),
        };
        match self.execute(&command).await {
            Ok(_) => {
                self.state = SessionState::Authenticated;
                Ok(())
            }
            Err(Error::Protocol(reason)) => Err(Error::Auth(format!(
                "Login failed for {}: {}",
                self.user, reason
            ))),
            Err(e) => Err(e),
        }
    }

    /// Select the folder to judge
    pub async fn select(&mut self, mailbox: &str) -> Result<()> {
        let command = ImapCommand::Select {
            mailbox: mailbox.to_string(),
        };
        self.execute(&command).await?;
        self.state = SessionState::Selected;
        debug!(user = %self.user, folder = %mailbox, "Folder selected");
        Ok(())
    }

    fn ensure_selected(&self) -> Result<()> {
        match self.state {
            SessionState::Selected => Ok(()),
            SessionState::Logout => Err(Error::Disconnected("session is closed".to_string())),
            _ => Err(Error::Protocol("no folder selected".to_string())),
        }
    }

    /// Mark the session unusable and build the matching error
    pub(crate) fn broken(&mut self, reason: &str) -> Error {
        self.state = SessionState::Logout;
        Error::Disconnected(reason.to_string())
    }

    /// Send a command and collect its untagged responses until completion
    async fn execute(&mut self, command: &ImapCommand) -> Result<Vec<ImapResponse>> {
        if self.state == SessionState::Logout && !matches!(command, ImapCommand::Logout) {
            return Err(Error::Disconnected("session is closed".to_string()));
        }

        let tag = self.tags.next_tag();
        debug!(user = %self.user, command = %command.redacted(&tag), "IMAP command");

        match tokio::time::timeout(self.command_timeout, self.exchange(&tag, command)).await {
            Ok(Ok(responses)) => Ok(responses),
            Ok(Err(e)) => {
                if e.ends_sweep() {
                    self.state = SessionState::Logout;
                }
                Err(e)
            }
            Err(_) => {
                let reason = format!("{} timed out after {:?}", command.name(), self.command_timeout);
                Err(self.broken(&reason))
            }
        }
    }

    async fn exchange(&mut self, tag: &str, command: &ImapCommand) -> Result<Vec<ImapResponse>> {
        self.stream.write_all(command.encode(tag).as_bytes()).await?;
        self.stream.flush().await?;

        let mut untagged = Vec::new();
        loop {
            let response = self.read_response().await?;

            if let Some((response_tag, status, text)) = response.tagged() {
                if response_tag != tag {
                    warn!(user = %self.user, tag = %response_tag, "Ignoring response for unknown tag");
                    continue;
                }
                return match status {
                    ResponseStatus::Ok => Ok(untagged),
                    _ => Err(Error::Protocol(format!(
                        "{} failed: {} {}",
                        command.name(),
                        status,
                        text
                    ))),
                };
            }

            if response.untagged_status() == Some(ResponseStatus::Bye)
                && !matches!(command, ImapCommand::Logout)
            {
                return Err(Error::Disconnected(response.text));
            }

            untagged.push(response);
        }
    }

    /// Read one logical response, following `{n}` literals
    async fn read_response(&mut self) -> Result<ImapResponse> {
        let mut response = ImapResponse::default();
        loop {
            let mut buf = Vec::new();
            let n = self.stream.read_until(b'\n', &mut buf).await?;
            if n == 0 {
                return Err(Error::Disconnected("connection closed by server".to_string()));
            }

            let line = decode_line(&buf);
            let literal = literal_len(&line);
            response.text.push_str(&line);

            match literal {
                Some(len) if len > self.max_literal => {
                    // the literal is left unread, so the stream is out of step
                    self.state = SessionState::Logout;
                    return Err(Error::Protocol(format!(
                        "literal of {} bytes exceeds the {} byte limit",
                        len, self.max_literal
                    )));
                }
                Some(len) => {
                    let mut literal = vec![0u8; len];
                    self.stream.read_exact(&mut literal).await?;
                    response.literals.push(literal);
                }
                None => return Ok(response),
            }
        }
    }
}

#[async_trait]
impl<S> MailboxSession for ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn search(&mut self, mode: SearchMode) -> Result<Vec<Uid>> {
        self.ensure_selected()?;
        let command = ImapCommand::UidSearch {
            criteria: mode.criteria(),
        };
        let responses = self.execute(&command).await?;

        let mut uids: Vec<Uid> = responses
            .iter()
            .filter_map(|r| r.search_uids())
            .flatten()
            .collect();
        uids.sort_unstable();
        uids.dedup();

        debug!(user = %self.user, count = uids.len(), "Search completed");
        Ok(uids)
    }

    async fn fetch_batch(&mut self, uids: &[Uid], pattern: &str) -> Result<Vec<RawMessage>> {
        self.ensure_selected()?;

        let mut fetched: Vec<RawMessage> = Vec::with_capacity(uids.len());
        for chunk in uids.chunks(self.commit_threshold) {
            let Some(sequence) = SequenceSet::from_uids(chunk) else {
                continue;
            };
            let command = ImapCommand::UidFetch {
                sequence: sequence.clone(),
                items: pattern.to_string(),
            };

            for response in self.execute(&command).await? {
                if let Some((uid, bytes)) = response.into_fetched() {
                    if sequence.contains(uid) {
                        fetched.push(RawMessage::new(uid, bytes));
                    }
                }
            }

            debug!(
                user = %self.user,
                committed = fetched.len(),
                requested = uids.len(),
                "Fetch progress"
            );
        }

        fetched.sort_by_key(|m| m.uid);
        fetched.dedup_by_key(|m| m.uid);
        Ok(fetched)
    }

    async fn copy(&mut self, uids: &[Uid], folder: &str) -> Result<()> {
        self.ensure_selected()?;
        let Some(sequence) = SequenceSet::from_uids(uids) else {
            return Ok(());
        };
        self.execute(&ImapCommand::UidCopy {
            sequence,
            mailbox: folder.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn store_deleted(&mut self, uids: &[Uid]) -> Result<()> {
        self.ensure_selected()?;
        let Some(sequence) = SequenceSet::from_uids(uids) else {
            return Ok(());
        };
        self.execute(&ImapCommand::UidStoreDeleted { sequence }).await?;
        Ok(())
    }

    async fn expunge(&mut self) -> Result<()> {
        self.ensure_selected()?;
        self.execute(&ImapCommand::Expunge).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if matches!(
            self.state,
            SessionState::NotAuthenticated | SessionState::Authenticated | SessionState::Selected
        ) {
            if let Err(e) = self.execute(&ImapCommand::Logout).await {
                debug!(user = %self.user, error = %e, "LOGOUT failed");
            }
        }
        self.state = SessionState::Logout;

        if let Err(e) = self.stream.get_mut().shutdown().await {
            debug!(user = %self.user, error = %e, "Socket shutdown failed");
        }
        debug!(user = %self.user, "Session closed");
        Ok(())
    }
}
