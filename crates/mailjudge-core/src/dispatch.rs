//! Action dispatch
//!
//! Applies a round's [`PendingActionBatch`] to the mailbox. Each action key
//! is applied with its whole UID set in one call. There is no native move:
//! a move is a copy followed by a delete, counted once as `move`.

use crate::engine::PendingActionBatch;
use crate::mailbox::MailboxSession;
use mailjudge_common::types::{ActionKey, ActionStats, Uid};
use mailjudge_common::{Error, Result};
use std::fmt;
use tracing::{debug, error, info, warn};

/// A validated action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Copy { folder: String },
    Move { folder: String },
    Delete,
}

impl Action {
    /// Resolve an action key. Unknown names are [`Error::InvalidAction`];
    /// `copy`/`move` without a folder are [`Error::MissingFolder`].
    pub fn from_key(key: &ActionKey) -> Result<Self> {
        let folder = || {
            key.folder
                .clone()
                .ok_or_else(|| Error::MissingFolder(key.to_string()))
        };
        match key.action.as_str() {
            "copy" => Ok(Action::Copy { folder: folder()? }),
            "move" => Ok(Action::Move { folder: folder()? }),
            "delete" => Ok(Action::Delete),
            other => Err(Error::InvalidAction(other.to_string())),
        }
    }

    /// Counter name in statistics
    pub fn name(&self) -> &'static str {
        match self {
            Action::Copy { .. } => "copy",
            Action::Move { .. } => "move",
            Action::Delete => "delete",
        }
    }

    /// Available actions with a short description
    pub fn catalog() -> &'static [(&'static str, &'static str)] {
        &[
            ("copy:<folder>", "Copy messages to <folder>, keeping the originals"),
            ("delete", "Flag messages as deleted, then purge them"),
            ("move:<folder>", "Copy messages to <folder>, then delete the originals"),
        ]
    }

    /// Application order within a round: copies, then moves, then deletes
    fn rank(&self) -> u8 {
        match self {
            Action::Copy { .. } => 0,
            Action::Move { .. } => 1,
            Action::Delete => 2,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Copy { folder } => write!(f, "copy:{}", folder),
            Action::Move { folder } => write!(f, "move:{}", folder),
            Action::Delete => f.write_str("delete"),
        }
    }
}

/// Applies pending actions for one account
#[derive(Debug, Clone)]
pub struct ActionDispatcher {
    user: String,
    dry_run: bool,
}

impl ActionDispatcher {
    pub fn new(user: impl Into<String>, dry_run: bool) -> Self {
        Self {
            user: user.into(),
            dry_run,
        }
    }

    /// Apply every action of the batch, adding applied UIDs to `stats`.
    ///
    /// All keys are validated first: an unknown action or a missing folder
    /// fails the round before anything is applied. A `NO`/`BAD` answer to
    /// one action is logged and the remaining actions still run; the
    /// affected UIDs are not counted. A lost session is returned at once.
    pub async fn dispatch(
        &self,
        session: &mut dyn MailboxSession,
        batch: &PendingActionBatch,
        stats: &mut ActionStats,
    ) -> Result<()> {
        let mut plan = Vec::with_capacity(batch.len());
        for (key, uids) in batch.iter() {
            match Action::from_key(key) {
                Ok(action) => plan.push((action, uids.iter().copied().collect::<Vec<Uid>>())),
                Err(e) => {
                    error!(user = %self.user, action = %key, error = %e, "Round aborted, no action applied");
                    return Err(e);
                }
            }
        }
        plan.sort_by_key(|(action, _)| action.rank());

        for (action, uids) in plan {
            if uids.is_empty() {
                continue;
            }

            if self.dry_run {
                info!(user = %self.user, action = %action, uids = ?uids, "Dry run, not applying");
                continue;
            }

            match self.apply(session, &action, &uids).await {
                Ok(()) => {
                    debug!(user = %self.user, action = %action, count = uids.len(), "Action applied");
                    stats.record(action.name(), uids.len() as u64);
                }
                Err(e) if e.ends_sweep() => return Err(e),
                Err(e) => {
                    warn!(user = %self.user, action = %action, uids = ?uids, error = %e, "Action failed, will retry on next run");
                }
            }
        }

        Ok(())
    }

    async fn apply(&self, session: &mut dyn MailboxSession, action: &Action, uids: &[Uid]) -> Result<()> {
        match action {
            Action::Copy { folder } => session.copy(uids, folder).await,
            Action::Delete => Self::delete(session, uids).await,
            Action::Move { folder } => {
                session.copy(uids, folder).await?;
                if let Err(e) = Self::delete(session, uids).await {
                    warn!(
                        user = %self.user,
                        folder = %folder,
                        uids = ?uids,
                        "Move copied but did not delete, messages are duplicated"
                    );
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    async fn delete(session: &mut dyn MailboxSession, uids: &[Uid]) -> Result<()> {
        session.store_deleted(uids).await?;
        session.expunge().await
    }
}
