//! mailjudge core - IMAP mail sorting by rules
//!
//! This crate provides the IMAP client, message normalization, the rule
//! predicate language, the judgement engine and the run orchestrator.

pub mod dispatch;
pub mod engine;
pub mod imap;
pub mod mailbox;
pub mod normalize;
pub mod orchestrator;
pub mod rules;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::{Action, ActionDispatcher};
pub use engine::{JudgementEngine, PendingActionBatch, SweepOptions, SweepOutcome};
pub use imap::{ImapConnector, ImapSession};
pub use mailbox::{Connector, MailboxSession, RawMessage, SearchMode};
pub use normalize::{MessageNormalizer, NormalizedMessage};
pub use orchestrator::{AccountReport, CredentialSource, EnvCredentials, Orchestrator, RunReport};
pub use rules::{Rule, RuleSet, RuleStore};
