//! Judgement engine
//!
//! Sweeps one account's folder in rounds of at most `batch_size` ids. Each
//! round fetches, normalizes and matches its messages, then dispatches the
//! collected actions before the next round starts:
//!
//! ```text
//! Idle -> Fetching -> Normalizing -> Matching -> Batching -> Dispatching -> Idle
//! ```
//!
//! Within a round, rules are tried in [`RuleSet`] order. The first rule that
//! matches a message claims it and the message leaves the candidate set.

use crate::dispatch::ActionDispatcher;
use crate::mailbox::{MailboxSession, SearchMode};
use crate::normalize::{MessageNormalizer, NormalizedMessage};
use crate::rules::RuleSet;
use mailjudge_common::config::JudgeConfig;
use mailjudge_common::types::{ActionKey, ActionStats, Uid};
use mailjudge_common::Error;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

/// Actions collected during one round, keyed by action directive.
///
/// Keys keep the order in which they were first claimed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingActionBatch {
    entries: Vec<(ActionKey, BTreeSet<Uid>)>,
}

impl PendingActionBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a UID under an action key
    pub fn add(&mut self, key: &ActionKey, uid: Uid) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, uids)) => {
                uids.insert(uid);
            }
            None => self.entries.push((key.clone(), BTreeSet::from([uid]))),
        }
    }

    /// Add a UID under each of a rule's action keys
    pub fn extend(&mut self, keys: &[ActionKey], uid: Uid) {
        for key in keys {
            self.add(key, uid);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActionKey, &BTreeSet<Uid>)> {
        self.entries.iter().map(|(key, uids)| (key, uids))
    }

    pub fn uids(&self, key: &ActionKey) -> Option<&BTreeSet<Uid>> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, uids)| uids)
    }

    /// Number of distinct action keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A message captured by a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub uid: Uid,
    pub rule: String,
}

/// Result of matching one round
#[derive(Debug, Clone, Default)]
pub struct Judgement {
    pub batch: PendingActionBatch,
    pub claims: Vec<Claim>,
}

/// Round state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Idle,
    Fetching,
    Normalizing,
    Matching,
    Batching,
    Dispatching,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundState::Idle => "idle",
            RoundState::Fetching => "fetching",
            RoundState::Normalizing => "normalizing",
            RoundState::Matching => "matching",
            RoundState::Batching => "batching",
            RoundState::Dispatching => "dispatching",
        };
        f.write_str(name)
    }
}

/// Per-sweep settings
#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub batch_size: usize,
    pub fetch_pattern: String,
    pub mode: SearchMode,
    pub dry_run: bool,
}

impl SweepOptions {
    pub fn from_config(config: &JudgeConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            fetch_pattern: config.fetch_pattern.clone(),
            mode: SearchMode::from_full(config.full),
            dry_run: config.dry_run,
        }
    }
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self::from_config(&JudgeConfig::default())
    }
}

/// What one account's sweep produced
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub stats: ActionStats,
    /// Rounds started
    pub rounds: usize,
    /// Rounds whose actions were rejected before dispatch
    pub aborted_rounds: usize,
    /// Messages claimed by a rule
    pub matched: usize,
    /// Session-level failure that ended the sweep early
    pub error: Option<Error>,
}

/// Matches one account's messages against its rules
pub struct JudgementEngine {
    user: String,
    rules: RuleSet,
    options: SweepOptions,
    normalizer: MessageNormalizer,
    dispatcher: ActionDispatcher,
}

impl JudgementEngine {
    pub fn new(user: impl Into<String>, rules: RuleSet, options: SweepOptions) -> Self {
        let user = user.into();
        let dispatcher = ActionDispatcher::new(user.clone(), options.dry_run);
        Self {
            user,
            rules,
            options,
            normalizer: MessageNormalizer::new(),
            dispatcher,
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Match one round of messages. Each message is claimed by at most one
    /// rule; a predicate that fails to evaluate does not match.
    pub fn judge(&self, messages: Vec<NormalizedMessage>) -> Judgement {
        let mut candidates = messages;
        let mut judgement = Judgement::default();

        for rule in self.rules.iter() {
            if candidates.is_empty() {
                break;
            }
            if let Err(e) = &rule.predicate {
                debug!(user = %self.user, rule = %rule.name, error = %e, "Skipping invalid rule");
                continue;
            }

            candidates.retain(|message| match rule.matches(message) {
                Ok(true) => {
                    debug!(user = %self.user, rule = %rule.name, uid = message.uid, "Rule matched");
                    judgement.batch.extend(&rule.actions, message.uid);
                    judgement.claims.push(Claim {
                        uid: message.uid,
                        rule: rule.name.clone(),
                    });
                    false
                }
                Ok(false) => true,
                Err(e) => {
                    warn!(user = %self.user, rule = %rule.name, uid = message.uid, error = %e, "Predicate failed, treated as no match");
                    true
                }
            });
        }

        judgement
    }

    /// Run every round over the session's candidate messages
    pub async fn sweep(&self, session: &mut dyn MailboxSession) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        let uids = match session.search(self.options.mode).await {
            Ok(uids) => uids,
            Err(e) => {
                warn!(user = %self.user, error = %e, "Search failed");
                outcome.error = Some(e);
                return outcome;
            }
        };
        info!(user = %self.user, candidates = uids.len(), rules = self.rules.len(), "Sweep started");

        for chunk in uids.chunks(self.options.batch_size) {
            outcome.rounds += 1;
            let round = outcome.rounds;

            self.transition(round, RoundState::Fetching);
            let raw = match session.fetch_batch(chunk, &self.options.fetch_pattern).await {
                Ok(raw) => raw,
                Err(e) if e.ends_sweep() => {
                    warn!(user = %self.user, round, error = %e, "Fetch failed, ending sweep");
                    outcome.error = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(user = %self.user, round, error = %e, "Fetch failed, skipping round");
                    self.transition(round, RoundState::Idle);
                    continue;
                }
            };

            self.transition(round, RoundState::Normalizing);
            let messages: Vec<NormalizedMessage> = raw
                .iter()
                .filter_map(|message| match self.normalizer.normalize(message) {
                    Ok(normalized) => Some(normalized),
                    Err(e) => {
                        warn!(user = %self.user, round, error = %e, "Dropping message");
                        None
                    }
                })
                .collect();

            self.transition(round, RoundState::Matching);
            let mut judgement = self.judge(messages);

            self.transition(round, RoundState::Batching);
            outcome.matched += judgement.claims.len();
            debug!(user = %self.user, round, claimed = judgement.claims.len(), actions = judgement.batch.len(), "Round judged");

            if !judgement.batch.is_empty() {
                self.transition(round, RoundState::Dispatching);
                match self
                    .dispatcher
                    .dispatch(session, &judgement.batch, &mut outcome.stats)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.aborts_round() => {
                        warn!(user = %self.user, round, error = %e, "Round aborted before any action");
                        outcome.aborted_rounds += 1;
                    }
                    // refused actions are logged by the dispatcher; anything
                    // else it returns means the session is gone
                    Err(e) => {
                        warn!(user = %self.user, round, error = %e, "Dispatch failed, ending sweep");
                        outcome.error = Some(e);
                        break;
                    }
                }
            }
            judgement.batch.clear();
            self.transition(round, RoundState::Idle);
        }

        info!(
            user = %self.user,
            rounds = outcome.rounds,
            matched = outcome.matched,
            applied = outcome.stats.total(),
            "Sweep finished"
        );
        outcome
    }

    fn transition(&self, round: usize, state: RoundState) {
        debug!(user = %self.user, round, state = %state, "Round state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Rule, RuleScope};
    use crate::testing::{MemoryMailbox, Op};
    use pretty_assertions::assert_eq;

    fn rule(name: &str, scope: RuleScope, body: &str) -> Rule {
        Rule::parse(name, scope, body).unwrap()
    }

    fn message(uid: Uid, subject: &str, body: &str) -> NormalizedMessage {
        NormalizedMessage {
            uid,
            subject: subject.to_string(),
            body: body.to_string(),
            ..NormalizedMessage::default()
        }
    }

    fn options(batch_size: usize) -> SweepOptions {
        SweepOptions {
            batch_size,
            ..SweepOptions::default()
        }
    }

    #[test]
    fn test_pending_batch_groups_by_key() {
        let delete = ActionKey::parse("delete");
        let archive = ActionKey::parse("move:Archive");
        let mut batch = PendingActionBatch::new();
        batch.add(&archive, 7);
        batch.extend(&[delete.clone(), archive.clone()], 3);
        batch.add(&archive, 7);

        let keys: Vec<&ActionKey> = batch.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&archive, &delete]);
        assert_eq!(batch.uids(&archive).unwrap(), &BTreeSet::from([3, 7]));
        assert_eq!(batch.len(), 2);

        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_first_match_claims_message() {
        let rules = RuleSet::new(
            vec![rule("spam", RuleScope::Global, "\"viagra\" in subject\ndelete")],
            vec![
                rule("a_lists", RuleScope::Account, "subject.startswith(\"[list]\")\nmove:Lists"),
                rule("b_any", RuleScope::Account, "true\ncopy:Backup"),
            ],
        );
        let engine = JudgementEngine::new("a@example.com", rules, SweepOptions::default());

        let judgement = engine.judge(vec![
            message(1, "[list] cheap viagra", ""),
            message(2, "[list] release notes", ""),
            message(3, "hello", ""),
        ]);

        assert_eq!(
            judgement.claims,
            vec![
                Claim { uid: 1, rule: "spam".to_string() },
                Claim { uid: 2, rule: "a_lists".to_string() },
                Claim { uid: 3, rule: "b_any".to_string() },
            ]
        );
        assert_eq!(
            judgement.batch.uids(&ActionKey::parse("delete")).unwrap(),
            &BTreeSet::from([1])
        );
        assert_eq!(
            judgement.batch.uids(&ActionKey::parse("copy:Backup")).unwrap(),
            &BTreeSet::from([3])
        );
    }

    #[test]
    fn test_failing_predicate_does_not_match() {
        let rules = RuleSet::new(
            Vec::new(),
            vec![
                rule("a_broken", RuleScope::Account, "subject ==\ndelete"),
                rule("b_unknown", RuleScope::Account, "no_such_field == \"x\"\ndelete"),
                rule("c_fallback", RuleScope::Account, "\"hello\" in subject\nmove:Inbox2"),
            ],
        );
        let engine = JudgementEngine::new("a@example.com", rules, SweepOptions::default());

        let judgement = engine.judge(vec![message(1, "hello", "")]);
        assert_eq!(judgement.claims, vec![Claim { uid: 1, rule: "c_fallback".to_string() }]);
        assert!(judgement.batch.uids(&ActionKey::parse("delete")).is_none());
    }

    #[tokio::test]
    async fn test_cherry_picked_message_is_deleted() {
        let mut mailbox = MemoryMailbox::default();
        mailbox.insert(
            10,
            "From: GitHub <noreply@github.com>\r\nSubject: [repo] Backport\r\n\r\nThis commit was (cherry picked from commit 0a1b2c3)\r\n",
        );
        mailbox.insert(11, "From: bob@example.com\r\nSubject: lunch\r\n\r\nNoon?\r\n");

        let rules = RuleSet::new(
            Vec::new(),
            vec![rule(
                "github_cherry_picked",
                RuleScope::Account,
                "\"cherry picked from commit\" in message\ndelete",
            )],
        );
        let engine = JudgementEngine::new("a@example.com", rules, options(100));

        let outcome = engine.sweep(&mut mailbox).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.stats.get("delete"), 1);
        assert_eq!(outcome.matched, 1);
        assert_eq!(mailbox.remaining(), vec![11]);
    }

    #[tokio::test]
    async fn test_rounds_are_ceil_of_candidates_over_batch() {
        let uids: Vec<Uid> = (1..=7).collect();
        let mut mailbox = MemoryMailbox::with_messages(&uids);
        let engine = JudgementEngine::new("a@example.com", RuleSet::default(), options(3));

        let outcome = engine.sweep(&mut mailbox).await;

        assert_eq!(outcome.rounds, 3);
        let fetches: Vec<Op> = mailbox
            .ops
            .iter()
            .filter(|op| matches!(op, Op::Fetch(_)))
            .cloned()
            .collect();
        assert_eq!(
            fetches,
            vec![Op::Fetch(vec![1, 2, 3]), Op::Fetch(vec![4, 5, 6]), Op::Fetch(vec![7])]
        );
    }

    #[tokio::test]
    async fn test_empty_folder_has_no_rounds() {
        let mut mailbox = MemoryMailbox::default();
        let engine = JudgementEngine::new("a@example.com", RuleSet::default(), options(3));

        let outcome = engine.sweep(&mut mailbox).await;
        assert_eq!(outcome.rounds, 0);
        assert_eq!(mailbox.ops, vec![Op::Search(SearchMode::NotDeleted)]);
    }

    #[tokio::test]
    async fn test_invalid_action_aborts_only_its_round() {
        let mut mailbox = MemoryMailbox::with_messages(&[1, 2]);
        let rules = RuleSet::new(
            Vec::new(),
            vec![
                rule("a_archive", RuleScope::Account, "subject == \"message 1\"\narchive"),
                rule("b_delete", RuleScope::Account, "subject == \"message 2\"\ndelete"),
            ],
        );
        let engine = JudgementEngine::new("a@example.com", rules, options(1));

        let outcome = engine.sweep(&mut mailbox).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.aborted_rounds, 1);
        assert_eq!(outcome.stats.get("delete"), 1);
        assert_eq!(mailbox.remaining(), vec![1]);
    }

    #[tokio::test]
    async fn test_refused_copy_leaves_message_and_sweep_continues() {
        let mut mailbox = MemoryMailbox::with_messages(&[1, 2]);
        mailbox.fail_copy_to("Missing");
        let rules = RuleSet::new(
            Vec::new(),
            vec![
                rule("a_move", RuleScope::Account, "subject == \"message 1\"\nmove:Missing"),
                rule("b_delete", RuleScope::Account, "subject == \"message 2\"\ndelete"),
            ],
        );
        let engine = JudgementEngine::new("a@example.com", rules, options(1));

        let outcome = engine.sweep(&mut mailbox).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.aborted_rounds, 0);
        assert_eq!(outcome.stats.get("move"), 0);
        assert_eq!(outcome.stats.get("delete"), 1);
        assert_eq!(mailbox.remaining(), vec![1]);
        assert!(mailbox.folder("Missing").is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_message_does_not_spoil_its_round() {
        let mut mailbox = MemoryMailbox::default();
        mailbox.insert(1, "\r\n  \r\n");
        mailbox.insert(
            2,
            "From: ci@example.com\r\nSubject: backport\r\n\r\n(cherry picked from commit 0a1b2c3)\r\n",
        );
        let rules = RuleSet::new(
            Vec::new(),
            vec![rule("cherry_picked", RuleScope::Account, "\"cherry picked\" in message\ndelete")],
        );
        let engine = JudgementEngine::new("a@example.com", rules, options(100));

        let outcome = engine.sweep(&mut mailbox).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.aborted_rounds, 0);
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.stats.get("delete"), 1);
        assert_eq!(mailbox.remaining(), vec![1]);
        assert!(mailbox.ops.contains(&Op::Fetch(vec![1, 2])));
    }

    #[tokio::test]
    async fn test_lost_session_keeps_collected_stats() {
        let mut mailbox = MemoryMailbox::with_messages(&[1, 2, 3]);
        // one round of delete succeeds (STORE + EXPUNGE), the next STORE fails
        mailbox.disconnect_after(2);
        let rules = RuleSet::new(Vec::new(), vec![rule("all", RuleScope::Account, "true\ndelete")]);
        let engine = JudgementEngine::new("a@example.com", rules, options(1));

        let outcome = engine.sweep(&mut mailbox).await;

        assert!(outcome.error.as_ref().is_some_and(Error::ends_sweep));
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.stats.get("delete"), 1);
        assert_eq!(mailbox.remaining(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_dry_run_records_nothing() {
        let mut mailbox = MemoryMailbox::with_messages(&[1, 2]);
        let rules = RuleSet::new(Vec::new(), vec![rule("all", RuleScope::Account, "true\ndelete")]);
        let engine = JudgementEngine::new(
            "a@example.com",
            rules,
            SweepOptions {
                dry_run: true,
                ..SweepOptions::default()
            },
        );

        let outcome = engine.sweep(&mut mailbox).await;

        assert_eq!(outcome.matched, 2);
        assert!(outcome.stats.is_empty());
        assert_eq!(mailbox.remaining(), vec![1, 2]);
    }
}
