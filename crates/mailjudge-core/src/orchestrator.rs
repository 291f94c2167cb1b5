//! Judgement run orchestration
//!
//! One task per account runs on a worker pool bounded by a semaphore. Each
//! task resolves its own account definition, credential and rules, so a
//! broken account fails alone. Finished accounts hand their counters to
//! the [`StatsSink`].

use crate::engine::{JudgementEngine, SweepOptions, SweepOutcome};
use crate::mailbox::Connector;
use crate::rules::RuleStore;
use chrono::{Local, NaiveDateTime};
use mailjudge_common::types::{truncate_to_minute, Account, ActionStats, Credential};
use mailjudge_common::{Error, Result};
use mailjudge_storage::StatsSink;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Provides the password of an account
pub trait CredentialSource: Send + Sync {
    fn credential(&self, account: &Account) -> Result<Credential>;
}

/// Reads `<ACCOUNT>_PWD` from the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn credential(&self, account: &Account) -> Result<Credential> {
        let envar = account.password_envar();
        match std::env::var(&envar) {
            Ok(password) if !password.is_empty() => Ok(Credential::new(password)),
            _ => Err(Error::MissingEnvPassword {
                account: account.user.clone(),
                envar,
            }),
        }
    }
}

/// Failure recorded for an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
}

impl From<&Error> for ErrorReport {
    fn from(e: &Error) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Outcome of one account
#[derive(Debug, Clone, Serialize)]
pub struct AccountReport {
    pub account: String,
    pub rounds: usize,
    pub aborted_rounds: usize,
    pub matched: usize,
    pub stats: ActionStats,
    pub error: Option<ErrorReport>,
}

impl AccountReport {
    fn from_outcome(account: &str, outcome: SweepOutcome) -> Self {
        Self {
            account: account.to_string(),
            rounds: outcome.rounds,
            aborted_rounds: outcome.aborted_rounds,
            matched: outcome.matched,
            stats: outcome.stats,
            error: outcome.error.as_ref().map(ErrorReport::from),
        }
    }

    fn failed(account: &str, error: &Error) -> Self {
        Self {
            account: account.to_string(),
            rounds: 0,
            aborted_rounds: 0,
            matched: 0,
            stats: ActionStats::new(),
            error: Some(ErrorReport::from(error)),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Run start, truncated to the minute; the statistics timestamp
    pub run_at: NaiveDateTime,
    pub dry_run: bool,
    pub accounts: Vec<AccountReport>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.accounts.iter().all(AccountReport::succeeded)
    }

    /// Counters summed over every account
    pub fn totals(&self) -> ActionStats {
        let mut totals = ActionStats::new();
        for account in &self.accounts {
            totals.merge(&account.stats);
        }
        totals
    }
}

/// Runs the judgement over every account of a rule store
pub struct Orchestrator {
    store: Arc<RuleStore>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSource>,
    sink: Arc<dyn StatsSink>,
    options: SweepOptions,
    max_concurrency: usize,
}

impl Orchestrator {
    pub fn new(
        store: Arc<RuleStore>,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSource>,
        sink: Arc<dyn StatsSink>,
        options: SweepOptions,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            connector,
            credentials,
            sink,
            options,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Judge every account. Account failures are reported, never raised.
    pub async fn run(&self) -> Result<RunReport> {
        let run_id = Uuid::now_v7();
        let run_at = truncate_to_minute(Local::now().naive_local());
        let accounts = self.store.account_names();

        info!(
            run_id = %run_id,
            accounts = accounts.len(),
            max_concurrency = self.max_concurrency,
            dry_run = self.options.dry_run,
            "Judgement run started"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut handles = Vec::with_capacity(accounts.len());

        for user in accounts {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(anyhow::Error::from)?;

            let store = self.store.clone();
            let connector = self.connector.clone();
            let credentials = self.credentials.clone();
            let options = self.options.clone();
            let task_user = user.clone();

            let handle = tokio::spawn(async move {
                let report = match judge_account(&task_user, &store, connector.as_ref(), credentials.as_ref(), options).await {
                    Ok(outcome) => AccountReport::from_outcome(&task_user, outcome),
                    Err(e) => {
                        error!(user = %task_user, code = e.code(), error = %e, "Account failed");
                        AccountReport::failed(&task_user, &e)
                    }
                };
                drop(permit);
                report
            });
            handles.push((user, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (user, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!(user = %user, "Task error: {}", e);
                    AccountReport::failed(&user, &Error::Other(anyhow::anyhow!("account task failed: {}", e)))
                }
            };

            if !report.stats.is_empty() {
                if let Err(e) = self.sink.record(run_at, &report.account, &report.stats).await {
                    error!(user = %report.account, error = %e, "Failed to record statistics");
                }
            }
            reports.push(report);
        }

        let report = RunReport {
            run_id,
            run_at,
            dry_run: self.options.dry_run,
            accounts: reports,
        };
        info!(
            run_id = %run_id,
            failed = report.accounts.iter().filter(|a| !a.succeeded()).count(),
            applied = report.totals().total(),
            "Judgement run finished"
        );
        Ok(report)
    }
}

async fn judge_account(
    user: &str,
    store: &RuleStore,
    connector: &dyn Connector,
    credentials: &dyn CredentialSource,
    options: SweepOptions,
) -> Result<SweepOutcome> {
    let account = store.account(user)?;
    let credential = credentials.credential(&account)?;
    let account = account.with_credential(credential);
    let rules = store.rule_set(user)?;

    let mut session = connector.connect(&account).await?;
    let engine = JudgementEngine::new(user, rules, options);
    let outcome = engine.sweep(session.as_mut()).await;

    if let Err(e) = session.close().await {
        warn!(user = %user, error = %e, "Failed to close session");
    }
    debug!(user = %user, rounds = outcome.rounds, "Session closed");

    if let Some(e) = &outcome.error {
        error!(user = %user, code = e.code(), error = %e, "Sweep ended early");
    }
    Ok(outcome)
}
