//! mailjudge - Sort IMAP mailboxes by rules

use anyhow::{Context, Result};
use clap::Parser;
use mailjudge_common::config::{Config, LoggingConfig};
use mailjudge_core::{Action, EnvCredentials, ImapConnector, Orchestrator, RuleStore, RunReport, SweepOptions};
use mailjudge_storage::create_sink;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Judge the messages of every configured account and apply the actions
/// of the first matching rule
#[derive(Parser, Debug)]
#[command(name = "mailjudge", version)]
struct Cli {
    /// Rule file (overrides `rules_file` from the settings)
    #[arg(short = 'c', long = "config-file", value_name = "RULES")]
    rules: Option<PathBuf>,

    /// Settings file
    #[arg(short, long, value_name = "SETTINGS")]
    settings: Option<PathBuf>,

    /// Judge every message, including those flagged as deleted
    #[arg(short, long)]
    full: bool,

    /// Debug logging; actions are logged instead of applied
    #[arg(short, long)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "debug")]
    quiet: bool,

    /// List available actions and exit
    #[arg(short, long)]
    list_actions: bool,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    /// Fold command line switches into the loaded settings
    fn apply(&self, config: &mut Config) {
        if let Some(rules) = &self.rules {
            config.rules_file = rules.clone();
        }
        if self.full {
            config.judge.full = true;
        }
        if self.debug {
            config.judge.dry_run = true;
            config.logging.level = "debug".to_string();
        } else if self.quiet {
            config.logging.level = "warn".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.list_actions {
        for (action, description) in Action::catalog() {
            println!("{}", action);
            println!("  {}", description);
        }
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(cli.settings.as_deref()) {
        Ok(mut config) => {
            cli.apply(&mut config);
            config
        }
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.logging);

    match run(&config).await {
        Ok(report) => {
            if cli.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{}", json),
                    Err(e) => error!("Failed to serialize report: {}", e),
                }
            }
            if report.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &Config) -> Result<RunReport> {
    let store = RuleStore::load(&config.rules_file)?;
    let connector = ImapConnector::new(config.imap.clone(), config.judge.commit_threshold)
        .context("Failed to set up the IMAP connector")?;
    let sink = create_sink(&config.stats).await?;

    info!(
        rules = %config.rules_file.display(),
        full = config.judge.full,
        dry_run = config.judge.dry_run,
        "Starting mailjudge"
    );

    let orchestrator = Orchestrator::new(
        Arc::new(store),
        Arc::new(connector),
        Arc::new(EnvCredentials),
        sink,
        SweepOptions::from_config(&config.judge),
        config.judge.max_concurrency,
    );
    let report = orchestrator.run().await?;

    for account in &report.accounts {
        match &account.error {
            None => info!(user = %account.account, stats = ?account.stats, "Account judged"),
            Some(e) => error!(user = %account.account, code = %e.code, "{}", e.message),
        }
    }
    Ok(report)
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,mailjudge={0},mailjudge_core={0},mailjudge_storage={0}", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
