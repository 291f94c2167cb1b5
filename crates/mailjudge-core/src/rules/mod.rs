//! Rule source and rule sets
//!
//! Rules live in a TOML file. Each account has a table holding its `server`
//! and optional `folder`, and a `"<account>:rules"` table of named rules.
//! Rules in the reserved `"ALL:rules"` table apply to every account ahead of
//! the account's own rules.
//!
//! A rule body is a multi-line string: the first line is the predicate,
//! every following line an action directive.
//!
//! ```toml
//! ["alice@example.com"]
//! server = "imap.example.com"
//!
//! ["alice@example.com:rules"]
//! github_cherry_picked = """
//! "cherry picked from commit" in message
//! delete
//! """
//! ```

pub mod predicate;

use mailjudge_common::types::{Account, ActionKey};
use mailjudge_common::{Error, Result};
use predicate::{Expr, FieldSource, PredicateError};
use std::path::{Path, PathBuf};
use toml::{Table, Value};
use tracing::{debug, info, warn};

/// Reserved account name holding global rules
pub const GLOBAL_SECTION: &str = "ALL";

const RULES_SUFFIX: &str = ":rules";

/// Where a rule comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    Global,
    Account,
}

/// One named rule: a predicate and the actions applied when it matches
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub scope: RuleScope,
    /// Predicate source line
    pub source: String,
    /// Parsed predicate; a parse failure is kept and reported on evaluation
    pub predicate: std::result::Result<Expr, PredicateError>,
    pub actions: Vec<ActionKey>,
}

impl Rule {
    /// Build a rule from its body (predicate line, then action lines)
    pub fn parse(name: &str, scope: RuleScope, body: &str) -> Result<Self> {
        let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());
        let source = lines
            .next()
            .ok_or_else(|| Error::Config(format!("Rule {:?} is empty", name)))?
            .to_string();
        let actions: Vec<ActionKey> = lines.map(ActionKey::parse).collect();
        if actions.is_empty() {
            return Err(Error::Config(format!("Rule {:?} has no action", name)));
        }

        Ok(Self {
            name: name.to_string(),
            scope,
            predicate: predicate::parse(&source),
            source,
            actions,
        })
    }

    /// Evaluate the predicate against a message
    pub fn matches<S: FieldSource + ?Sized>(&self, message: &S) -> std::result::Result<bool, PredicateError> {
        match &self.predicate {
            Ok(expr) => expr.eval(message),
            Err(e) => Err(e.clone()),
        }
    }
}

/// Rules applicable to one account, in evaluation order
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub global: Vec<Rule>,
    pub account: Vec<Rule>,
}

impl RuleSet {
    pub fn new(mut global: Vec<Rule>, mut account: Vec<Rule>) -> Self {
        global.sort_by(|a, b| a.name.cmp(&b.name));
        account.sort_by(|a, b| a.name.cmp(&b.name));
        Self { global, account }
    }

    /// Global rules first, then account rules, each sorted by name
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.global.iter().chain(self.account.iter())
    }

    pub fn len(&self) -> usize {
        self.global.len() + self.account.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rules whose predicate failed to parse
    pub fn invalid_rules(&self) -> impl Iterator<Item = (&Rule, Error)> {
        self.iter().filter_map(|rule| match &rule.predicate {
            Ok(_) => None,
            Err(e) => Some((rule, Error::from(e.clone()))),
        })
    }
}

/// Parsed rule source
#[derive(Debug, Clone)]
pub struct RuleStore {
    path: Option<PathBuf>,
    tables: Table,
}

impl RuleStore {
    /// Load the rule file. A missing or malformed file is a configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::Config(format!(
                "Rule file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut store = Self::from_toml(&content)?;
        store.path = Some(path.to_path_buf());

        info!(path = %path.display(), accounts = store.account_names().len(), "Rules loaded");
        Ok(store)
    }

    /// Parse rules from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let tables: Table = content
            .parse()
            .map_err(|e| Error::Config(format!("Invalid rule file: {}", e)))?;

        for (name, value) in &tables {
            if !value.is_table() {
                return Err(Error::Config(format!(
                    "Rule file entry {:?} must be a table",
                    name
                )));
            }
        }

        Ok(Self { path: None, tables })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Accounts defined in the rule source, sorted
    pub fn account_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .keys()
            .filter(|name| !name.ends_with(RULES_SUFFIX) && name.as_str() != GLOBAL_SECTION)
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Account definition; `server` is required
    pub fn account(&self, user: &str) -> Result<Account> {
        let table = self
            .table(user)
            .ok_or_else(|| Error::Config(format!("Unknown account {:?}", user)))?;

        let server = table
            .get("server")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::ConfigReference {
                account: user.to_string(),
                key: "server".to_string(),
            })?;
        let folder = table
            .get("folder")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string);

        Ok(Account::new(user, server.trim()).with_folder(folder))
    }

    /// Global rules followed by the account's own rules
    pub fn rule_set(&self, user: &str) -> Result<RuleSet> {
        let global = self.rules(GLOBAL_SECTION, RuleScope::Global)?;
        let account = self.rules(user, RuleScope::Account)?;
        if account.is_empty() {
            warn!(user = %user, "Account has no rules of its own");
        }

        let rule_set = RuleSet::new(global, account);
        for (rule, error) in rule_set.invalid_rules() {
            warn!(user = %user, rule = %rule.name, error = %error, "Rule predicate is invalid and will never match");
        }
        debug!(user = %user, global = rule_set.global.len(), account = rule_set.account.len(), "Rule set resolved");
        Ok(rule_set)
    }

    fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name).and_then(Value::as_table)
    }

    fn rules(&self, owner: &str, scope: RuleScope) -> Result<Vec<Rule>> {
        let section = format!("{}{}", owner, RULES_SUFFIX);
        let Some(table) = self.table(&section) else {
            return Ok(Vec::new());
        };

        table
            .iter()
            .map(|(name, body)| {
                let body = body.as_str().ok_or_else(|| {
                    Error::Config(format!("Rule {:?} in {:?} must be a string", name, section))
                })?;
                Rule::parse(name, scope, body)
            })
            .collect()
    }
}
