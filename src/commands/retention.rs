//! Retention policy commands: create, drop, list, apply.

use async_trait::async_trait;

use catalog::stat::{make_header, make_line};
use catalog::xlog;
use catalog::{
    BackupCatalog, BasebackupCleanupMode, CatalogDescr, CatalogError, CatalogTag, RetentionDescr,
    RetentionIntervalDescr, RetentionParsedAction, RetentionParsedModifier, RetentionParserState,
    RetentionRuleDescr, RetentionRuleId,
};

use super::{ensure_open, with_transaction, CatalogCommand};
use crate::error::{BunkerError, Result};

/// Parses one retention rule expression through the parser state machine,
/// e.g. `KEEP 4`, `DROP OLDER 1 days`, `KEEP WITH LABEL nightly` or
/// `CLEANUP`.
pub fn parse_retention_rule(input: &str) -> Result<RetentionRuleDescr> {
    let mut state = RetentionParserState::default();
    let mut tokens = input.split_whitespace().peekable();
    let malformed =
        || BunkerError::from(CatalogError::catalog(format!("malformed retention rule \"{input}\"")));

    match tokens.next().map(|t| t.to_ascii_uppercase()).as_deref() {
        Some("KEEP") => state.action = RetentionParsedAction::Keep,
        Some("DROP") => state.action = RetentionParsedAction::Drop,
        Some("CLEANUP") => {
            state.modifier = RetentionParsedModifier::Cleanup;
            let rule_type = state.rule_id()?;
            return Ok(RetentionRuleDescr::new(rule_type, ""));
        }
        _ => return Err(malformed()),
    }

    let value: String;
    match tokens.peek().map(|t| t.to_ascii_uppercase()).as_deref() {
        Some("WITH") => {
            tokens.next();
            if tokens.next().map(|t| t.to_ascii_uppercase()).as_deref() != Some("LABEL") {
                return Err(malformed());
            }
            state.modifier = RetentionParsedModifier::Label;
            value = tokens.collect::<Vec<_>>().join(" ");
            if value.is_empty() {
                return Err(malformed());
            }
        }
        Some("NEWER") | Some("OLDER") => {
            let which = tokens.next().map(|t| t.to_ascii_uppercase());
            state.modifier = if which.as_deref() == Some("NEWER") {
                RetentionParsedModifier::NewerDatetime
            } else {
                RetentionParsedModifier::OlderDatetime
            };
            // Optional THAN noise word.
            if tokens.peek().map(|t| t.to_ascii_uppercase()).as_deref() == Some("THAN") {
                tokens.next();
            }
            let expr = tokens.collect::<Vec<_>>().join(" ");
            // Validated through the interval descriptor and stored in its
            // catalog representation.
            let interval = RetentionIntervalDescr::parse(&expr).map_err(BunkerError::from)?;
            value = interval.compile();
        }
        Some(_) => {
            state.modifier = RetentionParsedModifier::Num;
            value = tokens.next().map(str::to_string).ok_or_else(malformed)?;
            value
                .parse::<u32>()
                .map_err(|_| malformed())?;
            if tokens.next().is_some() {
                return Err(malformed());
            }
        }
        None => return Err(malformed()),
    }

    let rule_type = state.rule_id()?;
    Ok(RetentionRuleDescr::new(rule_type, value))
}

pub struct CreateRetentionPolicyCommand {
    retention: RetentionDescr,
}

impl CreateRetentionPolicyCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Result<Self> {
        // The retention sub-descriptor is attached during parsing and not
        // part of the plain descriptor copy.
        let retention = descr.retention_descr().cloned().ok_or_else(|| {
            BunkerError::from(CatalogError::catalog(
                "CREATE RETENTION POLICY without an initialized retention descriptor",
            ))
        })?;
        Ok(Self { retention })
    }
}

#[async_trait(?Send)]
impl CatalogCommand for CreateRetentionPolicyCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::CreateRetentionPolicy
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, exists_ok: bool) -> Result<()> {
        ensure_open(catalog)?;

        let retention = &mut self.retention;
        with_transaction(catalog, |catalog| {
            let temp = catalog.get_retention_policy(&retention.name)?;
            if temp.id >= 0 {
                if exists_ok {
                    return Ok(());
                }
                return Err(CatalogError::catalog(format!(
                    "retention policy \"{}\" already exists",
                    retention.name
                ))
                .into());
            }
            catalog.create_retention_policy(retention)?;
            Ok(())
        })
    }
}

pub struct DropRetentionPolicyCommand {
    descr: CatalogDescr,
}

impl DropRetentionPolicyCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Self { descr: own }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for DropRetentionPolicyCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::DropRetentionPolicy
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, exists_ok: bool) -> Result<()> {
        ensure_open(catalog)?;

        let name = self.descr.retention_name.clone();
        with_transaction(catalog, |catalog| {
            let temp = catalog.get_retention_policy(&name)?;
            if temp.id < 0 {
                if exists_ok {
                    return Ok(());
                }
                return Err(CatalogError::catalog(format!(
                    "retention policy \"{name}\" does not exist"
                ))
                .into());
            }
            catalog.drop_retention_policy(&name)?;
            Ok(())
        })
    }
}

pub struct ListRetentionPoliciesCommand {
    descr: CatalogDescr,
}

impl ListRetentionPoliciesCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Self { descr: own }
    }
}

fn rule_display(rule: &RetentionRuleDescr) -> String {
    let kind = match rule.rule_type {
        RetentionRuleId::NoRule => "NO RULE",
        RetentionRuleId::KeepWithLabel => "KEEP WITH LABEL",
        RetentionRuleId::DropWithLabel => "DROP WITH LABEL",
        RetentionRuleId::KeepNum => "KEEP",
        RetentionRuleId::DropNum => "DROP",
        RetentionRuleId::KeepNewerByDatetime => "KEEP NEWER THAN",
        RetentionRuleId::KeepOlderByDatetime => "KEEP OLDER THAN",
        RetentionRuleId::DropNewerByDatetime => "DROP NEWER THAN",
        RetentionRuleId::DropOlderByDatetime => "DROP OLDER THAN",
        RetentionRuleId::Pin => "PIN",
        RetentionRuleId::Unpin => "UNPIN",
        RetentionRuleId::Cleanup => "CLEANUP",
    };
    if rule.value.is_empty() {
        kind.to_string()
    } else {
        format!("{kind} {}", rule.value)
    }
}

#[async_trait(?Send)]
impl CatalogCommand for ListRetentionPoliciesCommand {
    fn tag(&self) -> CatalogTag {
        self.descr.tag
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, _flag: bool) -> Result<()> {
        ensure_open(catalog)?;

        let name = self.descr.retention_name.clone();
        with_transaction(catalog, |catalog| {
            let policies = if name.is_empty() {
                catalog.get_retention_policies()?
            } else {
                let policy = catalog.get_retention_policy(&name)?;
                if policy.id < 0 {
                    return Err(CatalogError::catalog(format!(
                        "retention policy \"{name}\" does not exist"
                    ))
                    .into());
                }
                vec![policy]
            };

            print!(
                "{}",
                make_header(
                    "List of retention policies",
                    &format!("{:<25}\t{:<19}\t{:<30}", "Name", "Created", "Rules"),
                    90
                )
            );
            for policy in &policies {
                let rules = policy
                    .rules
                    .iter()
                    .map(rule_display)
                    .collect::<Vec<_>>()
                    .join("; ");
                println!("{:<25}\t{:<19}\t{:<30}", policy.name, policy.created, rules);
            }
            Ok(())
        })
    }
}

pub struct ApplyRetentionPolicyCommand {
    descr: CatalogDescr,
}

impl ApplyRetentionPolicyCommand {
    pub fn from_descr(descr: &CatalogDescr) -> Self {
        let mut own = CatalogDescr::new(descr.tag);
        own.copy_from(descr);
        Self { descr: own }
    }
}

#[async_trait(?Send)]
impl CatalogCommand for ApplyRetentionPolicyCommand {
    fn tag(&self) -> CatalogTag {
        CatalogTag::ApplyRetentionPolicy
    }

    async fn execute(&mut self, catalog: &mut BackupCatalog, _flag: bool) -> Result<()> {
        ensure_open(catalog)?;

        let archive_name = self.descr.archive_name.clone();
        let policy_name = self.descr.retention_name.clone();
        with_transaction(catalog, |catalog| {
            let cleanup = catalog.apply_retention_policy(&archive_name, &policy_name)?;

            print!(
                "{}",
                make_header(
                    &format!(
                        "Cleanup for archive \"{archive_name}\", policy \"{policy_name}\""
                    ),
                    &format!("{:<6}\t{:<19}\t{:<12}\t{:<8}", "ID", "Started", "Status", "Action"),
                    80
                )
            );
            for item in &cleanup.basebackups {
                let action = match item.mode {
                    BasebackupCleanupMode::Keep => "KEEP",
                    BasebackupCleanupMode::Delete => "DELETE",
                };
                println!(
                    "{:<6}\t{:<19}\t{:<12}\t{:<8}",
                    item.backup.id, item.backup.started, item.backup.status, action
                );
            }

            println!("{}", make_line(80));
            for off in cleanup.off_list.values() {
                println!(
                    "timeline {}: WAL cleanup range {} .. {}",
                    off.timeline,
                    xlog::format_xlog_pos(off.wal_cleanup_start_pos),
                    xlog::format_xlog_pos(off.wal_cleanup_end_pos)
                );
            }
            Ok(())
        })
    }
}
