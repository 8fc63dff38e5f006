//! Retention rules, interval expressions and the cleanup descriptor.
//!
//! Retention policies are parsed into typed rules; applying a policy to an
//! archive produces a `BackupCleanupDescr` naming the basebackups to keep
//! or delete and the WAL segment ranges safe to evict per timeline.

use std::collections::BTreeMap;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

use crate::descr::{BackupStatus, BaseBackupDescr, RetentionRuleDescr};
use crate::error::{CatalogError, Result};
use crate::xlog;

/// DROP or KEEP action recognized while parsing a retention command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetentionParsedAction {
    #[default]
    NoAction,
    Drop,
    Keep,
}

/// Rule modifier recognized while parsing a retention command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetentionParsedModifier {
    #[default]
    NoModifier,
    NewerDatetime,
    OlderDatetime,
    Label,
    Num,
    Cleanup,
}

/// Parser state pair assembling the final rule id.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RetentionParserState {
    pub action: RetentionParsedAction,
    pub modifier: RetentionParsedModifier,
}

impl RetentionParserState {
    /// Resolves the `{NoAction|Drop|Keep} x {modifier}` pair into a rule
    /// id. Combinations without a representation are rejected.
    pub fn rule_id(&self) -> Result<RetentionRuleId> {
        use RetentionParsedAction as A;
        use RetentionParsedModifier as M;

        let id = match (self.action, self.modifier) {
            (A::Keep, M::Label) => RetentionRuleId::KeepWithLabel,
            (A::Drop, M::Label) => RetentionRuleId::DropWithLabel,
            (A::Keep, M::Num) => RetentionRuleId::KeepNum,
            (A::Drop, M::Num) => RetentionRuleId::DropNum,
            (A::Keep, M::NewerDatetime) => RetentionRuleId::KeepNewerByDatetime,
            (A::Keep, M::OlderDatetime) => RetentionRuleId::KeepOlderByDatetime,
            (A::Drop, M::NewerDatetime) => RetentionRuleId::DropNewerByDatetime,
            (A::Drop, M::OlderDatetime) => RetentionRuleId::DropOlderByDatetime,
            (A::NoAction, M::Cleanup) => RetentionRuleId::Cleanup,
            (action, modifier) => {
                return Err(CatalogError::catalog(format!(
                    "retention parser state {action:?}/{modifier:?} does not form a rule"
                )))
            }
        };
        Ok(id)
    }
}

/// Classifies the supported retention rules and their actions. The
/// numeric values are the persisted catalog representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionRuleId {
    NoRule,
    KeepWithLabel,
    DropWithLabel,
    KeepNum,
    DropNum,
    KeepNewerByDatetime,
    KeepOlderByDatetime,
    DropNewerByDatetime,
    DropOlderByDatetime,
    Pin,
    Unpin,
    Cleanup,
}

impl RetentionRuleId {
    pub fn to_i64(self) -> i64 {
        match self {
            RetentionRuleId::NoRule => 0,
            RetentionRuleId::KeepWithLabel => 200,
            RetentionRuleId::DropWithLabel => 201,
            RetentionRuleId::KeepNum => 300,
            RetentionRuleId::DropNum => 301,
            RetentionRuleId::KeepNewerByDatetime => 400,
            RetentionRuleId::KeepOlderByDatetime => 401,
            RetentionRuleId::DropNewerByDatetime => 402,
            RetentionRuleId::DropOlderByDatetime => 403,
            RetentionRuleId::Pin => 500,
            RetentionRuleId::Unpin => 600,
            RetentionRuleId::Cleanup => 700,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        let id = match value {
            0 => RetentionRuleId::NoRule,
            200 => RetentionRuleId::KeepWithLabel,
            201 => RetentionRuleId::DropWithLabel,
            300 => RetentionRuleId::KeepNum,
            301 => RetentionRuleId::DropNum,
            400 => RetentionRuleId::KeepNewerByDatetime,
            401 => RetentionRuleId::KeepOlderByDatetime,
            402 => RetentionRuleId::DropNewerByDatetime,
            403 => RetentionRuleId::DropOlderByDatetime,
            500 => RetentionRuleId::Pin,
            600 => RetentionRuleId::Unpin,
            700 => RetentionRuleId::Cleanup,
            other => {
                return Err(CatalogError::catalog(format!(
                    "unrecognized retention rule id {other}"
                )))
            }
        };
        Ok(id)
    }

    /// True for rules whose value is an interval expression.
    pub fn takes_interval(self) -> bool {
        matches!(
            self,
            RetentionRuleId::KeepNewerByDatetime
                | RetentionRuleId::KeepOlderByDatetime
                | RetentionRuleId::DropNewerByDatetime
                | RetentionRuleId::DropOlderByDatetime
        )
    }
}

/// Units legal in a retention interval expression. The plural string form
/// doubles as the SQLite datetime modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalUnit {
    Years,
    Months,
    Days,
    Hours,
    Minutes,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Years => "years",
            IntervalUnit::Months => "months",
            IntervalUnit::Days => "days",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Minutes => "minutes",
        }
    }

    fn parse(token: &str) -> Result<Self> {
        match token {
            "years" | "year" => Ok(IntervalUnit::Years),
            "months" | "month" => Ok(IntervalUnit::Months),
            "days" | "day" => Ok(IntervalUnit::Days),
            "hours" | "hour" => Ok(IntervalUnit::Hours),
            "minutes" | "minute" => Ok(IntervalUnit::Minutes),
            other => Err(CatalogError::catalog(format!(
                "unrecognized interval unit \"{other}\""
            ))),
        }
    }
}

/// One `N unit` operand of an interval expression, with its sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalOperand {
    pub negative: bool,
    pub quantity: u64,
    pub unit: IntervalUnit,
}

impl IntervalOperand {
    fn render(&self) -> String {
        if self.negative {
            format!("-{} {}", self.quantity, self.unit.as_str())
        } else {
            format!("{} {}", self.quantity, self.unit.as_str())
        }
    }
}

/// A retention interval expression of the form
/// `N years|N months|N days|N hours|N minutes`, additively and
/// subtractively composable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionIntervalDescr {
    pub operands: Vec<IntervalOperand>,
}

impl RetentionIntervalDescr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an interval expression into its operand list.
    pub fn parse(expression: &str) -> Result<Self> {
        let mut descr = Self::new();
        descr.push(expression)?;
        if descr.operands.is_empty() {
            return Err(CatalogError::catalog(format!(
                "empty interval expression \"{expression}\""
            )));
        }
        Ok(descr)
    }

    /// Extracts the tokens of `value` and appends them to the operand
    /// list. Quantities may carry a leading sign.
    pub fn push(&mut self, value: &str) -> Result<()> {
        let mut tokens = value.split_whitespace();

        while let Some(num) = tokens.next() {
            let (negative, digits) = match num.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, num.strip_prefix('+').unwrap_or(num)),
            };
            let quantity: u64 = digits.parse().map_err(|_| {
                CatalogError::catalog(format!("malformed interval quantity \"{num}\""))
            })?;
            let unit = tokens.next().ok_or_else(|| {
                CatalogError::catalog(format!("interval quantity \"{num}\" is missing its unit"))
            })?;
            self.operands.push(IntervalOperand {
                negative,
                quantity,
                unit: IntervalUnit::parse(unit)?,
            });
        }
        Ok(())
    }

    pub fn push_add(&mut self, operand: &str) -> Result<()> {
        self.push(operand)
    }

    pub fn push_sub(&mut self, operand: &str) -> Result<()> {
        let mut tail = Self::new();
        tail.push(operand)?;
        for mut op in tail.operands {
            op.negative = !op.negative;
            self.operands.push(op);
        }
        Ok(())
    }

    /// The catalog representation of this interval. The result re-parses
    /// into an equal descriptor.
    pub fn compile(&self) -> String {
        self.operands
            .iter()
            .map(|op| op.render())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Plain operand string, suitable for display.
    pub fn operands_as_string(&self) -> String {
        self.compile()
    }

    /// Encodes this interval as a SQLite `datetime()` expression counting
    /// backwards from now, e.g. `datetime('now', '-3 days', '-2 hours')`.
    /// The catalog evaluates retention thresholds through this expression
    /// so months and years follow calendar arithmetic.
    pub fn sqlite_datetime(&self) -> String {
        let mut modifiers = String::new();
        for op in &self.operands {
            let sign = if op.negative { "+" } else { "-" };
            modifiers.push_str(&format!(", '{}{} {}'", sign, op.quantity, op.unit.as_str()));
        }
        format!("datetime('now'{modifiers})")
    }
}

impl Add for RetentionIntervalDescr {
    type Output = RetentionIntervalDescr;

    fn add(mut self, rhs: RetentionIntervalDescr) -> Self::Output {
        self.operands.extend(rhs.operands);
        self
    }
}

impl Sub for RetentionIntervalDescr {
    type Output = RetentionIntervalDescr;

    fn sub(mut self, rhs: RetentionIntervalDescr) -> Self::Output {
        for mut op in rhs.operands {
            op.negative = !op.negative;
            self.operands.push(op);
        }
        self
    }
}

/// WAL cleanup modes of a computed cleanup descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalCleanupMode {
    Range,
    Offset,
    All,
    NoWalToDelete,
}

/// Keep/delete decision for one basebackup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BasebackupCleanupMode {
    Keep,
    Delete,
}

/// WAL range safe to evict on one timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XlogCleanupOffset {
    pub timeline: u32,
    pub wal_segment_size: u64,
    pub wal_cleanup_start_pos: u64,
    pub wal_cleanup_end_pos: u64,
}

/// One basebackup with its election result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupItem {
    pub backup: BaseBackupDescr,
    pub mode: BasebackupCleanupMode,
}

/// Describes which basebackups and WAL segment ranges can be evicted.
/// The newest basebackup is first in the list. The WAL boundary is not
/// necessarily derived from an elected basebackup; a kept or pinned
/// backup drags it backwards to protect its required segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupCleanupDescr {
    pub basebackups: Vec<CleanupItem>,
    pub off_list: BTreeMap<u32, XlogCleanupOffset>,
    pub mode: WalCleanupMode,
}

/// Applies the rules of a policy to the backups of one archive, newest
/// first. `thresholds` carries the pre-evaluated datetime threshold for
/// each interval rule, aligned by index with `rules`.
pub fn compute_cleanup(
    backups: Vec<BaseBackupDescr>,
    rules: &[RetentionRuleDescr],
    thresholds: &[Option<String>],
) -> Result<BackupCleanupDescr> {
    let mut items: Vec<CleanupItem> = backups
        .into_iter()
        .map(|backup| CleanupItem {
            backup,
            mode: BasebackupCleanupMode::Keep,
        })
        .collect();

    for (idx, rule) in rules.iter().enumerate() {
        let threshold = thresholds.get(idx).and_then(|t| t.as_deref());
        apply_rule(&mut items, rule, threshold)?;
    }

    // Pin state overrides any deletion election.
    for item in items.iter_mut() {
        if item.backup.pinned > 0 {
            item.mode = BasebackupCleanupMode::Keep;
        }
    }

    let off_list = wal_cleanup_offsets(&items)?;
    let mode = if items
        .iter()
        .any(|i| i.mode == BasebackupCleanupMode::Delete)
    {
        WalCleanupMode::Range
    } else {
        WalCleanupMode::NoWalToDelete
    };

    Ok(BackupCleanupDescr {
        basebackups: items,
        off_list,
        mode,
    })
}

/// Elects backups for deletion according to one rule. Only `ready`
/// backups participate in label/num/datetime elections; the CLEANUP rule
/// elects aborted backups.
fn apply_rule(
    items: &mut [CleanupItem],
    rule: &RetentionRuleDescr,
    threshold: Option<&str>,
) -> Result<()> {
    use BasebackupCleanupMode::{Delete, Keep};

    let threshold_for = |rule: &RetentionRuleDescr| -> Result<&str> {
        threshold.ok_or_else(|| {
            CatalogError::catalog(format!(
                "retention rule {:?} is missing its datetime threshold",
                rule.rule_type
            ))
        })
    };

    match rule.rule_type {
        RetentionRuleId::NoRule => {}

        RetentionRuleId::KeepWithLabel => {
            for item in ready_mut(items) {
                item.mode = if item.backup.label == rule.value {
                    Keep
                } else {
                    Delete
                };
            }
        }

        RetentionRuleId::DropWithLabel => {
            for item in ready_mut(items) {
                if item.backup.label == rule.value {
                    item.mode = Delete;
                }
            }
        }

        RetentionRuleId::KeepNum => {
            let keep: usize = parse_rule_num(rule)?;
            for (seen, item) in ready_mut(items).enumerate() {
                item.mode = if seen < keep { Keep } else { Delete };
            }
        }

        RetentionRuleId::DropNum => {
            let drop: usize = parse_rule_num(rule)?;
            let ready_total = items
                .iter()
                .filter(|i| i.backup.status == BackupStatus::Ready)
                .count();
            // Items are newest first; dropping N applies to the oldest N.
            let boundary = ready_total.saturating_sub(drop);
            for (seen, item) in ready_mut(items).enumerate() {
                if seen >= boundary {
                    item.mode = Delete;
                }
            }
        }

        RetentionRuleId::KeepNewerByDatetime => {
            let threshold = threshold_for(rule)?;
            for item in ready_mut(items) {
                item.mode = if item.backup.started.as_str() >= threshold {
                    Keep
                } else {
                    Delete
                };
            }
        }

        RetentionRuleId::KeepOlderByDatetime => {
            let threshold = threshold_for(rule)?;
            for item in ready_mut(items) {
                item.mode = if item.backup.started.as_str() < threshold {
                    Keep
                } else {
                    Delete
                };
            }
        }

        RetentionRuleId::DropNewerByDatetime => {
            let threshold = threshold_for(rule)?;
            for item in ready_mut(items) {
                if item.backup.started.as_str() >= threshold {
                    item.mode = Delete;
                }
            }
        }

        RetentionRuleId::DropOlderByDatetime => {
            let threshold = threshold_for(rule)?;
            for item in ready_mut(items) {
                if item.backup.started.as_str() < threshold {
                    item.mode = Delete;
                }
            }
        }

        // PIN/UNPIN retention actions mutate pin counters in the store
        // before the cleanup is computed; nothing to elect here.
        RetentionRuleId::Pin | RetentionRuleId::Unpin => {}

        RetentionRuleId::Cleanup => {
            for item in items.iter_mut() {
                if item.backup.status == BackupStatus::Aborted {
                    item.mode = Delete;
                }
            }
        }
    }

    Ok(())
}

fn ready_mut(items: &mut [CleanupItem]) -> impl Iterator<Item = &mut CleanupItem> {
    items
        .iter_mut()
        .filter(|i| i.backup.status == BackupStatus::Ready)
}

fn parse_rule_num(rule: &RetentionRuleDescr) -> Result<usize> {
    rule.value.trim().parse().map_err(|_| {
        CatalogError::catalog(format!(
            "retention rule value \"{}\" is not a number",
            rule.value
        ))
    })
}

/// Computes per-timeline WAL ranges safe to evict. The range ends at the
/// oldest kept backup's start position, rounded down to its segment
/// boundary; if a timeline keeps nothing, the range extends to the end of
/// the newest elected backup.
fn wal_cleanup_offsets(items: &[CleanupItem]) -> Result<BTreeMap<u32, XlogCleanupOffset>> {
    struct TimelineAgg {
        segment_size: u64,
        start_min: u64,
        kept_min: Option<u64>,
        deleted_max_end: Option<u64>,
    }

    let mut agg: BTreeMap<u32, TimelineAgg> = BTreeMap::new();

    for item in items {
        let backup = &item.backup;
        if backup.xlogpos.is_empty() {
            continue;
        }

        let start = xlog::parse_xlog_pos(&backup.xlogpos)?;
        let entry = agg.entry(backup.timeline).or_insert_with(|| TimelineAgg {
            segment_size: backup.wal_segment_size,
            start_min: start,
            kept_min: None,
            deleted_max_end: None,
        });

        entry.start_min = entry.start_min.min(start);
        if backup.wal_segment_size > 0 {
            entry.segment_size = backup.wal_segment_size;
        }

        match item.mode {
            BasebackupCleanupMode::Keep => {
                let boundary = xlog::segment_start(start, backup.wal_segment_size);
                entry.kept_min = Some(entry.kept_min.map_or(boundary, |m| m.min(boundary)));
            }
            BasebackupCleanupMode::Delete => {
                let end = if backup.xlogposend.is_empty() {
                    start
                } else {
                    xlog::parse_xlog_pos(&backup.xlogposend)?
                };
                entry.deleted_max_end =
                    Some(entry.deleted_max_end.map_or(end, |m| m.max(end)));
            }
        }
    }

    let off_list = agg
        .into_iter()
        .map(|(timeline, tl)| {
            // A kept backup caps the range regardless of what was elected
            // after it; a timeline keeping everything collapses to an
            // empty range.
            let end = match (tl.kept_min, tl.deleted_max_end) {
                (Some(kept), _) => kept,
                (None, Some(deleted)) => deleted,
                (None, None) => tl.start_min,
            };
            (
                timeline,
                XlogCleanupOffset {
                    timeline,
                    wal_segment_size: tl.segment_size,
                    wal_cleanup_start_pos: tl.start_min,
                    wal_cleanup_end_pos: end.max(tl.start_min),
                },
            )
        })
        .collect();

    Ok(off_list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_compile_round_trip() {
        let descr = RetentionIntervalDescr::parse("3 days 2 hours").unwrap();
        let reparsed = RetentionIntervalDescr::parse(&descr.compile()).unwrap();
        assert_eq!(descr, reparsed);
    }

    #[test]
    fn interval_composition() {
        let a = RetentionIntervalDescr::parse("1 years").unwrap();
        let b = RetentionIntervalDescr::parse("6 months").unwrap();
        let sum = a.clone() + b.clone();
        assert_eq!(sum.compile(), "1 years 6 months");

        let diff = a - b;
        assert_eq!(diff.compile(), "1 years -6 months");
        let reparsed = RetentionIntervalDescr::parse(&diff.compile()).unwrap();
        assert_eq!(diff, reparsed);
    }

    #[test]
    fn interval_sqlite_expression() {
        let descr = RetentionIntervalDescr::parse("3 days 2 hours").unwrap();
        assert_eq!(
            descr.sqlite_datetime(),
            "datetime('now', '-3 days', '-2 hours')"
        );
    }

    #[test]
    fn interval_rejects_malformed() {
        assert!(RetentionIntervalDescr::parse("").is_err());
        assert!(RetentionIntervalDescr::parse("3").is_err());
        assert!(RetentionIntervalDescr::parse("three days").is_err());
        assert!(RetentionIntervalDescr::parse("3 fortnights").is_err());
    }

    #[test]
    fn parser_state_assembles_rule_ids() {
        let state = RetentionParserState {
            action: RetentionParsedAction::Drop,
            modifier: RetentionParsedModifier::OlderDatetime,
        };
        assert_eq!(state.rule_id().unwrap(), RetentionRuleId::DropOlderByDatetime);

        let invalid = RetentionParserState {
            action: RetentionParsedAction::NoAction,
            modifier: RetentionParsedModifier::Label,
        };
        assert!(invalid.rule_id().is_err());
    }

    #[test]
    fn rule_id_catalog_round_trip() {
        for id in [
            RetentionRuleId::KeepWithLabel,
            RetentionRuleId::DropNum,
            RetentionRuleId::DropOlderByDatetime,
            RetentionRuleId::Pin,
            RetentionRuleId::Cleanup,
        ] {
            assert_eq!(RetentionRuleId::from_i64(id.to_i64()).unwrap(), id);
        }
        assert!(RetentionRuleId::from_i64(42).is_err());
    }
}
