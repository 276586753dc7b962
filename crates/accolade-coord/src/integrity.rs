// Data Integrity Validator - rule-based consistency checking over the store
//
// SAFETY INVARIANTS:
// 1. Validation never mutates; every rule is read-only against the store
// 2. Rule selection is deterministic: enabled, level at or below the
//    requested level, and rule-id prefix matching the target's keyword set
// 3. A store error inside a rule surfaces as an ERROR issue for that rule,
//    never as a panic or a silent skip
// 4. A report passes exactly when it contains no FAILED and no ERROR issue

use accolade_core::error::StoreError;
use accolade_core::model::{Achievement, AchievementId, UserId};
use accolade_core::store::AchievementStore;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// How deep a validation run goes. Levels are cumulative: Strict runs
/// everything Comprehensive runs, and so on down.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ValidationLevel {
    Basic,
    Standard,
    Comprehensive,
    Strict,
}

impl ValidationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationLevel::Basic => "basic",
            ValidationLevel::Standard => "standard",
            ValidationLevel::Comprehensive => "comprehensive",
            ValidationLevel::Strict => "strict",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationSeverity {
    Passed,
    Warning,
    Failed,
    /// The rule itself could not run.
    Error,
}

/// What a validation run inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationTarget {
    User(UserId),
    Achievement(AchievementId),
    Global,
}

impl ValidationTarget {
    /// Keyword set a rule id's first token must fall in to apply.
    fn keywords(&self) -> &'static [&'static str] {
        match self {
            ValidationTarget::User(_) => &["user", "progress"],
            ValidationTarget::Achievement(_) => &["achievement", "criteria", "category"],
            ValidationTarget::Global => &["global", "stats", "cache"],
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ValidationTarget::User(user) => format!("user:{user}"),
            ValidationTarget::Achievement(achievement) => format!("achievement:{achievement}"),
            ValidationTarget::Global => "global".to_string(),
        }
    }
}

/// A registered consistency rule.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationRule {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub level: ValidationLevel,
    pub fix_suggestion: &'static str,
    pub enabled: bool,
}

/// One finding from one rule.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub rule_id: &'static str,
    pub severity: ValidationSeverity,
    pub target: String,
    pub detail: String,
    pub fix_suggestion: Option<&'static str>,
}

/// Outcome of one validation run.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub target: String,
    pub level: ValidationLevel,
    pub rules_run: usize,
    pub issues: Vec<ValidationIssue>,
    pub passed_count: usize,
    pub warning_count: usize,
    pub failed_count: usize,
    pub error_count: usize,
    pub duration_ms: u64,
}

impl ValidationReport {
    /// True when nothing failed and nothing errored. Warnings do not block.
    pub fn passed(&self) -> bool {
        self.failed_count == 0 && self.error_count == 0
    }

    fn tally(&mut self) {
        for issue in &self.issues {
            match issue.severity {
                ValidationSeverity::Passed => self.passed_count += 1,
                ValidationSeverity::Warning => self.warning_count += 1,
                ValidationSeverity::Failed => self.failed_count += 1,
                ValidationSeverity::Error => self.error_count += 1,
            }
        }
    }
}

/// Validator tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Allowed relative drift between stored global counters and recomputed
    /// values before the consistency rule fails.
    pub stats_tolerance: f64,

    /// Progress above `target * overshoot_factor` is flagged as corrupt
    /// rather than merely generous.
    pub overshoot_factor: i64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            stats_tolerance: 0.05,
            overshoot_factor: 10,
        }
    }
}

/// Counter snapshot for stats reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorStats {
    pub validations_run: u64,
    pub issues_found: u64,
}

fn builtin_rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule {
            id: "user_achievement_refs",
            name: "User achievement references",
            description: "Every grant row references an existing achievement definition",
            level: ValidationLevel::Basic,
            fix_suggestion: "Delete grant rows whose achievement definition was removed",
            enabled: true,
        },
        ValidationRule {
            id: "user_achievement_duplicates",
            name: "Duplicate grants",
            description: "At most one grant row per (user, achievement) pair",
            level: ValidationLevel::Basic,
            fix_suggestion: "Remove all but the earliest grant row for the pair",
            enabled: true,
        },
        ValidationRule {
            id: "user_progress_bounds",
            name: "Progress bounds",
            description: "Progress values are non-negative and within plausible range of the target",
            level: ValidationLevel::Standard,
            fix_suggestion: "Clamp the progress value or re-derive it from source events",
            enabled: true,
        },
        ValidationRule {
            id: "achievement_category_refs",
            name: "Achievement category references",
            description: "Every achievement references an existing category",
            level: ValidationLevel::Basic,
            fix_suggestion: "Reassign the achievement to an existing category",
            enabled: true,
        },
        ValidationRule {
            id: "criteria_shape",
            name: "Criteria shape",
            description: "Criteria targets are positive and point values are non-negative",
            level: ValidationLevel::Standard,
            fix_suggestion: "Correct the definition's criteria target or points",
            enabled: true,
        },
        ValidationRule {
            id: "global_stats_consistency",
            name: "Global stats consistency",
            description: "Stored global counters agree with recomputed values within tolerance",
            level: ValidationLevel::Comprehensive,
            fix_suggestion: "Rebuild the global stats counters from grant rows",
            enabled: true,
        },
    ]
}

/// Read-only rule engine over the achievement store.
pub struct DataIntegrityValidator {
    store: Arc<dyn AchievementStore>,
    rules: Mutex<Vec<ValidationRule>>,
    config: ValidatorConfig,

    validations_run: AtomicU64,
    issues_found: AtomicU64,
}

impl DataIntegrityValidator {
    pub fn new(store: Arc<dyn AchievementStore>) -> Self {
        Self::with_config(store, ValidatorConfig::default())
    }

    pub fn with_config(store: Arc<dyn AchievementStore>, config: ValidatorConfig) -> Self {
        DataIntegrityValidator {
            store,
            rules: Mutex::new(builtin_rules()),
            config,
            validations_run: AtomicU64::new(0),
            issues_found: AtomicU64::new(0),
        }
    }

    /// Run every applicable rule against the target at the given depth.
    pub async fn validate(
        &self,
        target: ValidationTarget,
        level: ValidationLevel,
    ) -> ValidationReport {
        let started = Instant::now();
        let selected: Vec<ValidationRule> = {
            let rules = self.rules.lock();
            rules
                .iter()
                .filter(|rule| rule.enabled && rule.level <= level && applies(rule.id, &target))
                .cloned()
                .collect()
        };

        let mut report = ValidationReport {
            target: target.describe(),
            level,
            rules_run: selected.len(),
            issues: Vec::new(),
            passed_count: 0,
            warning_count: 0,
            failed_count: 0,
            error_count: 0,
            duration_ms: 0,
        };

        for rule in &selected {
            match self.run_rule(rule, &target).await {
                Ok(mut issues) => {
                    if issues.is_empty() {
                        issues.push(ValidationIssue {
                            rule_id: rule.id,
                            severity: ValidationSeverity::Passed,
                            target: target.describe(),
                            detail: format!("{} ok", rule.name),
                            fix_suggestion: None,
                        });
                    }
                    report.issues.append(&mut issues);
                }
                Err(store_err) => {
                    warn!("validation rule {} could not run: {store_err}", rule.id);
                    report.issues.push(ValidationIssue {
                        rule_id: rule.id,
                        severity: ValidationSeverity::Error,
                        target: target.describe(),
                        detail: format!("rule could not run: {store_err}"),
                        fix_suggestion: None,
                    });
                }
            }
        }

        report.tally();
        report.duration_ms = started.elapsed().as_millis() as u64;
        self.validations_run.fetch_add(1, Ordering::Relaxed);
        let non_passing = (report.issues.len() - report.passed_count) as u64;
        self.issues_found.fetch_add(non_passing, Ordering::Relaxed);

        if report.passed() {
            debug!(
                "validation of {} at {} passed ({} rule(s), {}ms)",
                report.target,
                level.as_str(),
                report.rules_run,
                report.duration_ms
            );
        } else {
            info!(
                "validation of {} at {} found {} failure(s), {} error(s)",
                report.target,
                level.as_str(),
                report.failed_count,
                report.error_count
            );
        }
        report
    }

    async fn run_rule(
        &self,
        rule: &ValidationRule,
        target: &ValidationTarget,
    ) -> Result<Vec<ValidationIssue>, StoreError> {
        match rule.id {
            "user_achievement_refs" => self.check_user_achievement_refs(rule, target).await,
            "user_achievement_duplicates" => self.check_duplicates(rule, target).await,
            "user_progress_bounds" => self.check_progress_bounds(rule, target).await,
            "achievement_category_refs" => self.check_category_refs(rule, target).await,
            "criteria_shape" => self.check_criteria_shape(rule, target).await,
            "global_stats_consistency" => self.check_global_stats(rule).await,
            other => {
                warn!("unknown validation rule id {other}");
                Ok(Vec::new())
            }
        }
    }

    async fn check_user_achievement_refs(
        &self,
        rule: &ValidationRule,
        target: &ValidationTarget,
    ) -> Result<Vec<ValidationIssue>, StoreError> {
        let ValidationTarget::User(user) = target else {
            return Ok(Vec::new());
        };
        let mut issues = Vec::new();
        for row in self.store.get_user_achievements(*user).await? {
            if self.store.get_achievement(row.achievement).await?.is_none() {
                issues.push(failed(
                    rule,
                    target,
                    format!("grant row references unknown achievement {}", row.achievement),
                ));
            }
        }
        Ok(issues)
    }

    async fn check_duplicates(
        &self,
        rule: &ValidationRule,
        target: &ValidationTarget,
    ) -> Result<Vec<ValidationIssue>, StoreError> {
        let ValidationTarget::User(user) = target else {
            return Ok(Vec::new());
        };
        let mut seen = BTreeSet::new();
        let mut issues = Vec::new();
        for row in self.store.get_user_achievements(*user).await? {
            if !seen.insert(row.achievement) {
                issues.push(failed(
                    rule,
                    target,
                    format!("duplicate grant row for achievement {}", row.achievement),
                ));
            }
        }
        Ok(issues)
    }

    async fn check_progress_bounds(
        &self,
        rule: &ValidationRule,
        target: &ValidationTarget,
    ) -> Result<Vec<ValidationIssue>, StoreError> {
        let ValidationTarget::User(user) = target else {
            return Ok(Vec::new());
        };
        let mut issues = Vec::new();
        for row in self.store.get_user_progress(*user).await? {
            if row.current < 0 {
                issues.push(failed(
                    rule,
                    target,
                    format!("negative progress {} on achievement {}", row.current, row.achievement),
                ));
                continue;
            }
            if row.target > 0
                && row.current > row.target.saturating_mul(self.config.overshoot_factor)
            {
                issues.push(failed(
                    rule,
                    target,
                    format!(
                        "progress {} on achievement {} exceeds {}x its target {}",
                        row.current, row.achievement, self.config.overshoot_factor, row.target
                    ),
                ));
            } else if row.earned && row.target > 0 && row.current < row.target {
                issues.push(ValidationIssue {
                    rule_id: rule.id,
                    severity: ValidationSeverity::Warning,
                    target: target.describe(),
                    detail: format!(
                        "achievement {} marked earned at progress {}/{}",
                        row.achievement, row.current, row.target
                    ),
                    fix_suggestion: Some(rule.fix_suggestion),
                });
            }
        }
        Ok(issues)
    }

    async fn check_category_refs(
        &self,
        rule: &ValidationRule,
        target: &ValidationTarget,
    ) -> Result<Vec<ValidationIssue>, StoreError> {
        let definitions = self.definitions_for(target).await?;
        let mut issues = Vec::new();
        for definition in definitions {
            if self.store.get_category(definition.category).await?.is_none() {
                issues.push(failed(
                    rule,
                    target,
                    format!(
                        "achievement {} references unknown category {}",
                        definition.id, definition.category
                    ),
                ));
            }
        }
        Ok(issues)
    }

    async fn check_criteria_shape(
        &self,
        rule: &ValidationRule,
        target: &ValidationTarget,
    ) -> Result<Vec<ValidationIssue>, StoreError> {
        let definitions = self.definitions_for(target).await?;
        let mut issues = Vec::new();
        for definition in definitions {
            if !definition.criteria.is_well_formed() {
                issues.push(failed(
                    rule,
                    target,
                    format!(
                        "achievement {} has non-positive criteria target {}",
                        definition.id, definition.criteria.target
                    ),
                ));
            }
            if definition.points < 0 {
                issues.push(failed(
                    rule,
                    target,
                    format!("achievement {} has negative points {}", definition.id, definition.points),
                ));
            }
        }
        Ok(issues)
    }

    async fn check_global_stats(
        &self,
        rule: &ValidationRule,
    ) -> Result<Vec<ValidationIssue>, StoreError> {
        let stats = self.store.get_global_achievement_stats().await?;
        let rows = self.store.list_user_achievements().await?;
        let actual_grants = rows.len() as u64;
        let actual_users = rows
            .iter()
            .map(|row| row.user)
            .collect::<BTreeSet<_>>()
            .len() as u64;

        let mut issues = Vec::new();
        if drifts(stats.total_grants, actual_grants, self.config.stats_tolerance) {
            issues.push(failed(
                rule,
                &ValidationTarget::Global,
                format!(
                    "total_grants counter {} vs recomputed {}",
                    stats.total_grants, actual_grants
                ),
            ));
        }
        if drifts(
            stats.users_with_achievements,
            actual_users,
            self.config.stats_tolerance,
        ) {
            issues.push(failed(
                rule,
                &ValidationTarget::Global,
                format!(
                    "users_with_achievements counter {} vs recomputed {}",
                    stats.users_with_achievements, actual_users
                ),
            ));
        }
        Ok(issues)
    }

    async fn definitions_for(
        &self,
        target: &ValidationTarget,
    ) -> Result<Vec<Achievement>, StoreError> {
        match target {
            ValidationTarget::Achievement(id) => {
                Ok(self.store.get_achievement(*id).await?.into_iter().collect())
            }
            ValidationTarget::Global => self.store.list_achievements().await,
            ValidationTarget::User(_) => Ok(Vec::new()),
        }
    }

    /// Flip one rule on or off. Returns false for an unknown id.
    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut rules = self.rules.lock();
        match rules.iter_mut().find(|rule| rule.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                info!("validation rule {id} {}", if enabled { "enabled" } else { "disabled" });
                true
            }
            None => false,
        }
    }

    pub fn rules(&self) -> Vec<ValidationRule> {
        self.rules.lock().clone()
    }

    pub fn stats(&self) -> ValidatorStats {
        ValidatorStats {
            validations_run: self.validations_run.load(Ordering::Relaxed),
            issues_found: self.issues_found.load(Ordering::Relaxed),
        }
    }
}

/// A rule applies when the first `_`-separated token of its id is in the
/// target's keyword set.
fn applies(rule_id: &str, target: &ValidationTarget) -> bool {
    let first = rule_id.split('_').next().unwrap_or("");
    target.keywords().contains(&first)
}

fn failed(rule: &ValidationRule, target: &ValidationTarget, detail: String) -> ValidationIssue {
    ValidationIssue {
        rule_id: rule.id,
        severity: ValidationSeverity::Failed,
        target: target.describe(),
        detail,
        fix_suggestion: Some(rule.fix_suggestion),
    }
}

/// Relative drift beyond tolerance. Zero expected tolerates only zero.
fn drifts(stored: u64, recomputed: u64, tolerance: f64) -> bool {
    if stored == recomputed {
        return false;
    }
    if recomputed == 0 {
        return true;
    }
    let diff = stored.abs_diff(recomputed) as f64;
    diff / recomputed as f64 > tolerance
}
