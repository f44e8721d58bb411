//! Declarative lifecycle policies.
//!
//! A policy names the tables it governs and an ordered list of rules. Rules
//! are evaluated in order, each as its own unit of work; a later rule may
//! assume an earlier one already ran in the same cycle, but nothing is
//! atomic across rules.

use crate::criteria::{resolve_age, ArchivalCriteria, Predicate, QueryCriteria, TieringCriteria};
use crate::error::PolicyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What a rule does to the records it selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    MoveToColdStorage,
    Archive,
    Delete,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::MoveToColdStorage => "move_to_cold_storage",
            RuleAction::Archive => "archive",
            RuleAction::Delete => "delete",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rule of a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRule {
    pub action: RuleAction,
    /// Age threshold such as `"30_days"`
    #[serde(default)]
    pub age: Option<String>,
    /// Explicit condition such as `"status = 'closed'"`
    #[serde(default)]
    pub condition: Option<String>,
}

impl LifecycleRule {
    pub fn new(action: RuleAction) -> Self {
        Self {
            action,
            age: None,
            condition: None,
        }
    }

    pub fn with_age(mut self, age: impl Into<String>) -> Self {
        self.age = Some(age.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Resolve the rule into query criteria at `now`.
    ///
    /// The age threshold becomes an absolute cutoff each time this runs; it
    /// is never cached between evaluations.
    pub fn criteria_at(&self, now: DateTime<Utc>) -> Result<QueryCriteria, PolicyError> {
        let mut criteria = match &self.age {
            Some(age) => QueryCriteria::older_than(resolve_age(age, now)?),
            None => QueryCriteria::all(),
        };

        if let Some(condition) = &self.condition {
            criteria = criteria.with(Predicate::parse_condition(condition)?);
        }

        Ok(criteria)
    }

    /// Archival criteria for this rule, evaluated at `now`
    pub fn archival_criteria_at(
        &self,
        now: DateTime<Utc>,
        remove_after_archive: bool,
    ) -> Result<ArchivalCriteria, PolicyError> {
        let older_than = match &self.age {
            Some(age) => resolve_age(age, now)?,
            // Archive everything that exists at evaluation time
            None => now,
        };

        let mut criteria = ArchivalCriteria::new(older_than, remove_after_archive);
        if let Some(condition) = &self.condition {
            criteria = criteria
                .with_condition(QueryCriteria::all().with(Predicate::parse_condition(condition)?));
        }
        Ok(criteria)
    }

    /// Tiering criteria for this rule, evaluated at `now`
    pub fn tiering_criteria_at(
        &self,
        now: DateTime<Utc>,
        remove_from_source: bool,
    ) -> Result<TieringCriteria, PolicyError> {
        Ok(TieringCriteria::new(self.criteria_at(now)?, remove_from_source))
    }
}

/// A named set of rules applied to a set of tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    pub name: String,
    pub tables: Vec<String>,
    #[serde(default)]
    pub rules: Vec<LifecycleRule>,
}

impl LifecyclePolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.tables.push(table.into());
        self
    }

    pub fn rule(mut self, rule: LifecycleRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Check that every rule parses.
    ///
    /// A delete rule with neither an age nor a condition would wipe whole
    /// tables and is rejected.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let now = Utc::now();
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.action == RuleAction::Delete && rule.age.is_none() && rule.condition.is_none() {
                return Err(PolicyError::UnboundedRule {
                    policy: self.name.clone(),
                    index,
                });
            }
            rule.criteria_at(now)?;
        }
        Ok(())
    }
}

/// How often the scheduler runs a lifecycle cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Hourly,
    Daily,
    Every(Duration),
}

impl Schedule {
    /// Parse `"daily"`, `"hourly"` or an interval such as `"6_hours"`
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Schedule::Hourly),
            "daily" => Ok(Schedule::Daily),
            other => {
                let interval = crate::criteria::parse_age(other)
                    .map_err(|_| PolicyError::InvalidSchedule(raw.to_string()))?
                    .to_std()
                    .map_err(|_| PolicyError::InvalidSchedule(raw.to_string()))?;
                if interval.is_zero() {
                    return Err(PolicyError::InvalidSchedule(raw.to_string()));
                }
                Ok(Schedule::Every(interval))
            }
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            Schedule::Hourly => Duration::from_secs(60 * 60),
            Schedule::Daily => Duration::from_secs(24 * 60 * 60),
            Schedule::Every(interval) => *interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{Scalar, CREATED_AT_FIELD};
    use chrono::TimeZone;

    #[test]
    fn test_rule_action_serialization() {
        assert_eq!(
            serde_json::to_string(&RuleAction::MoveToColdStorage).unwrap(),
            "\"move_to_cold_storage\""
        );
        let rule: LifecycleRule =
            serde_json::from_str(r#"{"action": "delete", "age": "90_days"}"#).unwrap();
        assert_eq!(rule.action, RuleAction::Delete);
        assert_eq!(rule.condition, None);
    }

    #[test]
    fn test_criteria_resolved_against_now() {
        let rule = LifecycleRule::new(RuleAction::Delete)
            .with_age("30_days")
            .with_condition("status = 'closed'");

        let march = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap();
        let april = Utc.with_ymd_and_hms(2024, 4, 30, 0, 0, 0).unwrap();

        let first = rule.criteria_at(march).unwrap();
        let second = rule.criteria_at(april).unwrap();

        assert_ne!(first, second);
        assert_eq!(
            first.predicates()[0],
            Predicate::LessThan {
                field: CREATED_AT_FIELD.to_string(),
                value: Scalar::Timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            }
        );
        assert_eq!(first.predicates()[1].field(), "status");
    }

    #[test]
    fn test_archival_criteria_from_rule() {
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap();
        let criteria = LifecycleRule::new(RuleAction::Archive)
            .with_age("1_year")
            .archival_criteria_at(now, true)
            .unwrap();

        assert!(criteria.remove_after_archive);
        assert_eq!(criteria.older_than, Utc.with_ymd_and_hms(2023, 4, 1, 0, 0, 0).unwrap());
        assert!(criteria.condition.is_none());
    }

    #[test]
    fn test_validate_rejects_unbounded_delete() {
        let policy = LifecyclePolicy::new("wipe")
            .table("sessions")
            .rule(LifecycleRule::new(RuleAction::Delete));

        assert_eq!(
            policy.validate(),
            Err(PolicyError::UnboundedRule {
                policy: "wipe".to_string(),
                index: 0,
            })
        );

        let bad_age = LifecyclePolicy::new("typo")
            .table("sessions")
            .rule(LifecycleRule::new(RuleAction::Archive).with_age("3_eons"));
        assert!(bad_age.validate().is_err());
    }

    #[test]
    fn test_schedule_parsing() {
        assert_eq!(Schedule::parse("daily").unwrap().interval(), Duration::from_secs(86_400));
        assert_eq!(Schedule::parse("Hourly").unwrap().interval(), Duration::from_secs(3_600));
        assert_eq!(
            Schedule::parse("6_hours").unwrap(),
            Schedule::Every(Duration::from_secs(6 * 3_600))
        );
        assert!(Schedule::parse("every tuesday").is_err());
        assert!(Schedule::parse("0_days").is_err());
    }
}
