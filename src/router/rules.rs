//! Routing rules and their matching semantics

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::context::CallContext;
use crate::persona::{PersonaId, SYSTEM_PERSONA_ID};
use crate::{Error, Result};

/// Call urgency
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl FromStr for Urgency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "normal" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" | "urgent" => Ok(Self::Critical),
            other => Err(Error::Routing(format!("unknown urgency: {other}"))),
        }
    }
}

/// Minutes past local midnight, written `HH:MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    /// Build from hour and minute
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the time is out of range
    pub fn new(hour: u16, minute: u16) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(Error::Config(format!(
                "time of day out of range: {hour:02}:{minute:02}"
            )));
        }
        Ok(Self(hour * 60 + minute))
    }

    /// Time of day of a local timestamp
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn of(timestamp: &NaiveDateTime) -> Self {
        // hour() < 24 and minute() < 60, so the sum always fits
        Self((timestamp.hour() * 60 + timestamp.minute()) as u16)
    }

    #[must_use]
    pub const fn minutes(self) -> u16 {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("expected HH:MM, got {s:?}")))?;
        let hour = h
            .parse()
            .map_err(|_| Error::Config(format!("bad hour in {s:?}")))?;
        let minute = m
            .parse()
            .map_err(|_| Error::Config(format!("bad minute in {s:?}")))?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// Half-open local time window `[start, end)`
///
/// When `start > end` the window crosses midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeWindow {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl TimeWindow {
    #[must_use]
    pub fn contains(&self, t: TimeOfDay) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

/// Conditions that must all hold for a rule to match
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuleConditions {
    /// Regex tested against the caller id
    pub caller_pattern: Option<String>,

    /// Local time-of-day window
    pub time_window: Option<TimeWindow>,

    /// Days of the week (e.g. `["Mon", "Tue"]`)
    pub days: Option<Vec<Weekday>>,

    /// Any of these is a case-insensitive substring of any context keyword
    pub keywords: Vec<String>,

    /// Exact urgency
    pub urgency: Option<Urgency>,

    /// Caller has been routed at least this many times before
    pub min_prior_interactions: Option<u32>,
}

/// What happens when a rule wins
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RuleActions {
    /// Persona that takes the call
    pub target: PersonaId,

    #[serde(default)]
    pub record_call: bool,

    #[serde(default)]
    pub transcribe_call: bool,

    /// Hold the call until an operator approves it
    #[serde(default)]
    pub require_approval: bool,

    /// Parties notified about the call
    #[serde(default)]
    pub notify: Vec<String>,
}

impl RuleActions {
    /// Actions that only name a target
    #[must_use]
    pub fn target(target: impl Into<PersonaId>) -> Self {
        Self {
            target: target.into(),
            record_call: false,
            transcribe_call: false,
            require_approval: false,
            notify: Vec::new(),
        }
    }
}

/// A priority-ordered condition/action pair
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RoutingRule {
    pub id: String,

    /// Higher is evaluated first
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub conditions: RuleConditions,

    pub actions: RuleActions,
}

impl RoutingRule {
    /// Rule with no conditions
    #[must_use]
    pub fn new(id: impl Into<String>, priority: i32, target: impl Into<PersonaId>) -> Self {
        Self {
            id: id.into(),
            priority,
            conditions: RuleConditions::default(),
            actions: RuleActions::target(target),
        }
    }

    #[must_use]
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_caller_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.conditions.caller_pattern = Some(pattern.into());
        self
    }

    #[must_use]
    pub fn with_time_window(mut self, start: TimeOfDay, end: TimeOfDay) -> Self {
        self.conditions.time_window = Some(TimeWindow { start, end });
        self
    }

    #[must_use]
    pub fn with_days(mut self, days: Vec<Weekday>) -> Self {
        self.conditions.days = Some(days);
        self
    }

    #[must_use]
    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.conditions.urgency = Some(urgency);
        self
    }

    #[must_use]
    pub fn with_min_prior_interactions(mut self, n: u32) -> Self {
        self.conditions.min_prior_interactions = Some(n);
        self
    }

    #[must_use]
    pub fn with_actions(mut self, actions: RuleActions) -> Self {
        self.actions = actions;
        self
    }

    /// Check that the rule can be compiled
    ///
    /// # Errors
    ///
    /// Returns error for an empty id, an invalid caller pattern or an empty
    /// time window
    pub fn validate(&self) -> Result<()> {
        self.compile(0).map(|_| ())
    }

    pub(crate) fn compile(&self, seq: u64) -> Result<CompiledRule> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("rule id must not be empty".to_string()));
        }
        if let Some(window) = &self.conditions.time_window
            && window.start == window.end
        {
            return Err(Error::Config(format!(
                "rule {} has an empty time window",
                self.id
            )));
        }

        let caller_regex = self
            .conditions
            .caller_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;

        let keywords = self
            .conditions
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        Ok(CompiledRule {
            rule: self.clone(),
            caller_regex,
            keywords,
            seq,
        })
    }
}

/// A rule with its regex compiled and keywords normalized
#[derive(Debug, Clone)]
pub(crate) struct CompiledRule {
    pub(crate) rule: RoutingRule,
    caller_regex: Option<Regex>,
    keywords: Vec<String>,
    /// Registration order, breaks priority ties
    pub(crate) seq: u64,
}

impl CompiledRule {
    /// Whether every present condition holds for the context
    pub(crate) fn matches(&self, ctx: &CallContext) -> bool {
        let conditions = &self.rule.conditions;

        if let Some(regex) = &self.caller_regex
            && !regex.is_match(&ctx.caller_id)
        {
            return false;
        }

        if let Some(window) = &conditions.time_window
            && !window.contains(TimeOfDay::of(&ctx.timestamp))
        {
            return false;
        }

        if let Some(days) = &conditions.days
            && !days.contains(&ctx.timestamp.weekday())
        {
            return false;
        }

        if !self.keywords.is_empty() {
            let hit = self.keywords.iter().any(|rule_kw| {
                ctx.keywords
                    .iter()
                    .any(|kw| kw.to_lowercase().contains(rule_kw.as_str()))
            });
            if !hit {
                return false;
            }
        }

        if let Some(urgency) = conditions.urgency
            && urgency != ctx.urgency
        {
            return false;
        }

        if let Some(min) = conditions.min_prior_interactions
            && ctx.prior_interactions < min
        {
            return false;
        }

        true
    }
}

/// Built-in routing rules for the default catalog
#[must_use]
pub fn default_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule::new("critical-escalation", 200, SYSTEM_PERSONA_ID)
            .with_urgency(Urgency::Critical)
            .with_actions(RuleActions {
                record_call: true,
                notify: vec!["operations".to_string()],
                ..RuleActions::target(SYSTEM_PERSONA_ID)
            }),
        RoutingRule::new("finance", 100, "cfo")
            .with_keywords(["budget", "finance", "revenue", "invoice", "forecast"]),
        RoutingRule::new("legal", 90, "clo")
            .with_keywords(["legal", "contract", "lawsuit", "compliance"])
            .with_actions(RuleActions {
                record_call: true,
                transcribe_call: true,
                ..RuleActions::target("clo")
            }),
        RoutingRule::new("technology", 80, "cto")
            .with_keywords(["outage", "infrastructure", "engineering", "platform"]),
        RoutingRule::new("marketing", 70, "cmo")
            .with_keywords(["marketing", "campaign", "brand", "press"]),
        RoutingRule::new("operations", 60, "coo")
            .with_keywords(["operations", "logistics", "supply"]),
        RoutingRule::new("people", 50, "chro")
            .with_keywords(["hiring", "recruiting", "benefits", "payroll"]),
        RoutingRule::new("strategy", 40, "cso")
            .with_keywords(["strategy", "acquisition", "partnership"]),
    ]
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn ctx_at(hour: u32, minute: u32) -> CallContext {
        // 2024-06-03 is a Monday
        let timestamp = NaiveDate::from_ymd_opt(2024, 6, 3)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap();
        CallContext {
            caller_id: "+15550100".to_string(),
            metadata: std::collections::BTreeMap::new(),
            prior_interactions: 0,
            urgency: Urgency::Medium,
            keywords: Vec::new(),
            timestamp,
        }
    }

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    #[test]
    fn time_of_day_parses_and_displays() {
        assert_eq!(t("08:05").minutes(), 485);
        assert_eq!(t("8:05").to_string(), "08:05");
        assert!("24:00".parse::<TimeOfDay>().is_err());
        assert!("noon".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn window_is_half_open() {
        let window = TimeWindow {
            start: t("09:00"),
            end: t("17:00"),
        };
        assert!(window.contains(t("09:00")));
        assert!(window.contains(t("16:59")));
        assert!(!window.contains(t("17:00")));
        assert!(!window.contains(t("08:59")));
    }

    #[test]
    fn window_wraps_past_midnight() {
        let window = TimeWindow {
            start: t("22:00"),
            end: t("06:00"),
        };
        assert!(window.contains(t("23:30")));
        assert!(window.contains(t("00:00")));
        assert!(window.contains(t("05:59")));
        assert!(!window.contains(t("06:00")));
        assert!(!window.contains(t("12:00")));
    }

    #[test]
    fn empty_window_is_rejected() {
        let rule = RoutingRule::new("r", 1, "cfo").with_time_window(t("09:00"), t("09:00"));
        assert!(rule.validate().is_err());
    }

    #[test]
    fn keywords_match_as_substrings_case_insensitively() {
        let rule = RoutingRule::new("r", 1, "cfo")
            .with_keywords(["Budget"])
            .compile(0)
            .unwrap();

        let mut ctx = ctx_at(10, 0);
        ctx.keywords = vec!["q3-BUDGETS".to_string()];
        assert!(rule.matches(&ctx));

        ctx.keywords = vec!["revenue".to_string()];
        assert!(!rule.matches(&ctx));
    }

    #[test]
    fn conditions_are_anded() {
        let rule = RoutingRule::new("r", 1, "cfo")
            .with_keywords(["budget"])
            .with_urgency(Urgency::High)
            .compile(0)
            .unwrap();

        let mut ctx = ctx_at(10, 0);
        ctx.keywords = vec!["budget".to_string()];
        assert!(!rule.matches(&ctx));

        ctx.urgency = Urgency::High;
        assert!(rule.matches(&ctx));
    }

    #[test]
    fn urgency_is_exact() {
        let rule = RoutingRule::new("r", 1, "cfo")
            .with_urgency(Urgency::High)
            .compile(0)
            .unwrap();
        let mut ctx = ctx_at(10, 0);
        ctx.urgency = Urgency::Critical;
        assert!(!rule.matches(&ctx));
    }

    #[test]
    fn caller_pattern_and_days() {
        let rule = RoutingRule::new("r", 1, "cfo")
            .with_caller_pattern(r"^\+1555")
            .with_days(vec![Weekday::Mon, Weekday::Tue])
            .compile(0)
            .unwrap();

        let mut ctx = ctx_at(10, 0);
        assert!(rule.matches(&ctx));

        ctx.caller_id = "+4420".to_string();
        assert!(!rule.matches(&ctx));
    }

    #[test]
    fn repeat_callers() {
        let rule = RoutingRule::new("r", 1, "cfo")
            .with_min_prior_interactions(2)
            .compile(0)
            .unwrap();
        let mut ctx = ctx_at(10, 0);
        ctx.prior_interactions = 1;
        assert!(!rule.matches(&ctx));
        ctx.prior_interactions = 2;
        assert!(rule.matches(&ctx));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let rule = RoutingRule::new("r", 1, "cfo").with_caller_pattern("(");
        assert!(matches!(rule.validate(), Err(Error::Regex(_))));
    }

    #[test]
    fn rules_deserialize_from_toml() {
        let rule: RoutingRule = toml::from_str(
            r#"
id = "night"
priority = 5

[conditions]
time_window = { start = "22:00", end = "06:00" }
days = ["Sat", "Sun"]

[actions]
target = "sovren-ai"
notify = ["ops"]
"#,
        )
        .unwrap();

        let window = rule.conditions.time_window.unwrap();
        assert_eq!(window.start.to_string(), "22:00");
        assert_eq!(rule.conditions.days.unwrap().len(), 2);
        assert_eq!(rule.actions.notify, vec!["ops".to_string()]);
    }

    #[test]
    fn default_rules_are_valid() {
        for rule in default_rules() {
            rule.validate().unwrap();
        }
    }
}
