//! Executive call routing
//!
//! [`CallRouter`] assigns every communication event to exactly one persona:
//!
//! 1. the highest-priority matching rule whose target is tier-allowed and
//!    has spare capacity,
//! 2. otherwise the least-loaded available persona (ties go to higher
//!    priority, then to the lower id),
//! 3. otherwise the always-on fallback persona.
//!
//! The decision and the load increment happen under one lock with no
//! suspension point in between, so two concurrent routing calls can never
//! both see the same free slot.

pub mod context;
pub mod rules;

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

pub use context::{CallContext, CallHints, extract_keywords};
pub use rules::{
    RoutingRule, RuleActions, RuleConditions, TimeOfDay, TimeWindow, Urgency, default_rules,
};

use crate::config::Config;
use crate::events::{CallEvent, EventBus};
use crate::persona::{Availability, PersonaId, PersonaProfile};
use crate::session::SessionStore;
use crate::tier::{Tier, TierGate};
use crate::{Error, Result};
use rules::CompiledRule;

/// How a persona was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Rule,
    LoadBalanced,
    Fallback,
}

/// Outcome of routing one call
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub persona_id: PersonaId,
    pub strategy: RoutingStrategy,
    /// Rule that won, if any
    pub rule_id: Option<String>,
    /// Actions of the winning rule
    pub actions: Option<RuleActions>,
    pub context: CallContext,
}

#[derive(Debug)]
struct RouterState {
    personas: Vec<PersonaProfile>,
    allowed: HashSet<PersonaId>,
    /// Sorted by descending priority, then registration order
    rules: Vec<CompiledRule>,
    next_seq: u64,
}

impl RouterState {
    fn index_of(&self, id: &PersonaId) -> Option<usize> {
        self.personas.iter().position(|p| &p.id == id)
    }

    /// Take one unit of a persona's capacity
    fn try_acquire(&mut self, id: &PersonaId) -> Result<usize> {
        let idx = self
            .index_of(id)
            .ok_or_else(|| Error::PersonaNotFound(id.to_string()))?;
        if !self.allowed.contains(id) {
            return Err(Error::Routing(format!("persona {id} is not allowed for tier")));
        }

        let persona = &mut self.personas[idx];
        if !persona.availability.accepts_calls() {
            return Err(Error::Routing(format!(
                "persona {id} is {:?}",
                persona.availability
            )));
        }
        if persona.current_load >= persona.max_concurrent_calls {
            return Err(Error::CapacityExceeded {
                persona: id.to_string(),
                max: persona.max_concurrent_calls,
            });
        }

        persona.current_load += 1;
        Ok(idx)
    }

    fn least_loaded(&self, fallback: &PersonaId) -> Option<usize> {
        self.personas
            .iter()
            .enumerate()
            .filter(|(_, p)| &p.id != fallback && self.allowed.contains(&p.id) && p.is_available())
            .min_by_key(|(_, p)| (p.current_load, Reverse(p.priority), p.id.clone()))
            .map(|(idx, _)| idx)
    }

    /// Pick a persona and take its capacity
    fn decide(
        &mut self,
        ctx: &CallContext,
        fallback: &PersonaId,
    ) -> Result<(PersonaId, RoutingStrategy, Option<RoutingRule>)> {
        let candidates: Vec<usize> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.matches(ctx))
            .map(|(i, _)| i)
            .collect();

        for i in candidates {
            let target = self.rules[i].rule.actions.target.clone();
            match self.try_acquire(&target) {
                Ok(_) => return Ok((target, RoutingStrategy::Rule, Some(self.rules[i].rule.clone()))),
                Err(e) => tracing::debug!(
                    rule = %self.rules[i].rule.id,
                    persona = %target,
                    error = %e,
                    "rule target unusable, trying next"
                ),
            }
        }

        if let Some(idx) = self.least_loaded(fallback) {
            let persona = &mut self.personas[idx];
            persona.current_load += 1;
            return Ok((persona.id.clone(), RoutingStrategy::LoadBalanced, None));
        }

        let idx = self
            .index_of(fallback)
            .ok_or_else(|| Error::Config(format!("fallback persona {fallback} is not in the catalog")))?;
        let persona = &mut self.personas[idx];
        persona.current_load = persona.current_load.saturating_add(1);
        Ok((persona.id.clone(), RoutingStrategy::Fallback, None))
    }

    fn insert_rule(&mut self, rule: &RoutingRule) -> Result<()> {
        if self.rules.iter().any(|r| r.rule.id == rule.id) {
            return Err(Error::Config(format!("duplicate rule id: {}", rule.id)));
        }
        if self.index_of(&rule.actions.target).is_none() {
            return Err(Error::Config(format!(
                "rule {} targets unknown persona {}",
                rule.id, rule.actions.target
            )));
        }

        let compiled = rule.compile(self.next_seq)?;
        self.next_seq += 1;
        self.rules.push(compiled);
        self.rules.sort_by_key(|r| (Reverse(r.rule.priority), r.seq));
        Ok(())
    }
}

/// Assigns calls to personas under load, availability and tier constraints
#[derive(Debug)]
pub struct CallRouter {
    state: Mutex<RouterState>,
    fallback: PersonaId,
    history: Arc<SessionStore>,
    events: EventBus,
}

impl CallRouter {
    /// Create a router over a catalog with the given tier-allowed subset
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the fallback persona is missing, bounded
    /// or not allowed
    pub fn new(
        catalog: Vec<PersonaProfile>,
        allowed: &[PersonaProfile],
        fallback: PersonaId,
        history: Arc<SessionStore>,
        events: EventBus,
    ) -> Result<Self> {
        crate::persona::validate_catalog(&catalog)?;
        let allowed: HashSet<PersonaId> = allowed.iter().map(|p| p.id.clone()).collect();
        check_fallback(&catalog, &allowed, &fallback)?;

        Ok(Self {
            state: Mutex::new(RouterState {
                personas: catalog,
                allowed,
                rules: Vec::new(),
                next_seq: 0,
            }),
            fallback,
            history,
            events,
        })
    }

    /// Build a router from configuration, with its rules registered
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on an invalid tier layout, fallback or rule
    pub fn from_config(
        config: &Config,
        history: Arc<SessionStore>,
        events: EventBus,
    ) -> Result<Self> {
        let gate = config.tier_gate()?;
        let allowed = gate.resolve(config.tier, &config.personas)?;
        let router = Self::new(
            config.personas.clone(),
            &allowed,
            config.router.fallback_persona.clone(),
            history,
            events,
        )?;
        for rule in &config.rules {
            router.add_rule(rule.clone())?;
        }

        tracing::info!(
            tier = %config.tier,
            personas = allowed.len(),
            rules = config.rules.len(),
            "call router ready"
        );
        Ok(router)
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route a call and return the assigned persona
    ///
    /// # Errors
    ///
    /// Returns `Error::Routing` for an empty caller id
    pub fn assign_persona(&self, caller_id: &str, hints: CallHints) -> Result<PersonaId> {
        self.route(caller_id, hints).map(|d| d.persona_id)
    }

    /// Route a call and return the full decision
    ///
    /// Takes one unit of the chosen persona's capacity; pair with
    /// [`release`](Self::release) when the call ends.
    ///
    /// # Errors
    ///
    /// Returns `Error::Routing` for an empty caller id. Lack of capacity is
    /// never an error: the fallback persona always accepts.
    pub fn route(&self, caller_id: &str, hints: CallHints) -> Result<RoutingDecision> {
        let caller = caller_id.trim();
        if caller.is_empty() {
            let reason = "caller id must not be empty".to_string();
            tracing::warn!(reason = %reason, "routing rejected");
            self.events.emit_call(CallEvent::RoutingFailed {
                caller_id: caller_id.to_string(),
                reason: reason.clone(),
            });
            return Err(Error::Routing(reason));
        }

        let prior = self.history.prior_interactions(caller);
        let context = CallContext::build(caller, hints, prior);

        let (persona_id, strategy, rule) = {
            let mut state = self.lock();
            state.decide(&context, &self.fallback)?
        };

        self.history.record_interaction(caller, &persona_id);

        tracing::info!(
            caller = %caller,
            persona = %persona_id,
            strategy = ?strategy,
            rule = rule.as_ref().map_or("-", |r| r.id.as_str()),
            "persona assigned"
        );
        self.events.emit_call(CallEvent::PersonaAssigned {
            caller_id: caller.to_string(),
            persona_id: persona_id.clone(),
            strategy,
            rule_id: rule.as_ref().map(|r| r.id.clone()),
        });

        Ok(RoutingDecision {
            persona_id,
            strategy,
            rule_id: rule.as_ref().map(|r| r.id.clone()),
            actions: rule.map(|r| r.actions),
            context,
        })
    }

    /// Take one unit of a specific persona's capacity
    ///
    /// Used for outbound calls placed on behalf of a chosen persona.
    ///
    /// # Errors
    ///
    /// Returns `Error::PersonaNotFound`, `Error::CapacityExceeded`, or
    /// `Error::Routing` if the persona is not allowed or not accepting calls
    pub fn acquire(&self, persona_id: &PersonaId) -> Result<()> {
        self.lock().try_acquire(persona_id)?;
        tracing::debug!(persona = %persona_id, "persona acquired");
        Ok(())
    }

    /// Give back one unit of a persona's capacity
    ///
    /// Returns the persona's new load, floored at zero.
    ///
    /// # Errors
    ///
    /// Returns `Error::PersonaNotFound` if the persona is not in the catalog
    pub fn release(&self, persona_id: &PersonaId) -> Result<u32> {
        let load = {
            let mut state = self.lock();
            let idx = state
                .index_of(persona_id)
                .ok_or_else(|| Error::PersonaNotFound(persona_id.to_string()))?;
            let persona = &mut state.personas[idx];
            persona.current_load = persona.current_load.saturating_sub(1);
            persona.current_load
        };

        tracing::debug!(persona = %persona_id, load, "persona released");
        self.events.emit_call(CallEvent::PersonaReleased {
            persona_id: persona_id.clone(),
            current_load: load,
        });
        Ok(load)
    }

    /// Register a routing rule
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for a duplicate id, unknown target or invalid
    /// condition
    pub fn add_rule(&self, rule: RoutingRule) -> Result<()> {
        self.lock().insert_rule(&rule)?;
        tracing::debug!(rule = %rule.id, priority = rule.priority, target = %rule.actions.target, "rule added");
        Ok(())
    }

    /// Remove a routing rule by id; returns whether it existed
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut state = self.lock();
        let before = state.rules.len();
        state.rules.retain(|r| r.rule.id != rule_id);
        state.rules.len() != before
    }

    /// Registered rules in evaluation order
    #[must_use]
    pub fn rules(&self) -> Vec<RoutingRule> {
        self.lock().rules.iter().map(|r| r.rule.clone()).collect()
    }

    /// Change a persona's availability
    ///
    /// # Errors
    ///
    /// Returns `Error::PersonaNotFound` if the persona is not in the catalog
    pub fn set_availability(&self, persona_id: &PersonaId, availability: Availability) -> Result<()> {
        let mut state = self.lock();
        let idx = state
            .index_of(persona_id)
            .ok_or_else(|| Error::PersonaNotFound(persona_id.to_string()))?;
        state.personas[idx].availability = availability;
        tracing::debug!(persona = %persona_id, availability = ?availability, "availability changed");
        Ok(())
    }

    /// Re-gate the catalog for a different tier
    ///
    /// Loads are kept; personas that drop out simply stop receiving calls.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the tier is not configured or would
    /// exclude the fallback persona
    pub fn apply_tier(&self, gate: &TierGate, tier: Tier) -> Result<()> {
        let mut state = self.lock();
        let allowed: HashSet<PersonaId> = gate
            .resolve(tier, &state.personas)?
            .into_iter()
            .map(|p| p.id)
            .collect();
        check_fallback(&state.personas, &allowed, &self.fallback)?;
        state.allowed = allowed;
        tracing::info!(tier = %tier, personas = state.allowed.len(), "tier applied");
        Ok(())
    }

    /// Current state of every tier-allowed persona, in catalog order
    #[must_use]
    pub fn snapshot(&self) -> Vec<PersonaProfile> {
        let state = self.lock();
        state
            .personas
            .iter()
            .filter(|p| state.allowed.contains(&p.id))
            .cloned()
            .collect()
    }

    /// Current state of one persona
    #[must_use]
    pub fn persona(&self, persona_id: &PersonaId) -> Option<PersonaProfile> {
        let state = self.lock();
        state.index_of(persona_id).map(|i| state.personas[i].clone())
    }

    /// The always-on fallback persona
    #[must_use]
    pub const fn fallback(&self) -> &PersonaId {
        &self.fallback
    }

    /// Tier-allowed personas that can take a call right now
    #[must_use]
    pub fn available_count(&self) -> usize {
        let state = self.lock();
        state
            .personas
            .iter()
            .filter(|p| state.allowed.contains(&p.id) && p.is_available())
            .count()
    }

    /// Sum of concurrent call limits over tier-allowed, bounded personas
    #[must_use]
    pub fn total_capacity(&self) -> u64 {
        let state = self.lock();
        state
            .personas
            .iter()
            .filter(|p| state.allowed.contains(&p.id) && !p.is_unbounded())
            .map(|p| u64::from(p.max_concurrent_calls))
            .sum()
    }

    /// Calls currently assigned, over every persona
    #[must_use]
    pub fn active_calls(&self) -> u64 {
        self.lock()
            .personas
            .iter()
            .map(|p| u64::from(p.current_load))
            .sum()
    }

    /// Calls currently assigned to tier-allowed, bounded personas
    ///
    /// Counted over the same personas as [`Self::total_capacity`], so calls
    /// still held by personas a downgrade removed do not count.
    #[must_use]
    pub fn bounded_load(&self) -> u64 {
        let state = self.lock();
        state
            .personas
            .iter()
            .filter(|p| state.allowed.contains(&p.id) && !p.is_unbounded())
            .map(|p| u64::from(p.current_load))
            .sum()
    }
}

fn check_fallback(
    catalog: &[PersonaProfile],
    allowed: &HashSet<PersonaId>,
    fallback: &PersonaId,
) -> Result<()> {
    let persona = catalog
        .iter()
        .find(|p| &p.id == fallback)
        .ok_or_else(|| Error::Config(format!("fallback persona {fallback} is not in the catalog")))?;
    if !persona.is_unbounded() {
        return Err(Error::Config(format!(
            "fallback persona {fallback} must accept unbounded calls"
        )));
    }
    if !allowed.contains(fallback) {
        return Err(Error::Config(format!(
            "fallback persona {fallback} is not allowed for the active tier"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::{SYSTEM_PERSONA_ID, default_catalog};
    use crate::tier::default_tiers;

    fn router(tier: Tier) -> CallRouter {
        let catalog = default_catalog();
        let gate = TierGate::new(default_tiers()).unwrap();
        let allowed = gate.resolve(tier, &catalog).unwrap();
        CallRouter::new(
            catalog,
            &allowed,
            PersonaId::from(SYSTEM_PERSONA_ID),
            Arc::new(SessionStore::default()),
            EventBus::default(),
        )
        .unwrap()
    }

    #[test]
    fn blank_caller_is_rejected_with_event() {
        let router = router(Tier::Tier1);
        let mut rx = router.events.subscribe_calls();

        let err = router.route("   ", CallHints::new()).unwrap_err();
        assert!(matches!(err, Error::Routing(_)));
        assert!(matches!(
            rx.try_recv().unwrap(),
            CallEvent::RoutingFailed { .. }
        ));
        assert_eq!(router.active_calls(), 0);
    }

    #[test]
    fn no_rules_means_load_balancing_by_priority() {
        let router = router(Tier::Tier1);
        // All idle: highest priority executive wins
        let decision = router.route("a", CallHints::new()).unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::LoadBalanced);
        assert_eq!(decision.persona_id, "cfo");

        // cfo now carries one call, the next idle executive by priority is cto
        let decision = router.route("b", CallHints::new()).unwrap();
        assert_eq!(decision.persona_id, "cto");
    }

    #[test]
    fn acquire_respects_capacity() {
        let router = router(Tier::Tier1);
        let clo = PersonaId::from("clo");
        let max = router.persona(&clo).unwrap().max_concurrent_calls;
        for _ in 0..max {
            router.acquire(&clo).unwrap();
        }
        assert!(matches!(
            router.acquire(&clo),
            Err(Error::CapacityExceeded { .. })
        ));
        assert!(router.acquire(&PersonaId::from("coo")).is_err());
    }

    #[test]
    fn release_is_floored_at_zero() {
        let router = router(Tier::Tier1);
        let cfo = PersonaId::from("cfo");
        assert_eq!(router.release(&cfo).unwrap(), 0);
        assert!(matches!(
            router.release(&PersonaId::from("cxo")),
            Err(Error::PersonaNotFound(_))
        ));
    }

    #[test]
    fn rules_are_kept_in_evaluation_order() {
        let router = router(Tier::Tier1);
        router.add_rule(RoutingRule::new("low", 1, "cmo")).unwrap();
        router.add_rule(RoutingRule::new("high", 10, "cfo")).unwrap();
        router.add_rule(RoutingRule::new("low-2", 1, "cto")).unwrap();

        let ids: Vec<String> = router.rules().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["high", "low", "low-2"]);

        assert!(router.add_rule(RoutingRule::new("high", 3, "cfo")).is_err());
        assert!(router.add_rule(RoutingRule::new("ghost", 3, "cxo")).is_err());

        assert!(router.remove_rule("high"));
        assert!(!router.remove_rule("high"));
        assert_eq!(router.rules().len(), 2);
    }

    #[test]
    fn rule_for_disallowed_persona_falls_through() {
        let router = router(Tier::Tier1);
        router
            .add_rule(RoutingRule::new("ops", 10, "coo").with_keywords(["logistics"]))
            .unwrap();

        let decision = router
            .route("a", CallHints::new().keywords(["logistics"]))
            .unwrap();
        assert_ne!(decision.persona_id, "coo");
        assert_eq!(decision.strategy, RoutingStrategy::LoadBalanced);
    }

    #[test]
    fn offline_personas_are_skipped() {
        let router = router(Tier::Tier1);
        for id in ["cfo", "cto", "cmo", "clo"] {
            router
                .set_availability(&PersonaId::from(id), Availability::Offline)
                .unwrap();
        }
        let decision = router.route("a", CallHints::new()).unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::Fallback);
        assert_eq!(decision.persona_id, SYSTEM_PERSONA_ID);
        assert_eq!(router.available_count(), 1);
    }

    #[test]
    fn downgrade_excludes_removed_personas_from_load() {
        let router = router(Tier::Tier2);
        let gate = TierGate::new(default_tiers()).unwrap();
        let coo = PersonaId::new("coo");
        for _ in 0..3 {
            router.acquire(&coo).unwrap();
        }
        assert_eq!(router.bounded_load(), 3);

        router.apply_tier(&gate, Tier::Tier1).unwrap();

        assert_eq!(router.bounded_load(), 0);
        assert!(router.bounded_load() <= router.total_capacity());
        assert_eq!(router.persona(&coo).unwrap().current_load, 3);
    }

    #[test]
    fn apply_tier_widens_allowed_set() {
        let router = router(Tier::Tier1);
        let gate = TierGate::new(default_tiers()).unwrap();
        let before = router.snapshot().len();

        router.apply_tier(&gate, Tier::Tier2).unwrap();
        let after = router.snapshot();
        assert!(after.len() > before);
        assert!(after.iter().any(|p| p.id == "coo"));
    }

    #[test]
    fn bounded_fallback_is_rejected() {
        let mut catalog = default_catalog();
        catalog[0].max_concurrent_calls = 3;
        let result = CallRouter::new(
            catalog.clone(),
            &catalog,
            PersonaId::from(SYSTEM_PERSONA_ID),
            Arc::new(SessionStore::default()),
            EventBus::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn routing_records_history() {
        let history = Arc::new(SessionStore::default());
        let catalog = default_catalog();
        let router = CallRouter::new(
            catalog.clone(),
            &catalog,
            PersonaId::from(SYSTEM_PERSONA_ID),
            Arc::clone(&history),
            EventBus::default(),
        )
        .unwrap();
        router
            .add_rule(RoutingRule::new("repeat", 5, "clo").with_min_prior_interactions(1))
            .unwrap();

        let first = router.route("+1555", CallHints::new()).unwrap();
        assert_ne!(first.rule_id.as_deref(), Some("repeat"));

        let second = router.route("+1555", CallHints::new()).unwrap();
        assert_eq!(second.rule_id.as_deref(), Some("repeat"));
        assert_eq!(second.context.prior_interactions, 1);
        assert_eq!(history.prior_interactions("+1555"), 2);
    }
}
