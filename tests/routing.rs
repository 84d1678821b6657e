//! Call routing integration tests

use std::sync::Arc;

use sovren_voice::config::Config;
use sovren_voice::events::{CallEvent, EventBus};
use sovren_voice::persona::SYSTEM_PERSONA_ID;
use sovren_voice::router::{RoutingRule, Urgency};
use sovren_voice::{CallHints, CallRouter, PersonaId, RoutingStrategy, SessionStore, Tier};

fn router_for(tier: Tier) -> CallRouter {
    let config = Config {
        tier,
        ..Config::default()
    };
    CallRouter::from_config(
        &config,
        Arc::new(SessionStore::new(&config.sessions)),
        EventBus::default(),
    )
    .unwrap()
}

fn budget_call() -> CallHints {
    CallHints::new().keywords(["budget", "Q3"])
}

#[test]
fn keyword_rule_assigns_cfo() {
    let router = router_for(Tier::Tier1);

    let decision = router.route("+15550100", budget_call()).unwrap();

    assert_eq!(decision.persona_id, PersonaId::new("cfo"));
    assert_eq!(decision.strategy, RoutingStrategy::Rule);
    assert_eq!(decision.rule_id.as_deref(), Some("finance"));
    assert_eq!(router.persona(&PersonaId::new("cfo")).unwrap().current_load, 1);
}

#[test]
fn full_cfo_is_never_assigned() {
    let router = router_for(Tier::Tier1);
    let cfo = PersonaId::new("cfo");
    let max = router.persona(&cfo).unwrap().max_concurrent_calls;

    for i in 0..max {
        let decision = router.route(&format!("+1555010{i}"), budget_call()).unwrap();
        assert_eq!(decision.persona_id, cfo);
    }

    let overflow = router.route("+15550199", budget_call()).unwrap();
    assert_ne!(overflow.persona_id, cfo);
    assert_eq!(overflow.strategy, RoutingStrategy::LoadBalanced);
    assert_eq!(router.persona(&cfo).unwrap().current_load, max);
}

#[test]
fn basic_tier_skips_rules_for_excluded_personas() {
    let router = router_for(Tier::Tier1);

    let decision = router
        .route("+15550100", CallHints::new().keywords(["logistics"]))
        .unwrap();

    assert_ne!(decision.persona_id, PersonaId::new("coo"));
    assert_eq!(decision.strategy, RoutingStrategy::LoadBalanced);
    assert_eq!(router.persona(&PersonaId::new("coo")).unwrap().current_load, 0);
}

#[test]
fn full_tier_reaches_coo() {
    let router = router_for(Tier::Tier2);

    let decision = router
        .route("+15550100", CallHints::new().keywords(["logistics"]))
        .unwrap();

    assert_eq!(decision.persona_id, PersonaId::new("coo"));
}

#[test]
fn load_never_exceeds_capacity_and_fallback_absorbs_overflow() {
    let router = router_for(Tier::Tier1);
    let bounded = router.total_capacity();

    // Twice the bounded capacity, all with no matching rule
    for i in 0..bounded * 2 {
        router.route(&format!("caller-{i}"), CallHints::new()).unwrap();
    }

    for persona in router.snapshot() {
        if !persona.is_unbounded() {
            assert!(
                persona.current_load <= persona.max_concurrent_calls,
                "{} over capacity",
                persona.id
            );
        }
    }
    assert_eq!(router.bounded_load(), bounded);
    let fallback = router.persona(&PersonaId::new(SYSTEM_PERSONA_ID)).unwrap();
    assert_eq!(u64::from(fallback.current_load), bounded);
}

#[test]
fn release_frees_capacity_for_rules_again() {
    let router = router_for(Tier::Tier1);
    let cfo = PersonaId::new("cfo");
    let max = router.persona(&cfo).unwrap().max_concurrent_calls;
    for i in 0..max {
        router.route(&format!("c{i}"), budget_call()).unwrap();
    }
    assert_ne!(router.route("overflow", budget_call()).unwrap().persona_id, cfo);

    router.release(&cfo).unwrap();

    assert_eq!(router.route("again", budget_call()).unwrap().persona_id, cfo);
}

#[test]
fn critical_calls_escalate_to_system_persona() {
    let router = router_for(Tier::Tier1);

    let decision = router
        .route(
            "+15550100",
            CallHints::new().urgency(Urgency::Critical).keywords(["budget"]),
        )
        .unwrap();

    assert_eq!(decision.persona_id, PersonaId::new(SYSTEM_PERSONA_ID));
    assert_eq!(decision.rule_id.as_deref(), Some("critical-escalation"));
    assert!(decision.actions.unwrap().record_call);
}

#[test]
fn caller_pattern_rules_take_precedence_by_priority() {
    let router = router_for(Tier::Tier1);
    router
        .add_rule(
            RoutingRule::new("board-members", 500, "clo").with_caller_pattern(r"^\+1555099\d+$"),
        )
        .unwrap();

    let board = router.route("+155509912", budget_call()).unwrap();
    let other = router.route("+15550100", budget_call()).unwrap();

    assert_eq!(board.persona_id, PersonaId::new("clo"));
    assert_eq!(other.persona_id, PersonaId::new("cfo"));
}

#[test]
fn rules_for_unknown_personas_are_rejected() {
    let router = router_for(Tier::Tier1);
    assert!(router.add_rule(RoutingRule::new("ghost", 10, "cio")).is_err());
}

#[test]
fn free_text_is_turned_into_keywords() {
    let router = router_for(Tier::Tier1);

    let decision = router
        .route(
            "+15550100",
            CallHints::new().text("We need to review the marketing campaign launch"),
        )
        .unwrap();

    assert_eq!(decision.persona_id, PersonaId::new("cmo"));
}

#[test]
fn prior_interactions_are_counted_per_caller() {
    let router = router_for(Tier::Tier1);
    let vip = RoutingRule::new("returning-callers", 300, "cto").with_min_prior_interactions(2);
    router.add_rule(vip).unwrap();

    let first = router.route("+15550100", budget_call()).unwrap();
    let second = router.route("+15550100", budget_call()).unwrap();
    let third = router.route("+15550100", budget_call()).unwrap();

    assert_eq!(first.persona_id, PersonaId::new("cfo"));
    assert_eq!(second.persona_id, PersonaId::new("cfo"));
    assert_eq!(third.persona_id, PersonaId::new("cto"));
    assert_eq!(third.context.prior_interactions, 2);
}

#[tokio::test]
async fn routing_emits_assignment_events() {
    let config = Config::default();
    let events = EventBus::default();
    let mut rx = events.subscribe_calls();
    let router = CallRouter::from_config(
        &config,
        Arc::new(SessionStore::new(&config.sessions)),
        events,
    )
    .unwrap();

    router.route("+15550100", budget_call()).unwrap();
    router.release(&PersonaId::new("cfo")).unwrap();

    match rx.recv().await.unwrap() {
        CallEvent::PersonaAssigned {
            persona_id, rule_id, ..
        } => {
            assert_eq!(persona_id, PersonaId::new("cfo"));
            assert_eq!(rule_id.as_deref(), Some("finance"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match rx.recv().await.unwrap() {
        CallEvent::PersonaReleased { current_load, .. } => assert_eq!(current_load, 0),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn concurrent_routing_never_oversubscribes() {
    let router = Arc::new(router_for(Tier::Tier1));
    let cfo = PersonaId::new("cfo");

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let router = Arc::clone(&router);
            std::thread::spawn(move || router.route(&format!("t{i}"), budget_call()).unwrap())
        })
        .collect();
    let assigned_cfo = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|d| d.persona_id == cfo)
        .count();

    let max = router.persona(&cfo).unwrap().max_concurrent_calls;
    assert_eq!(assigned_cfo, max as usize);
    assert_eq!(router.persona(&cfo).unwrap().current_load, max);
}
