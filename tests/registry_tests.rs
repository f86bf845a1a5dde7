use chrono::{Duration, Utc};
use uuid::Uuid;

use supervaize_controller::identity::generate_keypair;
use supervaize_controller::registry::{AgentRegistry, AgentStatus, CapabilitySet};
use supervaize_controller::ControllerError;

fn caps(tags: &[&str]) -> CapabilitySet {
    CapabilitySet::parse(tags).unwrap()
}

fn active_agent(registry: &mut AgentRegistry, tags: &[&str]) -> Uuid {
    let now = Utc::now();
    let id = registry
        .register(generate_keypair().public(), caps(tags), now)
        .unwrap();
    registry.activate(id, now).unwrap();
    id
}

#[test]
fn test_register_starts_pending() {
    let mut registry = AgentRegistry::new();
    let key = generate_keypair().public();
    let id = registry.register(key, caps(&["ocr"]), Utc::now()).unwrap();

    let agent = registry.get(id).unwrap();
    assert_eq!(agent.status, AgentStatus::Pending);
    assert_eq!(agent.public_key, key);
    assert_eq!(registry.by_public_key(&key).unwrap().id, id);
}

#[test]
fn test_duplicate_key_rejected_with_existing_id() {
    let mut registry = AgentRegistry::new();
    let key = generate_keypair().public();
    let id = registry.register(key, caps(&["ocr"]), Utc::now()).unwrap();

    let err = registry
        .register(key, caps(&["other"]), Utc::now())
        .unwrap_err();
    assert!(matches!(err, ControllerError::AlreadyRegistered(existing) if existing == id));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_empty_capabilities_rejected() {
    let mut registry = AgentRegistry::new();
    let err = registry
        .register(generate_keypair().public(), CapabilitySet::default(), Utc::now())
        .unwrap_err();
    assert!(matches!(err, ControllerError::InvalidRequest(_)));
    assert!(registry.is_empty());
}

#[test]
fn test_heartbeat_activates_and_returns_previous_status() {
    let mut registry = AgentRegistry::new();
    let id = registry
        .register(generate_keypair().public(), caps(&["ocr"]), Utc::now())
        .unwrap();

    assert_eq!(registry.heartbeat(id, Utc::now()).unwrap(), AgentStatus::Pending);
    assert_eq!(registry.heartbeat(id, Utc::now()).unwrap(), AgentStatus::Active);
    assert!(registry.get(id).unwrap().is_active());
}

#[test]
fn test_unknown_agent() {
    let mut registry = AgentRegistry::new();
    let id = Uuid::new_v4();
    assert!(matches!(
        registry.heartbeat(id, Utc::now()),
        Err(ControllerError::UnknownAgent(missing)) if missing == id
    ));
    assert!(matches!(registry.get(id), Err(ControllerError::UnknownAgent(_))));
}

#[test]
fn test_revoked_agent_cannot_come_back() {
    let mut registry = AgentRegistry::new();
    let key = generate_keypair().public();
    let id = registry.register(key, caps(&["ocr"]), Utc::now()).unwrap();
    registry.activate(id, Utc::now()).unwrap();
    registry.revoke(id, Utc::now()).unwrap();

    assert!(matches!(
        registry.heartbeat(id, Utc::now()),
        Err(ControllerError::InvalidTransition { .. })
    ));
    assert!(matches!(
        registry.register(key, caps(&["ocr"]), Utc::now()),
        Err(ControllerError::AgentRevoked(existing)) if existing == id
    ));
    // revoking twice is a no-op
    assert!(registry.revoke(id, Utc::now()).unwrap().is_empty());
}

#[test]
fn test_mark_unreachable_only_from_active() {
    let mut registry = AgentRegistry::new();
    let id = registry
        .register(generate_keypair().public(), caps(&["ocr"]), Utc::now())
        .unwrap();

    assert!(matches!(
        registry.mark_unreachable(id, Utc::now()),
        Err(ControllerError::InvalidTransition { .. })
    ));

    registry.activate(id, Utc::now()).unwrap();
    registry.mark_unreachable(id, Utc::now()).unwrap();
    assert_eq!(registry.get(id).unwrap().status, AgentStatus::Unreachable);

    // a heartbeat brings it back
    assert_eq!(
        registry.heartbeat(id, Utc::now()).unwrap(),
        AgentStatus::Unreachable
    );
    assert!(registry.get(id).unwrap().is_active());
}

#[test]
fn test_losing_an_agent_returns_its_jobs() {
    let mut registry = AgentRegistry::new();
    let id = active_agent(&mut registry, &["ocr"]);
    let (j1, j2) = (Uuid::new_v4(), Uuid::new_v4());
    registry.record_assignment(id, j1, Utc::now()).unwrap();
    registry.record_assignment(id, j2, Utc::now()).unwrap();
    assert_eq!(registry.get(id).unwrap().pending_count(), 2);

    let mut released = registry.mark_unreachable(id, Utc::now()).unwrap();
    released.sort();
    let mut expected = vec![j1, j2];
    expected.sort();
    assert_eq!(released, expected);
    assert_eq!(registry.get(id).unwrap().pending_count(), 0);
}

#[test]
fn test_find_eligible_filters_by_status_and_capability() {
    let mut registry = AgentRegistry::new();
    let ocr = active_agent(&mut registry, &["ocr"]);
    let _translate = active_agent(&mut registry, &["translate.*"]);
    let pending = registry
        .register(generate_keypair().public(), caps(&["ocr"]), Utc::now())
        .unwrap();

    let eligible: Vec<Uuid> = registry.find_eligible("ocr").iter().map(|a| a.id).collect();
    assert_eq!(eligible, vec![ocr]);
    assert!(!eligible.contains(&pending));

    assert_eq!(registry.find_eligible("translate.fr").len(), 1);
    assert!(registry.find_eligible("summarize").is_empty());
}

#[test]
fn test_find_eligible_orders_least_recently_assigned_first() {
    let mut registry = AgentRegistry::new();
    let a = active_agent(&mut registry, &["ocr"]);
    let b = active_agent(&mut registry, &["ocr"]);
    let c = active_agent(&mut registry, &["ocr"]);

    // never-assigned agents come first, ordered by id
    let mut fresh = vec![a, b, c];
    fresh.sort();
    let order: Vec<Uuid> = registry.find_eligible("ocr").iter().map(|x| x.id).collect();
    assert_eq!(order, fresh);

    let first = fresh[0];
    registry
        .record_assignment(first, Uuid::new_v4(), Utc::now())
        .unwrap();
    let order: Vec<Uuid> = registry.find_eligible("ocr").iter().map(|x| x.id).collect();
    assert_eq!(order, vec![fresh[1], fresh[2], first]);

    registry
        .record_assignment(fresh[1], Uuid::new_v4(), Utc::now())
        .unwrap();
    let order: Vec<Uuid> = registry.find_eligible("ocr").iter().map(|x| x.id).collect();
    assert_eq!(order, vec![fresh[2], first, fresh[1]]);
}

#[test]
fn test_record_assignment_requires_active() {
    let mut registry = AgentRegistry::new();
    let id = registry
        .register(generate_keypair().public(), caps(&["ocr"]), Utc::now())
        .unwrap();
    assert!(registry
        .record_assignment(id, Uuid::new_v4(), Utc::now())
        .is_err());
}

#[test]
fn test_stale_agents() {
    let mut registry = AgentRegistry::new();
    let id = active_agent(&mut registry, &["ocr"]);
    let timeout = Duration::seconds(15);

    assert!(registry.stale_agents(timeout, Utc::now()).is_empty());
    let later = Utc::now() + Duration::seconds(16);
    assert_eq!(registry.stale_agents(timeout, later), vec![id]);
}

#[test]
fn test_purge_expired_frees_the_key() {
    let mut registry = AgentRegistry::new();
    let key = generate_keypair().public();
    let now = Utc::now();
    let id = registry.register(key, caps(&["ocr"]), now).unwrap();
    registry.activate(id, now).unwrap();
    registry.mark_unreachable(id, now).unwrap();

    let expiry = Duration::minutes(10);
    assert!(registry.purge_expired(expiry, now + Duration::minutes(5)).is_empty());
    assert_eq!(
        registry.purge_expired(expiry, now + Duration::minutes(11)),
        vec![id]
    );
    assert!(registry.get(id).is_err());

    let new_id = registry.register(key, caps(&["ocr"]), Utc::now()).unwrap();
    assert_ne!(new_id, id);
}

#[test]
fn test_list_is_paginated_in_registration_order() {
    let mut registry = AgentRegistry::new();
    let base = Utc::now();
    let ids: Vec<Uuid> = (0..5)
        .map(|i| {
            registry
                .register(
                    generate_keypair().public(),
                    caps(&["ocr"]),
                    base + Duration::seconds(i),
                )
                .unwrap()
        })
        .collect();

    let page: Vec<Uuid> = registry.list(1, 2).iter().map(|a| a.id).collect();
    assert_eq!(page, ids[1..3].to_vec());
    assert_eq!(registry.list(10, 2).len(), 0);
}
