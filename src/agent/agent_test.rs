use zbus::zvariant::{ObjectPath, OwnedObjectPath};

use crate::agent::{
    builtin_rules, sanitize_bus_name, AgentError, AgentRegistry, AgentRule, RegisterOutcome,
    UnregisterOutcome,
};

static SECRET_RULE: AgentRule = AgentRule {
    source_bus_name: "com.example.Svc",
    manager_path: "/com/example/Svc/AgentManager",
    manager_interface: "com.example.Svc.AgentManager",
    register_method: "Register",
    unregister_method: "Unregister",
    path_customizable: false,
    client_object_path: "/com/example/Svc/Agent",
    client_interface: "com.example.Svc.Agent",
    client_methods: &["GetSecrets", "CancelGetSecrets"],
};

static PAIRING_RULE: AgentRule = AgentRule {
    source_bus_name: "com.example.Svc",
    manager_path: "/com/example/Svc",
    manager_interface: "com.example.Svc.PairingManager",
    register_method: "RegisterAgent",
    unregister_method: "UnregisterAgent",
    path_customizable: true,
    client_object_path: "",
    client_interface: "com.example.Svc.PairingAgent",
    client_methods: &["RequestConfirmation", "Cancel"],
};

fn registry(promote_secondary: bool) -> AgentRegistry {
    AgentRegistry::with_rules(vec![&SECRET_RULE, &PAIRING_RULE], promote_secondary)
}

fn fixed_path() -> OwnedObjectPath {
    ObjectPath::try_from(SECRET_RULE.client_object_path)
        .unwrap()
        .into()
}

#[test]
fn matches_builtin_network_manager_rule() {
    let registry = AgentRegistry::new("org.freedesktop.NetworkManager", false);
    let rule = registry
        .match_register(
            "/org/freedesktop/NetworkManager/AgentManager",
            "org.freedesktop.NetworkManager.AgentManager",
            "Register",
        )
        .unwrap();
    assert_eq!(rule.client_interface, "org.freedesktop.NetworkManager.SecretAgent");
    assert!(registry
        .match_register("/somewhere/else", rule.manager_interface, "Register")
        .is_none());
}

#[test]
fn rules_for_other_services_are_inactive() {
    let registry = AgentRegistry::new("com.example.Unrelated", false);
    for rule in builtin_rules() {
        assert!(registry
            .match_register(rule.manager_path, rule.manager_interface, rule.register_method)
            .is_none());
    }
}

#[test]
fn first_registration_is_primary() {
    let mut registry = registry(false);
    let outcome = registry
        .register(&SECRET_RULE, ":1.10", fixed_path())
        .unwrap();
    assert_eq!(outcome, RegisterOutcome::Primary(fixed_path()));
    assert!(registry.is_primary(":1.10", fixed_path().as_str()));
}

#[test]
fn second_owner_becomes_secondary() {
    let mut registry = registry(false);
    registry
        .register(&SECRET_RULE, ":1.10", fixed_path())
        .unwrap();
    let outcome = registry
        .register(&SECRET_RULE, ":1.11", fixed_path())
        .unwrap();
    assert_eq!(outcome, RegisterOutcome::Secondary(fixed_path()));
    assert_eq!(registry.len(), 2);
    assert!(!registry.is_primary(":1.11", fixed_path().as_str()));
}

#[test]
fn duplicate_registration_is_tolerated() {
    let mut registry = registry(false);
    registry
        .register(&SECRET_RULE, ":1.10", fixed_path())
        .unwrap();
    let outcome = registry
        .register(&SECRET_RULE, ":1.10", fixed_path())
        .unwrap();
    assert_eq!(outcome, RegisterOutcome::Duplicate);
    assert_eq!(registry.len(), 1);
}

#[test]
fn customizable_rule_computes_surrogate_path() {
    let mut registry = registry(false);
    let client_path: OwnedObjectPath = ObjectPath::try_from("/client/agent").unwrap().into();
    let outcome = registry
        .register(&PAIRING_RULE, ":1.42", client_path)
        .unwrap();
    let RegisterOutcome::Primary(surrogate) = outcome else {
        panic!("expected a primary registration");
    };
    assert_eq!(surrogate.as_str(), "/client/agent/_1_42");
}

#[test]
fn customizable_rule_requires_path_argument() {
    let err = AgentRegistry::client_path_for(&PAIRING_RULE, None).unwrap_err();
    assert!(matches!(err, AgentError::MissingPathArgument));
}

#[test]
fn callbacks_route_to_the_primary_owner() {
    let mut registry = registry(false);
    registry
        .register(&SECRET_RULE, ":1.10", fixed_path())
        .unwrap();
    registry
        .register(&SECRET_RULE, ":1.11", fixed_path())
        .unwrap();

    let (callback_owner, client_path) = registry
        .lookup_owner(fixed_path().as_str(), SECRET_RULE.client_interface, "GetSecrets")
        .unwrap();
    assert_eq!(callback_owner, ":1.10");
    assert_eq!(client_path, fixed_path());

    assert!(registry
        .lookup_owner(fixed_path().as_str(), SECRET_RULE.client_interface, "Frobnicate")
        .is_none());
    assert!(registry
        .lookup_owner("/elsewhere", SECRET_RULE.client_interface, "GetSecrets")
        .is_none());
}

#[test]
fn unregistering_primary_keeps_survivors_live() {
    let mut registry = registry(false);
    registry
        .register(&SECRET_RULE, ":1.10", fixed_path())
        .unwrap();
    registry
        .register(&SECRET_RULE, ":1.11", fixed_path())
        .unwrap();

    let (outcome, _) = registry.unregister(&SECRET_RULE, ":1.10", None);
    assert_eq!(outcome, UnregisterOutcome::Local);
    assert!(registry.is_primary(":1.11", fixed_path().as_str()));

    let (outcome, _) = registry.unregister(&SECRET_RULE, ":1.11", None);
    assert_eq!(outcome, UnregisterOutcome::Forward(fixed_path()));
    assert!(registry.is_empty());
}

#[test]
fn unregister_without_registration_is_forwarded_unchanged() {
    let mut registry = registry(false);
    let (outcome, _) = registry.unregister(&SECRET_RULE, ":1.10", None);
    assert_eq!(outcome, UnregisterOutcome::NotRegistered);
}

#[test]
fn vanished_primary_unregisters_at_the_service() {
    let mut registry = registry(false);
    registry
        .register(&SECRET_RULE, ":1.10", fixed_path())
        .unwrap();
    registry
        .register(&SECRET_RULE, ":1.11", fixed_path())
        .unwrap();

    let (unregisters, _) = registry.remove_owner(":1.10");
    assert_eq!(unregisters.len(), 1);
    assert_eq!(unregisters[0].unique_object_path, fixed_path());
    // The survivor takes over the table entry even in parity mode
    assert!(registry.is_primary(":1.11", fixed_path().as_str()));
}

#[test]
fn promotion_keeps_the_service_side_agent() {
    let mut registry = registry(true);
    registry
        .register(&SECRET_RULE, ":1.10", fixed_path())
        .unwrap();
    registry
        .register(&SECRET_RULE, ":1.11", fixed_path())
        .unwrap();

    let (unregisters, _) = registry.remove_owner(":1.10");
    assert!(unregisters.is_empty());
    assert!(registry.is_primary(":1.11", fixed_path().as_str()));

    // The last owner going away always reaches the service
    let (unregisters, _) = registry.remove_owner(":1.11");
    assert_eq!(unregisters.len(), 1);
    assert!(registry.is_empty());
}

#[test]
fn vanished_secondary_is_dropped_silently() {
    let mut registry = registry(false);
    registry
        .register(&SECRET_RULE, ":1.10", fixed_path())
        .unwrap();
    registry
        .register(&SECRET_RULE, ":1.11", fixed_path())
        .unwrap();

    let (unregisters, _) = registry.remove_owner(":1.11");
    assert!(unregisters.is_empty());
    assert_eq!(registry.len(), 1);
    assert!(registry.is_primary(":1.10", fixed_path().as_str()));
}

#[test]
fn oldest_secondary_wins_promotion() {
    let mut registry = registry(true);
    registry
        .register(&SECRET_RULE, ":1.10", fixed_path())
        .unwrap();
    registry
        .register(&SECRET_RULE, ":1.11", fixed_path())
        .unwrap();
    registry
        .register(&SECRET_RULE, ":1.12", fixed_path())
        .unwrap();

    registry.remove_owner(":1.10");
    assert!(registry.is_primary(":1.11", fixed_path().as_str()));
    assert!(!registry.is_primary(":1.12", fixed_path().as_str()));
}

#[test]
fn sanitizes_unusual_sender_names() {
    assert_eq!(sanitize_bus_name(":1.10"), "_1_10");
    assert_eq!(sanitize_bus_name("org.example.App"), "org_example_App");
}
