use std::sync::Arc;

use ossature::bones::{Bone, Configure, RelationalBone, StringBone};
use ossature::registry::{Origin, SkeletonRegistry};
use ossature::skeleton::{SkeletonBuilder, SkeletonDefinition};
use ossature::OssatureError;

fn user(descr: &str) -> Arc<SkeletonDefinition> {
    SkeletonBuilder::new("user")
        .bone("name", StringBone::new(descr))
        .build()
        .unwrap()
}

fn descr_of(definition: &Arc<SkeletonDefinition>) -> String {
    definition.instance().get("name").unwrap().params().descr.clone()
}

#[test]
fn new_kinds_are_listed_in_registration_order() {
    let registry = SkeletonRegistry::new();
    registry.register(user("Name"), Origin::Framework).unwrap();
    let page = SkeletonBuilder::new("page").build().unwrap();
    registry
        .register(page, Origin::Application("app/page".into()))
        .unwrap();
    assert_eq!(registry.list_kinds().unwrap(), vec!["user", "page"]);
    assert_eq!(registry.lookup("page").unwrap().kind(), "page");
}

#[test]
fn application_overrides_framework() {
    let registry = SkeletonRegistry::new();
    registry.register(user("framework"), Origin::Framework).unwrap();
    let effective = registry
        .register(user("application"), Origin::Application("app/user".into()))
        .unwrap();
    assert_eq!(descr_of(&effective), "application");
    assert_eq!(descr_of(&registry.lookup("user").unwrap()), "application");
}

#[test]
fn framework_never_replaces_application() {
    let registry = SkeletonRegistry::new();
    registry
        .register(user("application"), Origin::Application("app/user".into()))
        .unwrap();
    let effective = registry.register(user("framework"), Origin::Framework).unwrap();
    assert_eq!(descr_of(&effective), "application");
    assert_eq!(descr_of(&registry.lookup("user").unwrap()), "application");
}

#[test]
fn two_applications_conflict() {
    let registry = SkeletonRegistry::new();
    registry
        .register(user("first"), Origin::Application("app/a".into()))
        .unwrap();
    let result = registry.register(user("second"), Origin::Application("app/b".into()));
    assert!(matches!(result, Err(OssatureError::Definition(_))));
    // re-registering from the same source replaces the definition
    registry
        .register(user("again"), Origin::Application("app/a".into()))
        .unwrap();
    assert_eq!(descr_of(&registry.lookup("user").unwrap()), "again");
    assert_eq!(registry.list_kinds().unwrap().len(), 1);
}

#[test]
fn empty_kind_is_not_stored() {
    let registry = SkeletonRegistry::new();
    let abstract_skel = SkeletonBuilder::new("").build().unwrap();
    registry.register(abstract_skel, Origin::Framework).unwrap();
    assert!(registry.list_kinds().unwrap().is_empty());
}

#[test]
fn unknown_kind_lookup_fails() {
    let registry = SkeletonRegistry::new();
    assert!(matches!(
        registry.lookup("missing"),
        Err(OssatureError::UnknownKind(_))
    ));
}

#[test]
fn invalid_definitions_are_rejected() {
    assert!(SkeletonBuilder::new("x")
        .bone("title", StringBone::new("Title").languages(&["en"]))
        .enforce_unique_values_for("title", None)
        .build()
        .is_err());
    assert!(SkeletonBuilder::new("x")
        .bone("ref", RelationalBone::new("Ref", "user").languages(&["en"]))
        .build()
        .is_err());
    assert!(SkeletonBuilder::new("x")
        .enforce_unique_values_for("nothing", Some("taken"))
        .build()
        .is_err());
    assert!(SkeletonBuilder::new("x")
        .bone("amount", StringBone::new("Amount"))
        .build()
        .is_err());
}

#[test]
fn global_registry_is_shared() {
    let definition = SkeletonBuilder::new("registry_rules_global")
        .bone("name", StringBone::new("Name"))
        .build()
        .unwrap();
    ossature::registry::register(definition, Origin::Framework).unwrap();
    assert_eq!(
        ossature::registry::skeleton_by_kind("registry_rules_global")
            .unwrap()
            .kind(),
        "registry_rules_global"
    );
    assert!(ossature::registry::list_known_skeletons()
        .unwrap()
        .contains(&"registry_rules_global".to_string()));
}
