//! Factories, factory providers and subject filter construction.

use std::sync::Arc;

use horizon_observer::{
    ACTIVITY_POLICY_FILTER_TAG, Category, Factory, FactoryItemId, FactoryProvider,
    InstanceFactoryInfo, NAMING_POLICY_FILTER_TAG, ObjectManager, ObserverError, Ownership,
    SUBJECT_FILTERS_CATEGORY, SubjectFilter, SubjectTypeFilter,
};
use horizon_observer_core::{ObjectId, TypeInfo};

#[test]
fn duplicate_tags_keep_the_first_registration() {
    let mut factory: Factory<&'static str> = Factory::new("Shapes");
    assert!(factory.register_factory_interface(|| "circle", FactoryItemId::from("Circle")));
    assert!(!factory.register_factory_interface(|| "imposter", FactoryItemId::from("Circle")));
    assert_eq!(factory.create_instance("Circle"), Some("circle"));
    assert_eq!(factory.create_instance("Square"), None);
    assert_eq!(factory.len(), 1);
}

#[test]
fn builtin_subject_filters_are_constructible() {
    let manager = ObjectManager::new();
    let tags = manager.subject_filter_tags();
    assert!(tags.contains(&ACTIVITY_POLICY_FILTER_TAG.to_string()));
    assert!(tags.contains(&NAMING_POLICY_FILTER_TAG.to_string()));

    let observer = manager.create_observer("Filtered");
    let filter = manager
        .create_subject_filter(NAMING_POLICY_FILTER_TAG)
        .unwrap();
    observer.install_subject_filter(filter).unwrap();
    assert!(observer.naming_filter().is_some());

    // Every construction is a new, unbound instance.
    let first = manager.create_subject_filter(ACTIVITY_POLICY_FILTER_TAG).unwrap();
    let second = manager.create_subject_filter(ACTIVITY_POLICY_FILTER_TAG).unwrap();
    assert!(!first.same_instance(&second));
}

#[test]
fn custom_subject_filters_can_be_registered() {
    let manager = ObjectManager::new();
    let registered = manager.register_subject_filter(
        || SubjectFilter::from(SubjectTypeFilter::new("Documents")),
        FactoryItemId::new("DocumentFilter", Category::from(SUBJECT_FILTERS_CATEGORY)),
    );
    assert!(registered);
    assert!(!manager.register_subject_filter(
        || SubjectFilter::from(SubjectTypeFilter::new("Again")),
        FactoryItemId::new("DocumentFilter", Category::from(SUBJECT_FILTERS_CATEGORY)),
    ));
    let filter = manager.create_subject_filter("DocumentFilter").unwrap();
    assert_eq!(filter.as_subject_type().unwrap().group_name(), "Documents");
}

struct Shelf;

impl FactoryProvider for Shelf {
    fn provided_factories(&self) -> Vec<String> {
        vec!["Shelf".to_string()]
    }

    fn provided_factory_tags(&self, factory_name: &str) -> Vec<String> {
        match factory_name {
            "Shelf" => vec!["Book".to_string()],
            _ => Vec::new(),
        }
    }

    fn create_instance(&self, manager: &ObjectManager, info: &InstanceFactoryInfo) -> Option<ObjectId> {
        let obj = manager.create_object(info.instance_name.clone(), TypeInfo::new("Book"));
        manager.register_object(obj, None).ok()?;
        Some(obj)
    }
}

#[test]
fn providers_build_instances_by_factory_and_tag() {
    let manager = ObjectManager::new();
    manager.register_factory_provider(Arc::new(Shelf)).unwrap();
    assert!(matches!(
        manager.register_factory_provider(Arc::new(Shelf)),
        Err(ObserverError::FactoryConflict(name)) if name == "Shelf"
    ));

    let book = manager
        .create_instance(&InstanceFactoryInfo::new("Shelf", "Book", "Dune"))
        .unwrap();
    assert_eq!(manager.registry().object_name(book).unwrap(), "Dune");
    assert_eq!(
        manager.global_pool().subject_ownership(book),
        Some(Ownership::Manual)
    );
    assert!(manager
        .create_instance(&InstanceFactoryInfo::new("Shelf", "Magazine", "x"))
        .is_none());
}
