//! Activity policy scenarios.

use std::sync::Arc;

use horizon_observer::{
    ActivityPolicy, ActivityPolicyFilter, MinimumActivityPolicy, NewSubjectActivityPolicy,
    ObjectManager, Observer, Ownership, PropertyChangeOutcome,
};
use horizon_observer_core::{ObjectId, TypeInfo, names};
use parking_lot::Mutex;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

fn observer_with(
    manager: &ObjectManager,
    configure: impl FnOnce(&ActivityPolicyFilter),
) -> (Arc<Observer>, Arc<ActivityPolicyFilter>) {
    let observer = manager.create_observer("Root");
    let filter = ActivityPolicyFilter::new();
    configure(&filter);
    observer.install_subject_filter(filter).unwrap();
    let filter = observer.activity_filter().unwrap();
    (observer, filter)
}

fn attach_items(manager: &ObjectManager, observer: &Observer, names: &[&str]) -> Vec<ObjectId> {
    names
        .iter()
        .map(|name| {
            let obj = manager.create_object(*name, TypeInfo::new("Item"));
            observer.attach_subject(obj, Ownership::Manual).unwrap();
            obj
        })
        .collect()
}

#[test]
fn set_active_then_invert() {
    init_tracing();
    let manager = ObjectManager::new();
    let (root, filter) = observer_with(&manager, |f| {
        f.set_activity_policy(ActivityPolicy::MultipleActivity).unwrap();
        f.set_new_subject_activity_policy(NewSubjectActivityPolicy::SetNewInactive)
            .unwrap();
    });
    let items = attach_items(&manager, &root, &["A", "B", "C"]);
    let (a, b, c) = (items[0], items[1], items[2]);

    assert!(filter.active_subjects().is_empty());

    assert!(filter.set_active_subject(b));
    assert_eq!(filter.active_subjects(), vec![b]);

    assert!(filter.invert_activity());
    assert_eq!(filter.active_subjects(), vec![a, c]);
    assert_eq!(filter.inactive_subjects(), vec![b]);
}

#[test]
fn prohibit_none_active_always_keeps_one_active() {
    init_tracing();
    let manager = ObjectManager::new();
    let (root, filter) = observer_with(&manager, |f| {
        f.set_minimum_activity_policy(MinimumActivityPolicy::ProhibitNoneActive)
            .unwrap();
        f.set_new_subject_activity_policy(NewSubjectActivityPolicy::SetNewInactive)
            .unwrap();
    });

    let items = attach_items(&manager, &root, &["A", "B", "C"]);
    assert_eq!(filter.active_subjects(), vec![items[0]]);

    // Refused without any state change.
    assert!(!filter.can_set_none_active());
    assert!(!filter.set_none_active());
    assert!(!filter.set_active_subjects(&[]));
    assert_eq!(filter.active_subjects(), vec![items[0]]);

    // Detaching the only active subject hands activity to the first remaining one.
    root.detach_subject(items[0]).unwrap();
    assert_eq!(filter.active_subjects(), vec![items[1]]);

    assert!(filter.set_active_subject(items[2]));
    root.detach_subject(items[2]).unwrap();
    assert_eq!(filter.active_subjects(), vec![items[1]]);

    root.detach_subject(items[1]).unwrap();
    assert!(filter.active_subjects().is_empty());
    assert_eq!(root.subject_count(), 0);
}

#[test]
fn unique_activity_keeps_exactly_one_active() {
    init_tracing();
    let manager = ObjectManager::new();
    let (root, filter) = observer_with(&manager, |f| {
        f.set_activity_policy(ActivityPolicy::UniqueActivity).unwrap();
    });
    let items = attach_items(&manager, &root, &["A", "B", "C"]);
    // New subjects become active and take activity from the previous one.
    assert_eq!(filter.active_subjects(), vec![items[2]]);

    for obj in &items {
        assert!(filter.set_active_subject(*obj));
        assert_eq!(filter.active_subjects(), vec![*obj]);
    }
    assert!(!filter.set_active_subjects(&items[..2]));
    assert!(!filter.can_set_all_active());
    assert!(!filter.set_all_active());
    assert_eq!(filter.active_subjects(), vec![items[2]]);

    assert!(filter.toggle_subject_activity(items[0]));
    assert_eq!(filter.active_subjects(), vec![items[0]]);
}

#[test]
fn change_signal_is_coalesced_in_processing_cycle() {
    init_tracing();
    let manager = ObjectManager::new();
    let (root, filter) = observer_with(&manager, |_| {});
    let emitted = Arc::new(Mutex::new(Vec::new()));
    let sink = emitted.clone();
    filter
        .active_subjects_changed
        .connect(move |(active, _)| sink.lock().push(active.len()));

    let objects: Vec<ObjectId> = ["A", "B", "C"]
        .iter()
        .map(|name| manager.create_object(*name, TypeInfo::new("Item")))
        .collect();
    let results = root.attach_subjects(&objects, Ownership::Manual);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(*emitted.lock(), vec![3]);

    assert!(filter.set_none_active());
    assert_eq!(*emitted.lock(), vec![3, 0]);
}

#[test]
fn routed_activity_change_is_applied_by_the_filter() {
    init_tracing();
    let manager = ObjectManager::new();
    let (root, filter) = observer_with(&manager, |f| {
        f.set_activity_policy(ActivityPolicy::UniqueActivity).unwrap();
    });
    let items = attach_items(&manager, &root, &["A", "B"]);
    assert_eq!(filter.active_subjects(), vec![items[1]]);

    let outcome = root
        .set_multi_context_property_value(items[0], names::OBJECT_ACTIVITY, true)
        .unwrap();
    assert_eq!(outcome, PropertyChangeOutcome::Intercepted);
    assert_eq!(filter.active_subjects(), vec![items[0]]);
}

#[test]
fn policies_are_locked_while_subjects_are_attached() {
    init_tracing();
    let manager = ObjectManager::new();
    let (root, filter) = observer_with(&manager, |_| {});
    let items = attach_items(&manager, &root, &["A"]);
    assert!(filter
        .set_activity_policy(ActivityPolicy::UniqueActivity)
        .is_err());
    assert_eq!(filter.activity_policy(), ActivityPolicy::MultipleActivity);

    root.detach_subject(items[0]).unwrap();
    filter
        .set_activity_policy(ActivityPolicy::UniqueActivity)
        .unwrap();
    assert_eq!(filter.activity_policy(), ActivityPolicy::UniqueActivity);
}
