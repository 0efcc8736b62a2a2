//! Property export, routing and context bookkeeping through the manager.

use std::io::Cursor;
use std::sync::Arc;

use horizon_observer::{
    NamingPolicyFilter, ObjectManager, ObserverError, Ownership, PropertyChangeOutcome,
};
use horizon_observer_core::{
    ExportVersion, ImportCompleteness, MultiContextProperty, PropertyDiff, PropertyKinds,
    SharedProperty, TypeInfo, Variant, names, store,
};
use parking_lot::Mutex;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

fn populated(manager: &ObjectManager) -> horizon_observer_core::ObjectId {
    let observer = manager.create_observer("Library");
    let obj = manager.create_object("book", TypeInfo::new("Document"));
    observer.attach_subject(obj, Ownership::Manual).unwrap();

    manager
        .set_shared_property(obj, SharedProperty::new("Title", "Dune").with_read_only(true))
        .unwrap();
    manager
        .set_shared_property(obj, SharedProperty::new("Tags", vec!["sf".to_string(), "classic".to_string()]))
        .unwrap();
    manager
        .set_shared_property(obj, SharedProperty::new("Handle", Variant::opaque(42u8)))
        .unwrap();
    observer
        .set_multi_context_property_value(obj, "Rating", 5)
        .unwrap();
    manager.set_plain_property(obj, "Pages", 412u32).unwrap();
    manager
        .set_plain_property(obj, "Cover", Variant::Bytes(vec![0xde, 0xad]))
        .unwrap();
    obj
}

#[test]
fn binary_round_trip_reproduces_exportable_properties() {
    init_tracing();
    let manager = ObjectManager::new();
    let obj = populated(&manager);

    let mut buffer = Vec::new();
    manager
        .export_object_properties_binary(obj, &mut buffer)
        .unwrap();
    let copy = manager.create_object("copy", TypeInfo::new("Document"));
    let completeness = manager
        .import_object_properties_binary(copy, &mut Cursor::new(buffer))
        .unwrap();
    assert_eq!(completeness, ImportCompleteness::Complete);

    let mut diff = PropertyDiff::default();
    let equal = manager.compare_dynamic_properties(
        obj,
        copy,
        PropertyKinds::ALL,
        Some(&mut diff),
        &["Handle"],
    );
    assert!(equal, "{diff}");
    assert!(!store::property_exists(manager.registry(), copy, "Handle"));
    assert!(store::get_shared_property(manager.registry(), copy, "Title").is_read_only());
}

#[test]
fn xml_round_trip_reproduces_exportable_properties() {
    init_tracing();
    let manager = ObjectManager::new();
    let obj = populated(&manager);

    let document = manager.export_object_properties_xml(obj).unwrap();
    assert!(document.contains("<Properties"));
    let copy = manager.create_object("copy", TypeInfo::new("Document"));
    manager
        .import_object_properties_xml(copy, &document)
        .unwrap();
    assert!(manager.compare_dynamic_properties(obj, copy, PropertyKinds::ALL, None, &["Handle"]));
}

#[test]
fn v1_export_drops_shared_flags() {
    let manager = ObjectManager::builder()
        .export_version(ExportVersion::V1)
        .build();
    let obj = populated(&manager);
    let mut buffer = Vec::new();
    manager
        .export_object_properties_binary(obj, &mut buffer)
        .unwrap();
    let copy = manager.create_object("copy", TypeInfo::new("Document"));
    manager
        .import_object_properties_binary(copy, &mut Cursor::new(buffer))
        .unwrap();
    let title = store::get_shared_property(manager.registry(), copy, "Title");
    assert_eq!(title.value(), &Variant::from("Dune"));
    assert!(!title.is_read_only());
}

#[test]
fn corrupt_envelope_leaves_object_untouched() {
    let manager = ObjectManager::new();
    let obj = populated(&manager);
    let mut buffer = Vec::new();
    manager
        .export_object_properties_binary(obj, &mut buffer)
        .unwrap();
    let last = buffer.len() - 1;
    buffer[last] ^= 0xff;

    let copy = manager.create_object("copy", TypeInfo::new("Document"));
    let err = manager
        .import_object_properties_binary(copy, &mut Cursor::new(buffer))
        .unwrap_err();
    assert!(matches!(err, ObserverError::Codec(_)));
    assert!(manager.registry().property_names(copy).unwrap().is_empty());
}

#[test]
fn clone_and_remove_dynamic_properties() {
    let manager = ObjectManager::new();
    let obj = populated(&manager);
    manager
        .set_shared_property(obj, SharedProperty::new("Pinned", true).with_removable(false))
        .unwrap();

    let copy = manager.create_object("copy", TypeInfo::new("Document"));
    assert!(manager.clone_object_properties(obj, copy, PropertyKinds::SHARED | PropertyKinds::PLAIN));
    assert!(store::property_exists(manager.registry(), copy, "Pages"));
    assert!(!store::property_exists(manager.registry(), copy, "Rating"));
    assert!(!store::property_exists(manager.registry(), copy, names::OBSERVER_MAP));

    assert!(manager.remove_dynamic_properties(copy, PropertyKinds::ALL));
    assert_eq!(
        manager.registry().property_names(copy).unwrap(),
        vec!["Pinned".to_string()]
    );
}

#[test]
fn detach_strips_every_context_entry() {
    init_tracing();
    let manager = ObjectManager::builder()
        .verify_context_invariants(true)
        .build();
    let first = manager.create_observer("First");
    let second = manager.create_observer("Second");
    let obj = manager.create_object("obj", TypeInfo::new("Thing"));
    first.attach_subject(obj, Ownership::Manual).unwrap();
    second.attach_subject(obj, Ownership::Manual).unwrap();
    first.set_multi_context_property_value(obj, "Note", "one").unwrap();
    second.set_multi_context_property_value(obj, "Note", "two").unwrap();

    first.detach_subject(obj).unwrap();
    assert!(manager.find_stale_context_entries().is_empty());
    assert_eq!(
        store::multi_context_value(manager.registry(), obj, "Note", first.context_id()),
        Variant::Invalid
    );
    assert_eq!(second.get_multi_context_property_value(obj, "Note"), Variant::from("two"));

    second.detach_subject(obj).unwrap();
    assert!(!store::property_exists(manager.registry(), obj, "Note"));
    assert!(manager.find_stale_context_entries().is_empty());
}

#[test]
fn audit_reports_entries_written_behind_the_observers_back() {
    let manager = ObjectManager::new();
    let observer = manager.create_observer("Context");
    let obj = manager.create_object("obj", TypeInfo::new("Thing"));
    let prop = MultiContextProperty::new("Orphan").with_value(observer.context_id(), 1);
    assert!(store::set_multi_context_property(manager.registry(), obj, prop));

    let stale = manager.find_stale_context_entries();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].object, obj);
    assert_eq!(stale[0].property, "Orphan");
    assert_eq!(stale[0].context, observer.context_id());
}

#[test]
fn monitored_changes_are_routed_and_announced() {
    init_tracing();
    let manager = ObjectManager::new();
    let observer = manager.create_observer("Names");
    observer
        .install_subject_filter(NamingPolicyFilter::new())
        .unwrap();
    let a = manager.create_object("alpha", TypeInfo::new("Thing"));
    let b = manager.create_object("beta", TypeInfo::new("Thing"));
    observer.attach_subject(a, Ownership::Manual).unwrap();
    observer.attach_subject(b, Ownership::Manual).unwrap();

    let announced = Arc::new(Mutex::new(Vec::new()));
    let sink = announced.clone();
    observer
        .monitored_property_changed
        .connect(move |(obj, name)| sink.lock().push((*obj, name.clone())));

    assert_eq!(
        manager.set_object_name(b, "alpha").unwrap(),
        PropertyChangeOutcome::Intercepted
    );
    assert_eq!(manager.registry().object_name(b).unwrap(), "beta");
    assert!(announced.lock().is_empty());

    assert_eq!(
        manager.set_object_name(b, "gamma").unwrap(),
        PropertyChangeOutcome::Applied
    );
    assert_eq!(manager.registry().object_name(b).unwrap(), "gamma");
    assert_eq!(*announced.lock(), vec![(b, names::OBJECT_NAME.to_string())]);

    assert!(matches!(
        manager.set_plain_property(a, names::OBJECT_NAME_MANAGER_ID, 7),
        Err(ObserverError::ReservedProperty { .. })
    ));
}
