//! Integration tests for the property store and envelopes.

use horizon_observer_core::{
    ContextId, ExportOptions, ImportCompleteness, MultiContextProperty, PropertyDiff, PropertyKinds,
    SharedObjectRegistry, SharedProperty, TypeInfo, Variant, export_properties_binary,
    export_properties_xml, import_properties_binary, import_properties_xml, store,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

#[test]
fn shared_property_reads_back_what_was_written() {
    init_tracing();
    let registry = SharedObjectRegistry::new();
    let obj = registry.register(TypeInfo::new("Thing"));

    let values = [
        Variant::Bool(true),
        Variant::Int(-4),
        Variant::UInt(u64::MAX),
        Variant::Double(0.125),
        Variant::from("text"),
        Variant::from(vec!["x".to_string()]),
        Variant::Bytes(vec![1, 2, 3]),
    ];
    for value in values {
        assert!(store::set_shared_property(
            &registry,
            obj,
            SharedProperty::new("Value", value.clone())
        ));
        assert_eq!(store::get_shared_property(&registry, obj, "Value").value(), &value);
    }
}

#[test]
fn setting_one_context_leaves_other_contexts_alone() {
    let registry = SharedObjectRegistry::new();
    let obj = registry.register(TypeInfo::new("Thing"));
    let contexts: Vec<ContextId> = (1..=5).map(ContextId::new).collect();

    for (i, ctx) in contexts.iter().enumerate() {
        store::set_multi_context_value(&registry, obj, "Rank", *ctx, i as i64, true);
    }
    // Read-modify-write of a single context.
    let mut prop = store::get_multi_context_property(&registry, obj, "Rank");
    prop.set_value(contexts[2], 100);
    assert!(store::set_multi_context_property(&registry, obj, prop));

    for (i, ctx) in contexts.iter().enumerate() {
        let expected = if i == 2 { 100 } else { i as i64 };
        assert_eq!(
            store::multi_context_value(&registry, obj, "Rank", *ctx),
            Variant::Int(expected)
        );
    }
}

#[test]
fn envelopes_round_trip_onto_fresh_objects() {
    init_tracing();
    let registry = SharedObjectRegistry::new();
    let source = registry.register(TypeInfo::new("Thing"));
    store::set_shared_property(
        &registry,
        source,
        SharedProperty::new("Label", "alpha").with_read_only(true),
    );
    store::set_multi_context_property(
        &registry,
        source,
        MultiContextProperty::new("Visible")
            .with_value(ContextId::new(2), true)
            .with_value(ContextId::new(9), false),
    );
    store::set_plain_property(&registry, source, "Count", 12u64);
    store::set_plain_property(&registry, source, "Cache", Variant::opaque(String::from("x")));

    let mut binary = Vec::new();
    export_properties_binary(&registry, source, &mut binary, &ExportOptions::default()).unwrap();
    let from_binary = registry.register(TypeInfo::new("Thing"));
    assert_eq!(
        import_properties_binary(&registry, from_binary, &mut binary.as_slice()).unwrap(),
        ImportCompleteness::Complete
    );

    let document = export_properties_xml(&registry, source, &ExportOptions::default()).unwrap();
    let from_xml = registry.register(TypeInfo::new("Thing"));
    assert_eq!(
        import_properties_xml(&registry, from_xml, &document).unwrap(),
        ImportCompleteness::Complete
    );

    for copy in [from_binary, from_xml] {
        let mut diff = PropertyDiff::default();
        assert!(
            store::compare_dynamic_properties(
                &registry,
                source,
                copy,
                PropertyKinds::ALL,
                Some(&mut diff),
                &["Cache"],
            ),
            "unexpected differences:\n{diff}"
        );
    }
}
