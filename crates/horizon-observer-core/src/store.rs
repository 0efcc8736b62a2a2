//! Typed access to object property bags.
//!
//! These free functions are the property store used by observers and filters.
//! Reads never fail: an unknown object or a property of a different kind reads
//! back as the invalid sentinel. Writes report success as a `bool`.

use std::collections::BTreeMap;

use crate::object::{ContextId, ObjectId, SharedObjectRegistry};
use crate::property::{
    MultiContextProperty, PropertyDiff, PropertyKinds, PropertyValue, SharedProperty,
};
use crate::variant::Variant;

const TARGET: &str = "horizon_observer_core::property";

/// Get a shared property, or [`SharedProperty::invalid`] if absent or of another kind.
pub fn get_shared_property(
    registry: &SharedObjectRegistry,
    obj: ObjectId,
    name: &str,
) -> SharedProperty {
    match registry.property(obj, name) {
        Ok(Some(PropertyValue::Shared(prop))) => prop,
        _ => SharedProperty::invalid(),
    }
}

/// Store a shared property under its own name, replacing any previous value.
pub fn set_shared_property(
    registry: &SharedObjectRegistry,
    obj: ObjectId,
    prop: SharedProperty,
) -> bool {
    if !prop.is_valid() {
        tracing::debug!(target: TARGET, ?obj, "refusing to store unnamed shared property");
        return false;
    }
    let name = prop.name().to_string();
    registry
        .set_property(obj, name, PropertyValue::Shared(prop))
        .is_ok()
}

/// Get a multi-context property, or [`MultiContextProperty::invalid`] if absent or of another kind.
pub fn get_multi_context_property(
    registry: &SharedObjectRegistry,
    obj: ObjectId,
    name: &str,
) -> MultiContextProperty {
    match registry.property(obj, name) {
        Ok(Some(PropertyValue::MultiContext(prop))) => prop,
        _ => MultiContextProperty::invalid(),
    }
}

/// Store a multi-context property, replacing the whole context map.
pub fn set_multi_context_property(
    registry: &SharedObjectRegistry,
    obj: ObjectId,
    prop: MultiContextProperty,
) -> bool {
    if !prop.is_valid() {
        tracing::debug!(target: TARGET, ?obj, "refusing to store unnamed multi-context property");
        return false;
    }
    let name = prop.name().to_string();
    registry
        .set_property(obj, name, PropertyValue::MultiContext(prop))
        .is_ok()
}

/// The value one context holds in a multi-context property.
pub fn multi_context_value(
    registry: &SharedObjectRegistry,
    obj: ObjectId,
    name: &str,
    context: ContextId,
) -> Variant {
    registry.with_read(|r| match r.property(obj, name) {
        Ok(Some(PropertyValue::MultiContext(prop))) => prop.value(context).clone(),
        _ => Variant::Invalid,
    })
}

/// Set one context's value of a multi-context property, leaving the other contexts untouched.
///
/// The property is created with the given `exportable` flag when it does not
/// exist yet. Fails if another kind of property holds the name.
pub fn set_multi_context_value(
    registry: &SharedObjectRegistry,
    obj: ObjectId,
    name: &str,
    context: ContextId,
    value: impl Into<Variant>,
    exportable: bool,
) -> bool {
    let value = value.into();
    registry.with_write(|r| {
        let Ok(properties) = r.properties_mut(obj) else {
            return false;
        };
        match properties.get_mut(name) {
            Some(PropertyValue::MultiContext(prop)) => {
                prop.set_value(context, value);
                true
            }
            Some(other) => {
                tracing::debug!(target: TARGET, ?obj, name, kind = other.kind().as_str(), "name is held by another property kind");
                false
            }
            None if name.is_empty() => false,
            None => {
                let prop = MultiContextProperty::new(name)
                    .with_exportable(exportable)
                    .with_value(context, value);
                properties.insert(name.to_string(), PropertyValue::MultiContext(prop));
                true
            }
        }
    })
}

/// Remove one context's value from a multi-context property.
///
/// The property itself is removed once no context holds a value. Returns
/// whether a value was removed.
pub fn remove_multi_context_value(
    registry: &SharedObjectRegistry,
    obj: ObjectId,
    name: &str,
    context: ContextId,
) -> bool {
    registry.with_write(|r| {
        let Ok(properties) = r.properties_mut(obj) else {
            return false;
        };
        let Some(PropertyValue::MultiContext(prop)) = properties.get_mut(name) else {
            return false;
        };
        let removed = prop.remove_context(context).is_some();
        if prop.is_empty() {
            properties.remove(name);
        }
        removed
    })
}

/// Get a plain property, or [`Variant::Invalid`] if absent or of another kind.
pub fn get_plain_property(registry: &SharedObjectRegistry, obj: ObjectId, name: &str) -> Variant {
    match registry.property(obj, name) {
        Ok(Some(PropertyValue::Plain(value))) => value,
        _ => Variant::Invalid,
    }
}

/// Store a plain property.
pub fn set_plain_property(
    registry: &SharedObjectRegistry,
    obj: ObjectId,
    name: &str,
    value: impl Into<Variant>,
) -> bool {
    registry
        .set_property(obj, name, PropertyValue::Plain(value.into()))
        .is_ok()
}

/// Whether the object has any property called `name`.
pub fn property_exists(registry: &SharedObjectRegistry, obj: ObjectId, name: &str) -> bool {
    matches!(registry.property(obj, name), Ok(Some(_)))
}

/// Remove one property. Returns whether it existed.
pub fn remove_property(registry: &SharedObjectRegistry, obj: ObjectId, name: &str) -> bool {
    matches!(registry.remove_property(obj, name), Ok(Some(_)))
}

/// Remove every property selected by `kinds`.
///
/// Shared properties marked non-removable are kept. Returns `false` only if
/// the object does not exist.
pub fn remove_dynamic_properties(
    registry: &SharedObjectRegistry,
    obj: ObjectId,
    kinds: PropertyKinds,
) -> bool {
    registry.with_write(|r| {
        let Ok(properties) = r.properties_mut(obj) else {
            return false;
        };
        let before = properties.len();
        properties.retain(|name, value| {
            if !kinds.matches(name, value) {
                return true;
            }
            matches!(value, PropertyValue::Shared(p) if !p.is_removable())
        });
        tracing::trace!(target: TARGET, ?obj, removed = before - properties.len(), "removed dynamic properties");
        true
    })
}

/// Copy every property selected by `kinds` from `src` to `dst`.
///
/// Properties on `dst` with the same names are overwritten.
pub fn clone_object_properties(
    registry: &SharedObjectRegistry,
    src: ObjectId,
    dst: ObjectId,
    kinds: PropertyKinds,
) -> bool {
    if src == dst {
        return registry.contains(src);
    }
    registry.with_write(|r| {
        let Ok(source) = r.properties(src) else {
            return false;
        };
        let selected: Vec<(String, PropertyValue)> = source
            .iter()
            .filter(|(name, value)| kinds.matches(name, value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let Ok(target) = r.properties_mut(dst) else {
            return false;
        };
        let count = selected.len();
        target.extend(selected);
        tracing::trace!(target: TARGET, ?src, ?dst, count, "cloned properties");
        true
    })
}

/// Compare the properties selected by `kinds` on two objects.
///
/// Names listed in `ignore` are skipped. When `diff` is given and the
/// objects differ, it receives the added, removed and changed entries with
/// rendered values. Returns `true` iff the selected properties are equal.
pub fn compare_dynamic_properties(
    registry: &SharedObjectRegistry,
    first: ObjectId,
    second: ObjectId,
    kinds: PropertyKinds,
    diff: Option<&mut PropertyDiff>,
    ignore: &[&str],
) -> bool {
    let (a, b) = registry.with_read(|r| {
        let select = |id| -> Option<BTreeMap<String, PropertyValue>> {
            let props = r.properties(id).ok()?;
            Some(
                props
                    .iter()
                    .filter(|(name, value)| {
                        kinds.matches(name, value) && !ignore.contains(&name.as_str())
                    })
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            )
        };
        (select(first), select(second))
    });
    let (Some(a), Some(b)) = (a, b) else {
        return false;
    };

    let mut result = PropertyDiff::default();
    for (name, value) in &a {
        match b.get(name) {
            None => {
                result.removed.insert(name.clone(), value.render());
            }
            Some(other) if other != value => {
                result.changed.insert(
                    name.clone(),
                    format!("{} -> {}", value.render(), other.render()),
                );
            }
            Some(_) => {}
        }
    }
    for (name, value) in &b {
        if !a.contains_key(name) {
            result.added.insert(name.clone(), value.render());
        }
    }

    let equal = result.is_empty();
    if !equal {
        if let Some(out) = diff {
            *out = result;
        }
    }
    equal
}

/// Strip `context` from every multi-context property on the object.
///
/// Properties whose context map becomes empty are removed. Returns the
/// number of entries stripped.
pub fn remove_context_entries(
    registry: &SharedObjectRegistry,
    obj: ObjectId,
    context: ContextId,
) -> usize {
    registry.with_write(|r| {
        let Ok(properties) = r.properties_mut(obj) else {
            return 0;
        };
        let mut stripped = 0;
        properties.retain(|_, value| match value {
            PropertyValue::MultiContext(prop) => {
                if prop.remove_context(context).is_some() {
                    stripped += 1;
                }
                !prop.is_empty()
            }
            _ => true,
        });
        stripped
    })
}
