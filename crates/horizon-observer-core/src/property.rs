//! Property types stored in object property bags.
//!
//! An object's property bag holds three kinds of values:
//!
//! - [`SharedProperty`]: one value, visible identically from every context.
//! - [`MultiContextProperty`]: one value per observing context.
//! - Plain [`Variant`] values that carry no bookkeeping flags.
//!
//! [`PropertyValue`] is the sum of the three; the kind is part of the type so a
//! shared property can never be read back as a multi-context one.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitAnd, BitOr};

use crate::object::ContextId;
use crate::variant::Variant;

/// Names of the bookkeeping properties maintained by observers and filters.
pub mod names {
    /// Prefix shared by every internal bookkeeping property.
    pub const INTERNAL_PREFIX: &str = "qti.";

    /// Multi-context: subject id of the object inside each observing context.
    pub const OBSERVER_MAP: &str = "qti.core.ObserverMap";
    /// Multi-context: ownership kind per observing context.
    pub const OWNERSHIP: &str = "qti.core.Ownership";
    /// Shared: the context that owns a `SpecificObserver`-owned object.
    pub const OBSERVER_PARENT: &str = "qti.core.ObserverParent";
    /// Multi-context: activity per context with an activity filter.
    pub const OBJECT_ACTIVITY: &str = "qti.core.Activity";
    /// Multi-context: category path per context.
    pub const OBJECT_CATEGORY: &str = "qti.core.Category";
    /// Shared: name owned by the object's name manager.
    pub const OBJECT_NAME: &str = "qti.core.ObjectName";
    /// Shared: the context acting as the object's name manager.
    pub const OBJECT_NAME_MANAGER_ID: &str = "qti.core.NameManagerId";
    /// Multi-context: per-context names used where the managed name conflicts.
    pub const INSTANCE_NAMES: &str = "qti.core.InstanceNames";
    /// Shared: maximum number of contexts the object may join.
    pub const OBSERVER_LIMIT: &str = "qti.core.ObserverLimit";
    /// Multi-context: transient visitor ids assigned by relational tables.
    pub const VISITOR_ID: &str = "qti.core.VisitorID";

    /// Whether `name` follows the internal bookkeeping convention.
    pub fn is_internal(name: &str) -> bool {
        name.starts_with(INTERNAL_PREFIX)
    }
}

/// A property with a single value visible from every context.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedProperty {
    name: String,
    value: Variant,
    read_only: bool,
    removable: bool,
    exportable: bool,
}

impl SharedProperty {
    /// Create a writable, removable, exportable property.
    pub fn new(name: impl Into<String>, value: impl Into<Variant>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            read_only: false,
            removable: true,
            exportable: true,
        }
    }

    /// The sentinel returned when no shared property exists.
    pub fn invalid() -> Self {
        Self {
            name: String::new(),
            value: Variant::Invalid,
            read_only: false,
            removable: true,
            exportable: true,
        }
    }

    /// Mark the property read-only.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Mark whether bulk removal may remove the property.
    pub fn with_removable(mut self, removable: bool) -> Self {
        self.removable = removable;
        self
    }

    /// Mark whether the property is written by exports.
    pub fn with_exportable(mut self, exportable: bool) -> Self {
        self.exportable = exportable;
        self
    }

    /// A property is valid when it has a name.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Variant {
        &self.value
    }

    pub fn set_value(&mut self, value: impl Into<Variant>) {
        self.value = value.into();
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_removable(&self) -> bool {
        self.removable
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }
}

impl Default for SharedProperty {
    fn default() -> Self {
        Self::invalid()
    }
}

/// A property holding one value per observing context.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiContextProperty {
    name: String,
    values: BTreeMap<ContextId, Variant>,
    exportable: bool,
}

impl MultiContextProperty {
    /// Create an empty, exportable property.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
            exportable: true,
        }
    }

    /// The sentinel returned when no multi-context property exists.
    pub fn invalid() -> Self {
        Self::new(String::new())
    }

    /// Mark whether the property is written by exports.
    pub fn with_exportable(mut self, exportable: bool) -> Self {
        self.exportable = exportable;
        self
    }

    /// Builder form of [`MultiContextProperty::set_value`].
    pub fn with_value(mut self, context: ContextId, value: impl Into<Variant>) -> Self {
        self.set_value(context, value);
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    /// The value for `context`, or [`Variant::Invalid`] if there is none.
    pub fn value(&self, context: ContextId) -> &Variant {
        const INVALID: &Variant = &Variant::Invalid;
        self.values.get(&context).unwrap_or(INVALID)
    }

    /// Set the value for one context without touching the others.
    pub fn set_value(&mut self, context: ContextId, value: impl Into<Variant>) {
        self.values.insert(context, value.into());
    }

    /// Remove the value for one context.
    pub fn remove_context(&mut self, context: ContextId) -> Option<Variant> {
        self.values.remove(&context)
    }

    pub fn has_context(&self, context: ContextId) -> bool {
        self.values.contains_key(&context)
    }

    /// Contexts holding a value, in ascending order.
    pub fn contexts(&self) -> impl Iterator<Item = ContextId> + '_ {
        self.values.keys().copied()
    }

    /// All `(context, value)` pairs in ascending context order.
    pub fn values(&self) -> impl Iterator<Item = (ContextId, &Variant)> + '_ {
        self.values.iter().map(|(ctx, v)| (*ctx, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The kind of a stored property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Shared,
    MultiContext,
    Plain,
}

impl PropertyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::MultiContext => "multi-context",
            Self::Plain => "plain",
        }
    }
}

/// A value stored in an object's property bag.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Shared(SharedProperty),
    MultiContext(MultiContextProperty),
    Plain(Variant),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::Shared(_) => PropertyKind::Shared,
            Self::MultiContext(_) => PropertyKind::MultiContext,
            Self::Plain(_) => PropertyKind::Plain,
        }
    }

    /// Whether the property should be written to export envelopes.
    pub fn is_exportable(&self) -> bool {
        match self {
            Self::Shared(p) => p.is_exportable() && p.value().is_exportable(),
            Self::MultiContext(p) => p.is_exportable(),
            Self::Plain(v) => v.is_exportable(),
        }
    }

    /// Render the value as text for diffs and debug output.
    ///
    /// Multi-context values render as `{ctx: value, ...}`.
    pub fn render(&self) -> String {
        match self {
            Self::Shared(p) => p.value().render(),
            Self::MultiContext(p) => {
                let entries: Vec<String> = p
                    .values()
                    .map(|(ctx, v)| format!("{ctx}: {}", v.render()))
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
            Self::Plain(v) => v.render(),
        }
    }
}

/// A set of property kinds used to select properties for bulk operations.
///
/// Internal (`qti.`-prefixed) names are only selected when
/// [`PropertyKinds::INTERNAL`] is part of the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyKinds(u8);

impl PropertyKinds {
    pub const NONE: Self = Self(0);
    pub const SHARED: Self = Self(1 << 0);
    pub const MULTI_CONTEXT: Self = Self(1 << 1);
    pub const PLAIN: Self = Self(1 << 2);
    /// Include internal bookkeeping names.
    pub const INTERNAL: Self = Self(1 << 3);
    /// Every kind of external property.
    pub const ALL: Self = Self(0b0111);

    /// Check if this set contains all of `other`.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check if the set selects no kind at all.
    pub fn is_empty(self) -> bool {
        self.0 & Self::ALL.0 == 0
    }

    /// Whether a property named `name` holding `value` is selected.
    pub fn matches(self, name: &str, value: &PropertyValue) -> bool {
        if names::is_internal(name) && !self.contains(Self::INTERNAL) {
            return false;
        }
        let kind = match value.kind() {
            PropertyKind::Shared => Self::SHARED,
            PropertyKind::MultiContext => Self::MULTI_CONTEXT,
            PropertyKind::Plain => Self::PLAIN,
        };
        self.contains(kind)
    }
}

impl Default for PropertyKinds {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for PropertyKinds {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for PropertyKinds {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

/// Differences between two property bags, with rendered values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyDiff {
    /// Present on the second object only.
    pub added: BTreeMap<String, String>,
    /// Present on the first object only.
    pub removed: BTreeMap<String, String>,
    /// Present on both with different values, rendered as `old -> new`.
    pub changed: BTreeMap<String, String>,
}

impl PropertyDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl fmt::Display for PropertyDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.added {
            writeln!(f, "+ {name} = {value}")?;
        }
        for (name, value) in &self.removed {
            writeln!(f, "- {name} = {value}")?;
        }
        for (name, value) in &self.changed {
            writeln!(f, "~ {name}: {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_property_flags() {
        let prop = SharedProperty::new("Size", 3)
            .with_read_only(true)
            .with_removable(false)
            .with_exportable(false);
        assert!(prop.is_valid());
        assert!(prop.is_read_only());
        assert!(!prop.is_removable());
        assert!(!prop.is_exportable());
        assert_eq!(prop.value(), &Variant::Int(3));
        assert!(!SharedProperty::invalid().is_valid());
    }

    #[test]
    fn test_multi_context_values_are_independent() {
        let c1 = ContextId::new(1);
        let c2 = ContextId::new(2);
        let mut prop = MultiContextProperty::new("Activity").with_value(c2, false);
        prop.set_value(c1, true);
        assert_eq!(prop.value(c1), &Variant::Bool(true));
        assert_eq!(prop.value(c2), &Variant::Bool(false));
        assert_eq!(prop.value(ContextId::new(3)), &Variant::Invalid);

        prop.remove_context(c1);
        assert!(!prop.has_context(c1));
        assert_eq!(prop.contexts().collect::<Vec<_>>(), vec![c2]);
    }

    #[test]
    fn test_kind_mask_matching() {
        let shared = PropertyValue::Shared(SharedProperty::new("a", 1));
        let plain = PropertyValue::Plain(Variant::Int(1));
        assert!(PropertyKinds::ALL.matches("a", &shared));
        assert!(!PropertyKinds::PLAIN.matches("a", &shared));
        assert!(PropertyKinds::PLAIN.matches("a", &plain));
        assert!(!PropertyKinds::ALL.matches(names::OBJECT_NAME, &shared));
        assert!((PropertyKinds::ALL | PropertyKinds::INTERNAL).matches(names::OBJECT_NAME, &shared));
        assert!(PropertyKinds::INTERNAL.is_empty());
    }

    #[test]
    fn test_render_multi_context() {
        let prop = PropertyValue::MultiContext(
            MultiContextProperty::new("m")
                .with_value(ContextId::new(1), "x")
                .with_value(ContextId::new(2), 5),
        );
        assert_eq!(prop.render(), "{1: x, 2: 5}");
    }

    #[test]
    fn test_opaque_shared_property_is_not_exportable() {
        let prop = PropertyValue::Shared(SharedProperty::new("o", Variant::opaque(1u8)));
        assert!(!prop.is_exportable());
    }
}
