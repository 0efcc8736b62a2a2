//! Default property providers.
//!
//! Plugins extend [`ObjectManager::construct_default_properties_on_object`](crate::ObjectManager::construct_default_properties_on_object)
//! by registering an [`AvailablePropertyProvider`] in the global object pool.

use horizon_observer_core::{PropertyKind, Variant};

/// Capability interface tag of property providers in the global pool.
pub const AVAILABLE_PROPERTY_PROVIDER_TAG: &str = "horizon.observer.AvailablePropertyProvider/1.0";

/// Describes a property a provider makes available on objects of a type.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySpecification {
    pub name: String,
    pub description: String,
    pub kind: PropertyKind,
    pub default_value: Variant,
    /// Type tag the property applies to. Empty matches every object.
    pub class_name: String,
    pub read_only: bool,
    pub removable: bool,
    pub exportable: bool,
    /// Add the property when default properties are constructed on a new object.
    pub add_during_construction: bool,
}

impl PropertySpecification {
    pub fn new(name: impl Into<String>, kind: PropertyKind, default_value: impl Into<Variant>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind,
            default_value: default_value.into(),
            class_name: String::new(),
            read_only: false,
            removable: true,
            exportable: true,
            add_during_construction: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_removable(mut self, removable: bool) -> Self {
        self.removable = removable;
        self
    }

    pub fn with_exportable(mut self, exportable: bool) -> Self {
        self.exportable = exportable;
        self
    }

    pub fn add_during_construction(mut self, add: bool) -> Self {
        self.add_during_construction = add;
        self
    }
}

/// A source of property specifications.
pub trait AvailablePropertyProvider: Send + Sync {
    fn available_properties(&self) -> Vec<PropertySpecification>;
}
