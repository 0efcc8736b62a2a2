//! Tag-keyed constructor registries.
//!
//! A [`Factory<T>`] maps string tags to constructors producing `T`, each
//! registered together with a [`Category`]. Registration is expected to
//! happen during startup; once complete, a factory is only read.
//!
//! [`FactoryProvider`]s bundle one or more named factories and are registered
//! with the [`ObjectManager`](crate::ObjectManager), which dispatches
//! [`InstanceFactoryInfo`] requests to them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use horizon_observer_core::ObjectId;

use crate::category::Category;
use crate::manager::ObjectManager;

/// Registration key of a factory entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FactoryItemId {
    pub tag: String,
    pub category: Category,
}

impl FactoryItemId {
    pub fn new(tag: impl Into<String>, category: Category) -> Self {
        Self {
            tag: tag.into(),
            category,
        }
    }
}

impl From<&str> for FactoryItemId {
    fn from(tag: &str) -> Self {
        Self::new(tag, Category::default())
    }
}

type Constructor<T> = Arc<dyn Fn() -> T + Send + Sync>;

struct FactoryEntry<T> {
    id: FactoryItemId,
    constructor: Constructor<T>,
}

/// A registry of constructors keyed by tag.
pub struct Factory<T> {
    name: String,
    entries: Vec<FactoryEntry<T>>,
}

impl<T> Factory<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a constructor under `id`.
    ///
    /// Fails if the tag is empty or already registered; the existing
    /// registration is kept. The same constructor may be registered under
    /// several tags.
    pub fn register_factory_interface<F>(&mut self, constructor: F, id: FactoryItemId) -> bool
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        if id.tag.is_empty() {
            tracing::warn!(target: "horizon_observer::manager", factory = %self.name, "refusing to register an empty factory tag");
            return false;
        }
        if self.contains(&id.tag) {
            tracing::warn!(target: "horizon_observer::manager", factory = %self.name, tag = %id.tag, "factory tag already registered");
            return false;
        }
        tracing::trace!(target: "horizon_observer::manager", factory = %self.name, tag = %id.tag, category = %id.category, "registered factory interface");
        self.entries.push(FactoryEntry {
            id,
            constructor: Arc::new(constructor),
        });
        true
    }

    /// Remove the registration for `tag`. Returns whether it existed.
    pub fn unregister_factory_interface(&mut self, tag: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id.tag != tag);
        before != self.entries.len()
    }

    /// Construct an instance registered under `tag`.
    ///
    /// Returns `None` for unknown tags.
    pub fn create_instance(&self, tag: &str) -> Option<T> {
        match self.entries.iter().find(|entry| entry.id.tag == tag) {
            Some(entry) => Some((entry.constructor)()),
            None => {
                tracing::warn!(target: "horizon_observer::manager", factory = %self.name, tag, "no factory interface registered for tag");
                None
            }
        }
    }

    /// Registered tags in registration order, optionally limited to one category.
    pub fn tags(&self, category: Option<&Category>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| category.is_none_or(|c| &entry.id.category == c))
            .map(|entry| entry.id.tag.clone())
            .collect()
    }

    /// The category a tag was registered with.
    pub fn category_for_tag(&self, tag: &str) -> Option<Category> {
        self.entries
            .iter()
            .find(|entry| entry.id.tag == tag)
            .map(|entry| entry.id.category.clone())
    }

    pub fn tag_category_map(&self) -> BTreeMap<String, Category> {
        self.entries
            .iter()
            .map(|entry| (entry.id.tag.clone(), entry.id.category.clone()))
            .collect()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.iter().any(|entry| entry.id.tag == tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> fmt::Debug for Factory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("name", &self.name)
            .field("tags", &self.tags(None))
            .finish()
    }
}

/// Identifies an instance to be built by a [`FactoryProvider`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFactoryInfo {
    /// Name of the factory, for example `"Observers"`.
    pub factory_tag: String,
    /// Tag inside that factory, for example `"Observer"`.
    pub instance_tag: String,
    /// Name given to the new instance.
    pub instance_name: String,
}

impl InstanceFactoryInfo {
    pub fn new(
        factory_tag: impl Into<String>,
        instance_tag: impl Into<String>,
        instance_name: impl Into<String>,
    ) -> Self {
        Self {
            factory_tag: factory_tag.into(),
            instance_tag: instance_tag.into(),
            instance_name: instance_name.into(),
        }
    }
}

/// A provider of one or more named factories producing managed objects.
pub trait FactoryProvider: Send + Sync {
    /// Names of the factories this provider serves.
    fn provided_factories(&self) -> Vec<String>;

    /// Tags available in the named factory.
    fn provided_factory_tags(&self, factory_name: &str) -> Vec<String>;

    /// Build the instance described by `info` inside `manager`.
    fn create_instance(&self, manager: &ObjectManager, info: &InstanceFactoryInfo)
    -> Option<ObjectId>;
}
