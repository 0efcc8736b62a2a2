//! Objects, their ids and the registry that owns them.
//!
//! Every tracked object is an entry in an [`ObjectRegistry`] keyed by a
//! generational [`ObjectId`]. An entry carries a name, a [`TypeInfo`] used by
//! type filters, a property bag and a set of named interfaces. Typed access
//! to the property bag lives in [`crate::store`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use slotmap::{SlotMap, new_key_type};

use crate::error::{ObjectError, ObjectResult};
use crate::property::PropertyValue;

new_key_type! {
    /// Handle to a registered object.
    ///
    /// Ids are stable handles. They become invalid when the object is
    /// destroyed and are never handed out again for a different object.
    pub struct ObjectId;
}

impl ObjectId {
    /// Packed form used by `OBSERVER_PARENT` and export envelopes.
    #[inline]
    pub fn as_raw(self) -> u64 {
        use slotmap::Key;
        self.data().as_ffi()
    }

    /// Inverse of [`ObjectId::as_raw`]. The object may no longer exist.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self::from(slotmap::KeyData::from_ffi(raw))
    }
}

/// Identifier of an observer context.
///
/// Ids are assigned monotonically starting at 1. Id 0 is reserved for the
/// global object pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u32);

impl ContextId {
    /// The global object pool.
    pub const GLOBAL_POOL: ContextId = ContextId(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_global_pool(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type information recorded for an object at registration.
///
/// `bases` lists every tag the object should also answer to in
/// [`TypeInfo::inherits`], so a `"Document"` registered with base
/// `"Exportable"` passes type filters for either tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypeInfo {
    name: String,
    bases: Vec<String>,
}

impl TypeInfo {
    /// Create type info with no bases.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bases: Vec::new(),
        }
    }

    /// Type info named after the Rust type `T`.
    pub fn of<T: ?Sized>() -> Self {
        Self::new(std::any::type_name::<T>())
    }

    /// Add a base tag.
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.bases.push(base.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bases(&self) -> &[String] {
        &self.bases
    }

    /// Whether this type is, or derives from, `tag`.
    pub fn inherits(&self, tag: &str) -> bool {
        self.name == tag || self.bases.iter().any(|b| b == tag)
    }
}

/// Per-object entry.
struct ObjectData {
    name: String,
    type_info: TypeInfo,
    properties: BTreeMap<String, PropertyValue>,
    interfaces: HashMap<String, Arc<dyn Any + Send + Sync>>,
    /// The observer context hosted by this object, if any.
    hosted_context: Option<ContextId>,
}

impl ObjectData {
    fn new(name: String, type_info: TypeInfo) -> Self {
        Self {
            name,
            type_info,
            properties: BTreeMap::new(),
            interfaces: HashMap::new(),
            hosted_context: None,
        }
    }
}

/// Owner of every object entry. Usually reached through [`SharedObjectRegistry`].
pub struct ObjectRegistry {
    objects: SlotMap<ObjectId, ObjectData>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            objects: SlotMap::with_key(),
        }
    }

    /// Register a new unnamed object and return its ID.
    pub fn register(&mut self, type_info: TypeInfo) -> ObjectId {
        self.register_named(String::new(), type_info)
    }

    /// Register a new named object and return its ID.
    pub fn register_named(&mut self, name: impl Into<String>, type_info: TypeInfo) -> ObjectId {
        let name = name.into();
        let type_name = type_info.name().to_string();
        let id = self.objects.insert(ObjectData::new(name, type_info));
        tracing::trace!(target: "horizon_observer_core::object", ?id, %type_name, "registered object");
        id
    }

    /// Remove an object from the registry.
    #[tracing::instrument(skip(self), target = "horizon_observer_core::object", level = "trace")]
    pub fn destroy(&mut self, id: ObjectId) -> ObjectResult<()> {
        self.objects
            .remove(id)
            .map(|_| ())
            .ok_or(ObjectError::InvalidObjectId)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    fn data(&self, id: ObjectId) -> ObjectResult<&ObjectData> {
        self.objects.get(id).ok_or(ObjectError::InvalidObjectId)
    }

    fn data_mut(&mut self, id: ObjectId) -> ObjectResult<&mut ObjectData> {
        self.objects.get_mut(id).ok_or(ObjectError::InvalidObjectId)
    }

    pub fn object_name(&self, id: ObjectId) -> ObjectResult<&str> {
        Ok(&self.data(id)?.name)
    }

    pub fn set_object_name(&mut self, id: ObjectId, name: impl Into<String>) -> ObjectResult<()> {
        self.data_mut(id)?.name = name.into();
        Ok(())
    }

    /// Get the type info recorded at registration.
    pub fn type_info(&self, id: ObjectId) -> ObjectResult<&TypeInfo> {
        Ok(&self.data(id)?.type_info)
    }

    /// Whether the object is, or derives from, the type tag. False for unknown objects.
    pub fn inherits(&self, id: ObjectId, tag: &str) -> bool {
        self.objects
            .get(id)
            .is_some_and(|data| data.type_info.inherits(tag))
    }

    // Property bag

    pub fn property(&self, id: ObjectId, name: &str) -> ObjectResult<Option<&PropertyValue>> {
        Ok(self.data(id)?.properties.get(name))
    }

    /// Set a property, returning the previous value under that name.
    pub fn set_property(
        &mut self,
        id: ObjectId,
        name: impl Into<String>,
        value: PropertyValue,
    ) -> ObjectResult<Option<PropertyValue>> {
        let name = name.into();
        if name.is_empty() {
            return Err(ObjectError::InvalidProperty);
        }
        Ok(self.data_mut(id)?.properties.insert(name, value))
    }

    /// Remove a property, returning it if it existed.
    pub fn remove_property(
        &mut self,
        id: ObjectId,
        name: &str,
    ) -> ObjectResult<Option<PropertyValue>> {
        Ok(self.data_mut(id)?.properties.remove(name))
    }

    /// Names of all properties, in sorted order.
    pub fn property_names(&self, id: ObjectId) -> ObjectResult<Vec<String>> {
        Ok(self.data(id)?.properties.keys().cloned().collect())
    }

    /// Borrow the whole property bag.
    pub fn properties(&self, id: ObjectId) -> ObjectResult<&BTreeMap<String, PropertyValue>> {
        Ok(&self.data(id)?.properties)
    }

    /// Mutably borrow the whole property bag.
    pub fn properties_mut(
        &mut self,
        id: ObjectId,
    ) -> ObjectResult<&mut BTreeMap<String, PropertyValue>> {
        Ok(&mut self.data_mut(id)?.properties)
    }

    // Capability interfaces

    /// Expose a named interface on the object.
    pub fn set_interface(
        &mut self,
        id: ObjectId,
        tag: impl Into<String>,
        payload: Arc<dyn Any + Send + Sync>,
    ) -> ObjectResult<()> {
        self.data_mut(id)?.interfaces.insert(tag.into(), payload);
        Ok(())
    }

    /// Withdraw a named interface.
    pub fn remove_interface(&mut self, id: ObjectId, tag: &str) -> ObjectResult<bool> {
        Ok(self.data_mut(id)?.interfaces.remove(tag).is_some())
    }

    /// Get the payload of a named interface.
    pub fn interface(&self, id: ObjectId, tag: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.objects
            .get(id)
            .and_then(|data| data.interfaces.get(tag).cloned())
    }

    /// Whether the object exposes the named interface.
    pub fn implements(&self, id: ObjectId, tag: &str) -> bool {
        self.objects
            .get(id)
            .is_some_and(|data| data.interfaces.contains_key(tag))
    }

    // Hosted contexts

    /// Record the observer context hosted by this object.
    pub fn set_hosted_context(
        &mut self,
        id: ObjectId,
        context: Option<ContextId>,
    ) -> ObjectResult<()> {
        self.data_mut(id)?.hosted_context = context;
        Ok(())
    }

    /// The observer context hosted by this object, if any.
    pub fn hosted_context(&self, id: ObjectId) -> Option<ContextId> {
        self.objects.get(id).and_then(|data| data.hosted_context)
    }

    /// Get the total number of objects in the registry.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Ids of every live object.
    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys()
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// [`ObjectRegistry`] behind a `parking_lot::RwLock`, shared by the manager and every observer.
///
/// Accessors return owned values so no lock outlives the call.
pub struct SharedObjectRegistry {
    inner: RwLock<ObjectRegistry>,
}

impl SharedObjectRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ObjectRegistry::new()),
        }
    }

    /// Register a new unnamed object.
    pub fn register(&self, type_info: TypeInfo) -> ObjectId {
        self.inner.write().register(type_info)
    }

    /// Register a new named object.
    pub fn register_named(&self, name: impl Into<String>, type_info: TypeInfo) -> ObjectId {
        self.inner.write().register_named(name, type_info)
    }

    /// Destroy an object.
    pub fn destroy(&self, id: ObjectId) -> ObjectResult<()> {
        self.inner.write().destroy(id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.inner.read().contains(id)
    }

    /// Get an object's name.
    pub fn object_name(&self, id: ObjectId) -> ObjectResult<String> {
        self.inner.read().object_name(id).map(str::to_string)
    }

    /// Set an object's name.
    pub fn set_object_name(&self, id: ObjectId, name: impl Into<String>) -> ObjectResult<()> {
        self.inner.write().set_object_name(id, name)
    }

    /// Get an object's type info.
    pub fn type_info(&self, id: ObjectId) -> ObjectResult<TypeInfo> {
        self.inner.read().type_info(id).cloned()
    }

    /// Whether an object is, or derives from, the type tag.
    pub fn inherits(&self, id: ObjectId, tag: &str) -> bool {
        self.inner.read().inherits(id, tag)
    }

    /// Get a copy of a property.
    pub fn property(&self, id: ObjectId, name: &str) -> ObjectResult<Option<PropertyValue>> {
        self.inner.read().property(id, name).map(|p| p.cloned())
    }

    /// Set a property.
    pub fn set_property(
        &self,
        id: ObjectId,
        name: impl Into<String>,
        value: PropertyValue,
    ) -> ObjectResult<Option<PropertyValue>> {
        self.inner.write().set_property(id, name, value)
    }

    /// Remove a property.
    pub fn remove_property(&self, id: ObjectId, name: &str) -> ObjectResult<Option<PropertyValue>> {
        self.inner.write().remove_property(id, name)
    }

    /// Names of all properties.
    pub fn property_names(&self, id: ObjectId) -> ObjectResult<Vec<String>> {
        self.inner.read().property_names(id)
    }

    /// Expose a named interface on an object.
    pub fn set_interface(
        &self,
        id: ObjectId,
        tag: impl Into<String>,
        payload: Arc<dyn Any + Send + Sync>,
    ) -> ObjectResult<()> {
        self.inner.write().set_interface(id, tag, payload)
    }

    /// Get the payload of a named interface.
    pub fn interface(&self, id: ObjectId, tag: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.read().interface(id, tag)
    }

    /// Whether an object exposes the named interface.
    pub fn implements(&self, id: ObjectId, tag: &str) -> bool {
        self.inner.read().implements(id, tag)
    }

    /// Record the observer context hosted by an object.
    pub fn set_hosted_context(&self, id: ObjectId, context: Option<ContextId>) -> ObjectResult<()> {
        self.inner.write().set_hosted_context(id, context)
    }

    /// The observer context hosted by an object.
    pub fn hosted_context(&self, id: ObjectId) -> Option<ContextId> {
        self.inner.read().hosted_context(id)
    }

    /// Get the total number of objects.
    pub fn object_count(&self) -> usize {
        self.inner.read().object_count()
    }

    /// Ids of every live object.
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.inner.read().object_ids().collect()
    }

    // Advanced Access

    /// Run `f` under the read lock. Do not call back into the registry from `f`.
    pub fn with_read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&ObjectRegistry) -> R,
    {
        f(&self.inner.read())
    }

    /// Run `f` under the write lock.
    pub fn with_write<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut ObjectRegistry) -> R,
    {
        f(&mut self.inner.write())
    }
}

impl Default for SharedObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::assert_impl_all!(SharedObjectRegistry: Send, Sync);
