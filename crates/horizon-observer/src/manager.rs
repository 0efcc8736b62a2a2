//! The object manager.
//!
//! [`ObjectManager`] is the registry every observer context belongs to. It
//! owns the object registry, assigns context ids, hosts the global object
//! pool (context `0`), the subject filter factory and the factory providers,
//! and implements the operations that span several contexts: moving and
//! copying subjects, deleting objects and observers, routing property
//! changes through the filters of every observing context, and the bulk
//! property operations.
//!
//! The manager is a cheap handle; clones share the same registry.
//!
//! # Example
//!
//! ```
//! use horizon_observer::{ObjectManager, Ownership};
//! use horizon_observer_core::TypeInfo;
//!
//! let manager = ObjectManager::new();
//! let documents = manager.create_observer("Documents");
//! let archive = manager.create_observer("Archive");
//!
//! let doc = manager.create_object("report", TypeInfo::new("Document"));
//! documents.attach_subject(doc, Ownership::ObserverScope).unwrap();
//!
//! let report = manager
//!     .move_subjects(&[doc], documents.context_id(), archive.context_id(), true)
//!     .unwrap();
//! assert!(report.is_complete());
//! assert!(archive.contains(doc));
//! ```

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use horizon_observer_core::{
    ContextId, ImportCompleteness, MultiContextProperty, ObjectId, PropertyDiff, PropertyKind,
    PropertyKinds, PropertyValue, SharedObjectRegistry, SharedProperty, Signal, TypeInfo, Variant,
    export_properties_binary, export_properties_xml, import_properties_binary,
    import_properties_xml, names, store,
};
use parking_lot::{Mutex, RwLock};

use crate::category::Category;
use crate::config::{ObjectManagerBuilder, ObjectManagerConfig};
use crate::error::{ObserverError, Result};
use crate::factory::{Factory, FactoryItemId, FactoryProvider, InstanceFactoryInfo};
use crate::filter::{
    ACTIVITY_POLICY_FILTER_TAG, ActivityPolicyFilter, Evaluation, NAMING_POLICY_FILTER_TAG,
    NamingPolicyFilter, SUBJECT_FILTERS_CATEGORY, SUBJECT_TYPE_FILTER_TAG, SubjectFilter,
    SubjectTypeFilter,
};
use crate::observer::{
    AttachOptions, DetachEvaluation, Observer, Ownership, observing_contexts,
};
use crate::provider::{AVAILABLE_PROPERTY_PROVIDER_TAG, AvailablePropertyProvider};

const TARGET: &str = "horizon_observer::manager";

/// Type tag of objects hosting an observer context.
pub const OBSERVER_TYPE: &str = "Observer";
/// Factory name of the built-in observer factory provider.
pub const OBSERVERS_FACTORY: &str = "Observers";
/// Tag of plain observers in [`OBSERVERS_FACTORY`].
pub const OBSERVER_FACTORY_TAG: &str = "Observer";

/// Result of a routed property change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyChangeOutcome {
    /// The change was written.
    Applied,
    /// A subject filter took over the change, either applying it itself or vetoing it.
    Intercepted,
}

/// Outcome for one object of [`ObjectManager::move_subjects`] or
/// [`ObjectManager::copy_subjects`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The object is now attached to the destination.
    Moved,
    Failed(String),
    /// An earlier failure aborted the batch.
    NotAttempted,
}

/// Per-object outcomes of a batch move or copy, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveReport {
    pub outcomes: Vec<(ObjectId, MoveOutcome)>,
}

impl MoveReport {
    /// Whether every object was moved.
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, outcome)| *outcome == MoveOutcome::Moved)
    }

    pub fn moved(&self) -> Vec<ObjectId> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == MoveOutcome::Moved)
            .map(|(obj, _)| *obj)
            .collect()
    }

    pub fn failures(&self) -> Vec<(ObjectId, String)> {
        self.outcomes
            .iter()
            .filter_map(|(obj, outcome)| match outcome {
                MoveOutcome::Failed(reason) => Some((*obj, reason.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn outcome(&self, obj: ObjectId) -> Option<&MoveOutcome> {
        self.outcomes
            .iter()
            .find(|(o, _)| *o == obj)
            .map(|(_, outcome)| outcome)
    }
}

/// A multi-context entry whose context no longer observes the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleContextEntry {
    pub object: ObjectId,
    pub property: String,
    pub context: ContextId,
}

pub(crate) struct ManagerInner {
    config: ObjectManagerConfig,
    registry: Arc<SharedObjectRegistry>,
    pool: Arc<Observer>,
    observers: RwLock<BTreeMap<ContextId, Arc<Observer>>>,
    next_context_id: AtomicU32,
    /// Relational table sessions count down from the top of the id range.
    next_table_session: AtomicU32,
    deleting: Mutex<HashSet<ObjectId>>,
    subject_filters: RwLock<Factory<SubjectFilter>>,
    providers: RwLock<BTreeMap<String, Arc<dyn FactoryProvider>>>,
    object_deleted: Signal<ObjectId>,
}

/// Handle to the process-wide object registry.
#[derive(Clone)]
pub struct ObjectManager {
    inner: Arc<ManagerInner>,
}

static_assertions::assert_impl_all!(ObjectManager: Send, Sync);

impl Default for ObjectManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectManager {
    pub fn new() -> Self {
        Self::with_config(ObjectManagerConfig::default())
    }

    pub fn builder() -> ObjectManagerBuilder {
        ObjectManagerBuilder::new()
    }

    pub fn with_config(config: ObjectManagerConfig) -> Self {
        let registry = Arc::new(SharedObjectRegistry::new());
        let pool_host = registry.register_named(
            config.global_pool_name.clone(),
            TypeInfo::new(OBSERVER_TYPE),
        );
        if let Err(err) = registry.set_hosted_context(pool_host, Some(ContextId::GLOBAL_POOL)) {
            tracing::error!(target: TARGET, %err, "could not mark global pool host");
        }

        let inner = Arc::new_cyclic(|weak| {
            let pool = Observer::new(
                ContextId::GLOBAL_POOL,
                pool_host,
                registry.clone(),
                weak.clone(),
                config.global_pool_name.clone(),
                config.verify_context_invariants,
            );
            let mut observers = BTreeMap::new();
            observers.insert(ContextId::GLOBAL_POOL, pool.clone());
            ManagerInner {
                config,
                registry,
                pool,
                observers: RwLock::new(observers),
                next_context_id: AtomicU32::new(1),
                next_table_session: AtomicU32::new(u32::MAX),
                deleting: Mutex::new(HashSet::new()),
                subject_filters: RwLock::new(builtin_subject_filters()),
                providers: RwLock::new(BTreeMap::new()),
                object_deleted: Signal::new(),
            }
        });
        let manager = Self { inner };
        let registered = manager.register_factory_provider(Arc::new(ObserverFactoryProvider));
        if let Err(err) = registered {
            tracing::error!(target: TARGET, %err, "could not register observer factory");
        }
        tracing::debug!(target: TARGET, pool = %manager.inner.config.global_pool_name, "object manager created");
        manager
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &ObjectManagerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<SharedObjectRegistry> {
        &self.inner.registry
    }

    /// Emitted after an object was deleted through [`delete_object`](Self::delete_object).
    pub fn object_deleted(&self) -> &Signal<ObjectId> {
        &self.inner.object_deleted
    }

    // =========================================================================
    // Objects and observers
    // =========================================================================

    /// Register a new named object.
    pub fn create_object(&self, name: impl Into<String>, type_info: TypeInfo) -> ObjectId {
        self.inner.registry.register_named(name, type_info)
    }

    pub(crate) fn allocate_context_id(&self) -> ContextId {
        ContextId::new(self.inner.next_context_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Key for the visitor ids of one relational table.
    ///
    /// Never equal to an observer context id, so detaching from a context
    /// leaves the tags of live tables alone.
    pub(crate) fn allocate_table_session(&self) -> ContextId {
        ContextId::new(self.inner.next_table_session.fetch_sub(1, Ordering::Relaxed))
    }

    /// Create a new observer context hosted by a new object.
    pub fn create_observer(&self, name: impl Into<String>) -> Arc<Observer> {
        let name = name.into();
        let host = self
            .inner
            .registry
            .register_named(name.clone(), TypeInfo::new(OBSERVER_TYPE));
        self.install_observer(host, name)
    }

    /// Make an existing object the host of a new observer context.
    ///
    /// Context ids are never reused.
    pub fn register_observer(&self, host: ObjectId, name: impl Into<String>) -> Result<Arc<Observer>> {
        if !self.inner.registry.contains(host) {
            return Err(ObserverError::InvalidObject);
        }
        if let Some(existing) = self.inner.registry.hosted_context(host) {
            return Err(ObserverError::rejected(
                existing,
                format!("object already hosts context {existing}"),
            ));
        }
        Ok(self.install_observer(host, name.into()))
    }

    fn install_observer(&self, host: ObjectId, name: String) -> Arc<Observer> {
        let context = self.allocate_context_id();
        if let Err(err) = self.inner.registry.set_hosted_context(host, Some(context)) {
            tracing::warn!(target: TARGET, %context, %err, "could not record hosted context");
        }
        let observer = Observer::new(
            context,
            host,
            self.inner.registry.clone(),
            Arc::downgrade(&self.inner),
            name,
            self.inner.config.verify_context_invariants,
        );
        self.inner.observers.write().insert(context, observer.clone());
        tracing::debug!(target: TARGET, %context, name = %observer.name(), "registered observer");
        observer
    }

    /// The observer registered under `context`; `0` is the global pool.
    pub fn observer_reference(&self, context: ContextId) -> Option<Arc<Observer>> {
        self.inner.observers.read().get(&context).cloned()
    }

    pub fn global_pool(&self) -> Arc<Observer> {
        self.inner.pool.clone()
    }

    /// The observer hosted by `obj`, if any.
    pub fn hosted_observer(&self, obj: ObjectId) -> Option<Arc<Observer>> {
        self.inner
            .registry
            .hosted_context(obj)
            .and_then(|ctx| self.observer_reference(ctx))
    }

    /// Every registered observer, ordered by context id.
    pub fn observers(&self) -> Vec<Arc<Observer>> {
        self.inner.observers.read().values().cloned().collect()
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.read().len()
    }

    /// Contexts other than the global pool that observe `obj`.
    pub fn parent_contexts(&self, obj: ObjectId) -> Vec<ContextId> {
        observing_contexts(&self.inner.registry, obj)
            .into_iter()
            .filter(|ctx| !ctx.is_global_pool())
            .collect()
    }

    /// Attach `obj` to the global pool, optionally with a category.
    pub fn register_object(&self, obj: ObjectId, category: Option<&Category>) -> Result<()> {
        self.inner.pool.attach_subject(obj, Ownership::Manual)?;
        if let Some(category) = category.filter(|c| !c.is_empty()) {
            store::set_multi_context_value(
                &self.inner.registry,
                obj,
                names::OBJECT_CATEGORY,
                ContextId::GLOBAL_POOL,
                category.to_variant(),
                true,
            );
        }
        Ok(())
    }

    /// Detach `obj` from the global pool.
    pub fn remove_object(&self, obj: ObjectId) -> Result<()> {
        self.inner.pool.detach_subject(obj)
    }

    /// Global pool objects exposing the capability interface `tag`.
    pub fn registered_interfaces(&self, tag: &str) -> Vec<ObjectId> {
        self.inner.pool.subject_references(tag)
    }

    /// Delete an object.
    ///
    /// The object is detached from every observing context, its hosted
    /// observer (if any) is torn down together with the subjects it owns,
    /// and finally the object is destroyed.
    #[tracing::instrument(skip(self), target = "horizon_observer::manager", level = "trace")]
    pub fn delete_object(&self, obj: ObjectId) {
        if !self.inner.registry.contains(obj) {
            return;
        }
        if !self.inner.deleting.lock().insert(obj) {
            return;
        }
        for ctx in observing_contexts(&self.inner.registry, obj) {
            if let Some(observer) = self.observer_reference(ctx) {
                observer.release_subject(obj, true);
            }
        }
        if let Some(ctx) = self.inner.registry.hosted_context(obj) {
            if !ctx.is_global_pool() {
                self.teardown_observer(ctx);
            }
        }
        if let Err(err) = self.inner.registry.destroy(obj) {
            tracing::warn!(target: TARGET, ?obj, %err, "object vanished during deletion");
        }
        self.inner.deleting.lock().remove(&obj);
        tracing::debug!(target: TARGET, ?obj, "deleted object");
        self.inner.object_deleted.emit(obj);
    }

    fn teardown_observer(&self, context: ContextId) {
        let Some(observer) = self.inner.observers.write().remove(&context) else {
            return;
        };
        observer.mark_deleting();
        observer.start_processing_cycle();
        let owned: Vec<ObjectId> = observer
            .subjects()
            .into_iter()
            .filter(|subject| observer.release_subject(*subject, false))
            .collect();
        observer.end_processing_cycle(false);
        for subject in owned {
            self.delete_object(subject);
        }
        tracing::debug!(target: TARGET, %context, "observer deleted");
        observer.destroyed.emit(context);
    }

    /// Delete an observer context together with its host object.
    pub fn delete_observer(&self, context: ContextId) -> Result<()> {
        if context.is_global_pool() {
            return Err(ObserverError::rejected(
                context,
                "the global object pool cannot be deleted",
            ));
        }
        let observer = self
            .observer_reference(context)
            .ok_or(ObserverError::ContextNotFound(context))?;
        self.delete_object(observer.host_object());
        Ok(())
    }

    fn require_observer(&self, context: ContextId) -> Result<Arc<Observer>> {
        self.observer_reference(context)
            .ok_or(ObserverError::ContextNotFound(context))
    }

    // =========================================================================
    // Moving and copying
    // =========================================================================

    /// Move objects from one context to another.
    ///
    /// Objects are processed in order. The first failure aborts the batch;
    /// objects moved before it stay moved and the remaining ones are reported
    /// as [`MoveOutcome::NotAttempted`]. A failed object is left attached to
    /// the source.
    pub fn move_subjects(
        &self,
        objects: &[ObjectId],
        source: ContextId,
        destination: ContextId,
        silent: bool,
    ) -> Result<MoveReport> {
        if source == destination {
            return Err(ObserverError::SameContext(source));
        }
        let src = self.require_observer(source)?;
        let dst = self.require_observer(destination)?;

        src.start_processing_cycle();
        dst.start_processing_cycle();
        let mut report = MoveReport::default();
        let mut aborted = false;
        for obj in objects {
            let outcome = if aborted {
                MoveOutcome::NotAttempted
            } else {
                match self.move_one(*obj, &src, &dst, silent) {
                    Ok(()) => MoveOutcome::Moved,
                    Err(err) => {
                        tracing::debug!(target: TARGET, ?obj, %source, %destination, %err, "move aborted");
                        aborted = true;
                        MoveOutcome::Failed(err.to_string())
                    }
                }
            };
            report.outcomes.push((*obj, outcome));
        }
        dst.end_processing_cycle(true);
        src.end_processing_cycle(true);
        Ok(report)
    }

    fn move_one(&self, obj: ObjectId, src: &Observer, dst: &Observer, silent: bool) -> Result<()> {
        let ownership = src
            .subject_ownership(obj)
            .ok_or(ObserverError::NotAttached(src.context_id()))?;
        match src.can_detach(obj) {
            DetachEvaluation::Rejected(reason) => {
                Err(ObserverError::rejected(src.context_id(), reason))
            }
            DetachEvaluation::Allowed => {
                if let Evaluation::Rejected(reason) = dst.can_attach(obj, ownership, silent) {
                    return Err(ObserverError::rejected(dst.context_id(), reason));
                }
                src.detach_subject(obj)?;
                let options = AttachOptions::new(ownership).silent(silent);
                if let Err(err) = dst.attach_subject_with(obj, options) {
                    if let Err(restore) = src.attach_subject_with(obj, options) {
                        tracing::error!(target: TARGET, ?obj, %restore, "could not restore object to its source context");
                    }
                    return Err(err);
                }
                Ok(())
            }
            DetachEvaluation::IsParentObserver => {
                // Hand lifetime ownership to the destination before leaving the source.
                store::remove_property(&self.inner.registry, obj, names::OBSERVER_PARENT);
                let options = AttachOptions::new(Ownership::SpecificObserver).silent(silent);
                if let Err(err) = dst.attach_subject_with(obj, options) {
                    self.restore_specific_owner(obj, src.context_id());
                    return Err(err);
                }
                if let Err(err) = src.detach_subject(obj) {
                    dst.release_subject(obj, false);
                    self.restore_specific_owner(obj, src.context_id());
                    return Err(err);
                }
                Ok(())
            }
            DetachEvaluation::LastScopedObserver => {
                // Join the destination first so the source is no longer the last scope.
                let options = AttachOptions::new(Ownership::ObserverScope).silent(silent);
                dst.attach_subject_with(obj, options)?;
                if let Err(err) = src.detach_subject(obj) {
                    dst.release_subject(obj, false);
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    fn restore_specific_owner(&self, obj: ObjectId, owner: ContextId) {
        store::set_shared_property(
            &self.inner.registry,
            obj,
            SharedProperty::new(names::OBSERVER_PARENT, u64::from(owner.raw()))
                .with_exportable(false),
        );
    }

    /// Attach objects to `destination` without detaching them anywhere.
    ///
    /// Failures do not stop the batch.
    pub fn copy_subjects(
        &self,
        objects: &[ObjectId],
        destination: ContextId,
        ownership: Ownership,
    ) -> Result<MoveReport> {
        let dst = self.require_observer(destination)?;
        dst.start_processing_cycle();
        let outcomes = objects
            .iter()
            .map(|obj| {
                let outcome = match dst.attach_subject(*obj, ownership) {
                    Ok(()) => MoveOutcome::Moved,
                    Err(err) => MoveOutcome::Failed(err.to_string()),
                };
                (*obj, outcome)
            })
            .collect();
        dst.end_processing_cycle(true);
        Ok(MoveReport { outcomes })
    }

    // =========================================================================
    // Factories
    // =========================================================================

    /// Register a factory provider.
    ///
    /// Fails without registering anything if another provider already
    /// serves one of its factory names.
    pub fn register_factory_provider(&self, provider: Arc<dyn FactoryProvider>) -> Result<()> {
        let factories = provider.provided_factories();
        let mut providers = self.inner.providers.write();
        for name in &factories {
            if let Some(existing) = providers.get(name) {
                if !std::ptr::addr_eq(Arc::as_ptr(existing), Arc::as_ptr(&provider)) {
                    tracing::warn!(target: TARGET, factory = %name, "factory name already provided");
                    return Err(ObserverError::FactoryConflict(name.clone()));
                }
            }
        }
        for name in factories {
            tracing::trace!(target: TARGET, factory = %name, "registered factory provider");
            providers.insert(name, provider.clone());
        }
        Ok(())
    }

    /// Names of every factory served by a registered provider.
    pub fn factory_names(&self) -> Vec<String> {
        self.inner.providers.read().keys().cloned().collect()
    }

    /// Build an instance through the provider serving `info.factory_tag`.
    pub fn create_instance(&self, info: &InstanceFactoryInfo) -> Option<ObjectId> {
        let provider = self.inner.providers.read().get(&info.factory_tag).cloned();
        let Some(provider) = provider else {
            tracing::warn!(target: TARGET, factory = %info.factory_tag, "no provider for factory");
            return None;
        };
        if !provider
            .provided_factory_tags(&info.factory_tag)
            .contains(&info.instance_tag)
        {
            tracing::warn!(target: TARGET, factory = %info.factory_tag, tag = %info.instance_tag, "factory does not provide tag");
            return None;
        }
        provider.create_instance(self, info)
    }

    /// Construct a subject filter registered under `tag`.
    pub fn create_subject_filter(&self, tag: &str) -> Option<SubjectFilter> {
        self.inner.subject_filters.read().create_instance(tag)
    }

    pub fn subject_filter_tags(&self) -> Vec<String> {
        self.inner.subject_filters.read().tags(None)
    }

    /// Register a custom subject filter constructor.
    pub fn register_subject_filter<F>(&self, constructor: F, id: FactoryItemId) -> bool
    where
        F: Fn() -> SubjectFilter + Send + Sync + 'static,
    {
        self.inner
            .subject_filters
            .write()
            .register_factory_interface(constructor, id)
    }

    // =========================================================================
    // Default properties
    // =========================================================================

    /// Register a property provider as a global pool object.
    pub fn register_property_provider(
        &self,
        name: impl Into<String>,
        provider: Arc<dyn AvailablePropertyProvider>,
    ) -> Result<ObjectId> {
        let obj = self.create_object(name, TypeInfo::new("AvailablePropertyProvider"));
        self.inner
            .registry
            .set_interface(obj, AVAILABLE_PROPERTY_PROVIDER_TAG, Arc::new(provider))
            .map_err(|_| ObserverError::InvalidObject)?;
        self.register_object(obj, None)?;
        Ok(obj)
    }

    fn property_providers(&self) -> Vec<Arc<dyn AvailablePropertyProvider>> {
        self.registered_interfaces(AVAILABLE_PROPERTY_PROVIDER_TAG)
            .into_iter()
            .filter_map(|obj| {
                self.inner
                    .registry
                    .interface(obj, AVAILABLE_PROPERTY_PROVIDER_TAG)
            })
            .filter_map(|payload| {
                payload
                    .downcast_ref::<Arc<dyn AvailablePropertyProvider>>()
                    .cloned()
            })
            .collect()
    }

    /// Add the default properties every registered provider declares for `obj`.
    ///
    /// Only specifications marked `add_during_construction` whose class
    /// matches the object are applied, and existing properties are left
    /// alone. Multi-context defaults get a value for every context currently
    /// observing the object. All specifications are attempted; failures are
    /// collected into [`ObserverError::DefaultProperties`]. Returns the number
    /// of properties added.
    pub fn construct_default_properties_on_object(&self, obj: ObjectId) -> Result<usize> {
        let registry = &self.inner.registry;
        if !registry.contains(obj) {
            return Err(ObserverError::InvalidObject);
        }
        let mut added = 0;
        let mut errors = Vec::new();
        for provider in self.property_providers() {
            for spec in provider.available_properties() {
                if !spec.add_during_construction {
                    continue;
                }
                if !spec.class_name.is_empty() && !registry.inherits(obj, &spec.class_name) {
                    continue;
                }
                if spec.name.is_empty() {
                    errors.push("provider declared a property without a name".to_string());
                    continue;
                }
                if store::property_exists(registry, obj, &spec.name) {
                    continue;
                }
                let ok = match spec.kind {
                    PropertyKind::Shared => store::set_shared_property(
                        registry,
                        obj,
                        SharedProperty::new(spec.name.clone(), spec.default_value.clone())
                            .with_read_only(spec.read_only)
                            .with_removable(spec.removable)
                            .with_exportable(spec.exportable),
                    ),
                    PropertyKind::MultiContext => {
                        let contexts = observing_contexts(registry, obj);
                        if contexts.is_empty() {
                            errors.push(format!(
                                "'{}' needs an observing context but the object has none",
                                spec.name
                            ));
                            continue;
                        }
                        let mut prop = MultiContextProperty::new(spec.name.clone())
                            .with_exportable(spec.exportable);
                        for ctx in contexts {
                            prop.set_value(ctx, spec.default_value.clone());
                        }
                        store::set_multi_context_property(registry, obj, prop)
                    }
                    PropertyKind::Plain => {
                        store::set_plain_property(registry, obj, &spec.name, spec.default_value.clone())
                    }
                };
                if ok {
                    added += 1;
                } else {
                    errors.push(format!("could not add '{}'", spec.name));
                }
            }
        }
        if errors.is_empty() {
            tracing::trace!(target: TARGET, ?obj, added, "constructed default properties");
            Ok(added)
        } else {
            tracing::warn!(target: TARGET, ?obj, added, failures = errors.len(), "default property construction incomplete");
            Err(ObserverError::DefaultProperties(errors))
        }
    }

    // =========================================================================
    // Routed property changes
    // =========================================================================

    fn route_change(
        &self,
        obj: ObjectId,
        name: &str,
        value: &PropertyValue,
        apply: impl FnOnce(&SharedObjectRegistry) -> bool,
    ) -> Result<PropertyChangeOutcome> {
        let registry = &self.inner.registry;
        if !registry.contains(obj) {
            return Err(ObserverError::InvalidObject);
        }
        if name.is_empty() {
            return Err(ObserverError::InvalidProperty(name.to_string()));
        }
        let observers: Vec<Arc<Observer>> = observing_contexts(registry, obj)
            .into_iter()
            .filter_map(|ctx| self.observer_reference(ctx))
            .collect();

        for observer in &observers {
            if observer.reserved_properties().iter().any(|r| r == name) {
                tracing::debug!(target: TARGET, ?obj, name, context = %observer.context_id(), "reserved property change refused");
                return Err(ObserverError::ReservedProperty {
                    name: name.to_string(),
                    context: observer.context_id(),
                });
            }
        }
        if store::get_shared_property(registry, obj, name).is_read_only() {
            return Err(ObserverError::ReadOnlyProperty(name.to_string()));
        }

        let monitoring: Vec<&Arc<Observer>> = observers
            .iter()
            .filter(|o| o.monitored_properties().iter().any(|m| m == name))
            .collect();
        let mut intercepted = false;
        for observer in &monitoring {
            intercepted |= observer.route_monitored_change(obj, name, value);
        }
        if intercepted {
            tracing::trace!(target: TARGET, ?obj, name, "property change intercepted");
            return Ok(PropertyChangeOutcome::Intercepted);
        }

        if !apply(registry) {
            return Err(ObserverError::InvalidProperty(name.to_string()));
        }
        for observer in monitoring {
            observer
                .monitored_property_changed
                .emit((obj, name.to_string()));
        }
        Ok(PropertyChangeOutcome::Applied)
    }

    /// Set a shared property, honouring the filters of every observing context.
    pub fn set_shared_property(
        &self,
        obj: ObjectId,
        prop: SharedProperty,
    ) -> Result<PropertyChangeOutcome> {
        if !prop.is_valid() {
            return Err(ObserverError::InvalidProperty(String::new()));
        }
        let name = prop.name().to_string();
        let value = PropertyValue::Shared(prop.clone());
        self.route_change(obj, &name, &value, |registry| {
            let renamed = prop.value().as_str().map(str::to_string);
            let ok = store::set_shared_property(registry, obj, prop);
            if ok && name == names::OBJECT_NAME {
                if let Some(new_name) = renamed {
                    return registry.set_object_name(obj, new_name).is_ok();
                }
            }
            ok
        })
    }

    /// Replace a multi-context property, honouring the filters of every observing context.
    pub fn set_multi_context_property(
        &self,
        obj: ObjectId,
        prop: MultiContextProperty,
    ) -> Result<PropertyChangeOutcome> {
        if !prop.is_valid() {
            return Err(ObserverError::InvalidProperty(String::new()));
        }
        let name = prop.name().to_string();
        let value = PropertyValue::MultiContext(prop.clone());
        self.route_change(obj, &name, &value, |registry| {
            store::set_multi_context_property(registry, obj, prop)
        })
    }

    /// Set a plain property, honouring the filters of every observing context.
    pub fn set_plain_property(
        &self,
        obj: ObjectId,
        name: &str,
        value: impl Into<Variant>,
    ) -> Result<PropertyChangeOutcome> {
        let value = value.into();
        let routed = PropertyValue::Plain(value.clone());
        self.route_change(obj, name, &routed, |registry| {
            store::set_plain_property(registry, obj, name, value)
        })
    }

    /// Rename an object, giving naming filters the chance to veto.
    pub fn set_object_name(
        &self,
        obj: ObjectId,
        name: impl Into<String>,
    ) -> Result<PropertyChangeOutcome> {
        let name = name.into();
        let mut prop = store::get_shared_property(&self.inner.registry, obj, names::OBJECT_NAME);
        let managed = prop.is_valid();
        if managed {
            prop.set_value(name.clone());
        } else {
            prop = SharedProperty::new(names::OBJECT_NAME, name.clone());
        }
        let value = PropertyValue::Shared(prop.clone());
        self.route_change(obj, names::OBJECT_NAME, &value, |registry| {
            if managed && !store::set_shared_property(registry, obj, prop) {
                return false;
            }
            registry.set_object_name(obj, name).is_ok()
        })
    }

    /// Remove a property unless an observing context reserves it.
    pub fn remove_property(&self, obj: ObjectId, name: &str) -> Result<bool> {
        for ctx in observing_contexts(&self.inner.registry, obj) {
            if let Some(observer) = self.observer_reference(ctx) {
                if observer.reserved_properties().iter().any(|r| r == name) {
                    return Err(ObserverError::ReservedProperty {
                        name: name.to_string(),
                        context: ctx,
                    });
                }
            }
        }
        Ok(store::remove_property(&self.inner.registry, obj, name))
    }

    // =========================================================================
    // Bulk property operations
    // =========================================================================

    /// Export the exportable properties of `obj` as a binary envelope.
    pub fn export_object_properties_binary<W: Write>(&self, obj: ObjectId, writer: &mut W) -> Result<()> {
        let options = self.inner.config.export_options()?;
        export_properties_binary(&self.inner.registry, obj, writer, &options)?;
        Ok(())
    }

    pub fn import_object_properties_binary<R: Read>(
        &self,
        obj: ObjectId,
        reader: &mut R,
    ) -> Result<ImportCompleteness> {
        Ok(import_properties_binary(&self.inner.registry, obj, reader)?)
    }

    /// Export the exportable properties of `obj` as an XML document.
    pub fn export_object_properties_xml(&self, obj: ObjectId) -> Result<String> {
        let options = self.inner.config.export_options()?;
        Ok(export_properties_xml(&self.inner.registry, obj, &options)?)
    }

    pub fn import_object_properties_xml(
        &self,
        obj: ObjectId,
        document: &str,
    ) -> Result<ImportCompleteness> {
        Ok(import_properties_xml(&self.inner.registry, obj, document)?)
    }

    pub fn clone_object_properties(&self, src: ObjectId, dst: ObjectId, kinds: PropertyKinds) -> bool {
        store::clone_object_properties(&self.inner.registry, src, dst, kinds)
    }

    pub fn compare_dynamic_properties(
        &self,
        first: ObjectId,
        second: ObjectId,
        kinds: PropertyKinds,
        diff: Option<&mut PropertyDiff>,
        ignore: &[&str],
    ) -> bool {
        store::compare_dynamic_properties(&self.inner.registry, first, second, kinds, diff, ignore)
    }

    pub fn remove_dynamic_properties(&self, obj: ObjectId, kinds: PropertyKinds) -> bool {
        store::remove_dynamic_properties(&self.inner.registry, obj, kinds)
    }

    // =========================================================================
    // Audit
    // =========================================================================

    /// Every multi-context entry whose context does not observe the object.
    ///
    /// Visitor ids of live relational tables are keyed by table sessions
    /// rather than contexts and are not reported.
    pub fn find_stale_context_entries(&self) -> Vec<StaleContextEntry> {
        let entries: Vec<StaleContextEntry> = self.inner.registry.with_read(|r| {
            let mut entries = Vec::new();
            for obj in r.object_ids() {
                let Ok(properties) = r.properties(obj) else {
                    continue;
                };
                for (name, value) in properties {
                    if name == names::VISITOR_ID {
                        continue;
                    }
                    if let PropertyValue::MultiContext(prop) = value {
                        entries.extend(prop.contexts().map(|context| StaleContextEntry {
                            object: obj,
                            property: name.clone(),
                            context,
                        }));
                    }
                }
            }
            entries
        });
        entries
            .into_iter()
            .filter(|entry| {
                !self
                    .observer_reference(entry.context)
                    .is_some_and(|observer| observer.contains(entry.object))
            })
            .collect()
    }
}

impl std::fmt::Debug for ObjectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectManager")
            .field("observers", &self.observer_count())
            .field("objects", &self.inner.registry.object_count())
            .finish()
    }
}

fn builtin_subject_filters() -> Factory<SubjectFilter> {
    let mut factory = Factory::new("Subject Filters");
    let category = Category::from(SUBJECT_FILTERS_CATEGORY);
    factory.register_factory_interface(
        || SubjectFilter::from(ActivityPolicyFilter::new()),
        FactoryItemId::new(ACTIVITY_POLICY_FILTER_TAG, category.clone()),
    );
    factory.register_factory_interface(
        || SubjectFilter::from(SubjectTypeFilter::new(String::new())),
        FactoryItemId::new(SUBJECT_TYPE_FILTER_TAG, category.clone()),
    );
    factory.register_factory_interface(
        || SubjectFilter::from(NamingPolicyFilter::new()),
        FactoryItemId::new(NAMING_POLICY_FILTER_TAG, category),
    );
    factory
}

/// Serves the built-in `"Observers"` factory.
struct ObserverFactoryProvider;

impl FactoryProvider for ObserverFactoryProvider {
    fn provided_factories(&self) -> Vec<String> {
        vec![OBSERVERS_FACTORY.to_string()]
    }

    fn provided_factory_tags(&self, factory_name: &str) -> Vec<String> {
        if factory_name == OBSERVERS_FACTORY {
            vec![OBSERVER_FACTORY_TAG.to_string()]
        } else {
            Vec::new()
        }
    }

    fn create_instance(&self, manager: &ObjectManager, info: &InstanceFactoryInfo) -> Option<ObjectId> {
        (info.instance_tag == OBSERVER_FACTORY_TAG)
            .then(|| manager.create_observer(info.instance_name.clone()).host_object())
    }
}
