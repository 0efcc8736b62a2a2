//! Observer contexts.
//!
//! An [`Observer`] is a named context that tracks a list of subject objects
//! and enforces its policies through installed [`SubjectFilter`]s. Each
//! observer is hosted by an object in the registry, which makes contexts
//! nodes in an object tree: attaching an observer's host object to another
//! observer nests the two contexts.
//!
//! Bookkeeping lives on the subjects themselves, in multi-context properties
//! keyed by the context id:
//!
//! - [`names::OBSERVER_MAP`]: the subject id the object has in each context
//! - [`names::OWNERSHIP`]: the ownership kind it was attached with
//! - [`names::OBSERVER_PARENT`] (shared): the context owning its lifetime
//!   under [`Ownership::SpecificObserver`]
//!
//! Every detach path strips the context from all multi-context properties of
//! the subject, so no entry outlives the attachment.
//!
//! Observers are created through the [`ObjectManager`], which assigns their
//! context ids.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use horizon_observer_core::{
    ContextId, ObjectId, PropertyValue, SharedObjectRegistry, SharedProperty, Signal, Variant,
    names, store,
};
use parking_lot::RwLock;

use crate::error::{ObserverError, Result};
use crate::filter::{ActivityPolicyFilter, Evaluation, NamingPolicyFilter, SubjectFilter};
use crate::manager::{ManagerInner, ObjectManager, PropertyChangeOutcome};

const TARGET: &str = "horizon_observer::observer";

/// Who is responsible for destroying a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Ownership {
    /// The caller deletes the object.
    #[default]
    Manual,
    /// The object is deleted when its last observing context detaches it.
    ObserverScope,
    /// The attaching context owns the object's lifetime.
    SpecificObserver,
}

impl Ownership {
    pub fn to_variant(self) -> Variant {
        Variant::Int(match self {
            Self::Manual => 0,
            Self::ObserverScope => 1,
            Self::SpecificObserver => 2,
        })
    }

    pub fn from_variant(value: &Variant) -> Option<Self> {
        match value.to_int()? {
            0 => Some(Self::Manual),
            1 => Some(Self::ObserverScope),
            2 => Some(Self::SpecificObserver),
            _ => None,
        }
    }
}

/// Options for a single attach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachOptions {
    pub ownership: Ownership,
    /// The object's properties come from an import stream.
    pub import_cycle: bool,
    /// The caller cannot tolerate interactive prompts.
    pub silent: bool,
}

impl AttachOptions {
    pub fn new(ownership: Ownership) -> Self {
        Self {
            ownership,
            ..Self::default()
        }
    }

    pub fn import_cycle(mut self, import_cycle: bool) -> Self {
        self.import_cycle = import_cycle;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}

impl From<Ownership> for AttachOptions {
    fn from(ownership: Ownership) -> Self {
        Self::new(ownership)
    }
}

/// Kind of change announced by [`Observer::subjects_changed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectChange {
    Added,
    Removed,
}

/// Verdict of [`Observer::can_detach`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachEvaluation {
    Allowed,
    Rejected(String),
    /// This context owns the subject's lifetime; detaching deletes it.
    IsParentObserver,
    /// This is the last context of an observer-scoped subject; detaching deletes it.
    LastScopedObserver,
}

impl DetachEvaluation {
    /// Whether detaching from this context would delete the subject.
    pub fn deletes_subject(&self) -> bool {
        matches!(self, Self::IsParentObserver | Self::LastScopedObserver)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityDisplay {
    #[default]
    NoActivityDisplay,
    CheckboxActivityDisplay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityControl {
    #[default]
    NoActivityControl,
    CheckboxTriggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamingControl {
    #[default]
    ReadOnlyNames,
    EditableNames,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HierarchicalDisplay {
    #[default]
    NoHierarchy,
    CategorizedHierarchy,
}

/// Presentation hints consumed by views of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayHints {
    pub activity_display: ActivityDisplay,
    pub activity_control: ActivityControl,
    pub naming_control: NamingControl,
    pub hierarchical_display: HierarchicalDisplay,
}

#[derive(Debug, Default)]
struct ObserverState {
    name: String,
    description: String,
    subjects: Vec<ObjectId>,
    next_subject_id: u64,
    subject_limit: Option<usize>,
    hints: DisplayHints,
    deleting: bool,
}

/// Contexts observing `obj`, from its observer map.
pub(crate) fn observing_contexts(registry: &SharedObjectRegistry, obj: ObjectId) -> Vec<ContextId> {
    store::get_multi_context_property(registry, obj, names::OBSERVER_MAP)
        .contexts()
        .collect()
}

/// The context owning `obj` under [`Ownership::SpecificObserver`].
pub(crate) fn specific_owner(registry: &SharedObjectRegistry, obj: ObjectId) -> Option<ContextId> {
    store::get_shared_property(registry, obj, names::OBSERVER_PARENT)
        .value()
        .to_uint()
        .and_then(|raw| u32::try_from(raw).ok())
        .map(ContextId::new)
}

/// An observer context.
pub struct Observer {
    context: ContextId,
    host: ObjectId,
    registry: Arc<SharedObjectRegistry>,
    manager: Weak<ManagerInner>,
    self_ref: Weak<Observer>,
    state: RwLock<ObserverState>,
    filters: RwLock<Vec<SubjectFilter>>,
    cycle_depth: AtomicUsize,
    permanent_cycle: bool,
    cycle_changed: AtomicBool,
    verify_invariants: bool,
    /// Emitted with the affected subjects after an attach or detach outside a processing cycle.
    pub subjects_changed: Signal<(Vec<ObjectId>, SubjectChange)>,
    /// Emitted once at the end of a processing cycle in which subjects changed.
    pub layout_changed: Signal<()>,
    /// Emitted after a routed change to a monitored property was applied.
    pub monitored_property_changed: Signal<(ObjectId, String)>,
    /// Emitted when the observer is deleted.
    pub destroyed: Signal<ContextId>,
}

static_assertions::assert_impl_all!(Observer: Send, Sync);

impl Observer {
    pub(crate) fn new(
        context: ContextId,
        host: ObjectId,
        registry: Arc<SharedObjectRegistry>,
        manager: Weak<ManagerInner>,
        name: String,
        verify_invariants: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            context,
            host,
            registry,
            manager,
            self_ref: self_ref.clone(),
            state: RwLock::new(ObserverState {
                name,
                ..ObserverState::default()
            }),
            filters: RwLock::new(Vec::new()),
            cycle_depth: AtomicUsize::new(0),
            permanent_cycle: context.is_global_pool(),
            cycle_changed: AtomicBool::new(false),
            verify_invariants,
            subjects_changed: Signal::new(),
            layout_changed: Signal::new(),
            monitored_property_changed: Signal::new(),
            destroyed: Signal::new(),
        })
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// The object hosting this context.
    pub fn host_object(&self) -> ObjectId {
        self.host
    }

    pub fn registry(&self) -> &Arc<SharedObjectRegistry> {
        &self.registry
    }

    pub fn weak_ref(&self) -> Weak<Observer> {
        self.self_ref.clone()
    }

    /// The manager this observer belongs to, if it is still alive.
    pub fn manager(&self) -> Option<ObjectManager> {
        self.manager.upgrade().map(ObjectManager::from_inner)
    }

    pub fn name(&self) -> String {
        self.state.read().name.clone()
    }

    /// Rename the context. The host object is renamed as well.
    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        if self.registry.set_object_name(self.host, name.clone()).is_err() {
            tracing::debug!(target: TARGET, context = %self.context, "host object is gone");
        }
        self.state.write().name = name;
    }

    pub fn description(&self) -> String {
        self.state.read().description.clone()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        self.state.write().description = description.into();
    }

    pub fn display_hints(&self) -> DisplayHints {
        self.state.read().hints
    }

    pub fn set_display_hints(&self, hints: DisplayHints) {
        self.state.write().hints = hints;
    }

    pub fn subject_limit(&self) -> Option<usize> {
        self.state.read().subject_limit
    }

    /// Cap the number of subjects. Existing subjects are kept.
    pub fn set_subject_limit(&self, limit: Option<usize>) {
        self.state.write().subject_limit = limit;
    }

    pub(crate) fn mark_deleting(&self) {
        self.state.write().deleting = true;
    }

    pub fn is_deleting(&self) -> bool {
        self.state.read().deleting
    }

    // =========================================================================
    // Subjects
    // =========================================================================

    /// Subjects in attachment order.
    pub fn subjects(&self) -> Vec<ObjectId> {
        self.state.read().subjects.clone()
    }

    pub fn subject_count(&self) -> usize {
        self.state.read().subjects.len()
    }

    pub fn contains(&self, obj: ObjectId) -> bool {
        self.state.read().subjects.contains(&obj)
    }

    /// The id `obj` was given when it attached to this context.
    pub fn subject_id(&self, obj: ObjectId) -> Option<u64> {
        store::multi_context_value(&self.registry, obj, names::OBSERVER_MAP, self.context).to_uint()
    }

    /// The ownership `obj` was attached with.
    pub fn subject_ownership(&self, obj: ObjectId) -> Option<Ownership> {
        let value = store::multi_context_value(&self.registry, obj, names::OWNERSHIP, self.context);
        Ownership::from_variant(&value)
    }

    /// Subjects exposing the capability interface `tag`.
    pub fn subject_references(&self, tag: &str) -> Vec<ObjectId> {
        self.subjects()
            .into_iter()
            .filter(|obj| self.registry.implements(*obj, tag))
            .collect()
    }

    /// Subjects whose registered type is or derives from `type_tag`.
    pub fn subjects_by_type(&self, type_tag: &str) -> Vec<ObjectId> {
        self.subjects()
            .into_iter()
            .filter(|obj| self.registry.inherits(*obj, type_tag))
            .collect()
    }

    // =========================================================================
    // Filters
    // =========================================================================

    /// Install a filter. Only allowed while the context has no subjects.
    pub fn install_subject_filter(&self, filter: impl Into<SubjectFilter>) -> Result<()> {
        let filter = filter.into();
        if self.subject_count() > 0 {
            return Err(ObserverError::FiltersLocked(self.context));
        }
        if self.filters.read().iter().any(|f| f.name() == filter.name()) {
            return Err(ObserverError::DuplicateFilter(filter.name().to_string()));
        }
        filter.hooks().set_observer_context(self)?;
        tracing::debug!(target: TARGET, context = %self.context, filter = filter.name(), "installed subject filter");
        self.filters.write().push(filter);
        Ok(())
    }

    /// Remove the filter called `name`. Only allowed while the context has no subjects.
    ///
    /// The filter stays bound to this context and cannot be installed elsewhere.
    pub fn uninstall_subject_filter(&self, name: &str) -> Result<SubjectFilter> {
        if self.subject_count() > 0 {
            return Err(ObserverError::FiltersLocked(self.context));
        }
        let mut filters = self.filters.write();
        let pos = filters
            .iter()
            .position(|f| f.name() == name)
            .ok_or_else(|| ObserverError::FilterNotInstalled(name.to_string()))?;
        Ok(filters.remove(pos))
    }

    /// Installed filters in installation order.
    pub fn subject_filters(&self) -> Vec<SubjectFilter> {
        self.filters.read().clone()
    }

    pub fn activity_filter(&self) -> Option<Arc<ActivityPolicyFilter>> {
        self.filters.read().iter().find_map(|f| f.as_activity().cloned())
    }

    pub fn naming_filter(&self) -> Option<Arc<NamingPolicyFilter>> {
        self.filters.read().iter().find_map(|f| f.as_naming().cloned())
    }

    /// Property names external code may not change on this context's subjects.
    pub fn reserved_properties(&self) -> Vec<String> {
        let mut reserved = vec![
            names::OBSERVER_MAP.to_string(),
            names::OWNERSHIP.to_string(),
            names::OBSERVER_PARENT.to_string(),
        ];
        for filter in self.subject_filters() {
            for name in filter.hooks().reserved_properties() {
                if !reserved.contains(&name) {
                    reserved.push(name);
                }
            }
        }
        reserved
    }

    /// Property names whose changes are routed to this context's filters.
    pub fn monitored_properties(&self) -> Vec<String> {
        let mut monitored = Vec::new();
        for filter in self.subject_filters() {
            for name in filter.hooks().monitored_properties() {
                if !monitored.contains(&name) {
                    monitored.push(name);
                }
            }
        }
        monitored
    }

    /// Offer a pending property change to the filters monitoring `name`.
    ///
    /// Returns `true` if any filter intercepted it.
    pub(crate) fn route_monitored_change(
        &self,
        obj: ObjectId,
        name: &str,
        value: &PropertyValue,
    ) -> bool {
        let mut intercepted = false;
        for filter in self.subject_filters() {
            let hooks = filter.hooks();
            if hooks.monitored_properties().iter().any(|m| m == name) {
                intercepted |= hooks.handle_monitored_property_change(obj, name, value);
            }
        }
        intercepted
    }

    // =========================================================================
    // Processing cycles
    // =========================================================================

    /// Start batching notifications. Cycles nest.
    pub fn start_processing_cycle(&self) {
        if self.cycle_depth.fetch_add(1, Ordering::AcqRel) == 0 {
            for filter in self.subject_filters() {
                filter.hooks().processing_cycle_started();
            }
        }
    }

    /// End a processing cycle.
    ///
    /// When the outermost cycle ends, filters flush their deferred
    /// notifications and, if `emit_changes` is set and subjects changed,
    /// [`layout_changed`](Self::layout_changed) fires once.
    pub fn end_processing_cycle(&self, emit_changes: bool) {
        let previous = self
            .cycle_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| depth.checked_sub(1));
        if previous != Ok(1) {
            return;
        }
        for filter in self.subject_filters() {
            filter.hooks().processing_cycle_ended();
        }
        if self.permanent_cycle {
            return;
        }
        let changed = self.cycle_changed.swap(false, Ordering::AcqRel);
        if emit_changes && changed {
            self.layout_changed.emit(());
        }
    }

    /// Whether notifications are currently being batched.
    ///
    /// The global object pool is always inside a processing cycle.
    pub fn is_processing_cycle_active(&self) -> bool {
        self.permanent_cycle || self.cycle_depth.load(Ordering::Acquire) > 0
    }

    fn notify(&self, obj: ObjectId, change: SubjectChange) {
        if self.is_processing_cycle_active() {
            self.cycle_changed.store(true, Ordering::Release);
            return;
        }
        self.subjects_changed.emit((vec![obj], change));
    }

    // =========================================================================
    // Attach
    // =========================================================================

    /// Pre-flight check for attaching `obj`, without changing anything.
    pub fn can_attach(&self, obj: ObjectId, ownership: Ownership, silent: bool) -> Evaluation {
        let options = AttachOptions::new(ownership).silent(silent);
        match self.check_attach(obj, &options, &self.subject_filters()) {
            Ok(verdict) => verdict,
            Err(err) => Evaluation::Rejected(err.to_string()),
        }
    }

    fn check_attach(
        &self,
        obj: ObjectId,
        options: &AttachOptions,
        filters: &[SubjectFilter],
    ) -> Result<Evaluation> {
        if !self.registry.contains(obj) {
            return Err(ObserverError::InvalidObject);
        }
        {
            let state = self.state.read();
            if state.deleting {
                return Err(ObserverError::ObserverDeleted(self.context));
            }
            if state.subjects.contains(&obj) {
                return Err(ObserverError::AlreadyAttached(self.context));
            }
            if let Some(limit) = state.subject_limit {
                if state.subjects.len() >= limit {
                    return Err(ObserverError::SubjectLimitReached {
                        context: self.context,
                        limit,
                    });
                }
            }
        }
        if obj == self.host {
            return Err(ObserverError::CircularAttachment(self.context));
        }
        if !self.context.is_global_pool() {
            let limit = store::get_shared_property(&self.registry, obj, names::OBSERVER_LIMIT);
            if let Some(limit) = limit.value().to_uint() {
                let joined = observing_contexts(&self.registry, obj)
                    .into_iter()
                    .filter(|ctx| !ctx.is_global_pool())
                    .count() as u64;
                if joined >= limit {
                    return Err(ObserverError::ObserverLimitReached(limit));
                }
            }
        }
        if options.ownership == Ownership::SpecificObserver {
            if let Some(owner) = specific_owner(&self.registry, obj) {
                if owner != self.context {
                    return Err(ObserverError::OwnerConflict(owner));
                }
            }
        }
        if self.would_create_cycle(obj) {
            return Err(ObserverError::CircularAttachment(self.context));
        }

        let mut verdict = Evaluation::Allowed;
        for filter in filters {
            match filter.hooks().evaluate_attachment(obj, options.silent) {
                Evaluation::Allowed => {}
                Evaluation::Conditional => verdict = Evaluation::Conditional,
                Evaluation::Rejected(reason) => {
                    tracing::debug!(target: TARGET, context = %self.context, ?obj, filter = filter.name(), %reason, "attachment rejected");
                    return Err(ObserverError::rejected(self.context, reason));
                }
            }
        }
        Ok(verdict)
    }

    /// Whether this context is reachable from the context hosted by `obj`.
    fn would_create_cycle(&self, obj: ObjectId) -> bool {
        let Some(start) = self.registry.hosted_context(obj) else {
            return false;
        };
        if start == self.context {
            return true;
        }
        let Some(manager) = self.manager() else {
            return false;
        };
        let mut visited = HashSet::new();
        let mut pending = vec![start];
        while let Some(ctx) = pending.pop() {
            if !visited.insert(ctx) {
                continue;
            }
            let Some(observer) = manager.observer_reference(ctx) else {
                continue;
            };
            for subject in observer.subjects() {
                match self.registry.hosted_context(subject) {
                    Some(hosted) if hosted == self.context => return true,
                    Some(hosted) => pending.push(hosted),
                    None => {}
                }
            }
        }
        false
    }

    /// Attach `obj` with the given ownership.
    pub fn attach_subject(&self, obj: ObjectId, ownership: Ownership) -> Result<()> {
        self.attach_subject_with(obj, AttachOptions::new(ownership))
    }

    /// Attach `obj`, running the full filter protocol.
    ///
    /// Either the object ends up attached with all bookkeeping in place, or
    /// nothing changes and the error carries the reason.
    #[tracing::instrument(skip(self), target = "horizon_observer::observer", level = "trace")]
    pub fn attach_subject_with(&self, obj: ObjectId, options: AttachOptions) -> Result<()> {
        let filters = self.subject_filters();
        self.check_attach(obj, &options, &filters)?;

        for filter in &filters {
            if let Err(reason) = filter
                .hooks()
                .initialize_attachment(obj, options.import_cycle)
            {
                tracing::debug!(target: TARGET, context = %self.context, ?obj, filter = filter.name(), %reason, "attachment initialization failed");
                for filter in &filters {
                    filter
                        .hooks()
                        .finalize_attachment(obj, false, options.import_cycle);
                }
                return Err(ObserverError::rejected(self.context, reason));
            }
        }

        let subject_id = {
            let mut state = self.state.write();
            state.subjects.push(obj);
            let id = state.next_subject_id;
            state.next_subject_id += 1;
            id
        };
        store::set_multi_context_value(&self.registry, obj, names::OBSERVER_MAP, self.context, subject_id, false);
        store::set_multi_context_value(
            &self.registry,
            obj,
            names::OWNERSHIP,
            self.context,
            options.ownership.to_variant(),
            false,
        );
        if options.ownership == Ownership::SpecificObserver {
            store::set_shared_property(
                &self.registry,
                obj,
                SharedProperty::new(names::OBSERVER_PARENT, u64::from(self.context.raw()))
                    .with_exportable(false),
            );
        }

        for filter in &filters {
            filter
                .hooks()
                .finalize_attachment(obj, true, options.import_cycle);
        }
        tracing::debug!(target: TARGET, context = %self.context, ?obj, ownership = ?options.ownership, "attached subject");
        self.notify(obj, SubjectChange::Added);
        Ok(())
    }

    /// Attach several objects inside one processing cycle.
    ///
    /// Each object succeeds or fails on its own.
    pub fn attach_subjects(
        &self,
        objects: &[ObjectId],
        ownership: Ownership,
    ) -> Vec<(ObjectId, Result<()>)> {
        self.start_processing_cycle();
        let results = objects
            .iter()
            .map(|obj| (*obj, self.attach_subject(*obj, ownership)))
            .collect();
        self.end_processing_cycle(true);
        results
    }

    // =========================================================================
    // Detach
    // =========================================================================

    /// Pre-flight check for detaching `obj`, without changing anything.
    pub fn can_detach(&self, obj: ObjectId) -> DetachEvaluation {
        match self.check_detach(obj, &self.subject_filters()) {
            Ok(verdict) => verdict,
            Err(err) => DetachEvaluation::Rejected(err.to_string()),
        }
    }

    fn check_detach(&self, obj: ObjectId, filters: &[SubjectFilter]) -> Result<DetachEvaluation> {
        if !self.contains(obj) {
            return Err(ObserverError::NotAttached(self.context));
        }
        for filter in filters {
            if let Evaluation::Rejected(reason) = filter.hooks().evaluate_detachment(obj) {
                tracing::debug!(target: TARGET, context = %self.context, ?obj, filter = filter.name(), %reason, "detachment rejected");
                return Err(ObserverError::rejected(self.context, reason));
            }
        }
        Ok(self.lifetime_verdict(obj))
    }

    /// Whether detaching `obj` from this context ends its lifetime.
    fn lifetime_verdict(&self, obj: ObjectId) -> DetachEvaluation {
        if specific_owner(&self.registry, obj) == Some(self.context) {
            return DetachEvaluation::IsParentObserver;
        }
        if !self.context.is_global_pool()
            && self.subject_ownership(obj) == Some(Ownership::ObserverScope)
        {
            let others = observing_contexts(&self.registry, obj)
                .into_iter()
                .any(|ctx| !ctx.is_global_pool() && ctx != self.context);
            if !others {
                return DetachEvaluation::LastScopedObserver;
            }
        }
        DetachEvaluation::Allowed
    }

    /// Detach `obj`, running the full filter protocol.
    ///
    /// If this context owns the subject's lifetime, the subject is deleted
    /// after the detach.
    #[tracing::instrument(skip(self), target = "horizon_observer::observer", level = "trace")]
    pub fn detach_subject(&self, obj: ObjectId) -> Result<()> {
        let filters = self.subject_filters();
        let verdict = self.check_detach(obj, &filters)?;
        self.detach_internal(obj, false, &filters)?;
        if verdict.deletes_subject() {
            tracing::debug!(target: TARGET, context = %self.context, ?obj, ?verdict, "deleting subject owned by context");
            match self.manager() {
                Some(manager) => manager.delete_object(obj),
                None => {
                    if let Err(err) = self.registry.destroy(obj) {
                        tracing::warn!(target: TARGET, context = %self.context, ?obj, %err, "could not destroy subject");
                    }
                }
            }
        }
        Ok(())
    }

    /// Detach without evaluation or lifetime handling.
    ///
    /// Returns whether this context owned the subject's lifetime.
    pub(crate) fn release_subject(&self, obj: ObjectId, subject_deleted: bool) -> bool {
        let owned = self.lifetime_verdict(obj).deletes_subject();
        let filters = self.subject_filters();
        if let Err(err) = self.detach_internal(obj, subject_deleted, &filters) {
            tracing::warn!(target: TARGET, context = %self.context, ?obj, %err, "forced detach failed");
        }
        owned
    }

    fn detach_internal(
        &self,
        obj: ObjectId,
        subject_deleted: bool,
        filters: &[SubjectFilter],
    ) -> Result<()> {
        for filter in filters {
            if let Err(reason) = filter.hooks().initialize_detachment(obj, subject_deleted) {
                if subject_deleted {
                    tracing::warn!(target: TARGET, context = %self.context, ?obj, filter = filter.name(), %reason, "ignoring detach failure of deleted subject");
                    continue;
                }
                for filter in filters {
                    filter.hooks().finalize_detachment(obj, false, subject_deleted);
                }
                return Err(ObserverError::rejected(self.context, reason));
            }
        }

        let removed = {
            let mut state = self.state.write();
            let before = state.subjects.len();
            state.subjects.retain(|s| *s != obj);
            before != state.subjects.len()
        };
        if !removed {
            return Err(ObserverError::NotAttached(self.context));
        }
        store::remove_context_entries(&self.registry, obj, self.context);
        if specific_owner(&self.registry, obj) == Some(self.context) {
            store::remove_property(&self.registry, obj, names::OBSERVER_PARENT);
        }

        for filter in filters {
            filter.hooks().finalize_detachment(obj, true, subject_deleted);
        }
        tracing::debug!(target: TARGET, context = %self.context, ?obj, subject_deleted, "detached subject");
        self.notify(obj, SubjectChange::Removed);

        if self.verify_invariants {
            self.verify_detached(obj);
        }
        Ok(())
    }

    /// Log any multi-context entry this context left behind on `obj`.
    fn verify_detached(&self, obj: ObjectId) {
        let stale: Vec<String> = self.registry.with_read(|r| {
            r.properties(obj)
                .map(|props| {
                    props
                        .iter()
                        .filter(|(_, value)| {
                            matches!(value, PropertyValue::MultiContext(p) if p.has_context(self.context))
                        })
                        .map(|(name, _)| name.clone())
                        .collect()
                })
                .unwrap_or_default()
        });
        if !stale.is_empty() {
            tracing::error!(target: TARGET, context = %self.context, ?obj, ?stale, "stale context entries after detach");
        }
    }

    /// Detach several objects inside one processing cycle.
    pub fn detach_subjects(&self, objects: &[ObjectId]) -> Vec<(ObjectId, Result<()>)> {
        self.start_processing_cycle();
        let results = objects
            .iter()
            .map(|obj| (*obj, self.detach_subject(*obj)))
            .collect();
        self.end_processing_cycle(true);
        results
    }

    // =========================================================================
    // Context-scoped properties
    // =========================================================================

    /// This context's value of a multi-context property on `obj`.
    pub fn get_multi_context_property_value(&self, obj: ObjectId, name: &str) -> Variant {
        store::multi_context_value(&self.registry, obj, name, self.context)
    }

    /// Set this context's value of a multi-context property on `obj`.
    ///
    /// The change is routed through the manager, so reserved names are
    /// refused and monitoring filters see it first.
    pub fn set_multi_context_property_value(
        &self,
        obj: ObjectId,
        name: &str,
        value: impl Into<Variant>,
    ) -> Result<PropertyChangeOutcome> {
        let manager = self.manager().ok_or(ObserverError::ManagerDropped)?;
        let mut prop = store::get_multi_context_property(&self.registry, obj, name);
        if !prop.is_valid() {
            prop = horizon_observer_core::MultiContextProperty::new(name);
        }
        prop.set_value(self.context, value);
        manager.set_multi_context_property(obj, prop)
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Observer")
            .field("context", &self.context)
            .field("name", &state.name)
            .field("subjects", &state.subjects.len())
            .field("filters", &*self.filters.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use horizon_observer_core::TypeInfo;
    use parking_lot::Mutex;

    use super::*;
    use crate::filter::{FilterBinding, SubjectFilterHooks};

    fn object(manager: &ObjectManager, name: &str) -> ObjectId {
        manager.create_object(name, TypeInfo::new("Thing"))
    }

    #[test]
    fn test_scoped_subject_destroyed_after_manager_dropped() {
        let manager = ObjectManager::new();
        let registry = manager.registry().clone();
        let observer = manager.create_observer("Orphan");
        let obj = object(&manager, "a");
        observer.attach_subject(obj, Ownership::ObserverScope).unwrap();
        drop(manager);

        assert!(observer.manager().is_none());
        observer.detach_subject(obj).unwrap();
        assert!(!registry.contains(obj));
    }

    #[test]
    fn test_attach_records_bookkeeping() {
        let manager = ObjectManager::new();
        let observer = manager.create_observer("Root");
        let obj = object(&manager, "a");
        observer.attach_subject(obj, Ownership::ObserverScope).unwrap();

        assert!(observer.contains(obj));
        assert_eq!(observer.subject_id(obj), Some(0));
        assert_eq!(observer.subject_ownership(obj), Some(Ownership::ObserverScope));
        assert!(matches!(
            observer.attach_subject(obj, Ownership::Manual),
            Err(ObserverError::AlreadyAttached(_))
        ));
    }

    #[test]
    fn test_detach_strips_every_context_entry() {
        let manager = ObjectManager::new();
        let observer = manager.create_observer("Root");
        let obj = object(&manager, "a");
        observer.attach_subject(obj, Ownership::Manual).unwrap();
        observer
            .set_multi_context_property_value(obj, "Custom", 5)
            .unwrap();
        observer.detach_subject(obj).unwrap();

        let registry = manager.registry();
        assert!(!store::property_exists(registry, obj, names::OBSERVER_MAP));
        assert!(!store::property_exists(registry, obj, "Custom"));
        assert!(manager.find_stale_context_entries().is_empty());
    }

    #[test]
    fn test_detach_verdicts() {
        let manager = ObjectManager::new();
        let first = manager.create_observer("First");
        let second = manager.create_observer("Second");

        let scoped = object(&manager, "scoped");
        first.attach_subject(scoped, Ownership::ObserverScope).unwrap();
        assert_eq!(first.can_detach(scoped), DetachEvaluation::LastScopedObserver);
        second.attach_subject(scoped, Ownership::Manual).unwrap();
        assert_eq!(first.can_detach(scoped), DetachEvaluation::Allowed);

        let owned = object(&manager, "owned");
        first.attach_subject(owned, Ownership::SpecificObserver).unwrap();
        second.attach_subject(owned, Ownership::Manual).unwrap();
        assert_eq!(first.can_detach(owned), DetachEvaluation::IsParentObserver);
        assert_eq!(second.can_detach(owned), DetachEvaluation::Allowed);
        assert!(matches!(
            second.can_detach(object(&manager, "stranger")),
            DetachEvaluation::Rejected(_)
        ));
    }

    #[test]
    fn test_last_scoped_detach_deletes_subject() {
        let manager = ObjectManager::new();
        let observer = manager.create_observer("Root");
        let obj = object(&manager, "a");
        observer.attach_subject(obj, Ownership::ObserverScope).unwrap();
        observer.detach_subject(obj).unwrap();
        assert!(!manager.registry().contains(obj));
    }

    #[test]
    fn test_specific_owner_conflict() {
        let manager = ObjectManager::new();
        let first = manager.create_observer("First");
        let second = manager.create_observer("Second");
        let obj = object(&manager, "a");
        first.attach_subject(obj, Ownership::SpecificObserver).unwrap();
        assert!(matches!(
            second.attach_subject(obj, Ownership::SpecificObserver),
            Err(ObserverError::OwnerConflict(ctx)) if ctx == first.context_id()
        ));
    }

    #[test]
    fn test_limits() {
        let manager = ObjectManager::new();
        let first = manager.create_observer("First");
        let second = manager.create_observer("Second");
        first.set_subject_limit(Some(1));
        first.attach_subject(object(&manager, "a"), Ownership::Manual).unwrap();
        assert!(matches!(
            first.attach_subject(object(&manager, "b"), Ownership::Manual),
            Err(ObserverError::SubjectLimitReached { limit: 1, .. })
        ));

        let limited = object(&manager, "limited");
        store::set_shared_property(
            manager.registry(),
            limited,
            SharedProperty::new(names::OBSERVER_LIMIT, 1u64),
        );
        manager.register_object(limited, None).unwrap();
        second.attach_subject(limited, Ownership::Manual).unwrap();
        let third = manager.create_observer("Third");
        assert!(matches!(
            third.attach_subject(limited, Ownership::Manual),
            Err(ObserverError::ObserverLimitReached(1))
        ));
    }

    #[test]
    fn test_cycles_rejected() {
        let manager = ObjectManager::new();
        let parent = manager.create_observer("Parent");
        let child = manager.create_observer("Child");
        parent
            .attach_subject(child.host_object(), Ownership::Manual)
            .unwrap();
        assert!(matches!(
            child.attach_subject(parent.host_object(), Ownership::Manual),
            Err(ObserverError::CircularAttachment(_))
        ));
        assert!(matches!(
            parent.attach_subject(parent.host_object(), Ownership::Manual),
            Err(ObserverError::CircularAttachment(_))
        ));
    }

    struct Recorder {
        binding: FilterBinding,
        calls: Mutex<Vec<String>>,
        fail_init: bool,
    }

    impl Recorder {
        fn new(fail_init: bool) -> Self {
            Self {
                binding: FilterBinding::new(),
                calls: Mutex::new(Vec::new()),
                fail_init,
            }
        }
    }

    impl SubjectFilterHooks for Recorder {
        fn filter_name(&self) -> &str {
            "Recorder"
        }

        fn binding(&self) -> &FilterBinding {
            &self.binding
        }

        fn evaluate_attachment(&self, _obj: ObjectId, silent: bool) -> Evaluation {
            self.calls.lock().push(format!("evaluate silent={silent}"));
            Evaluation::Allowed
        }

        fn initialize_attachment(&self, _obj: ObjectId, _import_cycle: bool) -> std::result::Result<(), String> {
            self.calls.lock().push("initialize".into());
            if self.fail_init {
                Err("not today".into())
            } else {
                Ok(())
            }
        }

        fn finalize_attachment(&self, _obj: ObjectId, ok: bool, _import_cycle: bool) {
            self.calls.lock().push(format!("finalize ok={ok}"));
        }
    }

    #[test]
    fn test_hook_order() {
        let manager = ObjectManager::new();
        let observer = manager.create_observer("Root");
        let recorder = Arc::new(Recorder::new(false));
        observer
            .install_subject_filter(SubjectFilter::Custom(recorder.clone()))
            .unwrap();
        observer
            .attach_subject_with(object(&manager, "a"), AttachOptions::default().silent(true))
            .unwrap();
        assert_eq!(
            *recorder.calls.lock(),
            vec!["evaluate silent=true", "initialize", "finalize ok=true"]
        );
    }

    #[test]
    fn test_failed_initialization_leaves_no_trace() {
        let manager = ObjectManager::new();
        let observer = manager.create_observer("Root");
        let recorder = Arc::new(Recorder::new(true));
        observer
            .install_subject_filter(SubjectFilter::Custom(recorder.clone()))
            .unwrap();
        let obj = object(&manager, "a");
        let err = observer.attach_subject(obj, Ownership::Manual).unwrap_err();
        assert_eq!(err.to_string(), "not today");
        assert!(!observer.contains(obj));
        assert!(!store::property_exists(manager.registry(), obj, names::OBSERVER_MAP));
        assert_eq!(recorder.calls.lock().last().map(String::as_str), Some("finalize ok=false"));
    }

    #[test]
    fn test_filter_binds_once() {
        let manager = ObjectManager::new();
        let first = manager.create_observer("First");
        let second = manager.create_observer("Second");
        let filter = Arc::new(ActivityPolicyFilter::new());
        first.install_subject_filter(filter.clone()).unwrap();
        assert!(matches!(
            second.install_subject_filter(filter),
            Err(ObserverError::Filter(crate::FilterError::AlreadyBound(_)))
        ));
        assert!(matches!(
            first.install_subject_filter(ActivityPolicyFilter::new()),
            Err(ObserverError::DuplicateFilter(_))
        ));
    }

    #[test]
    fn test_filters_locked_with_subjects() {
        let manager = ObjectManager::new();
        let observer = manager.create_observer("Root");
        observer.attach_subject(object(&manager, "a"), Ownership::Manual).unwrap();
        assert!(matches!(
            observer.install_subject_filter(ActivityPolicyFilter::new()),
            Err(ObserverError::FiltersLocked(_))
        ));
    }

    #[test]
    fn test_processing_cycle_batches_notifications() {
        let manager = ObjectManager::new();
        let observer = manager.create_observer("Root");
        let singles = Arc::new(Mutex::new(0));
        let layouts = Arc::new(Mutex::new(0));
        let s = singles.clone();
        observer.subjects_changed.connect(move |_| *s.lock() += 1);
        let l = layouts.clone();
        observer.layout_changed.connect(move |_| *l.lock() += 1);

        let objects: Vec<_> = (0..3).map(|i| object(&manager, &format!("o{i}"))).collect();
        let results = observer.attach_subjects(&objects, Ownership::Manual);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(*singles.lock(), 0);
        assert_eq!(*layouts.lock(), 1);

        observer.detach_subject(objects[0]).unwrap();
        assert_eq!(*singles.lock(), 1);
    }

    #[test]
    fn test_subject_references() {
        let manager = ObjectManager::new();
        let observer = manager.create_observer("Root");
        let plain = object(&manager, "plain");
        let capable = object(&manager, "capable");
        manager
            .registry()
            .set_interface(capable, "com.example.IThing/1.0", Arc::new(()))
            .unwrap();
        observer.attach_subject(plain, Ownership::Manual).unwrap();
        observer.attach_subject(capable, Ownership::Manual).unwrap();
        assert_eq!(observer.subject_references("com.example.IThing/1.0"), vec![capable]);
        assert_eq!(observer.subjects_by_type("Thing").len(), 2);
    }
}
